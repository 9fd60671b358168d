//! # matryoshka-gan: composable GAN modules on a symbolic graph
//!
//! A generator and a discriminator are assembled from **Matryoshka modules**:
//! parameter-owning convolutional, fully connected and latent-injection
//! blocks with optional batch normalization. Modules append their
//! computation to an **Abstract Semantic Graph (ASG)**; autograd appends the
//! gradient nodes to the same graph, and compiled functions evaluate both on
//! the CPU backend and apply Adam updates in place.
//!
//! ## Usage Example
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use matryoshka_gan::network::{Discriminator, DiscriminatorConfig, Generator, GeneratorConfig};
//! use matryoshka_gan::runtime::{CpuBackend, Function};
//! use matryoshka_gan::tensor::{GraphContext, Tensor};
//! use ndarray::ArrayD;
//!
//! // 1. One graph context owns the graph and every parameter.
//! let context = Rc::new(RefCell::new(GraphContext::with_seed(7)));
//!
//! // 2. Assemble both networks; channel mismatches fail here.
//! let generator = Generator::new(&context, &GeneratorConfig::default())?;
//! let discriminator = Discriminator::new(&context, &DiscriminatorConfig::default())?;
//!
//! // 3. Build the symbolic graph.
//! let z0 = Tensor::new_input(&context, "Z0");
//! let images = generator.apply(&z0);
//! let scores = discriminator.apply(&images);
//! assert_eq!(scores.len(), 5);
//!
//! // 4. Compile and run.
//! let mut gen = Function::compile(&context, &[&z0], &[&images], None)?;
//! let out = gen.call(&CpuBackend::with_seed(1), &[ArrayD::zeros(vec![8, 64])])?;
//! assert_eq!(out[0].shape(), &[8, 3, 32, 32]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod config;
pub mod data;
pub mod losses;
pub mod network;
pub mod nn;
pub mod optimizers;
pub mod runtime;
pub mod serialization;
pub mod tensor;
pub mod training;
