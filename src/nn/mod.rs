//! # Neural Network Building Blocks
//!
//! Each layer is a constructor that registers its parameters in a
//! [`GraphContext`](crate::tensor::GraphContext) and, when applied, appends
//! its pattern of nodes to the graph.
//!
//! ## Layers
//! - [`Linear`]: bias-free fully connected map
//! - [`Conv2d`]: bias-free 2D convolution with "same" padding
//! - [`BatchNorm`]: minibatch normalization with learned gain and shift
//!
//! ## Matryoshka modules
//! Named composites with declared [`Port`]s that networks chain together:
//! - generator side: [`GenUniModule`], [`GenConvModule`], [`GenFcModule`]
//! - discriminator side: [`DiscConvModule`], [`DiscFcModule`]
//! - plain: [`BasicConvModule`]
//!
//! [`ModuleConfig`] and [`MatryoshkaModule`] close the family into enums.
//!
//! ## Example
//!
//! ```ignore
//! use matryoshka_gan::nn::{DiscConvConfig, DiscConvModule, Module};
//! use matryoshka_gan::tensor::{GraphContext, Tensor};
//!
//! let ctx = Rc::new(RefCell::new(GraphContext::new()));
//! let block = DiscConvModule::new(&ctx, DiscConvConfig::new("disc_mod_1", 5, 3, 32))?;
//! let x = Tensor::new_input(&ctx, "x");
//! let out = block.apply(&x);
//! ```

pub mod activations;
pub mod basic;
pub mod batchnorm;
pub mod conv;
pub mod discriminator;
pub mod generator;
pub mod init;
pub mod linear;
pub mod matryoshka;
pub mod module;

pub use activations::{Activation, LEAK};
pub use basic::{BasicConvConfig, BasicConvModule};
pub use batchnorm::{BatchNorm, NormLayout, BN_EPS};
pub use conv::{Conv2d, Conv2dConfig};
pub use discriminator::{DiscConvConfig, DiscConvModule, DiscFcConfig, DiscFcModule};
pub use generator::{
    GenConvConfig, GenConvModule, GenFcConfig, GenFcModule, GenUniConfig, GenUniModule,
};
pub use init::{InitError, Initializer};
pub use linear::Linear;
pub use matryoshka::{MatryoshkaModule, ModuleConfig};
pub use module::{Layer, Module, ModuleError, ModuleOutput, Parameter, Port};
