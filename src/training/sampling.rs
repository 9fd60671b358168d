//! Drawing images from a trained generator.

use super::{Result, TrainError};
use crate::network::{Generator, GeneratorConfig};
use crate::runtime::{CpuBackend, Function};
use crate::serialization::{load_collection, CheckpointInfo};
use crate::tensor::{GraphContext, Tensor};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use tracing::info;

/// Draws a `(count, nz0)` standard normal latent batch.
pub fn normal_latent(rng: &mut StdRng, count: usize, nz0: usize) -> ArrayD<f32> {
    ArrayD::random_using(IxDyn(&[count, nz0]), StandardNormal, rng)
}

/// A generator on its own graph, compiled for evaluation only.
pub struct ImageSampler {
    generator: Generator,
    gen: Function,
    backend: CpuBackend,
    rng: StdRng,
    nz0: usize,
}

impl ImageSampler {
    pub fn new(config: &GeneratorConfig, seed: u64) -> Result<Self> {
        let context = Rc::new(RefCell::new(GraphContext::with_seed(seed)));
        let generator = Generator::new(&context, config)?;
        let z0 = Tensor::new_input(&context, "Z0");
        let gx = generator.apply(&z0);
        let gen = Function::compile(&context, &[&z0], &[&gx], None)?;
        Ok(Self {
            generator,
            gen,
            backend: CpuBackend::with_seed(seed.wrapping_add(1)),
            rng: StdRng::seed_from_u64(seed.wrapping_add(2)),
            nz0: config.nz0,
        })
    }

    /// Replaces the generator parameters with a saved `gen` checkpoint.
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<CheckpointInfo> {
        let info = load_collection(path.as_ref(), &self.generator.params())?;
        info!(path = %path.as_ref().display(), epoch = info.epoch, "loaded generator");
        Ok(info)
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    /// Images for the given `(n, nz0)` latent batch.
    pub fn generate_from(&mut self, z0: ArrayD<f32>) -> Result<ArrayD<f32>> {
        if z0.ndim() != 2 || z0.shape()[1] != self.nz0 {
            return Err(TrainError::LatentShape {
                shape: z0.shape().to_vec(),
                nz0: self.nz0,
            });
        }
        let mut out = self
            .gen
            .call(&self.backend, &[z0])
            .map_err(|e| TrainError::from_function(e, 0))?;
        Ok(out.remove(0))
    }

    /// `count` images from fresh latent draws.
    pub fn generate(&mut self, count: usize) -> Result<ArrayD<f32>> {
        let z0 = normal_latent(&mut self.rng, count, self.nz0);
        self.generate_from(z0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> GeneratorConfig {
        GeneratorConfig {
            nz0: 4,
            nz1: 2,
            ngf: 2,
            nc: 3,
            npx: 16,
            ..GeneratorConfig::default()
        }
    }

    #[test]
    fn generates_images_in_tanh_range() {
        let mut sampler = ImageSampler::new(&tiny(), 5).unwrap();
        let images = sampler.generate(3).unwrap();
        assert_eq!(images.shape(), &[3, 3, 16, 16]);
        assert!(images.iter().all(|v| v.abs() < 1.0));
    }

    #[test]
    fn rejects_a_latent_of_the_wrong_width() {
        let mut sampler = ImageSampler::new(&tiny(), 5).unwrap();
        assert!(matches!(
            sampler.generate_from(ArrayD::zeros(IxDyn(&[2, 5]))),
            Err(TrainError::LatentShape { nz0: 4, .. })
        ));
    }
}
