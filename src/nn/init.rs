//! Parameter initializers.

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InitError {
    #[error("cannot initialize a tensor of shape {0:?}: every dimension must be positive")]
    InvalidShape(Vec<usize>),
    #[error("invalid normal distribution (mean {mean}, std {std})")]
    InvalidDistribution { mean: f32, std: f32 },
}

/// Sampling scheme for fresh parameter values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initializer {
    Normal { mean: f32, std: f32 },
    Constant(f32),
}

impl Default for Initializer {
    /// Small zero-centred weights, `N(0, 0.02)`.
    fn default() -> Self {
        Initializer::Normal {
            mean: 0.0,
            std: 0.02,
        }
    }
}

impl Initializer {
    pub fn normal(std: f32) -> Self {
        Initializer::Normal { mean: 0.0, std }
    }

    /// Batch-norm gain init, `N(1, 0.02)`.
    pub fn gain() -> Self {
        Initializer::Normal {
            mean: 1.0,
            std: 0.02,
        }
    }

    pub fn zeros() -> Self {
        Initializer::Constant(0.0)
    }

    pub fn sample<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> Result<ArrayD<f32>, InitError> {
        if shape.is_empty() || shape.contains(&0) {
            return Err(InitError::InvalidShape(shape.to_vec()));
        }
        match *self {
            Initializer::Normal { mean, std } => {
                let dist = Normal::new(mean, std)
                    .map_err(|_| InitError::InvalidDistribution { mean, std })?;
                Ok(ArrayD::random_using(IxDyn(shape), dist, rng))
            }
            Initializer::Constant(c) => Ok(ArrayD::from_elem(IxDyn(shape), c)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn normal_init_statistics() {
        let mut rng = StdRng::seed_from_u64(3);
        let w = Initializer::default().sample(&[64, 64], &mut rng).unwrap();
        assert_eq!(w.shape(), &[64, 64]);
        let mean = w.mean().unwrap();
        let std = w.std(0.0);
        assert!(mean.abs() < 0.002, "mean {mean}");
        assert!((std - 0.02).abs() < 0.002, "std {std}");

        let g = Initializer::gain().sample(&[512], &mut rng).unwrap();
        assert!((g.mean().unwrap() - 1.0).abs() < 0.01);
    }

    #[test]
    fn constant_and_invalid_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        let b = Initializer::zeros().sample(&[3], &mut rng).unwrap();
        assert!(b.iter().all(|&v| v == 0.0));

        assert_eq!(
            Initializer::default().sample(&[], &mut rng),
            Err(InitError::InvalidShape(vec![]))
        );
        assert_eq!(
            Initializer::default().sample(&[4, 0, 3], &mut rng),
            Err(InitError::InvalidShape(vec![4, 0, 3]))
        );
        assert!(matches!(
            Initializer::normal(-1.0).sample(&[2], &mut rng),
            Err(InitError::InvalidDistribution { .. })
        ));
    }

    #[test]
    fn same_seed_same_values() {
        let a = Initializer::default().sample(&[5, 5], &mut StdRng::seed_from_u64(9)).unwrap();
        let b = Initializer::default().sample(&[5, 5], &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(a, b);
    }
}
