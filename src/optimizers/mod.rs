//! Optimizers that update parameter values in place.
//!
//! Optimizers work on real numeric data on the CPU. They receive a
//! [`ParameterCollection`] and the gradients computed for it (in the same
//! order) and apply their update rule to the shared value cells.

use crate::network::ParameterCollection;
use ndarray::{ArrayD, Zip};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("expected {expected} gradients, got {actual}")]
    GradientCount { expected: usize, actual: usize },

    #[error("gradient for '{name}' has shape {actual:?}, parameter has {expected:?}")]
    GradientShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("optimizer state was built for {expected} parameters, got {actual}")]
    StateMismatch { expected: usize, actual: usize },
}

/// Common interface of every optimizer.
pub trait Optimizer {
    /// Applies one update. `grads[i]` belongs to the `i`-th parameter of
    /// `params`. Nothing is written if the gradients do not line up.
    fn step(&mut self, params: &ParameterCollection, grads: &[ArrayD<f32>]) -> Result<(), OptimizerError>;

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);
}

fn check_gradients(params: &ParameterCollection, grads: &[ArrayD<f32>]) -> Result<(), OptimizerError> {
    if grads.len() != params.len() {
        return Err(OptimizerError::GradientCount {
            expected: params.len(),
            actual: grads.len(),
        });
    }
    for (p, g) in params.iter().zip(grads) {
        if g.shape() != p.shape() {
            return Err(OptimizerError::GradientShape {
                name: p.name().to_string(),
                expected: p.shape().to_vec(),
                actual: g.shape().to_vec(),
            });
        }
    }
    Ok(())
}

/// Plain stochastic gradient descent: `p -= lr * g`.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &ParameterCollection, grads: &[ArrayD<f32>]) -> Result<(), OptimizerError> {
        check_gradients(params, grads)?;
        for (param, grad) in params.iter().zip(grads) {
            let mut value = param.value_mut();
            let lr = self.lr;
            Zip::from(&mut *value).and(grad).for_each(|p, &g| *p -= lr * g);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Hyperparameters of [`Adam`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub lr: f32,
    pub b1: f32,
    pub b2: f32,
    pub eps: f32,
    /// L2 regularization strength, added to the gradient as `l2 * p`.
    pub l2: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            b1: 0.5,
            b2: 0.999,
            eps: 1e-8,
            l2: 2e-5,
        }
    }
}

/// Adam with bias correction and an L2 regularizer on the gradient.
///
/// Moment estimates are allocated lazily on the first step and are tied to
/// the collection seen then.
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    t: u32,
    m: Vec<ArrayD<f32>>,
    v: Vec<ArrayD<f32>>,
}

impl Adam {
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Number of steps taken so far.
    pub fn steps(&self) -> u32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &ParameterCollection, grads: &[ArrayD<f32>]) -> Result<(), OptimizerError> {
        check_gradients(params, grads)?;
        if self.m.is_empty() {
            self.m = params.iter().map(|p| ArrayD::zeros(p.shape())).collect();
            self.v = self.m.clone();
        } else if self.m.len() != params.len() {
            return Err(OptimizerError::StateMismatch {
                expected: self.m.len(),
                actual: params.len(),
            });
        }

        self.t += 1;
        let AdamConfig { lr, b1, b2, eps, l2 } = self.config;
        let t = self.t as i32;
        let lr_t = lr * (1.0 - b2.powi(t)).sqrt() / (1.0 - b1.powi(t));

        for (((param, grad), m), v) in params.iter().zip(grads).zip(&mut self.m).zip(&mut self.v) {
            let mut value = param.value_mut();
            Zip::from(&mut *value)
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    let g = g + l2 * *p;
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *p -= lr_t * *m / (v.sqrt() + eps);
                });
        }
        debug!(step = self.t, lr, "adam update");
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.config.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Initializer, Parameter};
    use crate::tensor::GraphContext;
    use approx::assert_abs_diff_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn single(value: f32) -> ParameterCollection {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let p = Parameter::new(&ctx, "w", &[2], &Initializer::Constant(value)).unwrap();
        let mut c = ParameterCollection::new("test");
        c.push(p);
        c
    }

    #[test]
    fn sgd_moves_against_the_gradient() {
        let params = single(1.0);
        let mut sgd = Sgd::new(0.1);
        sgd.step(&params, &[ArrayD::from_elem(vec![2], 2.0)]).unwrap();
        assert!(params.params()[0].value().iter().all(|&x| (x - 0.8).abs() < 1e-6));
    }

    #[test]
    fn first_adam_step_has_size_lr() {
        let params = single(1.0);
        let mut adam = Adam::new(AdamConfig {
            lr: 0.01,
            l2: 0.0,
            ..AdamConfig::default()
        });
        adam.step(&params, &[ArrayD::from_elem(vec![2], 3.0)]).unwrap();
        for &x in params.params()[0].value().iter() {
            assert_abs_diff_eq!(x, 0.99, epsilon = 1e-5);
        }
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn l2_pulls_weights_toward_zero_without_gradient() {
        let params = single(5.0);
        let mut adam = Adam::new(AdamConfig {
            lr: 0.1,
            l2: 1.0,
            ..AdamConfig::default()
        });
        adam.step(&params, &[ArrayD::zeros(vec![2])]).unwrap();
        assert!(params.params()[0].value().iter().all(|&x| x < 5.0));
    }

    #[test]
    fn mismatched_gradients_leave_values_untouched() {
        let params = single(1.0);
        let mut adam = Adam::new(AdamConfig::default());
        let err = adam.step(&params, &[ArrayD::zeros(vec![3])]).unwrap_err();
        assert!(matches!(err, OptimizerError::GradientShape { .. }));
        assert_eq!(
            adam.step(&params, &[]),
            Err(OptimizerError::GradientCount { expected: 1, actual: 0 })
        );
        assert!(params.params()[0].value().iter().all(|&x| x == 1.0));
        assert_eq!(adam.steps(), 0);

        adam.set_learning_rate(0.5);
        assert_eq!(adam.learning_rate(), 0.5);
    }
}
