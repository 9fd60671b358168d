//! Stateless nonlinearities.

use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Slope used by every leaky rectifier in the networks.
pub const LEAK: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Relu,
    LeakyRelu(f32),
    Tanh,
    Sigmoid,
    Identity,
}

impl Activation {
    pub fn leaky() -> Self {
        Activation::LeakyRelu(LEAK)
    }

    pub fn apply(&self, x: &Tensor) -> Tensor {
        match *self {
            Activation::Relu => x.relu(),
            Activation::LeakyRelu(slope) => x.leaky_relu(slope),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => x.sigmoid(),
            Activation::Identity => x.clone(),
        }
    }
}
