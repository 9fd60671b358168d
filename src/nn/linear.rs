//! Fully connected layer without bias.

use crate::nn::init::Initializer;
use crate::nn::module::{Layer, ModuleError, Parameter};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// `y = x · W` for `x` of shape `(batch, in_features)`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weights: Parameter,
}

impl Linear {
    /// Registers an `(in_features, out_features)` weight matrix as `name`.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_features: usize,
        out_features: usize,
        init: &Initializer,
    ) -> Result<Self, ModuleError> {
        let weights = Parameter::new(context, name, &[in_features, out_features], init)?;
        Ok(Self { weights })
    }

    pub fn in_features(&self) -> usize {
        self.weights.shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weights.shape()[1]
    }
}

impl Layer for Linear {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.dot(self.weights.tensor())
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![self.weights.clone()]
    }
}
