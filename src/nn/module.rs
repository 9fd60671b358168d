//! Core traits and records shared by every layer and module.
//!
//! Two levels of building blocks exist:
//! - a [`Layer`] (convolution, linear map, batch norm) adds one operation
//!   pattern to the graph;
//! - a [`Module`] is a named, configured composite of layers with declared
//!   input and output [`Port`]s that networks chain together.

use crate::asg::{AsgError, Shape};
use crate::nn::init::{InitError, Initializer};
use crate::tensor::{GraphContext, SharedValue, Tensor};
use ndarray::ArrayD;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModuleError {
    #[error("module '{module}': {reason}")]
    InvalidConfig { module: String, reason: String },
    #[error("initialization failed: {0}")]
    Init(#[from] InitError),
    #[error("graph error: {0}")]
    Graph(#[from] AsgError),
    #[error("parameter '{name}' expects shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Shape,
        actual: Shape,
    },
}

/// Fails with [`ModuleError::InvalidConfig`] unless `cond` holds.
pub(crate) fn ensure(cond: bool, module: &str, reason: impl FnOnce() -> String) -> Result<(), ModuleError> {
    if cond {
        Ok(())
    } else {
        Err(ModuleError::InvalidConfig {
            module: module.to_string(),
            reason: reason(),
        })
    }
}

/// Runs a module constructor so that on failure none of the parameters it
/// registered stay behind in `context`.
pub(crate) fn register_all_or_none<T>(
    context: &Rc<RefCell<GraphContext>>,
    build: impl FnOnce() -> Result<T, ModuleError>,
) -> Result<T, ModuleError> {
    let before: HashSet<String> = context.borrow().parameter_names().map(str::to_string).collect();
    build().map_err(|err| {
        context.borrow_mut().retain_parameters(|name| before.contains(name));
        err
    })
}

/// A named trainable tensor.
///
/// The value cell is shared with the graph context, so every clone of a
/// `Parameter` (and every compiled function reading it) observes optimizer
/// updates and checkpoint restores immediately. The shape never changes.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    shape: Shape,
    tensor: Tensor,
    value: SharedValue,
}

impl Parameter {
    /// Samples an initial value and registers the parameter under `name`.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        shape: &[usize],
        init: &Initializer,
    ) -> Result<Self, ModuleError> {
        let initial = {
            let mut ctx = context.borrow_mut();
            init.sample(shape, ctx.rng())?
        };
        let (tensor, value) = Tensor::new_parameter(context, name, initial)?;
        Ok(Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            tensor,
            value,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Graph handle used when building expressions.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn value(&self) -> Ref<'_, ArrayD<f32>> {
        self.value.borrow()
    }

    pub(crate) fn value_mut(&self) -> RefMut<'_, ArrayD<f32>> {
        self.value.borrow_mut()
    }

    /// Replaces the value; the new array must have the declared shape.
    pub fn assign(&self, value: ArrayD<f32>) -> Result<(), ModuleError> {
        if value.shape() != self.shape.as_slice() {
            return Err(ModuleError::ShapeMismatch {
                name: self.name.clone(),
                expected: self.shape.clone(),
                actual: value.shape().to_vec(),
            });
        }
        *self.value.borrow_mut() = value;
        Ok(())
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// What flows across the junction between two chained modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    /// `(batch, n)` feature vectors.
    Vector(usize),
    /// `(batch, c, h, w)` feature maps with `c` channels.
    Maps(usize),
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Vector(n) => write!(f, "vector({n})"),
            Port::Maps(c) => write!(f, "maps({c})"),
        }
    }
}

/// Result of applying a module: the features passed down the chain and, for
/// discriminator-side modules, a per-layer score (raw logits).
#[derive(Debug, Clone)]
pub struct ModuleOutput {
    pub features: Tensor,
    pub score: Option<Tensor>,
}

/// A single graph-building operation with its own parameters.
pub trait Layer {
    /// Appends the layer's operations to the graph.
    fn forward(&self, input: &Tensor) -> Tensor;

    /// Parameters in declared order.
    fn parameters(&self) -> Vec<Parameter>;
}

/// A configured building block of a generator or discriminator chain.
pub trait Module {
    fn name(&self) -> &str;

    fn input_port(&self) -> Port;

    fn output_port(&self) -> Port;

    /// Owned parameters in declared order.
    fn params(&self) -> Vec<Parameter>;

    /// Builds the module's computation on `input`. Pure: reads parameters,
    /// never mutates them.
    fn apply(&self, input: &Tensor) -> ModuleOutput;
}
