//! `Tensor` handles and the `GraphContext` that owns the graph they point into.
//!
//! A `Tensor` holds no data. It is a node id plus a shared reference to the
//! context, and every operation on it appends a node to the context's graph.
//! Actual numbers only appear when a compiled [`Function`](crate::runtime::Function)
//! runs the graph on a backend.
//!
//! The context also owns the values of all parameters (keyed by their unique
//! names) and the RNG used to initialize them.

use crate::asg::{Asg, AsgError, AsgResult, NodeId, NodeType, UpsampleMode};
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

/// Mutable parameter storage shared between a module, its collections and
/// the compiled functions that read or update it.
pub type SharedValue = Rc<RefCell<ArrayD<f32>>>;

#[derive(Debug)]
pub struct GraphContext {
    main_graph: Asg,
    parameters: HashMap<String, SharedValue>,
    rng: StdRng,
}

impl GraphContext {
    /// Creates an empty context with an entropy-seeded init RNG.
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Creates an empty context whose parameter initialization is reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            main_graph: Asg::new(),
            parameters: HashMap::new(),
            rng,
        }
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Value cell of the parameter registered under `name`.
    pub fn parameter_value(&self, name: &str) -> Option<SharedValue> {
        self.parameters.get(name).cloned()
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.parameters.keys().map(String::as_str)
    }

    /// Unregisters every parameter whose name fails `keep`. Their graph
    /// nodes remain but no compiled function can bind them.
    pub(crate) fn retain_parameters(&mut self, keep: impl Fn(&str) -> bool) {
        self.parameters.retain(|name, _| keep(name));
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbolic handle to a node of the context graph.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub node_id: NodeId,
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    /// Creates a graph input. Its value is fed by name when a function runs.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let mut ctx = context.borrow_mut();
        let graph = ctx.main_graph_mut();
        let node_id = graph.add_node(
            Some(name.to_string()),
            NodeType::Input {
                name: name.to_string(),
            },
        );
        graph.inputs.push(node_id);
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Registers a parameter node holding `value`.
    ///
    /// Parameter names double as checkpoint keys, so a second registration
    /// under the same name is rejected.
    pub fn new_parameter(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        value: ArrayD<f32>,
    ) -> AsgResult<(Self, SharedValue)> {
        let mut ctx = context.borrow_mut();
        if ctx.has_parameter(name) {
            return Err(AsgError::DuplicateParameter(name.to_string()));
        }
        let shape = value.shape().to_vec();
        let graph = ctx.main_graph_mut();
        let node_id = graph.add_node(
            Some(name.to_string()),
            NodeType::Parameter {
                name: name.to_string(),
            },
        );
        graph.get_node_mut(node_id)?.shape = Some(shape);

        let cell = Rc::new(RefCell::new(value));
        ctx.parameters.insert(name.to_string(), Rc::clone(&cell));
        Ok((
            Self {
                node_id,
                context: Rc::clone(context),
            },
            cell,
        ))
    }

    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Literal(data));
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(None, NodeType::Scalar(value));
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Wraps an existing node of `context`.
    pub fn from_node(context: &Rc<RefCell<GraphContext>>, node_id: NodeId) -> Self {
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    fn derive(&self, node_type: NodeType) -> Self {
        let node_id = self
            .context
            .borrow_mut()
            .main_graph_mut()
            .add_node(None, node_type);
        Self {
            node_id,
            context: Rc::clone(&self.context),
        }
    }

    /// Matrix product of two 2-d tensors.
    pub fn dot(&self, other: &Tensor) -> Self {
        self.derive(NodeType::MatrixMultiply(self.node_id, other.node_id))
    }

    pub fn sqrt(&self) -> Self {
        self.derive(NodeType::Sqrt(self.node_id))
    }

    pub fn exp(&self) -> Self {
        self.derive(NodeType::Exp(self.node_id))
    }

    pub fn log(&self) -> Self {
        self.derive(NodeType::Log(self.node_id))
    }

    pub fn square(&self) -> Self {
        self * self
    }

    pub fn relu(&self) -> Self {
        self.derive(NodeType::ReLU(self.node_id))
    }

    pub fn leaky_relu(&self, slope: f32) -> Self {
        self.derive(NodeType::LeakyReLU(self.node_id, slope))
    }

    pub fn sigmoid(&self) -> Self {
        self.derive(NodeType::Sigmoid(self.node_id))
    }

    pub fn tanh(&self) -> Self {
        self.derive(NodeType::Tanh(self.node_id))
    }

    /// `ln(1 + e^x)`, evaluated without overflow for large `|x|`.
    pub fn softplus(&self) -> Self {
        self.derive(NodeType::Softplus(self.node_id))
    }

    /// 1.0 where `self > other`, 0.0 elsewhere.
    pub fn greater_than(&self, other: &Tensor) -> Self {
        self.derive(NodeType::GreaterThan(self.node_id, other.node_id))
    }

    pub fn scale(&self, factor: f32) -> Self {
        let factor = Tensor::scalar(&self.context, factor);
        self * &factor
    }

    pub fn add_scalar(&self, value: f32) -> Self {
        let value = Tensor::scalar(&self.context, value);
        self + &value
    }

    /// Sum of all elements (0-d result).
    pub fn sum(&self) -> Self {
        self.derive(NodeType::Sum(self.node_id))
    }

    /// Mean of all elements (0-d result).
    pub fn mean(&self) -> Self {
        self.derive(NodeType::Mean(self.node_id))
    }

    pub fn sum_axes(&self, axes: &[usize]) -> Self {
        self.derive(NodeType::SumAxes {
            input: self.node_id,
            axes: axes.to_vec(),
        })
    }

    pub fn mean_axes(&self, axes: &[usize]) -> Self {
        self.derive(NodeType::MeanAxes {
            input: self.node_id,
            axes: axes.to_vec(),
        })
    }

    /// Reshape. A `0` entry keeps the input dimension at that position and
    /// one entry may be `-1`.
    pub fn reshape(&self, shape: Vec<isize>) -> Self {
        self.derive(NodeType::Reshape(self.node_id, shape))
    }

    /// Collapses every axis after the first: `(batch, ...) -> (batch, rest)`.
    pub fn flatten(&self) -> Self {
        self.reshape(vec![0, -1])
    }

    pub fn transpose(&self, axis1: usize, axis2: usize) -> Self {
        self.derive(NodeType::Transpose(self.node_id, axis1, axis2))
    }

    /// NCHW convolution with an `(out, in, kh, kw)` filter bank.
    pub fn conv2d(&self, weight: &Tensor, stride: usize, padding: usize) -> Self {
        self.derive(NodeType::Conv2d {
            input: self.node_id,
            weight: weight.node_id,
            stride,
            padding,
        })
    }

    pub fn upsample2d(&self, factor: usize, mode: UpsampleMode) -> Self {
        self.derive(NodeType::Upsample2d {
            input: self.node_id,
            factor,
            mode,
        })
    }

    /// Non-overlapping `size x size` average pooling.
    pub fn avg_pool2d(&self, size: usize) -> Self {
        self.derive(NodeType::AvgPool2d {
            input: self.node_id,
            size,
        })
    }

    /// Fresh `N(0, 1)` noise with the batch (and spatial) extent of `self`
    /// and `channels` entries along axis 1.
    pub fn random_normal_like(&self, channels: usize) -> Self {
        self.derive(NodeType::RandomNormal {
            like: self.node_id,
            channels,
        })
    }

    /// Concatenates `parts` along `axis`. All parts must share one context.
    ///
    /// # Panics
    ///
    /// If `parts` is empty.
    pub fn concat(parts: &[&Tensor], axis: usize) -> Self {
        assert!(!parts.is_empty(), "concat needs at least one tensor");
        let inputs = parts.iter().map(|t| t.node_id).collect();
        parts[0].derive(NodeType::Concat { inputs, axis })
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $variant:ident) => {
        impl $trait<&Tensor> for &Tensor {
            type Output = Tensor;

            fn $method(self, rhs: &Tensor) -> Self::Output {
                self.derive(NodeType::$variant(self.node_id, rhs.node_id))
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Sub, sub, Subtract);
impl_binary_op!(Mul, mul, Multiply);
impl_binary_op!(Div, div, Divide);

impl Neg for &Tensor {
    type Output = Tensor;

    fn neg(self) -> Self::Output {
        self.derive(NodeType::Negate(self.node_id))
    }
}
