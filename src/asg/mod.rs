//! ASG: the abstract semantic graph every network is lowered into.
//!
//! Nodes are appended in construction order and only ever reference earlier
//! nodes, so ascending node ids always form a valid topological order. The
//! gradient pass appends its nodes to the same graph, which lets gradient
//! nodes read forward values directly.

use ndarray::ArrayD;
use thiserror::Error;

/// Node identifier (index into [`Asg::nodes`]).
pub type NodeId = usize;
/// Tensor shape.
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("node {node} references later node {operand}; graph is not in topological order")]
    ForwardReference { node: NodeId, operand: NodeId },
    #[error("parameter name '{0}' is already registered in this graph")]
    DuplicateParameter(String),
    #[error("node {0} has no shape information")]
    InvalidShape(NodeId),
}

/// How `Upsample2d` fills the enlarged grid.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpsampleMode {
    /// Every input pixel is repeated over a `factor x factor` block.
    Nearest,
    /// Input pixels land on every `factor`-th position, the rest is zero.
    /// Followed by a convolution this is a strided transposed convolution.
    ZeroInsert,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    /// Static shape, known for parameters and literals.
    pub shape: Option<Shape>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeType {
    // Data
    Input { name: String },
    Parameter { name: String },
    Literal(ArrayD<f32>),
    Scalar(f32),
    /// Standard-normal noise shaped like `like` with axis 1 set to `channels`.
    /// Sampled by the backend on every evaluation.
    RandomNormal { like: NodeId, channels: usize },

    // Binary, numpy-style broadcasting
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    MatrixMultiply(NodeId, NodeId),
    GreaterThan(NodeId, NodeId),

    // Unary
    Negate(NodeId),
    Exp(NodeId),
    Log(NodeId),
    Sqrt(NodeId),
    ReLU(NodeId),
    LeakyReLU(NodeId, f32),
    Sigmoid(NodeId),
    Tanh(NodeId),
    Softplus(NodeId),

    // Reductions
    Sum(NodeId),
    Mean(NodeId),
    /// Sum over `axes`, keeping them with length 1.
    SumAxes { input: NodeId, axes: Vec<usize> },
    /// Mean over `axes`, keeping them with length 1.
    MeanAxes { input: NodeId, axes: Vec<usize> },

    // Layout
    /// Reshape; `0` keeps the input dimension, one `-1` is inferred.
    Reshape(NodeId, Vec<isize>),
    ReshapeLike { input: NodeId, like: NodeId },
    Transpose(NodeId, usize, usize),
    Concat { inputs: Vec<NodeId>, axis: usize },

    // Spatial
    Conv2d { input: NodeId, weight: NodeId, stride: usize, padding: usize },
    Upsample2d { input: NodeId, factor: usize, mode: UpsampleMode },
    AvgPool2d { input: NodeId, size: usize },

    // Gradient companions, emitted by the autograd pass
    Broadcast { source: NodeId, like: NodeId },
    /// Broadcast followed by division by the number of reduced elements.
    /// `axes == None` means every element was reduced.
    BroadcastMean { source: NodeId, like: NodeId, axes: Option<Vec<usize>> },
    ReduceSumTo { source: NodeId, like: NodeId },
    /// The `index`-th piece of a tensor that was concatenated from `parts`.
    Split { source: NodeId, parts: Vec<NodeId>, index: usize, axis: usize },
    Conv2dGradInput { grad: NodeId, weight: NodeId, like: NodeId, stride: usize, padding: usize },
    Conv2dGradWeight { input: NodeId, grad: NodeId, like: NodeId, stride: usize, padding: usize },
    Upsample2dGrad { grad: NodeId, factor: usize, mode: UpsampleMode },
    AvgPool2dGrad { grad: NodeId, like: NodeId, size: usize },
}

impl NodeType {
    /// Ids of the nodes this node reads.
    pub fn operands(&self) -> Vec<NodeId> {
        use NodeType::*;
        match self {
            Input { .. } | Parameter { .. } | Literal(_) | Scalar(_) => vec![],
            RandomNormal { like, .. } => vec![*like],

            Add(a, b) | Subtract(a, b) | Multiply(a, b) | Divide(a, b) | MatrixMultiply(a, b)
            | GreaterThan(a, b) => vec![*a, *b],

            Negate(x) | Exp(x) | Log(x) | Sqrt(x) | ReLU(x) | LeakyReLU(x, _) | Sigmoid(x)
            | Tanh(x) | Softplus(x) | Sum(x) | Mean(x) | Reshape(x, _) | Transpose(x, _, _) => {
                vec![*x]
            }
            SumAxes { input, .. } | MeanAxes { input, .. } => vec![*input],

            ReshapeLike { input, like } => vec![*input, *like],
            Concat { inputs, .. } => inputs.clone(),

            Conv2d { input, weight, .. } => vec![*input, *weight],
            Upsample2d { input, .. } | AvgPool2d { input, .. } => vec![*input],

            Broadcast { source, like }
            | BroadcastMean { source, like, .. }
            | ReduceSumTo { source, like } => vec![*source, *like],
            Split { source, parts, .. } => {
                let mut ids = vec![*source];
                ids.extend(parts.iter().copied());
                ids
            }
            Conv2dGradInput { grad, weight, like, .. } => vec![*grad, *weight, *like],
            Conv2dGradWeight { input, grad, like, .. } => vec![*input, *grad, *like],
            Upsample2dGrad { grad, .. } => vec![*grad],
            AvgPool2dGrad { grad, like, .. } => vec![*grad, *like],
        }
    }

    /// Short operation name for error messages and logs.
    pub fn op_name(&self) -> &'static str {
        use NodeType::*;
        match self {
            Input { .. } => "Input",
            Parameter { .. } => "Parameter",
            Literal(_) => "Literal",
            Scalar(_) => "Scalar",
            RandomNormal { .. } => "RandomNormal",
            Add(..) => "Add",
            Subtract(..) => "Subtract",
            Multiply(..) => "Multiply",
            Divide(..) => "Divide",
            MatrixMultiply(..) => "MatrixMultiply",
            GreaterThan(..) => "GreaterThan",
            Negate(_) => "Negate",
            Exp(_) => "Exp",
            Log(_) => "Log",
            Sqrt(_) => "Sqrt",
            ReLU(_) => "ReLU",
            LeakyReLU(..) => "LeakyReLU",
            Sigmoid(_) => "Sigmoid",
            Tanh(_) => "Tanh",
            Softplus(_) => "Softplus",
            Sum(_) => "Sum",
            Mean(_) => "Mean",
            SumAxes { .. } => "SumAxes",
            MeanAxes { .. } => "MeanAxes",
            Reshape(..) => "Reshape",
            ReshapeLike { .. } => "ReshapeLike",
            Transpose(..) => "Transpose",
            Concat { .. } => "Concat",
            Conv2d { .. } => "Conv2d",
            Upsample2d { .. } => "Upsample2d",
            AvgPool2d { .. } => "AvgPool2d",
            Broadcast { .. } => "Broadcast",
            BroadcastMean { .. } => "BroadcastMean",
            ReduceSumTo { .. } => "ReduceSumTo",
            Split { .. } => "Split",
            Conv2dGradInput { .. } => "Conv2dGradInput",
            Conv2dGradWeight { .. } => "Conv2dGradWeight",
            Upsample2dGrad { .. } => "Upsample2dGrad",
            AvgPool2dGrad { .. } => "AvgPool2dGrad",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Asg {
    pub nodes: Vec<Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let id = self.nodes.len();
        let shape = match &node_type {
            NodeType::Literal(arr) => Some(arr.shape().to_vec()),
            NodeType::Scalar(_) => Some(vec![]),
            _ => None,
        };
        self.nodes.push(Node { id, name, node_type, shape });
        id
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(id).ok_or(AsgError::NodeNotFound(id))
    }

    /// Every node `roots` depend on (roots included), in topological order.
    ///
    /// Operands always precede their users, so the order is simply ascending
    /// ids; a node referencing a later one is reported as a malformed graph.
    pub fn ancestors(&self, roots: &[NodeId]) -> AsgResult<Vec<NodeId>> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = Vec::with_capacity(roots.len());
        for &root in roots {
            self.get_node(root)?;
            stack.push(root);
        }
        while let Some(id) = stack.pop() {
            if seen[id] {
                continue;
            }
            seen[id] = true;
            for operand in self.nodes[id].node_type.operands() {
                if operand >= id {
                    return Err(AsgError::ForwardReference { node: id, operand });
                }
                if !seen[operand] {
                    stack.push(operand);
                }
            }
        }
        Ok(seen
            .iter()
            .enumerate()
            .filter_map(|(id, &s)| s.then_some(id))
            .collect())
    }

    /// Finds the `Input` node registered under `name`.
    pub fn find_input(&self, name: &str) -> Option<NodeId> {
        self.inputs.iter().copied().find(|&id| {
            matches!(&self.nodes[id].node_type, NodeType::Input { name: n } if n == name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_insertion_order() {
        let mut g = Asg::new();
        let a = g.add_node(Some("a".into()), NodeType::Input { name: "a".into() });
        let b = g.add_node(None, NodeType::Scalar(2.0));
        let c = g.add_node(None, NodeType::Multiply(a, b));
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(g.get_node(c).unwrap().node_type.operands(), vec![a, b]);
        assert_eq!(g.get_node(b).unwrap().shape, Some(vec![]));
        assert_eq!(g.get_node(7), Err(AsgError::NodeNotFound(7)));
    }

    #[test]
    fn ancestors_skip_unrelated_nodes() {
        let mut g = Asg::new();
        let a = g.add_node(None, NodeType::Scalar(1.0));
        let unrelated = g.add_node(None, NodeType::Scalar(5.0));
        let b = g.add_node(None, NodeType::Exp(a));
        let c = g.add_node(None, NodeType::Add(b, a));
        assert_eq!(g.ancestors(&[c]).unwrap(), vec![a, b, c]);
        assert!(!g.ancestors(&[c]).unwrap().contains(&unrelated));
        assert_eq!(g.ancestors(&[9]), Err(AsgError::NodeNotFound(9)));
    }

    #[test]
    fn split_reads_source_and_parts() {
        let op = NodeType::Split { source: 5, parts: vec![1, 2], index: 1, axis: 1 };
        assert_eq!(op.operands(), vec![5, 1, 2]);
        assert_eq!(op.op_name(), "Split");
    }
}
