//! Symbolic reverse-mode differentiation.
//!
//! The pass walks the ancestors of a scalar loss in reverse topological order
//! and, for every node with an incoming gradient, appends the nodes computing
//! its operands' contributions. Gradient nodes are appended to the same graph
//! as the forward pass, so they read forward values (activations, noise
//! samples) from the same evaluation instead of recomputing them.
//!
//! Only nodes lying on a path between the loss and one of the requested
//! leaves are differentiated; the rest of the graph gets no gradient nodes.

use crate::asg::{Asg, AsgError, NodeId, NodeType};
use crate::tensor::Tensor;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutogradError {
    #[error("ASG: {0}")]
    Asg(#[from] AsgError),
    #[error("operation '{0}' cannot be differentiated")]
    Unsupported(&'static str),
    #[error("tensors belong to different graph contexts")]
    ForeignTensor,
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Gradient builder over a graph that is extended in place.
pub struct Gradients<'a> {
    graph: &'a mut Asg,
    gmap: HashMap<NodeId, NodeId>,
    needs_grad: Vec<bool>,
}

impl<'a> Gradients<'a> {
    pub fn new(graph: &'a mut Asg) -> Self {
        Self {
            graph,
            gmap: HashMap::new(),
            needs_grad: Vec::new(),
        }
    }

    /// Appends `d(loss)/d(x)` for every `x` in `wrt` and returns the gradient
    /// node ids in the same order. A leaf the loss does not depend on gets an
    /// all-zero gradient.
    pub fn build(&mut self, loss: NodeId, wrt: &[NodeId]) -> AutogradResult<Vec<NodeId>> {
        let order = self.graph.ancestors(&[loss])?;

        self.needs_grad = vec![false; self.graph.len()];
        for &leaf in wrt {
            self.graph.get_node(leaf)?;
            self.needs_grad[leaf] = true;
        }
        for &id in &order {
            if !self.needs_grad[id] {
                let ops = self.graph.nodes[id].node_type.operands();
                self.needs_grad[id] = ops.iter().any(|&op| self.needs_grad[op]);
            }
        }

        let seed = self.add_node(NodeType::Scalar(1.0));
        self.gmap.insert(loss, seed);

        for &id in order.iter().rev() {
            if !self.needs_grad[id] {
                continue;
            }
            let Some(g_out) = self.gmap.get(&id).copied() else {
                continue;
            };
            let node_type = self.graph.get_node(id)?.node_type.clone();
            self.backprop(id, &node_type, g_out)?;
        }

        let mut grads = Vec::with_capacity(wrt.len());
        for &leaf in wrt {
            let g = match self.gmap.get(&leaf) {
                Some(&g) => g,
                None => {
                    let zero = self.add_node(NodeType::Scalar(0.0));
                    self.add_node(NodeType::Broadcast { source: zero, like: leaf })
                }
            };
            grads.push(g);
        }
        Ok(grads)
    }

    fn backprop(&mut self, y: NodeId, node_type: &NodeType, g: NodeId) -> AutogradResult<()> {
        use NodeType::*;
        match node_type {
            Input { .. } | Parameter { .. } | Literal(_) | Scalar(_) | RandomNormal { .. } => {}
            GreaterThan(..) => {}

            Add(a, b) => {
                self.acc_reduced(*a, g)?;
                self.acc_reduced(*b, g)?;
            }
            Subtract(a, b) => {
                self.acc_reduced(*a, g)?;
                if self.wants(*b) {
                    let neg = self.add_node(Negate(g));
                    self.acc_reduced(*b, neg)?;
                }
            }
            Multiply(a, b) => {
                if self.wants(*a) {
                    let ga = self.add_node(Multiply(g, *b));
                    self.acc_reduced(*a, ga)?;
                }
                if self.wants(*b) {
                    let gb = self.add_node(Multiply(g, *a));
                    self.acc_reduced(*b, gb)?;
                }
            }
            Divide(a, b) => {
                if self.wants(*a) {
                    let ga = self.add_node(Divide(g, *b));
                    self.acc_reduced(*a, ga)?;
                }
                if self.wants(*b) {
                    // d(a/b)/db = -(a/b)/b
                    let gy = self.add_node(Multiply(g, y));
                    let q = self.add_node(Divide(gy, *b));
                    let gb = self.add_node(Negate(q));
                    self.acc_reduced(*b, gb)?;
                }
            }
            MatrixMultiply(a, b) => {
                if self.wants(*a) {
                    let bt = self.add_node(Transpose(*b, 0, 1));
                    let ga = self.add_node(MatrixMultiply(g, bt));
                    self.acc(*a, ga);
                }
                if self.wants(*b) {
                    let at = self.add_node(Transpose(*a, 0, 1));
                    let gb = self.add_node(MatrixMultiply(at, g));
                    self.acc(*b, gb);
                }
            }

            Negate(x) => {
                let gx = self.add_node(Negate(g));
                self.acc(*x, gx);
            }
            Exp(x) => {
                let gx = self.add_node(Multiply(g, y));
                self.acc(*x, gx);
            }
            Log(x) => {
                let gx = self.add_node(Divide(g, *x));
                self.acc(*x, gx);
            }
            Sqrt(x) => {
                let two = self.add_node(Scalar(2.0));
                let denom = self.add_node(Multiply(y, two));
                let gx = self.add_node(Divide(g, denom));
                self.acc(*x, gx);
            }
            ReLU(x) => {
                let zero = self.add_node(Scalar(0.0));
                let mask = self.add_node(GreaterThan(*x, zero));
                let gx = self.add_node(Multiply(g, mask));
                self.acc(*x, gx);
            }
            LeakyReLU(x, slope) => {
                // factor = mask * (1 - slope) + slope
                let zero = self.add_node(Scalar(0.0));
                let mask = self.add_node(GreaterThan(*x, zero));
                let span = self.add_node(Scalar(1.0 - slope));
                let scaled = self.add_node(Multiply(mask, span));
                let floor = self.add_node(Scalar(*slope));
                let factor = self.add_node(Add(scaled, floor));
                let gx = self.add_node(Multiply(g, factor));
                self.acc(*x, gx);
            }
            Sigmoid(x) => {
                let one = self.add_node(Scalar(1.0));
                let rest = self.add_node(Subtract(one, y));
                let local = self.add_node(Multiply(y, rest));
                let gx = self.add_node(Multiply(g, local));
                self.acc(*x, gx);
            }
            Tanh(x) => {
                let one = self.add_node(Scalar(1.0));
                let sq = self.add_node(Multiply(y, y));
                let local = self.add_node(Subtract(one, sq));
                let gx = self.add_node(Multiply(g, local));
                self.acc(*x, gx);
            }
            Softplus(x) => {
                let sig = self.add_node(Sigmoid(*x));
                let gx = self.add_node(Multiply(g, sig));
                self.acc(*x, gx);
            }

            Sum(x) | SumAxes { input: x, .. } => {
                let gx = self.add_node(Broadcast { source: g, like: *x });
                self.acc(*x, gx);
            }
            Mean(x) => {
                let gx = self.add_node(BroadcastMean {
                    source: g,
                    like: *x,
                    axes: None,
                });
                self.acc(*x, gx);
            }
            MeanAxes { input, axes } => {
                let gx = self.add_node(BroadcastMean {
                    source: g,
                    like: *input,
                    axes: Some(axes.clone()),
                });
                self.acc(*input, gx);
            }

            Reshape(x, _) | ReshapeLike { input: x, .. } => {
                let gx = self.add_node(ReshapeLike { input: g, like: *x });
                self.acc(*x, gx);
            }
            Transpose(x, a1, a2) => {
                let gx = self.add_node(Transpose(g, *a1, *a2));
                self.acc(*x, gx);
            }
            Concat { inputs, axis } => {
                for (index, &part) in inputs.iter().enumerate() {
                    if !self.wants(part) {
                        continue;
                    }
                    let gp = self.add_node(Split {
                        source: g,
                        parts: inputs.clone(),
                        index,
                        axis: *axis,
                    });
                    self.acc(part, gp);
                }
            }

            Conv2d {
                input,
                weight,
                stride,
                padding,
            } => {
                if self.wants(*input) {
                    let gx = self.add_node(Conv2dGradInput {
                        grad: g,
                        weight: *weight,
                        like: *input,
                        stride: *stride,
                        padding: *padding,
                    });
                    self.acc(*input, gx);
                }
                if self.wants(*weight) {
                    let gw = self.add_node(Conv2dGradWeight {
                        input: *input,
                        grad: g,
                        like: *weight,
                        stride: *stride,
                        padding: *padding,
                    });
                    self.acc(*weight, gw);
                }
            }
            Upsample2d {
                input,
                factor,
                mode,
            } => {
                let gx = self.add_node(Upsample2dGrad {
                    grad: g,
                    factor: *factor,
                    mode: *mode,
                });
                self.acc(*input, gx);
            }
            AvgPool2d { input, size } => {
                let gx = self.add_node(AvgPool2dGrad {
                    grad: g,
                    like: *input,
                    size: *size,
                });
                self.acc(*input, gx);
            }

            other => return Err(AutogradError::Unsupported(other.op_name())),
        }
        Ok(())
    }

    fn wants(&self, id: NodeId) -> bool {
        self.needs_grad.get(id).copied().unwrap_or(false)
    }

    fn add_node(&mut self, node_type: NodeType) -> NodeId {
        self.graph.add_node(None, node_type)
    }

    /// Accumulates a contribution into the gradient of `target`.
    fn acc(&mut self, target: NodeId, contribution: NodeId) {
        if !self.wants(target) {
            return;
        }
        let total = match self.gmap.get(&target) {
            Some(&prev) => self.add_node(NodeType::Add(prev, contribution)),
            None => contribution,
        };
        self.gmap.insert(target, total);
    }

    /// Like [`acc`](Self::acc), first summing away broadcast dimensions.
    fn acc_reduced(&mut self, target: NodeId, contribution: NodeId) -> AutogradResult<()> {
        if self.wants(target) {
            let reduced = self.add_node(NodeType::ReduceSumTo {
                source: contribution,
                like: target,
            });
            self.acc(target, reduced);
        }
        Ok(())
    }
}

/// Builds `d(loss)/d(x)` for each tensor in `wrt` inside their shared context.
pub fn grad(loss: &Tensor, wrt: &[&Tensor]) -> AutogradResult<Vec<Tensor>> {
    if wrt.iter().any(|t| !std::rc::Rc::ptr_eq(&t.context, &loss.context)) {
        return Err(AutogradError::ForeignTensor);
    }
    let leaves: Vec<NodeId> = wrt.iter().map(|t| t.node_id).collect();
    let ids = {
        let mut ctx = loss.context.borrow_mut();
        Gradients::new(ctx.main_graph_mut()).build(loss.node_id, &leaves)?
    };
    Ok(ids
        .into_iter()
        .map(|id| Tensor::from_node(&loss.context, id))
        .collect())
}
