//! Compiled functions: a fixed set of graph inputs and outputs, optionally
//! paired with a loss whose gradients drive an in-place optimizer update.

use super::backend::{Backend, Memo, RuntimeError};
use crate::asg::{AsgError, NodeId, NodeType};
use crate::autograd::{AutogradError, Gradients};
use crate::network::ParameterCollection;
use crate::optimizers::{Optimizer, OptimizerError};
use crate::tensor::{GraphContext, SharedValue, Tensor};
use ndarray::ArrayD;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum FunctionError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Autograd(#[from] AutogradError),

    #[error(transparent)]
    Graph(#[from] AsgError),

    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error("node {0} is not a graph input")]
    NotAnInput(NodeId),

    #[error("tensor belongs to a different graph context")]
    ForeignTensor,

    #[error("expected {expected} input values, got {actual}")]
    InputCount { expected: usize, actual: usize },

    #[error("{what} is not finite")]
    NonFinite { what: String },
}

pub type Result<T> = std::result::Result<T, FunctionError>;

/// What a compiled function trains: a collection, the scalar loss to
/// minimize and the optimizer applying the steps.
pub struct Updates {
    pub params: ParameterCollection,
    pub loss: Tensor,
    pub optimizer: Box<dyn Optimizer>,
}

impl Updates {
    pub fn new(params: ParameterCollection, loss: Tensor, optimizer: impl Optimizer + 'static) -> Self {
        Self {
            params,
            loss,
            optimizer: Box::new(optimizer),
        }
    }
}

struct CompiledUpdates {
    params: ParameterCollection,
    loss: NodeId,
    grads: Vec<NodeId>,
    optimizer: Box<dyn Optimizer>,
}

/// A callable over the shared graph.
///
/// Every call evaluates the outputs (and, with updates, the loss and the
/// gradients) in one backend pass, checks them for non-finite values and only
/// then lets the optimizer write the new parameter values.
pub struct Function {
    context: Rc<RefCell<GraphContext>>,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    parameters: Vec<(NodeId, SharedValue)>,
    updates: Option<CompiledUpdates>,
}

impl Function {
    /// Prepares a function from `inputs` to `outputs`. With `updates`, the
    /// gradient nodes of the loss are appended to the graph here, once.
    pub fn compile(
        context: &Rc<RefCell<GraphContext>>,
        inputs: &[&Tensor],
        outputs: &[&Tensor],
        updates: Option<Updates>,
    ) -> Result<Self> {
        let same_context = |t: &Tensor| Rc::ptr_eq(&t.context, context);
        if !inputs.iter().chain(outputs).all(|t| same_context(*t)) {
            return Err(FunctionError::ForeignTensor);
        }

        let mut ctx = context.borrow_mut();
        for input in inputs {
            let node = ctx.main_graph().get_node(input.node_id)?;
            if !matches!(node.node_type, NodeType::Input { .. }) {
                return Err(FunctionError::NotAnInput(input.node_id));
            }
        }

        let compiled = match updates {
            Some(u) => {
                if !same_context(&u.loss) || !u.params.iter().all(|p| same_context(p.tensor())) {
                    return Err(FunctionError::ForeignTensor);
                }
                let wrt: Vec<NodeId> = u.params.iter().map(|p| p.tensor().node_id).collect();
                let grads = Gradients::new(ctx.main_graph_mut()).build(u.loss.node_id, &wrt)?;
                Some(CompiledUpdates {
                    params: u.params,
                    loss: u.loss.node_id,
                    grads,
                    optimizer: u.optimizer,
                })
            }
            None => None,
        };

        let outputs: Vec<NodeId> = outputs.iter().map(|t| t.node_id).collect();
        let mut targets = outputs.clone();
        if let Some(u) = &compiled {
            targets.push(u.loss);
            targets.extend(&u.grads);
        }

        let graph = ctx.main_graph();
        let mut parameters = Vec::new();
        for id in graph.ancestors(&targets)? {
            if let NodeType::Parameter { name } = &graph.get_node(id)?.node_type {
                let value = ctx
                    .parameter_value(name)
                    .ok_or_else(|| RuntimeError::MissingParameter(name.clone(), id))?;
                parameters.push((id, value));
            }
        }

        info!(
            inputs = inputs.len(),
            outputs = outputs.len(),
            parameters = parameters.len(),
            trains = compiled.as_ref().map(|u| u.params.label().to_string()).unwrap_or_default(),
            graph_nodes = graph.len(),
            "compiled function"
        );
        drop(ctx);
        Ok(Self {
            context: Rc::clone(context),
            inputs: inputs.iter().map(|t| t.node_id).collect(),
            outputs,
            parameters,
            updates: compiled,
        })
    }

    /// Runs the function on `feed` (one array per input, in compile order)
    /// and returns the outputs. Applies the optimizer step when compiled
    /// with updates.
    pub fn call<B: Backend>(&mut self, backend: &B, feed: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>> {
        if feed.len() != self.inputs.len() {
            return Err(FunctionError::InputCount {
                expected: self.inputs.len(),
                actual: feed.len(),
            });
        }

        let mut memo: Memo<B::DeviceData> = Memo::new();
        for (&id, data) in self.inputs.iter().zip(feed) {
            memo.insert(id, backend.load_data(data)?);
        }
        for (id, value) in &self.parameters {
            memo.insert(*id, backend.load_data(&value.borrow())?);
        }

        let mut targets = self.outputs.clone();
        if let Some(u) = &self.updates {
            targets.push(u.loss);
            targets.extend(&u.grads);
        }
        let results = {
            let ctx = self.context.borrow();
            let (device, _) = backend.run(ctx.main_graph(), &targets, memo)?;
            backend.retrieve_data(&device)?
        };

        let n_out = self.outputs.len();
        for (i, out) in results[..n_out].iter().enumerate() {
            if !out.iter().all(|v| v.is_finite()) {
                return Err(FunctionError::NonFinite {
                    what: format!("output {i}"),
                });
            }
        }

        if let Some(u) = &mut self.updates {
            let loss = &results[n_out];
            if !loss.iter().all(|v| v.is_finite()) {
                return Err(FunctionError::NonFinite {
                    what: format!("loss of '{}'", u.params.label()),
                });
            }
            u.optimizer.step(&u.params, &results[n_out + 1..])?;
            debug!(network = %u.params.label(), "applied update");
        }

        let mut results = results;
        results.truncate(n_out);
        Ok(results)
    }

    /// Learning rate of the attached optimizer, if any.
    pub fn learning_rate(&self) -> Option<f32> {
        self.updates.as_ref().map(|u| u.optimizer.learning_rate())
    }

    pub fn set_learning_rate(&mut self, lr: f32) {
        if let Some(u) = &mut self.updates {
            u.optimizer.set_learning_rate(lr);
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("parameters", &self.parameters.len())
            .field("trains", &self.updates.as_ref().map(|u| u.params.label().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Initializer, Parameter};
    use crate::optimizers::Sgd;
    use crate::runtime::CpuBackend;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    #[test]
    fn evaluates_without_updates() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let w = Parameter::new(&ctx, "w", &[2], &Initializer::Constant(3.0)).unwrap();
        let y = &x * w.tensor();

        let mut f = Function::compile(&ctx, &[&x], &[&y], None).unwrap();
        let out = f.call(&CpuBackend::new(), &[arr1(&[1.0, 2.0]).into_dyn()]).unwrap();
        assert_eq!(out[0], arr1(&[3.0, 6.0]).into_dyn());
        assert_eq!(f.learning_rate(), None);
        assert!(matches!(
            f.call(&CpuBackend::new(), &[]),
            Err(FunctionError::InputCount { expected: 1, actual: 0 })
        ));
    }

    #[test]
    fn updates_write_into_parameters() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let w = Parameter::new(&ctx, "w", &[2], &Initializer::Constant(1.0)).unwrap();
        let loss = (&x * w.tensor()).sum();
        let mut params = ParameterCollection::new("toy");
        params.push(w.clone());

        let updates = Updates::new(params, loss.clone(), Sgd::new(0.5));
        let mut f = Function::compile(&ctx, &[&x], &[&loss], Some(updates)).unwrap();
        let out = f.call(&CpuBackend::new(), &[arr1(&[2.0, -4.0]).into_dyn()]).unwrap();

        // loss is computed with the old weights, the step uses d/dw = x
        assert_abs_diff_eq!(out[0].iter().sum::<f32>(), -2.0);
        assert_eq!(*w.value(), arr1(&[0.0, 3.0]).into_dyn());
        f.set_learning_rate(0.1);
        assert_eq!(f.learning_rate(), Some(0.1));
    }

    #[test]
    fn non_finite_loss_skips_the_update() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let w = Parameter::new(&ctx, "w", &[1], &Initializer::Constant(1.0)).unwrap();
        let loss = (&x * w.tensor()).log().sum();
        let mut params = ParameterCollection::new("toy");
        params.push(w.clone());

        let updates = Updates::new(params, loss, Sgd::new(0.5));
        let mut f = Function::compile(&ctx, &[&x], &[], Some(updates)).unwrap();
        let err = f.call(&CpuBackend::new(), &[arr1(&[-1.0]).into_dyn()]).unwrap_err();
        assert!(matches!(err, FunctionError::NonFinite { .. }));
        assert_eq!(*w.value(), arr1(&[1.0]).into_dyn());
    }

    #[test]
    fn only_inputs_can_be_fed() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = x.exp();
        assert!(matches!(
            Function::compile(&ctx, &[&y], &[&y], None),
            Err(FunctionError::NotAnInput(_))
        ));
    }
}
