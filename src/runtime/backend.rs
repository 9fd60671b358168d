//! Abstract interface for execution backends.

use crate::asg::{Asg, AsgError, NodeId};
use ndarray::ArrayD;
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while evaluating a graph. Shared by every backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("graph error: {0}")]
    Graph(#[from] AsgError),

    #[error("tensor shape error in '{op}': {detail}")]
    ShapeError { op: &'static str, detail: String },

    #[error("no value fed for input '{0}' (node {1})")]
    MissingInput(String, NodeId),

    #[error("no value for parameter '{0}' (node {1})")]
    MissingParameter(String, NodeId),

    #[error("operand {operand} of node {node} was not evaluated")]
    MissingOperand { node: NodeId, operand: NodeId },

    #[error("computation error: {0}")]
    ComputationError(String),
}

impl RuntimeError {
    pub(crate) fn shape(op: &'static str, detail: impl Into<String>) -> Self {
        RuntimeError::ShapeError {
            op,
            detail: detail.into(),
        }
    }
}

/// Values computed during one evaluation, keyed by node.
pub type Memo<T> = HashMap<NodeId, T>;

/// Common interface of an execution environment.
///
/// A backend evaluates the nodes of an [`Asg`] that the requested outputs
/// depend on. Inputs and parameters are supplied through the initial memo;
/// the final memo holds every intermediate value of the evaluation.
pub trait Backend {
    /// Device-resident representation of a tensor.
    type DeviceData: std::fmt::Debug + Clone;

    /// Moves host data onto the device.
    fn load_data(&self, data: &ArrayD<f32>) -> Result<Self::DeviceData, RuntimeError>;

    /// Evaluates `outputs` (and everything they need) in one pass.
    fn run(
        &self,
        asg: &Asg,
        outputs: &[NodeId],
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError>;

    /// Copies results back to host memory.
    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<ArrayD<f32>>, RuntimeError>;
}
