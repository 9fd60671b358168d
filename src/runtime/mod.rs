//! Execution environments for the ASG.
//!
//! [`Backend`] is the evaluation interface, [`CpuBackend`] its `ndarray`
//! implementation, and [`Function`] the compiled callable that the training
//! loop drives.

pub mod backend;
pub mod cpu_backend;
pub mod function;

pub use backend::{Backend, Memo, RuntimeError};
pub use cpu_backend::CpuBackend;
pub use function::{Function, FunctionError, Updates};
