//! Network assembly: chains of Matryoshka modules, the SVHN generator and
//! discriminator, and the ordered parameter collections they expose.

pub mod chain;
pub mod collection;
pub mod gan;

pub use chain::{assemble_chain, junction, Junction, ModuleChain};
pub use collection::ParameterCollection;
pub use gan::{Discriminator, DiscriminatorConfig, Generator, GeneratorConfig};

use crate::nn::{ModuleError, Port};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    #[error("'{from}' produces {output} but '{to}' expects {input}")]
    ChannelMismatch {
        from: String,
        to: String,
        output: Port,
        input: Port,
    },

    #[error("module chain is empty")]
    EmptyChain,

    #[error("module name '{0}' is used twice")]
    DuplicateModule(String),

    #[error("'{module}' ends the chain with {port}; {reason}")]
    InvalidOutput {
        module: String,
        port: Port,
        reason: String,
    },

    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),

    #[error("expected {expected} parameter values, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Module(#[from] ModuleError),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
