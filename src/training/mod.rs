//! Adversarial training: the update schedule, the epoch loop, checkpoints at
//! milestone epochs, the ndjson log and sampling from trained generators.

pub mod log;
pub mod sampling;
pub mod schedule;
pub mod trainer;

pub use log::{EpochRecord, NdjsonLog};
pub use sampling::ImageSampler;
pub use schedule::{LearningRateSchedule, Step, UpdateSchedule};
pub use trainer::{EpochReport, GanTrainer};

use crate::config::ConfigError;
use crate::data::DataError;
use crate::network::NetworkError;
use crate::runtime::FunctionError;
use crate::serialization::{CheckpointError, SafeTensorsError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    /// A cost or output evaluated to NaN or infinity. No parameter was
    /// written by the failing update.
    #[error("{what} is not finite at update {n_updates}")]
    NonFiniteLoss { what: String, n_updates: usize },

    #[error("dataset holds {found} images, the networks expect {expected}")]
    DataMismatch { expected: String, found: String },

    #[error("latent batch has shape {shape:?}, expected (n, {nz0})")]
    LatentShape { shape: Vec<usize>, nz0: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Function(#[from] FunctionError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    SafeTensors(#[from] SafeTensorsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TrainError>;

impl TrainError {
    /// Lifts a function failure, tagging non-finite values with the update
    /// counter.
    pub(crate) fn from_function(err: FunctionError, n_updates: usize) -> Self {
        match err {
            FunctionError::NonFinite { what } => TrainError::NonFiniteLoss { what, n_updates },
            other => TrainError::Function(other),
        }
    }
}
