//! Checkpoints of parameter collections.
//!
//! One SafeTensors archive per (network, epoch), named
//! `{epoch}_{network}_params.safetensors`. The archive metadata records the
//! format version, network label, epoch and the ordered parameter names.
//! Restoring is positional and strict: the target collection must list the
//! same names in the same order with the same shapes.

use super::safetensors_io::{load_safetensors, save_safetensors, SafeTensorsError};
use crate::network::{NetworkError, ParameterCollection};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const FORMAT_VERSION: &str = "1";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensorsError(#[from] SafeTensorsError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("checkpoint metadata lacks '{0}'")]
    MissingMetadata(&'static str),

    #[error("unsupported checkpoint format version '{0}'")]
    UnsupportedVersion(String),

    #[error("checkpoint holds '{found}' parameters, expected '{expected}'")]
    NetworkMismatch { expected: String, found: String },

    #[error("checkpoint has {actual} parameters, the network has {expected}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("parameter {index} is '{found}' in the checkpoint but '{expected}' in the network")]
    NameMismatch {
        index: usize,
        expected: String,
        found: String,
    },

    #[error("parameter '{name}' has shape {actual:?} in the checkpoint, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid checkpoint: {0}")]
    InvalidFormat(String),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

type Result<T> = std::result::Result<T, CheckpointError>;

/// Header of a parameter checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub network: String,
    pub epoch: usize,
    pub names: Vec<String>,
}

/// A checkpoint read from disk: its header and the values in saved order.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub info: CheckpointInfo,
    pub values: Vec<ArrayD<f32>>,
}

/// Run counters at a milestone, so that a resumed run continues its update
/// alternation and its log where they stopped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub n_epochs: usize,
    pub n_updates: usize,
    pub n_examples: usize,
    pub n_seconds: f64,
}

/// `{epoch}_state.json`.
pub fn state_file_name(epoch: usize) -> String {
    format!("{epoch}_state.json")
}

/// `{epoch}_{network}_params.safetensors`.
pub fn checkpoint_file_name(epoch: usize, network: &str) -> String {
    format!("{epoch}_{network}_params.safetensors")
}

/// Writes the current values of `params`.
pub fn save_collection<P: AsRef<Path>>(path: P, params: &ParameterCollection, epoch: usize) -> Result<()> {
    let names = params.names();
    let metadata = HashMap::from([
        ("format_version".to_string(), FORMAT_VERSION.to_string()),
        ("network".to_string(), params.label().to_string()),
        ("epoch".to_string(), epoch.to_string()),
        ("names".to_string(), serde_json::to_string(&names)?),
    ]);
    let tensors: Vec<(String, ArrayD<f32>)> = names.into_iter().zip(params.values()).collect();
    save_safetensors(path, &tensors, metadata)?;
    Ok(())
}

fn meta<'a>(metadata: &'a HashMap<String, String>, key: &'static str) -> Result<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .ok_or(CheckpointError::MissingMetadata(key))
}

/// Reads a checkpoint, restoring the saved parameter order.
pub fn read_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
    let mut archive = load_safetensors(path)?;
    let version = meta(&archive.metadata, "format_version")?;
    if version != FORMAT_VERSION {
        return Err(CheckpointError::UnsupportedVersion(version.to_string()));
    }
    let network = meta(&archive.metadata, "network")?.to_string();
    let epoch = meta(&archive.metadata, "epoch")?
        .parse::<usize>()
        .map_err(|e| CheckpointError::InvalidFormat(format!("epoch: {e}")))?;
    let names: Vec<String> = serde_json::from_str(meta(&archive.metadata, "names")?)?;

    if names.len() != archive.tensors.len() {
        return Err(CheckpointError::InvalidFormat(format!(
            "{} names listed for {} tensors",
            names.len(),
            archive.tensors.len()
        )));
    }
    let values = names
        .iter()
        .map(|name| archive.take(name))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Checkpoint {
        info: CheckpointInfo {
            network,
            epoch,
            names,
        },
        values,
    })
}

/// Restores `params` from the checkpoint at `path`. Any disagreement in
/// network label, count, order or shape fails before a value is written.
pub fn load_collection<P: AsRef<Path>>(path: P, params: &ParameterCollection) -> Result<CheckpointInfo> {
    let Checkpoint { info, values } = read_checkpoint(path)?;
    if info.network != params.label() {
        return Err(CheckpointError::NetworkMismatch {
            expected: params.label().to_string(),
            found: info.network,
        });
    }
    if values.len() != params.len() {
        return Err(CheckpointError::CountMismatch {
            expected: params.len(),
            actual: values.len(),
        });
    }
    for (index, ((param, name), value)) in params.iter().zip(&info.names).zip(&values).enumerate() {
        if param.name() != name {
            return Err(CheckpointError::NameMismatch {
                index,
                expected: param.name().to_string(),
                found: name.clone(),
            });
        }
        if param.shape() != value.shape() {
            return Err(CheckpointError::ShapeMismatch {
                name: name.clone(),
                expected: param.shape().to_vec(),
                actual: value.shape().to_vec(),
            });
        }
    }
    params.assign_all(values)?;
    Ok(info)
}

/// Writes milestone checkpoints of a run into one model directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    model_dir: PathBuf,
}

impl CheckpointManager {
    /// Creates `model_dir` if needed.
    pub fn new<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        let model_dir = model_dir.as_ref().to_path_buf();
        fs::create_dir_all(&model_dir)?;
        Ok(Self { model_dir })
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn path_for(&self, epoch: usize, network: &str) -> PathBuf {
        self.model_dir.join(checkpoint_file_name(epoch, network))
    }

    /// Saves `params` for `epoch` and returns the file written.
    pub fn save(&self, epoch: usize, params: &ParameterCollection) -> Result<PathBuf> {
        let path = self.path_for(epoch, params.label());
        save_collection(&path, params, epoch)?;
        info!(path = %path.display(), parameters = params.len(), "saved checkpoint");
        Ok(path)
    }

    pub fn restore(&self, epoch: usize, params: &ParameterCollection) -> Result<CheckpointInfo> {
        load_collection(self.path_for(epoch, params.label()), params)
    }

    /// Writes the counters of the milestone `state.n_epochs`.
    pub fn save_state(&self, state: &RunState) -> Result<PathBuf> {
        let path = self.model_dir.join(state_file_name(state.n_epochs));
        fs::write(&path, serde_json::to_string_pretty(state)?)?;
        Ok(path)
    }

    pub fn load_state(&self, epoch: usize) -> Result<RunState> {
        let text = fs::read_to_string(self.model_dir.join(state_file_name(epoch)))?;
        let state: RunState = serde_json::from_str(&text)?;
        if state.n_epochs != epoch {
            return Err(CheckpointError::InvalidFormat(format!(
                "{} records epoch {}",
                state_file_name(epoch),
                state.n_epochs
            )));
        }
        Ok(state)
    }

    /// Writes `config.json` describing the run.
    pub fn write_manifest<T: Serialize>(&self, manifest: &T) -> Result<PathBuf> {
        let path = self.model_dir.join("config.json");
        fs::write(&path, serde_json::to_string_pretty(manifest)?)?;
        Ok(path)
    }

    /// Epochs for which a checkpoint of `network` exists, ascending.
    pub fn saved_epochs(&self, network: &str) -> Result<Vec<usize>> {
        let suffix = format!("_{network}_params.safetensors");
        let mut epochs: Vec<usize> = fs::read_dir(&self.model_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(&suffix)?.parse().ok()
            })
            .collect();
        epochs.sort_unstable();
        Ok(epochs)
    }
}
