//! Run configuration.
//!
//! [`RunConfig`] holds every hyperparameter of a training run. Its defaults
//! are the SVHN settings; any subset can be overridden from a JSON file,
//! missing keys keep their defaults.

use crate::network::{DiscriminatorConfig, GeneratorConfig};
use crate::nn::Initializer;
use crate::optimizers::AdamConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Epochs after which both networks are checkpointed.
pub const DEFAULT_MILESTONES: [usize; 16] = [1, 5, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 150, 200, 250, 300];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Discriminator updates per generator update.
    pub k: usize,
    /// L2 regularization added to the gradients by Adam.
    pub l2: f32,
    /// Adam momentum.
    pub b1: f32,
    pub nc: usize,
    pub nbatch: usize,
    pub npx: usize,
    pub nz0: usize,
    pub nz1: usize,
    pub ngfc: usize,
    pub ndfc: usize,
    pub ngf: usize,
    pub ndf: usize,
    /// Epochs at the initial learning rate.
    pub niter: usize,
    /// Epochs over which the learning rate decays linearly to zero.
    pub niter_decay: usize,
    pub lr: f32,
    /// Weight init scale for both networks.
    pub init_std: f32,
    pub milestones: Vec<usize>,
    /// Latent rows of the fixed sample batch evaluated after every epoch.
    pub n_samples: usize,
    pub seed: u64,
    pub exp_dir: PathBuf,
    pub desc: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            k: 1,
            l2: 2.0e-5,
            b1: 0.5,
            nc: 3,
            nbatch: 128,
            npx: 32,
            nz0: 64,
            nz1: 8,
            ngfc: 256,
            ndfc: 256,
            ngf: 32,
            ndf: 32,
            niter: 150,
            niter_decay: 200,
            lr: 1.0e-4,
            init_std: 0.02,
            milestones: DEFAULT_MILESTONES.to_vec(),
            n_samples: 200,
            seed: 42,
            exp_dir: PathBuf::from("./svhn"),
            desc: "matronet_2".to_string(),
        }
    }
}

impl RunConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("nc", self.nc),
            ("nbatch", self.nbatch),
            ("npx", self.npx),
            ("nz0", self.nz0),
            ("ngf", self.ngf),
            ("ndf", self.ndf),
            ("ndfc", self.ndfc),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(ConfigError::Invalid(format!("lr must be positive, got {}", self.lr)));
        }
        if !(0.0..1.0).contains(&self.b1) {
            return Err(ConfigError::Invalid(format!("b1 must lie in [0, 1), got {}", self.b1)));
        }
        if self.l2 < 0.0 || self.init_std <= 0.0 {
            return Err(ConfigError::Invalid("l2 must be >= 0 and init_std > 0".to_string()));
        }
        if self.desc.is_empty() {
            return Err(ConfigError::Invalid("desc must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn total_epochs(&self) -> usize {
        self.niter + self.niter_decay
    }

    fn init(&self) -> Initializer {
        Initializer::normal(self.init_std)
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            nz0: self.nz0,
            nz1: self.nz1,
            ngf: self.ngf,
            nc: self.nc,
            npx: self.npx,
            init: self.init(),
        }
    }

    pub fn discriminator_config(&self) -> DiscriminatorConfig {
        DiscriminatorConfig {
            ndf: self.ndf,
            ndfc: self.ndfc,
            nc: self.nc,
            npx: self.npx,
            init: self.init(),
        }
    }

    pub fn adam_config(&self) -> AdamConfig {
        AdamConfig {
            lr: self.lr,
            b1: self.b1,
            l2: self.l2,
            ..AdamConfig::default()
        }
    }

    /// `{exp_dir}/models/{desc}`
    pub fn model_dir(&self) -> PathBuf {
        self.exp_dir.join("models").join(&self.desc)
    }

    /// `{exp_dir}/samples/{desc}`
    pub fn sample_dir(&self) -> PathBuf {
        self.exp_dir.join("samples").join(&self.desc)
    }

    /// `{exp_dir}/logs`
    pub fn log_dir(&self) -> PathBuf {
        self.exp_dir.join("logs")
    }

    /// `{exp_dir}/logs/{desc}.ndjson`
    pub fn log_path(&self) -> PathBuf {
        self.log_dir().join(format!("{}.ndjson", self.desc))
    }
}
