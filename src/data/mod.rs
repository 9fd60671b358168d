//! # Image data
//!
//! In-memory image sets and shuffled minibatch iteration for GAN training.
//!
//! - [`ImageSet`]: `(N, nc, npx, npx)` images, loaded from a safetensors
//!   archive or built from an array
//! - [`MinMaxScale`]: global rescale into `[-1, 1]`
//! - [`DataLoader`]: minibatches over a [`Dataset`], reshuffled every epoch
//!
//! ```no_run
//! use matryoshka_gan::data::{DataLoader, ImageSet, MinMaxScale};
//!
//! let images = ImageSet::load("svhn.safetensors", 3, 32)?;
//! let scale = MinMaxScale::fit(images.images())?;
//! let mut loader = DataLoader::new(images.map(&scale), 128)?.shuffled(Some(7));
//! for batch in loader.epoch() {
//!     assert_eq!(&batch.images.shape()[1..], &[3, 32, 32]);
//! }
//! # Ok::<(), matryoshka_gan::data::DataError>(())
//! ```

pub mod dataloader;
pub mod dataset;
pub mod sampler;
pub mod transforms;

use crate::serialization::SafeTensorsError;
use thiserror::Error;

pub use dataloader::{Batch, DataLoader, Epoch};
pub use dataset::{Dataset, ImageSet, IMAGES_TENSOR};
pub use sampler::{BatchSampler, IndexOrder, RandomSampler, Sampler, SequentialSampler};
pub use transforms::{MinMaxScale, Transform};

#[derive(Error, Debug)]
pub enum DataError {
    #[error(transparent)]
    Archive(#[from] SafeTensorsError),

    #[error("array of shape {shape:?} does not hold {nc}x{npx}x{npx} images")]
    BadShape { shape: Vec<usize>, nc: usize, npx: usize },

    #[error("dataset is empty")]
    Empty,

    #[error("cannot rescale data with min {min} and max {max}")]
    Degenerate { min: f32, max: f32 },

    #[error("batch size must be positive")]
    ZeroBatchSize,
}

pub type Result<T> = std::result::Result<T, DataError>;
