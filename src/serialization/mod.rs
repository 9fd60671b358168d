//! Saving and restoring parameters.
//!
//! - **SafeTensors** ([`safetensors_io`]): flat named-tensor archives with
//!   string metadata, also used for image datasets.
//! - **Checkpoints** ([`checkpoint`]): one archive per network and epoch,
//!   restored positionally into a [`ParameterCollection`](crate::network::ParameterCollection),
//!   plus the [`RunState`] counters of each milestone.

pub mod checkpoint;
pub mod safetensors_io;

pub use checkpoint::{
    checkpoint_file_name, load_collection, read_checkpoint, save_collection, state_file_name, Checkpoint,
    CheckpointError, CheckpointInfo, CheckpointManager, RunState, FORMAT_VERSION,
};
pub use safetensors_io::{list_tensors, load_safetensors, save_safetensors, SafeTensorsError, TensorArchive};
