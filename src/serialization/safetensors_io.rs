//! Reading and writing SafeTensors archives.
//!
//! SafeTensors is HuggingFace's flat binary tensor format: a JSON header with
//! names, dtypes, shapes and free-form string metadata, followed by raw
//! little-endian data. Archives are written as `F32`; loading also accepts
//! `F64` and `U8` (raw image pixels) and converts to `f32`.

use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use safetensors::serialize_to_file;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SafeTensorsError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensorsError(#[from] safetensors::SafeTensorError),

    #[error("unsupported dtype {0}")]
    UnsupportedDtype(String),

    #[error("tensor '{name}' declares shape {shape:?} but holds {len} elements")]
    ShapeMismatch {
        name: String,
        shape: Vec<usize>,
        len: usize,
    },

    #[error("tensor '{0}' not found")]
    TensorNotFound(String),
}

type Result<T> = std::result::Result<T, SafeTensorsError>;

/// Contents of an archive.
#[derive(Debug, Clone, Default)]
pub struct TensorArchive {
    pub tensors: HashMap<String, ArrayD<f32>>,
    pub metadata: HashMap<String, String>,
}

impl TensorArchive {
    /// Removes and returns the tensor called `name`.
    pub fn take(&mut self, name: &str) -> Result<ArrayD<f32>> {
        self.tensors
            .remove(name)
            .ok_or_else(|| SafeTensorsError::TensorNotFound(name.to_string()))
    }
}

/// Writes named `f32` tensors with string `metadata` to `path`.
pub fn save_safetensors<P: AsRef<Path>>(
    path: P,
    tensors: &[(String, ArrayD<f32>)],
    metadata: HashMap<String, String>,
) -> Result<()> {
    // Byte buffers must outlive the views referencing them.
    let data_storage: Vec<Vec<u8>> = tensors
        .iter()
        .map(|(_, arr)| arr.iter().flat_map(|&x| x.to_le_bytes()).collect())
        .collect();

    let mut tensor_views: Vec<(&str, TensorView<'_>)> = Vec::with_capacity(tensors.len());
    for ((name, arr), data) in tensors.iter().zip(&data_storage) {
        tensor_views.push((
            name.as_str(),
            TensorView::new(Dtype::F32, arr.shape().to_vec(), data)?,
        ));
    }

    let metadata = (!metadata.is_empty()).then_some(metadata);
    serialize_to_file(tensor_views, &metadata, path.as_ref())?;
    Ok(())
}

fn to_array(name: &str, view: &TensorView<'_>) -> Result<ArrayD<f32>> {
    let shape = view.shape().to_vec();
    let data = view.data();
    let floats: Vec<f32> = match view.dtype() {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F64 => data
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
        Dtype::U8 => data.iter().map(|&b| f32::from(b)).collect(),
        other => return Err(SafeTensorsError::UnsupportedDtype(format!("{other:?}"))),
    };
    let len = floats.len();
    ArrayD::from_shape_vec(IxDyn(&shape), floats).map_err(|_| SafeTensorsError::ShapeMismatch {
        name: name.to_string(),
        shape,
        len,
    })
}

/// Reads every tensor of the archive at `path`, plus its metadata.
pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<TensorArchive> {
    let buffer = fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&buffer)?;
    let metadata = header.metadata().clone().unwrap_or_default();

    let tensors = SafeTensors::deserialize(&buffer)?;
    let mut result = HashMap::new();
    for (name, view) in tensors.tensors() {
        let array = to_array(&name, &view)?;
        result.insert(name, array);
    }
    Ok(TensorArchive {
        tensors: result,
        metadata,
    })
}

/// Names of the tensors stored at `path`.
pub fn list_tensors<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    let mut names: Vec<String> = tensors.names().into_iter().cloned().collect();
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn save_and_load_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.safetensors");
        let tensors = vec![
            ("b.weight".to_string(), arr2(&[[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]]).into_dyn()),
            ("a.bias".to_string(), ArrayD::from_elem(vec![3], 0.25f32)),
        ];
        let metadata = HashMap::from([("epoch".to_string(), "3".to_string())]);
        save_safetensors(&path, &tensors, metadata).unwrap();

        let mut archive = load_safetensors(&path).unwrap();
        assert_eq!(archive.metadata.get("epoch").map(String::as_str), Some("3"));
        assert_eq!(archive.take("b.weight").unwrap(), tensors[0].1);
        assert!(matches!(
            archive.take("b.weight"),
            Err(SafeTensorsError::TensorNotFound(_))
        ));
        assert_eq!(list_tensors(&path).unwrap(), vec!["a.bias", "b.weight"]);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_safetensors(dir.path().join("absent.safetensors")),
            Err(SafeTensorsError::IoError(_))
        ));
    }
}
