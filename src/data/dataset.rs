//! Datasets of images held in memory.

use super::transforms::Transform;
use super::{DataError, Result};
use crate::serialization::load_safetensors;
use ndarray::{ArrayD, Axis, IxDyn};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Name of the tensor read from an image archive.
pub const IMAGES_TENSOR: &str = "images";

/// A source of examples indexed along the first axis.
pub trait Dataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape of one example.
    fn item_shape(&self) -> Vec<usize>;

    /// Stacks the examples at `indices` into one batch array.
    fn gather(&self, indices: &[usize]) -> ArrayD<f32>;
}

/// `N` images of `nc` channels and `npx x npx` pixels.
#[derive(Debug, Clone)]
pub struct ImageSet {
    images: Arc<ArrayD<f32>>,
    nc: usize,
    npx: usize,
}

impl ImageSet {
    /// Accepts `(N, nc, npx, npx)` or flattened `(N, nc*npx*npx)` rows.
    pub fn from_array(array: ArrayD<f32>, nc: usize, npx: usize) -> Result<Self> {
        let shape = array.shape().to_vec();
        let bad_shape = || DataError::BadShape {
            shape: shape.clone(),
            nc,
            npx,
        };
        let n = *shape.first().ok_or_else(bad_shape)?;
        if n == 0 {
            return Err(DataError::Empty);
        }
        let images = match shape.len() {
            4 if shape[1..] == [nc, npx, npx] => array,
            2 if shape[1] == nc * npx * npx => array
                .as_standard_layout()
                .into_owned()
                .into_shape(IxDyn(&[n, nc, npx, npx]))
                .map_err(|_| bad_shape())?,
            _ => return Err(bad_shape()),
        };
        Ok(Self {
            images: Arc::new(images),
            nc,
            npx,
        })
    }

    /// Reads the `images` tensor of a safetensors archive. `U8` pixel data is
    /// converted to `f32` unchanged.
    pub fn load<P: AsRef<Path>>(path: P, nc: usize, npx: usize) -> Result<Self> {
        let path = path.as_ref();
        let mut archive = load_safetensors(path)?;
        let set = Self::from_array(archive.take(IMAGES_TENSOR)?, nc, npx)?;
        info!(path = %path.display(), images = set.len(), nc, npx, "loaded image set");
        Ok(set)
    }

    pub fn images(&self) -> &ArrayD<f32> {
        &self.images
    }

    pub fn channels(&self) -> usize {
        self.nc
    }

    pub fn side(&self) -> usize {
        self.npx
    }

    /// Applies `transform` to every pixel value.
    pub fn map(&self, transform: &impl Transform) -> Self {
        Self {
            images: Arc::new(transform.apply((*self.images).clone())),
            nc: self.nc,
            npx: self.npx,
        }
    }
}

impl Dataset for ImageSet {
    fn len(&self) -> usize {
        self.images.shape()[0]
    }

    fn item_shape(&self) -> Vec<usize> {
        vec![self.nc, self.npx, self.npx]
    }

    fn gather(&self, indices: &[usize]) -> ArrayD<f32> {
        self.images.select(Axis(0), indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::save_safetensors;
    use std::collections::HashMap;

    fn flat(n: usize) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&[n, 12]), (0..n * 12).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn flat_rows_become_images() {
        let set = ImageSet::from_array(flat(5), 3, 2).unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(set.images().shape(), &[5, 3, 2, 2]);
        assert_eq!(set.item_shape(), vec![3, 2, 2]);

        let batch = set.gather(&[4, 1]);
        assert_eq!(batch.shape(), &[2, 3, 2, 2]);
        assert_eq!(batch[[0, 0, 0, 0]], 48.0);
        assert_eq!(batch[[1, 2, 1, 1]], 23.0);
    }

    #[test]
    fn wrong_geometry_is_rejected() {
        assert!(matches!(
            ImageSet::from_array(flat(5), 3, 3),
            Err(DataError::BadShape { .. })
        ));
        assert!(matches!(
            ImageSet::from_array(ArrayD::zeros(IxDyn(&[0, 12])), 3, 2),
            Err(DataError::Empty)
        ));
        assert!(matches!(
            ImageSet::from_array(ArrayD::zeros(IxDyn(&[2, 2, 2, 2])), 3, 2),
            Err(DataError::BadShape { .. })
        ));
    }

    #[test]
    fn loads_the_images_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.safetensors");
        let images = ArrayD::from_elem(IxDyn(&[4, 3, 2, 2]), 7.0f32);
        save_safetensors(&path, &[(IMAGES_TENSOR.to_string(), images)], HashMap::new()).unwrap();

        let set = ImageSet::load(&path, 3, 2).unwrap();
        assert_eq!(set.len(), 4);
        assert!(set.images().iter().all(|&v| v == 7.0));

        let other = dir.path().join("other.safetensors");
        save_safetensors(&other, &[("pixels".to_string(), flat(2))], HashMap::new()).unwrap();
        assert!(matches!(ImageSet::load(&other, 3, 2), Err(DataError::Archive(_))));
    }
}
