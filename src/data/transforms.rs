//! Value transforms applied to whole datasets.

use super::{DataError, Result};
use ndarray::ArrayD;

pub trait Transform {
    fn apply(&self, data: ArrayD<f32>) -> ArrayD<f32>;
}

/// Affine map of `[min, max]` onto `[-1, 1]`, fitted on the global extremes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinMaxScale {
    min: f32,
    max: f32,
}

impl MinMaxScale {
    pub fn new(min: f32, max: f32) -> Result<Self> {
        if !(min.is_finite() && max.is_finite() && max > min) {
            return Err(DataError::Degenerate { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn fit(data: &ArrayD<f32>) -> Result<Self> {
        if data.is_empty() {
            return Err(DataError::Empty);
        }
        let (min, max) = data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        Self::new(min, max)
    }

    pub fn range(&self) -> (f32, f32) {
        (self.min, self.max)
    }

    /// Maps `[-1, 1]` back to the original range.
    pub fn invert(&self, data: ArrayD<f32>) -> ArrayD<f32> {
        let (min, span) = (self.min, self.max - self.min);
        data.mapv_into(|v| (v + 1.0) * 0.5 * span + min)
    }
}

impl Transform for MinMaxScale {
    fn apply(&self, data: ArrayD<f32>) -> ArrayD<f32> {
        let (min, span) = (self.min, self.max - self.min);
        data.mapv_into(|v| 2.0 * ((v - min) / span - 0.5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    #[test]
    fn pixels_land_in_unit_interval() {
        let data = arr1(&[0.0f32, 51.0, 255.0]).into_dyn();
        let scale = MinMaxScale::fit(&data).unwrap();
        assert_eq!(scale.range(), (0.0, 255.0));

        let scaled = scale.apply(data.clone());
        assert_abs_diff_eq!(scaled[0], -1.0);
        assert_abs_diff_eq!(scaled[1], -0.6, epsilon = 1e-6);
        assert_abs_diff_eq!(scaled[2], 1.0);

        let back = scale.invert(scaled);
        for (a, b) in back.iter().zip(data.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn constant_data_cannot_be_scaled() {
        let data = ArrayD::from_elem(vec![4], 3.0f32);
        assert!(matches!(MinMaxScale::fit(&data), Err(DataError::Degenerate { .. })));
        assert!(matches!(
            MinMaxScale::fit(&ArrayD::zeros(vec![0])),
            Err(DataError::Empty)
        ));
    }
}
