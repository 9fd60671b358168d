//! Batch normalization using minibatch statistics.
//!
//! Normalizes per channel with the statistics of the current batch and
//! applies a learned gain and shift:
//! `y = g * (x - mean) / sqrt(var + eps) + b`.
//! There are no running averages; every evaluation is in training mode.

use crate::nn::init::Initializer;
use crate::nn::module::{Layer, ModuleError, Parameter};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

pub const BN_EPS: f32 = 1e-4;

/// Which axes hold the batch (and spatial) extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormLayout {
    /// `(batch, c, h, w)`; statistics over axes 0, 2 and 3.
    Maps,
    /// `(batch, c)`; statistics over axis 0.
    Vector,
}

#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub gain: Parameter,
    pub shift: Parameter,
    layout: NormLayout,
    eps: f32,
}

impl BatchNorm {
    /// Registers `{module}.g{suffix}` (init `N(1, 0.02)`) and
    /// `{module}.b{suffix}` (zeros), both of shape `(channels,)`.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        module: &str,
        suffix: &str,
        channels: usize,
        layout: NormLayout,
    ) -> Result<Self, ModuleError> {
        let gain = Parameter::new(
            context,
            &format!("{module}.g{suffix}"),
            &[channels],
            &Initializer::gain(),
        )?;
        let shift = Parameter::new(
            context,
            &format!("{module}.b{suffix}"),
            &[channels],
            &Initializer::zeros(),
        )?;
        Ok(Self {
            gain,
            shift,
            layout,
            eps: BN_EPS,
        })
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn channels(&self) -> usize {
        self.gain.shape()[0]
    }
}

impl Layer for BatchNorm {
    fn forward(&self, x: &Tensor) -> Tensor {
        let c = self.channels() as isize;
        let (axes, view): (&[usize], Vec<isize>) = match self.layout {
            NormLayout::Maps => (&[0, 2, 3], vec![1, c, 1, 1]),
            NormLayout::Vector => (&[0], vec![1, c]),
        };

        let mean = x.mean_axes(axes);
        let centered = x - &mean;
        let var = centered.square().mean_axes(axes);
        let normed = &centered / &var.add_scalar(self.eps).sqrt();

        let gain = self.gain.tensor().reshape(view.clone());
        let shift = self.shift.tensor().reshape(view);
        &(&normed * &gain) + &shift
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![self.gain.clone(), self.shift.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Backend, CpuBackend};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, ArrayD, Axis};
    use std::collections::HashMap;

    #[test]
    fn normalizes_each_channel_of_a_map_batch() {
        let ctx = Rc::new(RefCell::new(GraphContext::with_seed(4)));
        let bn = BatchNorm::new(&ctx, "m", "1", 2, NormLayout::Maps).unwrap();
        bn.gain.assign(ArrayD::from_elem(vec![2], 1.0)).unwrap();
        bn.shift.assign(Array::from_vec(vec![0.0, 3.0]).into_dyn()).unwrap();
        assert_eq!(bn.gain.name(), "m.g1");
        assert_eq!(bn.shift.name(), "m.b1");

        let x = Tensor::new_input(&ctx, "x");
        let y = bn.forward(&x);

        let data = Array::from_shape_fn((3, 2, 2, 2), |(n, c, h, w)| {
            (n * 8 + h * 2 + w) as f32 * (c as f32 + 1.0)
        })
        .into_dyn();
        let mut memo = HashMap::new();
        memo.insert(x.node_id, data);
        for p in bn.parameters() {
            memo.insert(p.tensor().node_id, p.value().clone());
        }
        let graph = ctx.borrow();
        let (out, _) = CpuBackend::new()
            .run(graph.main_graph(), &[y.node_id], memo)
            .unwrap();

        for (c, expected_mean) in [(0, 0.0), (1, 3.0)] {
            let channel = out[0].index_axis(Axis(1), c);
            let mean = channel.mean().unwrap();
            let var = channel.mapv(|v| (v - mean).powi(2)).mean().unwrap();
            assert_abs_diff_eq!(mean, expected_mean, epsilon = 1e-4);
            assert_abs_diff_eq!(var, 1.0, epsilon = 1e-3);
        }
    }
}
