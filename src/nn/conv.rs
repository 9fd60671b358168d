//! Bias-free 2D convolution with "same" padding.

use crate::nn::init::Initializer;
use crate::nn::module::{Layer, ModuleError, Parameter};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Configuration for a [`Conv2d`] layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv2dConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Square, odd kernel size.
    pub kernel_size: usize,
    pub stride: usize,
}

impl Conv2dConfig {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride: 1,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Padding that keeps the spatial size at stride 1.
    pub fn padding(&self) -> usize {
        (self.kernel_size - 1) / 2
    }

    pub fn weight_shape(&self) -> [usize; 4] {
        [self.out_channels, self.in_channels, self.kernel_size, self.kernel_size]
    }
}

/// Convolution over NCHW maps with an `(out, in, k, k)` filter bank.
///
/// Bias terms are omitted: every convolution in this crate is followed by a
/// batch norm shift or feeds a score.
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub weight: Parameter,
    pub config: Conv2dConfig,
}

impl Conv2d {
    /// Registers the filter bank as parameter `name`.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        config: Conv2dConfig,
        init: &Initializer,
    ) -> Result<Self, ModuleError> {
        let weight = Parameter::new(context, name, &config.weight_shape(), init)?;
        Ok(Self { weight, config })
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.config.stride = stride;
        self
    }
}

impl Layer for Conv2d {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.conv2d(self.weight.tensor(), self.config.stride, self.config.padding())
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![self.weight.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::shape_inference::ShapeInference;
    use std::collections::HashMap;

    #[test]
    fn conv2d_layer_shapes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let conv = Conv2d::new(
            &ctx,
            "disc_mod_1.w2",
            Conv2dConfig::new(3, 16, 5).with_stride(2),
            &Initializer::default(),
        )
        .unwrap();
        assert_eq!(conv.weight.shape(), &[16, 3, 5, 5]);
        assert_eq!(conv.config.padding(), 2);

        let x = Tensor::new_input(&ctx, "x");
        let y = conv.forward(&x);
        let shapes = HashMap::from([("x".to_string(), vec![2, 3, 32, 32])]);
        let graph = ctx.borrow().main_graph().clone();
        let out = ShapeInference::output_shapes(&graph, &[y.node_id], &shapes).unwrap();
        assert_eq!(out[0], vec![2, 16, 16, 16]);
        assert_eq!(conv.parameters().len(), 1);
    }
}
