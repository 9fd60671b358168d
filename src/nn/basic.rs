//! Plain `act(bn(conv(x)))` block.

use crate::nn::activations::Activation;
use crate::nn::batchnorm::{BatchNorm, NormLayout};
use crate::nn::conv::{Conv2d, Conv2dConfig};
use crate::nn::init::Initializer;
use crate::nn::module::{ensure, register_all_or_none, Layer, Module, ModuleError, ModuleOutput, Parameter, Port};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct BasicConvConfig {
    pub name: String,
    pub filt_dim: usize,
    pub in_chans: usize,
    pub out_chans: usize,
    pub apply_bn: bool,
    pub stride: usize,
    pub act: Activation,
    pub init: Initializer,
}

impl BasicConvConfig {
    pub fn new(name: &str, filt_dim: usize, in_chans: usize, out_chans: usize) -> Self {
        Self {
            name: name.to_string(),
            filt_dim,
            in_chans,
            out_chans,
            apply_bn: true,
            stride: 1,
            act: Activation::Relu,
            init: Initializer::default(),
        }
    }

    pub fn with_bn(mut self, apply_bn: bool) -> Self {
        self.apply_bn = apply_bn;
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_act(mut self, act: Activation) -> Self {
        self.act = act;
        self
    }

    pub fn with_init(mut self, init: Initializer) -> Self {
        self.init = init;
        self
    }

    pub fn validate(&self) -> Result<(), ModuleError> {
        let name = &self.name;
        ensure(self.filt_dim % 2 == 1, name, || {
            format!("filter size must be odd, got {}", self.filt_dim)
        })?;
        ensure(self.in_chans > 0 && self.out_chans > 0, name, || {
            "channel counts must be positive".into()
        })?;
        ensure(self.stride >= 1, name, || "stride must be at least 1".into())
    }

    pub fn input_port(&self) -> Port {
        Port::Maps(self.in_chans)
    }

    pub fn output_port(&self) -> Port {
        Port::Maps(self.out_chans)
    }
}

#[derive(Debug, Clone)]
pub struct BasicConvModule {
    config: BasicConvConfig,
    conv: Conv2d,
    bn: Option<BatchNorm>,
}

impl BasicConvModule {
    pub fn new(context: &Rc<RefCell<GraphContext>>, config: BasicConvConfig) -> Result<Self, ModuleError> {
        register_all_or_none(context, || Self::build(context, config))
    }

    fn build(context: &Rc<RefCell<GraphContext>>, config: BasicConvConfig) -> Result<Self, ModuleError> {
        config.validate()?;
        let name = &config.name;
        let conv = Conv2d::new(
            context,
            &format!("{name}.w1"),
            Conv2dConfig::new(config.in_chans, config.out_chans, config.filt_dim)
                .with_stride(config.stride),
            &config.init,
        )?;
        let bn = config
            .apply_bn
            .then(|| BatchNorm::new(context, name, "1", config.out_chans, NormLayout::Maps))
            .transpose()?;
        debug!(module = %name, act = ?config.act, "built BasicConv module");
        Ok(Self { config, conv, bn })
    }

    pub fn config(&self) -> &BasicConvConfig {
        &self.config
    }
}

impl Module for BasicConvModule {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn input_port(&self) -> Port {
        self.config.input_port()
    }

    fn output_port(&self) -> Port {
        self.config.output_port()
    }

    fn params(&self) -> Vec<Parameter> {
        let mut params = self.conv.parameters();
        if let Some(bn) = &self.bn {
            params.extend(bn.parameters());
        }
        params
    }

    fn apply(&self, input: &Tensor) -> ModuleOutput {
        let mut h = self.conv.forward(input);
        if let Some(bn) = &self.bn {
            h = bn.forward(&h);
        }
        ModuleOutput {
            features: self.config.act.apply(&h),
            score: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_conv_parameters() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let m = BasicConvModule::new(
            &ctx,
            BasicConvConfig::new("basic", 3, 4, 6).with_act(Activation::Tanh),
        )
        .unwrap();
        let names: Vec<_> = m.params().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["basic.w1", "basic.g1", "basic.b1"]);
        assert_eq!(m.params()[0].shape(), &[6, 4, 3, 3]);
        assert!(m.apply(&Tensor::new_input(&ctx, "x")).score.is_none());
    }
}
