//! Discriminator-side modules. Each reports a score (raw logits) next to the
//! features it passes down the chain.

use crate::nn::activations::LEAK;
use crate::nn::batchnorm::{BatchNorm, NormLayout};
use crate::nn::conv::{Conv2d, Conv2dConfig};
use crate::nn::init::Initializer;
use crate::nn::linear::Linear;
use crate::nn::module::{ensure, register_all_or_none, Layer, Module, ModuleError, ModuleOutput, Parameter, Port};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

fn bn_params(bn: &Option<BatchNorm>) -> Vec<Parameter> {
    bn.as_ref().map(|bn| bn.parameters()).unwrap_or_default()
}

fn maybe_bn(bn: &Option<BatchNorm>, h: Tensor) -> Tensor {
    match bn {
        Some(bn) => bn.forward(&h),
        None => h,
    }
}

// ---------------------------------------------------------------------------
// DiscConv
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DiscConvConfig {
    pub name: String,
    pub filt_dim: usize,
    pub in_chans: usize,
    pub out_chans: usize,
    pub apply_bn_1: bool,
    pub apply_bn_2: bool,
    pub ds_stride: usize,
    /// Downsample with 2x2 average pooling after a stride-1 convolution.
    pub use_pooling: bool,
    pub init: Initializer,
}

impl DiscConvConfig {
    /// Block halving the spatial size, with both batch norms enabled.
    pub fn new(name: &str, filt_dim: usize, in_chans: usize, out_chans: usize) -> Self {
        Self {
            name: name.to_string(),
            filt_dim,
            in_chans,
            out_chans,
            apply_bn_1: true,
            apply_bn_2: true,
            ds_stride: 2,
            use_pooling: false,
            init: Initializer::default(),
        }
    }

    pub fn with_bn(mut self, apply_bn_1: bool, apply_bn_2: bool) -> Self {
        self.apply_bn_1 = apply_bn_1;
        self.apply_bn_2 = apply_bn_2;
        self
    }

    pub fn with_ds_stride(mut self, ds_stride: usize) -> Self {
        self.ds_stride = ds_stride;
        self
    }

    pub fn with_pooling(mut self, use_pooling: bool) -> Self {
        self.use_pooling = use_pooling;
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
        ensure(self.ds_stride >= 1, name, || "ds_stride must be at least 1".into())
    }

    pub fn input_port(&self) -> Port {
        Port::Maps(self.in_chans)
    }

    pub fn output_port(&self) -> Port {
        Port::Maps(self.out_chans)
    }
}

/// `conv -> bn -> lrelu -> downsampling conv -> bn -> lrelu`, with a
/// single-filter convolution of the result as the per-pixel score.
#[derive(Debug, Clone)]
pub struct DiscConvModule {
    config: DiscConvConfig,
    conv1: Conv2d,
    bn1: Option<BatchNorm>,
    conv2: Conv2d,
    bn2: Option<BatchNorm>,
    score: Conv2d,
}

impl DiscConvModule {
    pub fn new(context: &Rc<RefCell<GraphContext>>, config: DiscConvConfig) -> Result<Self, ModuleError> {
        register_all_or_none(context, || Self::build(context, config))
    }

    fn build(context: &Rc<RefCell<GraphContext>>, config: DiscConvConfig) -> Result<Self, ModuleError> {
        config.validate()?;
        let name = &config.name;
        let (f, out) = (config.filt_dim, config.out_chans);
        let conv2_stride = if config.use_pooling { 1 } else { config.ds_stride };

        let conv1 = Conv2d::new(
            context,
            &format!("{name}.w1"),
            Conv2dConfig::new(config.in_chans, out, f),
            &config.init,
        )?;
        let bn1 = config
            .apply_bn_1
            .then(|| BatchNorm::new(context, name, "1", out, NormLayout::Maps))
            .transpose()?;
        let conv2 = Conv2d::new(
            context,
            &format!("{name}.w2"),
            Conv2dConfig::new(out, out, f).with_stride(conv2_stride),
            &config.init,
        )?;
        let bn2 = config
            .apply_bn_2
            .then(|| BatchNorm::new(context, name, "2", out, NormLayout::Maps))
            .transpose()?;
        let score = Conv2d::new(
            context,
            &format!("{name}.wy"),
            Conv2dConfig::new(out, 1, f),
            &config.init,
        )?;

        debug!(module = %name, in_chans = config.in_chans, out_chans = out, "built DiscConv module");
        Ok(Self {
            config,
            conv1,
            bn1,
            conv2,
            bn2,
            score,
        })
    }

    pub fn config(&self) -> &DiscConvConfig {
        &self.config
    }
}

impl Module for DiscConvModule {
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
        let mut params = self.conv1.parameters();
        params.extend(bn_params(&self.bn1));
        params.extend(self.conv2.parameters());
        params.extend(bn_params(&self.bn2));
        params.extend(self.score.parameters());
        params
    }

    fn apply(&self, input: &Tensor) -> ModuleOutput {
        let h = maybe_bn(&self.bn1, self.conv1.forward(input)).leaky_relu(LEAK);
        let mut h = self.conv2.forward(&h);
        if self.config.use_pooling && self.config.ds_stride > 1 {
            h = h.avg_pool2d(self.config.ds_stride);
        }
        let h = maybe_bn(&self.bn2, h).leaky_relu(LEAK);
        let y = self.score.forward(&h).flatten();
        ModuleOutput {
            features: h,
            score: Some(y),
        }
    }
}

// ---------------------------------------------------------------------------
// DiscFc
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DiscFcConfig {
    pub name: String,
    pub fc_dim: usize,
    pub in_dim: usize,
    pub apply_bn: bool,
    pub init: Initializer,
}

impl DiscFcConfig {
    pub fn new(name: &str, in_dim: usize, fc_dim: usize) -> Self {
        Self {
            name: name.to_string(),
            fc_dim,
            in_dim,
            apply_bn: true,
            init: Initializer::default(),
        }
    }

    pub fn with_bn(mut self, apply_bn: bool) -> Self {
        self.apply_bn = apply_bn;
        self
    }

    pub fn with_init(mut self, init: Initializer) -> Self {
        self.init = init;
        self
    }

    pub fn validate(&self) -> Result<(), ModuleError> {
        ensure(self.in_dim > 0 && self.fc_dim > 0, &self.name, || {
            "dimensions must be positive".into()
        })
    }

    pub fn input_port(&self) -> Port {
        Port::Vector(self.in_dim)
    }

    pub fn output_port(&self) -> Port {
        Port::Vector(self.fc_dim)
    }
}

/// `h = lrelu(bn(x · w1))`, score `h · w2` of shape `(batch, 1)`.
#[derive(Debug, Clone)]
pub struct DiscFcModule {
    config: DiscFcConfig,
    w1: Linear,
    bn1: Option<BatchNorm>,
    w2: Linear,
}

impl DiscFcModule {
    pub fn new(context: &Rc<RefCell<GraphContext>>, config: DiscFcConfig) -> Result<Self, ModuleError> {
        register_all_or_none(context, || Self::build(context, config))
    }

    fn build(context: &Rc<RefCell<GraphContext>>, config: DiscFcConfig) -> Result<Self, ModuleError> {
        config.validate()?;
        let name = &config.name;
        let w1 = Linear::new(context, &format!("{name}.w1"), config.in_dim, config.fc_dim, &config.init)?;
        let bn1 = config
            .apply_bn
            .then(|| BatchNorm::new(context, name, "1", config.fc_dim, NormLayout::Vector))
            .transpose()?;
        let w2 = Linear::new(context, &format!("{name}.w2"), config.fc_dim, 1, &config.init)?;
        debug!(module = %name, in_dim = config.in_dim, fc_dim = config.fc_dim, "built DiscFc module");
        Ok(Self { config, w1, bn1, w2 })
    }

    pub fn config(&self) -> &DiscFcConfig {
        &self.config
    }
}

impl Module for DiscFcModule {
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
        let mut params = self.w1.parameters();
        params.extend(bn_params(&self.bn1));
        params.extend(self.w2.parameters());
        params
    }

    fn apply(&self, input: &Tensor) -> ModuleOutput {
        let h = maybe_bn(&self.bn1, self.w1.forward(input)).leaky_relu(LEAK);
        let y = self.w2.forward(&h);
        ModuleOutput {
            features: h,
            score: Some(y),
        }
    }
}
