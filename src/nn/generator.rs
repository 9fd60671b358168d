//! Generator-side modules: latent projection, upsampling convolution blocks
//! and fully connected blocks, each optionally injecting fresh noise.

use crate::asg::UpsampleMode;
use crate::nn::batchnorm::{BatchNorm, NormLayout};
use crate::nn::conv::{Conv2d, Conv2dConfig};
use crate::nn::init::Initializer;
use crate::nn::linear::Linear;
use crate::nn::module::{ensure, register_all_or_none, Layer, Module, ModuleError, ModuleOutput, Parameter, Port};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

fn push_bn(params: &mut Vec<Parameter>, bn: &Option<BatchNorm>) {
    if let Some(bn) = bn {
        params.extend(bn.parameters());
    }
}

fn apply_bn(bn: &Option<BatchNorm>, h: Tensor) -> Tensor {
    match bn {
        Some(bn) => bn.forward(&h),
        None => h,
    }
}

// ---------------------------------------------------------------------------
// GenUni
// ---------------------------------------------------------------------------

/// Projects a latent vector: `relu(bn(z · w1))`.
#[derive(Debug, Clone, PartialEq)]
pub struct GenUniConfig {
    pub name: String,
    pub rand_dim: usize,
    pub out_dim: usize,
    pub apply_bn: bool,
    pub init: Initializer,
}

impl GenUniConfig {
    pub fn new(name: &str, rand_dim: usize, out_dim: usize) -> Self {
        Self {
            name: name.to_string(),
            rand_dim,
            out_dim,
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
        ensure(self.rand_dim > 0, &self.name, || "rand_dim must be positive".into())?;
        ensure(self.out_dim > 0, &self.name, || "out_dim must be positive".into())
    }

    pub fn input_port(&self) -> Port {
        Port::Vector(self.rand_dim)
    }

    pub fn output_port(&self) -> Port {
        Port::Vector(self.out_dim)
    }
}

#[derive(Debug, Clone)]
pub struct GenUniModule {
    config: GenUniConfig,
    w1: Linear,
    bn1: Option<BatchNorm>,
}

impl GenUniModule {
    pub fn new(context: &Rc<RefCell<GraphContext>>, config: GenUniConfig) -> Result<Self, ModuleError> {
        register_all_or_none(context, || Self::build(context, config))
    }

    fn build(context: &Rc<RefCell<GraphContext>>, config: GenUniConfig) -> Result<Self, ModuleError> {
        config.validate()?;
        let name = &config.name;
        let w1 = Linear::new(context, &format!("{name}.w1"), config.rand_dim, config.out_dim, &config.init)?;
        let bn1 = config
            .apply_bn
            .then(|| BatchNorm::new(context, name, "1", config.out_dim, NormLayout::Vector))
            .transpose()?;
        debug!(module = %name, rand_dim = config.rand_dim, out_dim = config.out_dim, "built GenUni module");
        Ok(Self { config, w1, bn1 })
    }

    pub fn config(&self) -> &GenUniConfig {
        &self.config
    }

    /// Draws its own latent `(batch, rand_dim)` with the batch size of `like`.
    pub fn sample(&self, like: &Tensor) -> Tensor {
        let z = like.flatten().random_normal_like(self.config.rand_dim);
        self.project(&z)
    }

    fn project(&self, z: &Tensor) -> Tensor {
        apply_bn(&self.bn1, self.w1.forward(z)).relu()
    }
}

impl Module for GenUniModule {
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
        push_bn(&mut params, &self.bn1);
        params
    }

    /// `input` is the latent batch `z`.
    fn apply(&self, input: &Tensor) -> ModuleOutput {
        ModuleOutput {
            features: self.project(input),
            score: None,
        }
    }
}

// ---------------------------------------------------------------------------
// GenConv
// ---------------------------------------------------------------------------

/// Upsampling double-convolution block with optional noise injection.
#[derive(Debug, Clone, PartialEq)]
pub struct GenConvConfig {
    pub name: String,
    pub filt_dim: usize,
    pub in_chans: usize,
    pub out_chans: usize,
    pub rand_chans: usize,
    pub apply_bn_1: bool,
    pub apply_bn_2: bool,
    pub us_stride: usize,
    pub use_rand: bool,
    /// Nearest-neighbour upsampling instead of the transposed-convolution
    /// (zero insertion) form.
    pub use_pooling: bool,
    pub init: Initializer,
}

impl GenConvConfig {
    /// Block that doubles the spatial size, with batch norm and no noise.
    pub fn new(name: &str, filt_dim: usize, in_chans: usize, out_chans: usize) -> Self {
        Self {
            name: name.to_string(),
            filt_dim,
            in_chans,
            out_chans,
            rand_chans: 0,
            apply_bn_1: true,
            apply_bn_2: true,
            us_stride: 2,
            use_rand: false,
            use_pooling: false,
            init: Initializer::default(),
        }
    }

    /// Concatenates `rand_chans` noise channels before the second convolution.
    pub fn with_noise(mut self, rand_chans: usize) -> Self {
        self.rand_chans = rand_chans;
        self.use_rand = rand_chans > 0;
        self
    }

    pub fn with_bn(mut self, apply_bn_1: bool, apply_bn_2: bool) -> Self {
        self.apply_bn_1 = apply_bn_1;
        self.apply_bn_2 = apply_bn_2;
        self
    }

    pub fn with_us_stride(mut self, us_stride: usize) -> Self {
        self.us_stride = us_stride;
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

    fn noise_chans(&self) -> usize {
        if self.use_rand {
            self.rand_chans
        } else {
            0
        }
    }

    pub fn validate(&self) -> Result<(), ModuleError> {
        let name = &self.name;
        ensure(self.filt_dim % 2 == 1, name, || {
            format!("filter size must be odd, got {}", self.filt_dim)
        })?;
        ensure(self.in_chans > 0 && self.out_chans > 0, name, || {
            "channel counts must be positive".into()
        })?;
        ensure(self.us_stride >= 1, name, || "us_stride must be at least 1".into())?;
        ensure(!self.use_rand || self.rand_chans > 0, name, || {
            "noise injection needs rand_chans > 0".into()
        })
    }

    pub fn input_port(&self) -> Port {
        Port::Maps(self.in_chans)
    }

    pub fn output_port(&self) -> Port {
        Port::Maps(self.out_chans)
    }
}

#[derive(Debug, Clone)]
pub struct GenConvModule {
    config: GenConvConfig,
    conv1: Conv2d,
    bn1: Option<BatchNorm>,
    conv2: Conv2d,
    bn2: Option<BatchNorm>,
}

impl GenConvModule {
    pub fn new(context: &Rc<RefCell<GraphContext>>, config: GenConvConfig) -> Result<Self, ModuleError> {
        register_all_or_none(context, || Self::build(context, config))
    }

    fn build(context: &Rc<RefCell<GraphContext>>, config: GenConvConfig) -> Result<Self, ModuleError> {
        config.validate()?;
        let name = &config.name;
        let (f, out) = (config.filt_dim, config.out_chans);

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
            Conv2dConfig::new(out + config.noise_chans(), out, f),
            &config.init,
        )?;
        let bn2 = config
            .apply_bn_2
            .then(|| BatchNorm::new(context, name, "2", out, NormLayout::Maps))
            .transpose()?;

        debug!(
            module = %name,
            in_chans = config.in_chans,
            out_chans = out,
            rand_chans = config.noise_chans(),
            "built GenConv module"
        );
        Ok(Self {
            config,
            conv1,
            bn1,
            conv2,
            bn2,
        })
    }

    pub fn config(&self) -> &GenConvConfig {
        &self.config
    }

    /// Applies the block; `latent` replaces the sampled noise when given and
    /// must be `(batch, rand_chans, H, W)` at the upsampled resolution.
    pub fn apply_with_latent(&self, input: &Tensor, latent: Option<&Tensor>) -> Tensor {
        let mut h = input.clone();
        if self.config.us_stride > 1 {
            let mode = if self.config.use_pooling {
                UpsampleMode::Nearest
            } else {
                UpsampleMode::ZeroInsert
            };
            h = h.upsample2d(self.config.us_stride, mode);
        }
        h = apply_bn(&self.bn1, self.conv1.forward(&h)).relu();

        if self.config.use_rand {
            let noise = match latent {
                Some(z) => z.clone(),
                None => h.random_normal_like(self.config.rand_chans),
            };
            h = Tensor::concat(&[&h, &noise], 1);
        }
        apply_bn(&self.bn2, self.conv2.forward(&h)).relu()
    }
}

impl Module for GenConvModule {
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
        push_bn(&mut params, &self.bn1);
        params.extend(self.conv2.parameters());
        push_bn(&mut params, &self.bn2);
        params
    }

    fn apply(&self, input: &Tensor) -> ModuleOutput {
        ModuleOutput {
            features: self.apply_with_latent(input, None),
            score: None,
        }
    }
}

// ---------------------------------------------------------------------------
// GenFc
// ---------------------------------------------------------------------------

/// Two fully connected layers with optional noise concatenated to the input.
#[derive(Debug, Clone, PartialEq)]
pub struct GenFcConfig {
    pub name: String,
    pub rand_dim: usize,
    pub in_dim: usize,
    pub fc_dim: usize,
    pub out_dim: usize,
    pub apply_bn_1: bool,
    pub apply_bn_2: bool,
    pub use_rand: bool,
    pub init: Initializer,
}

impl GenFcConfig {
    pub fn new(name: &str, in_dim: usize, fc_dim: usize, out_dim: usize) -> Self {
        Self {
            name: name.to_string(),
            rand_dim: 0,
            in_dim,
            fc_dim,
            out_dim,
            apply_bn_1: true,
            apply_bn_2: true,
            use_rand: false,
            init: Initializer::default(),
        }
    }

    pub fn with_noise(mut self, rand_dim: usize) -> Self {
        self.rand_dim = rand_dim;
        self.use_rand = rand_dim > 0;
        self
    }

    pub fn with_bn(mut self, apply_bn_1: bool, apply_bn_2: bool) -> Self {
        self.apply_bn_1 = apply_bn_1;
        self.apply_bn_2 = apply_bn_2;
        self
    }

    pub fn with_init(mut self, init: Initializer) -> Self {
        self.init = init;
        self
    }

    fn noise_dim(&self) -> usize {
        if self.use_rand {
            self.rand_dim
        } else {
            0
        }
    }

    pub fn validate(&self) -> Result<(), ModuleError> {
        let name = &self.name;
        ensure(self.in_dim > 0 && self.fc_dim > 0 && self.out_dim > 0, name, || {
            "dimensions must be positive".into()
        })?;
        ensure(!self.use_rand || self.rand_dim > 0, name, || {
            "noise injection needs rand_dim > 0".into()
        })
    }

    pub fn input_port(&self) -> Port {
        Port::Vector(self.in_dim)
    }

    pub fn output_port(&self) -> Port {
        Port::Vector(self.out_dim)
    }
}

#[derive(Debug, Clone)]
pub struct GenFcModule {
    config: GenFcConfig,
    w1: Linear,
    bn1: Option<BatchNorm>,
    w2: Linear,
    bn2: Option<BatchNorm>,
}

impl GenFcModule {
    pub fn new(context: &Rc<RefCell<GraphContext>>, config: GenFcConfig) -> Result<Self, ModuleError> {
        register_all_or_none(context, || Self::build(context, config))
    }

    fn build(context: &Rc<RefCell<GraphContext>>, config: GenFcConfig) -> Result<Self, ModuleError> {
        config.validate()?;
        let name = &config.name;
        let w1 = Linear::new(
            context,
            &format!("{name}.w1"),
            config.in_dim + config.noise_dim(),
            config.fc_dim,
            &config.init,
        )?;
        let bn1 = config
            .apply_bn_1
            .then(|| BatchNorm::new(context, name, "1", config.fc_dim, NormLayout::Vector))
            .transpose()?;
        let w2 = Linear::new(context, &format!("{name}.w2"), config.fc_dim, config.out_dim, &config.init)?;
        let bn2 = config
            .apply_bn_2
            .then(|| BatchNorm::new(context, name, "2", config.out_dim, NormLayout::Vector))
            .transpose()?;
        debug!(module = %name, in_dim = config.in_dim, out_dim = config.out_dim, "built GenFc module");
        Ok(Self {
            config,
            w1,
            bn1,
            w2,
            bn2,
        })
    }

    pub fn config(&self) -> &GenFcConfig {
        &self.config
    }
}

impl Module for GenFcModule {
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
        push_bn(&mut params, &self.bn1);
        params.extend(self.w2.parameters());
        push_bn(&mut params, &self.bn2);
        params
    }

    fn apply(&self, input: &Tensor) -> ModuleOutput {
        let x = if self.config.use_rand {
            let noise = input.random_normal_like(self.config.rand_dim);
            Tensor::concat(&[input, &noise], 1)
        } else {
            input.clone()
        };
        let h = apply_bn(&self.bn1, self.w1.forward(&x)).relu();
        let h = apply_bn(&self.bn2, self.w2.forward(&h)).relu();
        ModuleOutput {
            features: h,
            score: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shapes(params: &[Parameter]) -> Vec<(String, Vec<usize>)> {
        params
            .iter()
            .map(|p| (p.name().to_string(), p.shape().to_vec()))
            .collect()
    }

    #[test]
    fn gen_uni_parameters() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let m = GenUniModule::new(&ctx, GenUniConfig::new("gen_mod_1", 64, 1024)).unwrap();
        assert_eq!(
            shapes(&m.params()),
            vec![
                ("gen_mod_1.w1".to_string(), vec![64, 1024]),
                ("gen_mod_1.g1".to_string(), vec![1024]),
                ("gen_mod_1.b1".to_string(), vec![1024]),
            ]
        );
        assert_eq!(m.input_port(), Port::Vector(64));
        assert_eq!(m.output_port(), Port::Vector(1024));
    }

    #[test]
    fn gen_conv_parameters_account_for_noise() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let m = GenConvModule::new(&ctx, GenConvConfig::new("gen_mod_3", 3, 256, 128).with_noise(8))
            .unwrap();
        assert_eq!(
            shapes(&m.params()),
            vec![
                ("gen_mod_3.w1".to_string(), vec![128, 256, 3, 3]),
                ("gen_mod_3.g1".to_string(), vec![128]),
                ("gen_mod_3.b1".to_string(), vec![128]),
                ("gen_mod_3.w2".to_string(), vec![128, 136, 3, 3]),
                ("gen_mod_3.g2".to_string(), vec![128]),
                ("gen_mod_3.b2".to_string(), vec![128]),
            ]
        );
    }

    #[test]
    fn gen_conv_without_bn_or_noise() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let m = GenConvModule::new(
            &ctx,
            GenConvConfig::new("g", 5, 4, 4).with_bn(false, false),
        )
        .unwrap();
        let names: Vec<_> = m.params().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["g.w1", "g.w2"]);
        assert_eq!(m.params()[1].shape(), &[4, 4, 5, 5]);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let even = GenConvModule::new(&ctx, GenConvConfig::new("even", 4, 8, 8));
        assert!(matches!(even, Err(ModuleError::InvalidConfig { .. })));

        let mut cfg = GenConvConfig::new("noisy", 3, 8, 8);
        cfg.use_rand = true;
        assert!(GenConvModule::new(&ctx, cfg).is_err());

        assert!(GenUniModule::new(&ctx, GenUniConfig::new("zero", 0, 8)).is_err());
        assert!(GenFcModule::new(&ctx, GenFcConfig::new("fc", 8, 0, 8)).is_err());
        assert_eq!(ctx.borrow().parameter_count(), 0);
    }

    #[test]
    fn failed_construction_registers_nothing() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        Parameter::new(&ctx, "gen_mod_2.w2", &[1], &Initializer::default()).unwrap();

        let clash = GenConvModule::new(&ctx, GenConvConfig::new("gen_mod_2", 3, 8, 8));
        assert!(matches!(clash, Err(ModuleError::Graph(_))));
        let names: Vec<String> = ctx.borrow().parameter_names().map(str::to_string).collect();
        assert_eq!(names, vec!["gen_mod_2.w2"]);

        // w1 and the first batch norm were released, so another block can take them
        let fc = GenFcModule::new(&ctx, GenFcConfig::new("gen_mod_2", 8, 4, 4).with_bn(true, false));
        assert!(matches!(fc, Err(ModuleError::Graph(_))));
        assert_eq!(ctx.borrow().parameter_count(), 1);
        GenUniModule::new(&ctx, GenUniConfig::new("gen_mod_2", 4, 8)).unwrap();
        assert!(ctx.borrow().has_parameter("gen_mod_2.w1"));
        assert_eq!(ctx.borrow().parameter_count(), 4);
    }

    #[test]
    fn gen_fc_parameters() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let m = GenFcModule::new(&ctx, GenFcConfig::new("fc", 16, 32, 8).with_noise(4)).unwrap();
        let p = m.params();
        assert_eq!(p.len(), 6);
        assert_eq!(p[0].shape(), &[20, 32]);
        assert_eq!(p[3].shape(), &[32, 8]);
        assert_eq!(p[5].name(), "fc.b2");
    }
}
