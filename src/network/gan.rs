//! The SVHN generator and discriminator.
//!
//! Both networks are [`ModuleChain`]s built from a fixed schedule of module
//! configs. The generator adds a standalone aggregation convolution (`gwx`)
//! mapping the last feature maps to image channels; the discriminator
//! reports one score per module.

use super::chain::ModuleChain;
use super::collection::ParameterCollection;
use super::{NetworkError, Result};
use crate::nn::{
    Conv2d, Conv2dConfig, DiscConvConfig, DiscFcConfig, GenConvConfig, GenUniConfig, Initializer,
    Layer, MatryoshkaModule, Module, ModuleConfig, Port,
};
use crate::tensor::{GraphContext, Tensor};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::info;

/// Each network scales spatial size by 2 four times.
const SCALE_STEPS: usize = 4;

fn base_side(npx: usize) -> Result<usize> {
    let factor = 1 << SCALE_STEPS;
    if npx == 0 || npx % factor != 0 {
        return Err(NetworkError::InvalidConfig(format!(
            "image side {npx} must be a positive multiple of {factor}"
        )));
    }
    Ok(npx / factor)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Latent dimension fed to the first module.
    pub nz0: usize,
    /// Noise channels injected by the later conv modules.
    pub nz1: usize,
    pub ngf: usize,
    pub nc: usize,
    pub npx: usize,
    pub init: Initializer,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            nz0: 64,
            nz1: 8,
            ngf: 32,
            nc: 3,
            npx: 32,
            init: Initializer::default(),
        }
    }
}

impl GeneratorConfig {
    /// `gen_mod_1..5`: latent projection onto a `side x side` grid, then four
    /// upsampling conv modules, the last three injecting noise.
    pub fn module_configs(&self) -> Result<Vec<ModuleConfig>> {
        let side = base_side(self.npx)?;
        let (ngf, nz1, init) = (self.ngf, self.nz1, self.init);
        Ok(vec![
            GenUniConfig::new("gen_mod_1", self.nz0, ngf * 8 * side * side)
                .with_init(init)
                .into(),
            GenConvConfig::new("gen_mod_2", 3, ngf * 8, ngf * 8)
                .with_init(init)
                .into(),
            GenConvConfig::new("gen_mod_3", 3, ngf * 8, ngf * 4)
                .with_noise(nz1)
                .with_init(init)
                .into(),
            GenConvConfig::new("gen_mod_4", 3, ngf * 4, ngf * 2)
                .with_noise(nz1)
                .with_init(init)
                .into(),
            GenConvConfig::new("gen_mod_5", 5, ngf * 2, ngf * 2)
                .with_noise(nz1)
                .with_init(init)
                .into(),
        ])
    }
}

/// Latent-to-image network.
#[derive(Debug, Clone)]
pub struct Generator {
    chain: ModuleChain,
    gwx: Conv2d,
}

impl Generator {
    pub fn new(context: &Rc<RefCell<GraphContext>>, config: &GeneratorConfig) -> Result<Self> {
        Self::from_configs(context, &config.module_configs()?, config.nc, &config.init)
    }

    /// Builds a generator from any chain that ends in feature maps, followed
    /// by a 5x5 aggregation convolution to `nc` channels.
    pub fn from_configs(
        context: &Rc<RefCell<GraphContext>>,
        configs: &[ModuleConfig],
        nc: usize,
        init: &Initializer,
    ) -> Result<Self> {
        let chain = ModuleChain::build(context, configs)?;
        let Port::Maps(channels) = chain.output_port() else {
            return Err(NetworkError::InvalidOutput {
                module: chain.last().name().to_string(),
                port: chain.output_port(),
                reason: "the aggregation convolution needs feature maps".into(),
            });
        };
        let gwx = Conv2d::new(context, "gwx", Conv2dConfig::new(channels, nc, 5), init)?;
        let generator = Self { chain, gwx };
        info!(
            modules = generator.chain.modules().len(),
            parameters = generator.params().numel(),
            "built generator"
        );
        Ok(generator)
    }

    pub fn modules(&self) -> &[MatryoshkaModule] {
        self.chain.modules()
    }

    /// Images in `(-1, 1)` from a `(batch, nz0)` latent.
    pub fn apply(&self, z0: &Tensor) -> Tensor {
        let h = self.chain.apply(z0).features;
        self.gwx.forward(&h).tanh()
    }

    /// Module parameters in chain order, then `gwx`.
    pub fn params(&self) -> ParameterCollection {
        ParameterCollection::gather("gen", self.chain.modules(), &self.gwx.parameters())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiscriminatorConfig {
    pub ndf: usize,
    /// Width of the fully connected module.
    pub ndfc: usize,
    pub nc: usize,
    pub npx: usize,
    pub init: Initializer,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            ndf: 32,
            ndfc: 256,
            nc: 3,
            npx: 32,
            init: Initializer::default(),
        }
    }
}

impl DiscriminatorConfig {
    /// `disc_mod_1..5`: four downsampling conv modules (the first without
    /// its leading batch norm) and a fully connected head.
    pub fn module_configs(&self) -> Result<Vec<ModuleConfig>> {
        let side = base_side(self.npx)?;
        let (ndf, init) = (self.ndf, self.init);
        Ok(vec![
            DiscConvConfig::new("disc_mod_1", 5, self.nc, ndf)
                .with_bn(false, true)
                .with_init(init)
                .into(),
            DiscConvConfig::new("disc_mod_2", 3, ndf, ndf * 2)
                .with_init(init)
                .into(),
            DiscConvConfig::new("disc_mod_3", 3, ndf * 2, ndf * 4)
                .with_init(init)
                .into(),
            DiscConvConfig::new("disc_mod_4", 3, ndf * 4, ndf * 8)
                .with_init(init)
                .into(),
            DiscFcConfig::new("disc_mod_5", ndf * 8 * side * side, self.ndfc)
                .with_init(init)
                .into(),
        ])
    }
}

/// Image-to-scores network with deep supervision.
#[derive(Debug, Clone)]
pub struct Discriminator {
    chain: ModuleChain,
}

impl Discriminator {
    pub fn new(context: &Rc<RefCell<GraphContext>>, config: &DiscriminatorConfig) -> Result<Self> {
        Self::from_configs(context, &config.module_configs()?)
    }

    pub fn from_configs(context: &Rc<RefCell<GraphContext>>, configs: &[ModuleConfig]) -> Result<Self> {
        let chain = ModuleChain::build(context, configs)?;
        let discriminator = Self { chain };
        info!(
            modules = discriminator.chain.modules().len(),
            parameters = discriminator.params().numel(),
            "built discriminator"
        );
        Ok(discriminator)
    }

    pub fn modules(&self) -> &[MatryoshkaModule] {
        self.chain.modules()
    }

    /// Raw logit scores, one per scoring module, shallowest first. Each is
    /// `(batch, k)` for some `k`.
    pub fn apply(&self, x: &Tensor) -> Vec<Tensor> {
        self.chain.apply(x).scores
    }

    pub fn params(&self) -> ParameterCollection {
        ParameterCollection::gather("discrim", self.chain.modules(), &[])
    }
}
