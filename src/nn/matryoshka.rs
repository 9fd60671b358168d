//! The closed family of Matryoshka modules.
//!
//! [`ModuleConfig`] enumerates every variant's validated configuration and
//! [`MatryoshkaModule`] holds a constructed module of any variant, so that
//! networks can store heterogeneous chains without trait objects.

use crate::nn::basic::{BasicConvConfig, BasicConvModule};
use crate::nn::discriminator::{DiscConvConfig, DiscConvModule, DiscFcConfig, DiscFcModule};
use crate::nn::generator::{
    GenConvConfig, GenConvModule, GenFcConfig, GenFcModule, GenUniConfig, GenUniModule,
};
use crate::nn::module::{Module, ModuleError, ModuleOutput, Parameter, Port};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub enum ModuleConfig {
    GenUni(GenUniConfig),
    GenConv(GenConvConfig),
    GenFc(GenFcConfig),
    DiscConv(DiscConvConfig),
    DiscFc(DiscFcConfig),
    BasicConv(BasicConvConfig),
}

macro_rules! dispatch_config {
    ($self:expr, $cfg:ident => $body:expr) => {
        match $self {
            ModuleConfig::GenUni($cfg) => $body,
            ModuleConfig::GenConv($cfg) => $body,
            ModuleConfig::GenFc($cfg) => $body,
            ModuleConfig::DiscConv($cfg) => $body,
            ModuleConfig::DiscFc($cfg) => $body,
            ModuleConfig::BasicConv($cfg) => $body,
        }
    };
}

impl ModuleConfig {
    pub fn name(&self) -> &str {
        dispatch_config!(self, c => &c.name)
    }

    pub fn input_port(&self) -> Port {
        dispatch_config!(self, c => c.input_port())
    }

    pub fn output_port(&self) -> Port {
        dispatch_config!(self, c => c.output_port())
    }

    pub fn validate(&self) -> Result<(), ModuleError> {
        dispatch_config!(self, c => c.validate())
    }

    /// Allocates the module's parameters in `context`.
    pub fn build(&self, context: &Rc<RefCell<GraphContext>>) -> Result<MatryoshkaModule, ModuleError> {
        Ok(match self {
            ModuleConfig::GenUni(c) => GenUniModule::new(context, c.clone())?.into(),
            ModuleConfig::GenConv(c) => GenConvModule::new(context, c.clone())?.into(),
            ModuleConfig::GenFc(c) => GenFcModule::new(context, c.clone())?.into(),
            ModuleConfig::DiscConv(c) => DiscConvModule::new(context, c.clone())?.into(),
            ModuleConfig::DiscFc(c) => DiscFcModule::new(context, c.clone())?.into(),
            ModuleConfig::BasicConv(c) => BasicConvModule::new(context, c.clone())?.into(),
        })
    }
}

#[derive(Debug, Clone)]
pub enum MatryoshkaModule {
    GenUni(GenUniModule),
    GenConv(GenConvModule),
    GenFc(GenFcModule),
    DiscConv(DiscConvModule),
    DiscFc(DiscFcModule),
    BasicConv(BasicConvModule),
}

macro_rules! dispatch_module {
    ($self:expr, $m:ident => $body:expr) => {
        match $self {
            MatryoshkaModule::GenUni($m) => $body,
            MatryoshkaModule::GenConv($m) => $body,
            MatryoshkaModule::GenFc($m) => $body,
            MatryoshkaModule::DiscConv($m) => $body,
            MatryoshkaModule::DiscFc($m) => $body,
            MatryoshkaModule::BasicConv($m) => $body,
        }
    };
}

impl Module for MatryoshkaModule {
    fn name(&self) -> &str {
        dispatch_module!(self, m => m.name())
    }

    fn input_port(&self) -> Port {
        dispatch_module!(self, m => m.input_port())
    }

    fn output_port(&self) -> Port {
        dispatch_module!(self, m => m.output_port())
    }

    fn params(&self) -> Vec<Parameter> {
        dispatch_module!(self, m => m.params())
    }

    fn apply(&self, input: &Tensor) -> ModuleOutput {
        dispatch_module!(self, m => m.apply(input))
    }
}

macro_rules! impl_from {
    ($($variant:ident: $config:ty => $module:ty),* $(,)?) => {
        $(
            impl From<$config> for ModuleConfig {
                fn from(config: $config) -> Self {
                    ModuleConfig::$variant(config)
                }
            }

            impl From<$module> for MatryoshkaModule {
                fn from(module: $module) -> Self {
                    MatryoshkaModule::$variant(module)
                }
            }
        )*
    };
}

impl_from!(
    GenUni: GenUniConfig => GenUniModule,
    GenConv: GenConvConfig => GenConvModule,
    GenFc: GenFcConfig => GenFcModule,
    DiscConv: DiscConvConfig => DiscConvModule,
    DiscFc: DiscFcConfig => DiscFcModule,
    BasicConv: BasicConvConfig => BasicConvModule,
);
