//! Port checking and application of module chains.

use super::{NetworkError, Result};
use crate::nn::{MatryoshkaModule, Module, ModuleConfig, Port};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use tracing::debug;

/// How features cross from one module to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Junction {
    Direct,
    /// `(batch, c*side*side) -> (batch, c, side, side)`.
    Unflatten { channels: usize, side: usize },
    /// `(batch, c, h, w) -> (batch, c*h*w)`.
    Flatten,
}

impl Junction {
    pub fn apply(&self, x: &Tensor) -> Tensor {
        match *self {
            Junction::Direct => x.clone(),
            Junction::Unflatten { channels, side } => {
                x.reshape(vec![-1, channels as isize, side as isize, side as isize])
            }
            Junction::Flatten => x.flatten(),
        }
    }
}

fn exact_sqrt(q: usize) -> Option<usize> {
    let s = (q as f64).sqrt().round() as usize;
    (s > 0 && s * s == q).then_some(s)
}

/// Junction connecting an `output` port to an `input` port, or `None` when
/// the two cannot be joined.
pub fn junction(output: Port, input: Port) -> Option<Junction> {
    match (output, input) {
        (Port::Vector(a), Port::Vector(b)) | (Port::Maps(a), Port::Maps(b)) => {
            (a == b).then_some(Junction::Direct)
        }
        (Port::Vector(n), Port::Maps(c)) => {
            if c == 0 || n % c != 0 {
                return None;
            }
            exact_sqrt(n / c).map(|side| Junction::Unflatten { channels: c, side })
        }
        (Port::Maps(c), Port::Vector(n)) => (c > 0 && n % c == 0).then_some(Junction::Flatten),
    }
}

/// Validates every config and every junction of the chain, in order.
pub fn assemble_chain(configs: &[ModuleConfig]) -> Result<Vec<Junction>> {
    if configs.is_empty() {
        return Err(NetworkError::EmptyChain);
    }
    let mut names = HashSet::new();
    for config in configs {
        config.validate()?;
        if !names.insert(config.name()) {
            return Err(NetworkError::DuplicateModule(config.name().to_string()));
        }
    }
    configs
        .windows(2)
        .map(|pair| {
            let (from, to) = (&pair[0], &pair[1]);
            junction(from.output_port(), to.input_port()).ok_or_else(|| {
                NetworkError::ChannelMismatch {
                    from: from.name().to_string(),
                    to: to.name().to_string(),
                    output: from.output_port(),
                    input: to.input_port(),
                }
            })
        })
        .collect()
}

/// Features and collected scores after running a chain.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub features: Tensor,
    pub scores: Vec<Tensor>,
}

/// An assembled, port-checked sequence of modules.
#[derive(Debug, Clone)]
pub struct ModuleChain {
    modules: Vec<MatryoshkaModule>,
    junctions: Vec<Junction>,
}

impl ModuleChain {
    /// Checks the chain, then constructs its modules in order.
    pub fn build(context: &Rc<RefCell<GraphContext>>, configs: &[ModuleConfig]) -> Result<Self> {
        let junctions = assemble_chain(configs)?;
        let modules = configs
            .iter()
            .map(|config| config.build(context))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        debug!(
            modules = modules.len(),
            first = %configs[0].name(),
            "assembled module chain"
        );
        Ok(Self { modules, junctions })
    }

    pub fn modules(&self) -> &[MatryoshkaModule] {
        &self.modules
    }

    pub fn junctions(&self) -> &[Junction] {
        &self.junctions
    }

    /// Last module of the chain. Chains are never empty.
    pub fn last(&self) -> &MatryoshkaModule {
        &self.modules[self.modules.len() - 1]
    }

    pub fn input_port(&self) -> Port {
        self.modules[0].input_port()
    }

    pub fn output_port(&self) -> Port {
        self.last().output_port()
    }

    /// Applies every module, bridging junctions and collecting scores.
    pub fn apply(&self, input: &Tensor) -> ChainOutput {
        let mut scores = Vec::new();
        let mut h = input.clone();
        for (i, module) in self.modules.iter().enumerate() {
            if i > 0 {
                h = self.junctions[i - 1].apply(&h);
            }
            let out = module.apply(&h);
            scores.extend(out.score);
            h = out.features;
        }
        ChainOutput { features: h, scores }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{DiscConvConfig, DiscFcConfig, GenConvConfig, GenUniConfig};

    #[test]
    fn junction_rules() {
        assert_eq!(junction(Port::Maps(8), Port::Maps(8)), Some(Junction::Direct));
        assert_eq!(junction(Port::Vector(8), Port::Vector(9)), None);
        assert_eq!(
            junction(Port::Vector(1024), Port::Maps(256)),
            Some(Junction::Unflatten { channels: 256, side: 2 })
        );
        assert_eq!(junction(Port::Vector(512), Port::Maps(256)), None);
        assert_eq!(junction(Port::Vector(100), Port::Maps(3)), None);
        assert_eq!(junction(Port::Maps(256), Port::Vector(1024)), Some(Junction::Flatten));
        assert_eq!(junction(Port::Maps(256), Port::Vector(1000)), None);
    }

    #[test]
    fn mismatched_channels_are_reported_with_both_modules() {
        let configs: Vec<ModuleConfig> = vec![
            GenUniConfig::new("gen_mod_1", 64, 1024).into(),
            GenConvConfig::new("gen_mod_2", 3, 256, 256).into(),
            GenConvConfig::new("gen_mod_3", 3, 128, 64).into(),
        ];
        let err = assemble_chain(&configs).unwrap_err();
        assert_eq!(
            err,
            NetworkError::ChannelMismatch {
                from: "gen_mod_2".into(),
                to: "gen_mod_3".into(),
                output: Port::Maps(256),
                input: Port::Maps(128),
            }
        );
    }

    #[test]
    fn empty_and_duplicate_chains_fail() {
        assert_eq!(assemble_chain(&[]), Err(NetworkError::EmptyChain));
        let configs: Vec<ModuleConfig> = vec![
            DiscConvConfig::new("d", 3, 3, 8).into(),
            DiscConvConfig::new("d", 3, 8, 8).into(),
        ];
        assert_eq!(
            assemble_chain(&configs),
            Err(NetworkError::DuplicateModule("d".into()))
        );
    }

    #[test]
    fn chain_collects_one_score_per_discriminator_module() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let configs: Vec<ModuleConfig> = vec![
            DiscConvConfig::new("disc_mod_1", 3, 3, 4).into(),
            DiscFcConfig::new("disc_mod_2", 4 * 4 * 4, 8).into(),
        ];
        let chain = ModuleChain::build(&ctx, &configs).unwrap();
        assert_eq!(chain.junctions(), &[Junction::Flatten]);
        let out = chain.apply(&Tensor::new_input(&ctx, "x"));
        assert_eq!(out.scores.len(), 2);
        assert_eq!(chain.output_port(), Port::Vector(8));
    }
}
