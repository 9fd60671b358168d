//! Ordered parameter collections: the unit of optimization and checkpointing.

use super::{NetworkError, Result};
use crate::nn::{Module, ModuleError, Parameter};
use crate::tensor::Tensor;
use ndarray::ArrayD;

/// Parameters of one network in a deterministic order: each module's
/// parameters in declared order, followed by standalone tensors.
#[derive(Debug, Clone, Default)]
pub struct ParameterCollection {
    label: String,
    params: Vec<Parameter>,
}

impl ParameterCollection {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            params: Vec::new(),
        }
    }

    /// Collects the parameters of `modules` in chain order, then `standalone`.
    pub fn gather<'a, M, I>(label: &str, modules: I, standalone: &[Parameter]) -> Self
    where
        M: Module + 'a,
        I: IntoIterator<Item = &'a M>,
    {
        let mut params: Vec<Parameter> = modules.into_iter().flat_map(|m| m.params()).collect();
        params.extend(standalone.iter().cloned());
        Self {
            label: label.to_string(),
            params,
        }
    }

    pub fn push(&mut self, param: Parameter) {
        self.params.push(param);
    }

    /// Network label used in checkpoint file names (`gen`, `discrim`).
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Parameter> {
        self.params.iter()
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn names(&self) -> Vec<String> {
        self.params.iter().map(|p| p.name().to_string()).collect()
    }

    /// Graph handles, e.g. the differentiation targets of a loss.
    pub fn tensors(&self) -> Vec<Tensor> {
        self.params.iter().map(|p| p.tensor().clone()).collect()
    }

    /// Snapshot of the current values.
    pub fn values(&self) -> Vec<ArrayD<f32>> {
        self.params.iter().map(|p| p.value().clone()).collect()
    }

    /// Total number of scalar weights.
    pub fn numel(&self) -> usize {
        self.params.iter().map(Parameter::numel).sum()
    }

    /// Assigns `values` positionally. Nothing is written unless the count and
    /// every shape match.
    pub fn assign_all(&self, values: Vec<ArrayD<f32>>) -> Result<()> {
        if values.len() != self.params.len() {
            return Err(NetworkError::CountMismatch {
                expected: self.params.len(),
                actual: values.len(),
            });
        }
        for (param, value) in self.params.iter().zip(&values) {
            if value.shape() != param.shape() {
                return Err(ModuleError::ShapeMismatch {
                    name: param.name().to_string(),
                    expected: param.shape().to_vec(),
                    actual: value.shape().to_vec(),
                }
                .into());
            }
        }
        for (param, value) in self.params.iter().zip(values) {
            param.assign(value)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a ParameterCollection {
    type Item = &'a Parameter;
    type IntoIter = std::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{DiscFcConfig, DiscFcModule, Initializer};
    use crate::tensor::GraphContext;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn collection() -> ParameterCollection {
        let ctx = Rc::new(RefCell::new(GraphContext::with_seed(0)));
        let m = DiscFcModule::new(&ctx, DiscFcConfig::new("fc", 4, 3)).unwrap();
        let extra = Parameter::new(&ctx, "extra", &[2], &Initializer::zeros()).unwrap();
        ParameterCollection::gather("discrim", [&m], &[extra])
    }

    #[test]
    fn gather_keeps_declared_order() {
        let c = collection();
        assert_eq!(c.label(), "discrim");
        assert_eq!(c.names(), vec!["fc.w1", "fc.g1", "fc.b1", "fc.w2", "extra"]);
        assert_eq!(c.numel(), 12 + 3 + 3 + 3 + 2);
    }

    #[test]
    fn assign_all_is_all_or_nothing() {
        let c = collection();
        let before = c.values();

        let mut wrong = before.clone();
        wrong[3] = ArrayD::zeros(vec![3, 2]);
        wrong[0] = ArrayD::ones(vec![4, 3]);
        assert!(matches!(
            c.assign_all(wrong),
            Err(NetworkError::Module(ModuleError::ShapeMismatch { .. }))
        ));
        assert_eq!(c.values(), before);

        assert_eq!(
            c.assign_all(before[..2].to_vec()),
            Err(NetworkError::CountMismatch { expected: 5, actual: 2 })
        );

        let ones: Vec<_> = before.iter().map(|v| ArrayD::ones(v.raw_dim())).collect();
        c.assign_all(ones).unwrap();
        assert!(c.iter().all(|p| p.value().iter().all(|&x| x == 1.0)));
    }
}
