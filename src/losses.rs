//! Loss functions in the graph paradigm.
//!
//! Loss functions are regular Rust functions that take symbolic `Tensor`
//! handles and append the nodes computing the error value. Every loss here
//! is a 0-d tensor.
//!
//! - **Binary cross-entropy on logits**: [`bce_with_logits`], [`bce_with_logits_to`]
//! - **Deep supervision**: [`deep_supervision`] sums the BCE of every score
//! - **Weight decay**: [`l2_penalty`]
//! - **GAN objectives**: [`GanCosts`]

use crate::network::ParameterCollection;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Weight of the squared-norm penalty inside both GAN costs.
pub const COST_WEIGHT_DECAY: f32 = 1e-5;

fn sum_all(context: &Rc<RefCell<GraphContext>>, terms: impl IntoIterator<Item = Tensor>) -> Tensor {
    terms
        .into_iter()
        .reduce(|acc, t| &acc + &t)
        .unwrap_or_else(|| Tensor::scalar(context, 0.0))
}

/// Mean binary cross-entropy between `sigmoid(logits)` and `targets`.
///
/// Uses `softplus(x) - x * y`, which equals
/// `-(y * ln(sigmoid(x)) + (1 - y) * ln(1 - sigmoid(x)))` and stays finite for
/// any logit.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Tensor {
    let per_element = &logits.softplus() - &(logits * targets);
    per_element.mean()
}

/// [`bce_with_logits`] against a constant target (`1.0` real, `0.0` fake).
pub fn bce_with_logits_to(logits: &Tensor, target: f32) -> Tensor {
    if target == 0.0 {
        return logits.softplus().mean();
    }
    let per_element = &logits.softplus() - &logits.scale(target);
    per_element.mean()
}

/// `Σ_i mean(bce(score_i, target))` over every reported score.
pub fn deep_supervision(context: &Rc<RefCell<GraphContext>>, scores: &[Tensor], target: f32) -> Tensor {
    sum_all(context, scores.iter().map(|s| bce_with_logits_to(s, target)))
}

/// `weight * Σ_p Σ p²` over a parameter collection.
pub fn l2_penalty(context: &Rc<RefCell<GraphContext>>, params: &ParameterCollection, weight: f32) -> Tensor {
    sum_all(context, params.iter().map(|p| p.tensor().square().sum())).scale(weight)
}

/// Both adversarial objectives and their parts, built once over shared
/// discriminator outputs for real and generated batches.
#[derive(Debug, Clone)]
pub struct GanCosts {
    pub g_cost: Tensor,
    pub d_cost: Tensor,
    /// Generator's adversarial term, `Σ bce(p_gen, 1)`.
    pub g_cost_d: Tensor,
    pub d_cost_real: Tensor,
    pub d_cost_gen: Tensor,
}

impl GanCosts {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        p_real: &[Tensor],
        p_gen: &[Tensor],
        gen_params: &ParameterCollection,
        disc_params: &ParameterCollection,
    ) -> Self {
        let d_cost_real = deep_supervision(context, p_real, 1.0);
        let d_cost_gen = deep_supervision(context, p_gen, 0.0);
        let g_cost_d = deep_supervision(context, p_gen, 1.0);

        let d_cost = &(&d_cost_real + &d_cost_gen) + &l2_penalty(context, disc_params, COST_WEIGHT_DECAY);
        let g_cost = &g_cost_d + &l2_penalty(context, gen_params, COST_WEIGHT_DECAY);
        Self {
            g_cost,
            d_cost,
            g_cost_d,
            d_cost_real,
            d_cost_gen,
        }
    }

    /// `[g_cost, d_cost, g_cost_d, d_cost_real, d_cost_gen]`.
    pub fn outputs(&self) -> Vec<Tensor> {
        vec![
            self.g_cost.clone(),
            self.d_cost.clone(),
            self.g_cost_d.clone(),
            self.d_cost_real.clone(),
            self.d_cost_gen.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Initializer, Parameter};
    use crate::runtime::{Backend, CpuBackend};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, ArrayD};
    use std::collections::HashMap;

    fn eval(ctx: &Rc<RefCell<GraphContext>>, out: &Tensor, feed: Vec<(&Tensor, ArrayD<f32>)>) -> f32 {
        let memo: HashMap<_, _> = feed.into_iter().map(|(t, v)| (t.node_id, v)).collect();
        let graph = ctx.borrow();
        let (values, _) = CpuBackend::new()
            .run(graph.main_graph(), &[out.node_id], memo)
            .unwrap();
        assert_eq!(values[0].ndim(), 0);
        values[0].iter().copied().next().unwrap()
    }

    fn reference_bce(x: f32, y: f32) -> f32 {
        let p = 1.0 / (1.0 + (-x).exp());
        -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
    }

    #[test]
    fn bce_matches_the_probability_form() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = Tensor::new_input(&ctx, "y");
        let loss = bce_with_logits(&x, &y);

        let xs = [-2.0f32, -0.5, 0.0, 1.5];
        let ys = [0.0f32, 1.0, 1.0, 0.0];
        let expected = xs.iter().zip(&ys).map(|(&a, &b)| reference_bce(a, b)).sum::<f32>() / 4.0;
        let got = eval(
            &ctx,
            &loss,
            vec![(&x, arr1(&xs).into_dyn()), (&y, arr1(&ys).into_dyn())],
        );
        assert_abs_diff_eq!(got, expected, epsilon = 1e-5);
    }

    #[test]
    fn bce_is_finite_for_extreme_logits() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let real = bce_with_logits_to(&x, 1.0);
        let fake = bce_with_logits_to(&x, 0.0);
        let data = arr1(&[-500.0f32, 500.0]).into_dyn();
        let r = eval(&ctx, &real, vec![(&x, data.clone())]);
        let f = eval(&ctx, &fake, vec![(&x, data)]);
        assert_abs_diff_eq!(r, 250.0, epsilon = 1e-2);
        assert_abs_diff_eq!(f, 250.0, epsilon = 1e-2);
    }

    #[test]
    fn deep_supervision_sums_every_score() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let a = Tensor::new_input(&ctx, "a");
        let b = Tensor::new_input(&ctx, "b");
        let total = deep_supervision(&ctx, &[a.clone(), b.clone()], 1.0);
        let got = eval(
            &ctx,
            &total,
            vec![
                (&a, arr1(&[0.0f32, 0.0]).into_dyn()),
                (&b, arr1(&[0.0f32]).into_dyn()),
            ],
        );
        assert_abs_diff_eq!(got, 2.0 * std::f32::consts::LN_2, epsilon = 1e-6);
    }

    #[test]
    fn l2_penalty_of_a_collection() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let p = Parameter::new(&ctx, "w", &[2, 2], &Initializer::Constant(2.0)).unwrap();
        let mut params = ParameterCollection::new("gen");
        params.push(p.clone());
        let penalty = l2_penalty(&ctx, &params, 0.5);
        let got = eval(&ctx, &penalty, vec![(p.tensor(), p.value().clone())]);
        assert_abs_diff_eq!(got, 8.0, epsilon = 1e-6);

        let empty = l2_penalty(&ctx, &ParameterCollection::new("none"), 0.5);
        assert_abs_diff_eq!(eval(&ctx, &empty, vec![]), 0.0);
    }
}
