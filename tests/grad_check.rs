//! Compares symbolic gradients against central finite differences, for raw
//! graph operations and for the parameters of Matryoshka modules.

use matryoshka_gan::asg::{NodeId, UpsampleMode};
use matryoshka_gan::autograd::Gradients;
use matryoshka_gan::losses::bce_with_logits_to;
use matryoshka_gan::nn::{
    BatchNorm, DiscConvConfig, DiscConvModule, GenConvConfig, GenConvModule, Layer, Module, NormLayout, Parameter,
};
use matryoshka_gan::runtime::{Backend, CpuBackend, Memo};
use matryoshka_gan::tensor::{GraphContext, Tensor};

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::rc::Rc;

/// Step for smooth graphs, compared element by element.
const EPSILON: f32 = 1e-2;
const ABS_TOLERANCE: f32 = 5e-3;
const REL_TOLERANCE: f32 = 3e-2;
/// Step for module parameters. Rectifier kinks can spoil single elements of
/// the numeric gradient, so these are compared as whole vectors.
const PARAM_EPSILON: f32 = 1e-3;
const NOISE_SEED: u64 = 17;

fn assert_grads_are_close(analytic: &ArrayD<f32>, numeric: &ArrayD<f32>) {
    assert_eq!(analytic.shape(), numeric.shape(), "gradient shapes differ");
    for (i, (a, n)) in analytic.iter().zip(numeric.iter()).enumerate() {
        let diff = (a - n).abs();
        let bound = ABS_TOLERANCE + REL_TOLERANCE * a.abs().max(n.abs());
        assert!(
            diff <= bound,
            "element {i}: analytic {a:.6}, numeric {n:.6}, difference {diff:.6}"
        );
    }
}

/// Direction and length agree: cosine similarity and relative norm.
fn assert_grads_align(analytic: &ArrayD<f32>, numeric: &ArrayD<f32>) {
    assert_eq!(analytic.shape(), numeric.shape(), "gradient shapes differ");
    let dot: f32 = analytic.iter().zip(numeric.iter()).map(|(a, n)| a * n).sum();
    let norm_a = analytic.iter().map(|a| a * a).sum::<f32>().sqrt();
    let norm_n = numeric.iter().map(|n| n * n).sum::<f32>().sqrt();
    assert!(norm_n > 1e-3, "numeric gradient vanishes");
    let cosine = dot / (norm_a * norm_n);
    assert!(cosine > 0.995, "cosine similarity {cosine:.5}");
    assert!(
        (norm_a - norm_n).abs() <= 0.03 * norm_n,
        "norms differ: analytic {norm_a:.5}, numeric {norm_n:.5}"
    );
}

fn random(shape: &[usize], seed: u64) -> ArrayD<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    ArrayD::random_using(IxDyn(shape), Uniform::new(-1.0f32, 1.0), &mut rng)
}

/// A scalar that depends nonlinearly on every element of `y`, so that
/// normalized outputs still produce nonzero gradients.
fn readout(y: &Tensor) -> Tensor {
    (&(&y.tanh() * y) + &y.scale(0.5)).sum()
}

/// A loss graph with one fed input and the parameters it reads.
struct Probe {
    context: Rc<RefCell<GraphContext>>,
    input: Tensor,
    loss: Tensor,
    params: Vec<Parameter>,
}

impl Probe {
    fn evaluate(&self, x: &ArrayD<f32>, targets: &[NodeId]) -> Vec<ArrayD<f32>> {
        let backend = CpuBackend::with_seed(NOISE_SEED);
        let mut memo: Memo<ArrayD<f32>> = Memo::new();
        memo.insert(self.input.node_id, x.clone());
        for p in &self.params {
            memo.insert(p.tensor().node_id, p.value().clone());
        }
        let ctx = self.context.borrow();
        backend.run(ctx.main_graph(), targets, memo).unwrap().0
    }

    fn loss_value(&self, x: &ArrayD<f32>) -> f32 {
        let out = self.evaluate(x, &[self.loss.node_id]);
        assert_eq!(out[0].len(), 1, "grad check needs a scalar loss");
        out[0].iter().copied().next().unwrap()
    }

    fn analytic(&self, x: &ArrayD<f32>, wrt: NodeId) -> ArrayD<f32> {
        let grads = {
            let mut ctx = self.context.borrow_mut();
            Gradients::new(ctx.main_graph_mut())
                .build(self.loss.node_id, &[wrt])
                .unwrap()
        };
        self.evaluate(x, &grads).remove(0)
    }

    fn numeric_wrt_input(&self, x: &ArrayD<f32>, eps: f32) -> ArrayD<f32> {
        let mut grad = ArrayD::zeros(x.shape());
        for i in 0..x.len() {
            let mut plus = x.clone();
            plus.as_slice_mut().unwrap()[i] += eps;
            let mut minus = x.clone();
            minus.as_slice_mut().unwrap()[i] -= eps;
            grad.as_slice_mut().unwrap()[i] = (self.loss_value(&plus) - self.loss_value(&minus)) / (2.0 * eps);
        }
        grad
    }

    fn numeric_wrt_param(&self, x: &ArrayD<f32>, param: &Parameter, eps: f32) -> ArrayD<f32> {
        let original = param.value().clone();
        let mut grad = ArrayD::zeros(original.shape());
        for i in 0..original.len() {
            let mut plus = original.clone();
            plus.as_slice_mut().unwrap()[i] += eps;
            param.assign(plus).unwrap();
            let up = self.loss_value(x);

            let mut minus = original.clone();
            minus.as_slice_mut().unwrap()[i] -= eps;
            param.assign(minus).unwrap();
            let down = self.loss_value(x);

            grad.as_slice_mut().unwrap()[i] = (up - down) / (2.0 * eps);
        }
        param.assign(original).unwrap();
        grad
    }
}

fn probe(build: impl FnOnce(&Rc<RefCell<GraphContext>>, &Tensor) -> (Tensor, Vec<Parameter>)) -> Probe {
    let context = Rc::new(RefCell::new(GraphContext::with_seed(5)));
    let input = Tensor::new_input(&context, "x");
    let (loss, params) = build(&context, &input);
    Probe {
        context,
        input,
        loss,
        params,
    }
}

fn check_input_grad(build: fn(&Tensor) -> Tensor, x: ArrayD<f32>) {
    let p = probe(|_, input| (build(input), Vec::new()));
    let analytic = p.analytic(&x, p.input.node_id);
    let numeric = p.numeric_wrt_input(&x, EPSILON);
    assert_grads_are_close(&analytic, &numeric);
}

#[test]
fn test_grad_elementwise() {
    check_input_grad(|x| (x * x).sum(), random(&[2, 3], 1));
    check_input_grad(|x| readout(&(&x.sigmoid() + &x.softplus())), random(&[2, 3], 2));
    check_input_grad(|x| (&x.exp() / &x.square().add_scalar(1.0)).mean(), random(&[4], 3));
    // keep inputs clear of the kink
    let away = random(&[3, 3], 4).mapv(|v| if v >= 0.0 { v + 0.1 } else { v - 0.1 });
    check_input_grad(|x| readout(&x.leaky_relu(0.2)), away);
}

#[test]
fn test_grad_reductions_and_reshape() {
    check_input_grad(|x| readout(&x.mean_axes(&[0, 2, 3])), random(&[2, 3, 2, 2], 5));
    check_input_grad(|x| readout(&x.sum_axes(&[1]).reshape(vec![-1, 2])), random(&[2, 3, 2, 2], 6));
    check_input_grad(|x| readout(&x.flatten().transpose(0, 1)), random(&[2, 2, 3], 7));
}

#[test]
fn test_grad_conv2d() {
    check_input_grad(
        |x| {
            let w = Tensor::new_literal(&x.context, random(&[4, 2, 3, 3], 8), "w");
            readout(&x.conv2d(&w, 1, 1))
        },
        random(&[2, 2, 5, 5], 9),
    );
    check_input_grad(
        |x| {
            let w = Tensor::new_literal(&x.context, random(&[3, 2, 5, 5], 10), "w");
            readout(&x.conv2d(&w, 2, 2))
        },
        random(&[1, 2, 6, 6], 11),
    );
}

#[test]
fn test_grad_resampling() {
    check_input_grad(
        |x| readout(&x.upsample2d(2, UpsampleMode::Nearest).avg_pool2d(2).scale(3.0)),
        random(&[2, 2, 3, 3], 12),
    );
    check_input_grad(
        |x| {
            let w = Tensor::new_literal(&x.context, random(&[2, 2, 3, 3], 13), "w");
            readout(&x.upsample2d(2, UpsampleMode::ZeroInsert).conv2d(&w, 1, 1))
        },
        random(&[1, 2, 3, 3], 14),
    );
}

#[test]
fn test_grad_concat_and_bce() {
    check_input_grad(
        |x| readout(&Tensor::concat(&[x, &x.tanh()], 1)),
        random(&[2, 3], 15),
    );
    check_input_grad(|x| bce_with_logits_to(&x.scale(4.0), 1.0), random(&[3, 2], 16));
    check_input_grad(|x| bce_with_logits_to(&x.scale(4.0), 0.0), random(&[3, 2], 17));
}

#[test]
fn test_grad_batchnorm_input_and_gain() {
    let p = probe(|ctx, x| {
        let bn = BatchNorm::new(ctx, "bn", "1", 3, NormLayout::Maps).unwrap();
        (readout(&bn.forward(x)), bn.parameters())
    });
    let x = random(&[3, 3, 2, 2], 18);

    let analytic = p.analytic(&x, p.input.node_id);
    assert_grads_are_close(&analytic, &p.numeric_wrt_input(&x, EPSILON));

    let gain = p.params[0].clone();
    let analytic = p.analytic(&x, gain.tensor().node_id);
    assert_grads_are_close(&analytic, &p.numeric_wrt_param(&x, &gain, EPSILON));
}

#[test]
fn test_grad_disc_conv_module_params() {
    let p = probe(|ctx, x| {
        let config = DiscConvConfig::new("disc", 3, 2, 3).with_bn(false, true);
        let module = DiscConvModule::new(ctx, config).unwrap();
        let out = module.apply(x);
        let score = out.score.unwrap();
        let loss = &bce_with_logits_to(&score, 1.0) + &readout(&out.features);
        (loss, module.params())
    });
    let x = random(&[3, 2, 4, 4], 19);
    let names: Vec<&str> = p.params.iter().map(|q| q.name()).collect();
    assert_eq!(names, vec!["disc.w1", "disc.w2", "disc.g2", "disc.b2", "disc.wy"]);

    for param in [p.params[0].clone(), p.params[4].clone()] {
        let analytic = p.analytic(&x, param.tensor().node_id);
        assert_grads_align(&analytic, &p.numeric_wrt_param(&x, &param, PARAM_EPSILON));
    }
}

#[test]
fn test_grad_through_injected_noise() {
    // Forward and backward read the same noise sample within one evaluation,
    // and every evaluation restarts the noise stream from the same seed.
    let p = probe(|ctx, x| {
        let config = GenConvConfig::new("gen", 3, 2, 2).with_noise(2).with_bn(false, false);
        let module = GenConvModule::new(ctx, config).unwrap();
        (readout(&module.apply(x).features), module.params())
    });
    let x = random(&[2, 2, 2, 2], 20);
    let w2 = p.params.iter().find(|q| q.name() == "gen.w2").unwrap().clone();
    assert_eq!(w2.shape(), &[2, 4, 3, 3]);

    let analytic = p.analytic(&x, w2.tensor().node_id);
    assert_grads_align(&analytic, &p.numeric_wrt_param(&x, &w2, PARAM_EPSILON));
}
