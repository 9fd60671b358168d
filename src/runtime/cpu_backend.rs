//! CPU execution backend.
//!
//! Evaluates the ancestors of the requested outputs in topological order with
//! `ndarray`, caching every value in the memo. Convolutions are lowered to
//! im2col + matrix products. Noise nodes draw from the backend's own RNG, so
//! a seeded backend makes a whole evaluation reproducible.

use super::backend::{Backend, Memo, RuntimeError};
use crate::analysis::shape_inference::{broadcast_shapes, conv_output_len, resolve_reshape};
use crate::asg::{Asg, NodeId, NodeType, UpsampleMode};
use ndarray::{
    arr0, Array2, Array4, ArrayBase, ArrayD, ArrayView3, ArrayView4, ArrayViewMut3, Axis, Data,
    Dimension, Ix2, Ix4, IxDyn, Slice, Zip,
};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;

type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug)]
pub struct CpuBackend {
    rng: RefCell<StdRng>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            rng: RefCell::new(StdRng::from_entropy()),
        }
    }

    /// Backend whose noise samples are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Restarts the noise stream from `seed`.
    pub fn reseed(&self, seed: u64) {
        *self.rng.borrow_mut() = StdRng::seed_from_u64(seed);
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    type DeviceData = ArrayD<f32>;

    fn load_data(&self, data: &ArrayD<f32>) -> Result<Self::DeviceData> {
        Ok(data.clone())
    }

    fn run(
        &self,
        asg: &Asg,
        outputs: &[NodeId],
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>)> {
        let mut ctx = ExecutionContext {
            asg,
            memo: initial_memo,
            rng: &self.rng,
        };
        for id in asg.ancestors(outputs)? {
            if ctx.memo.contains_key(&id) {
                continue;
            }
            let value = ctx.evaluate_node(id)?;
            ctx.memo.insert(id, value);
        }
        let results = outputs
            .iter()
            .map(|&id| {
                ctx.memo
                    .get(&id)
                    .cloned()
                    .ok_or(RuntimeError::MissingOperand { node: id, operand: id })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((results, ctx.memo))
    }

    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<ArrayD<f32>>> {
        Ok(device_data.to_vec())
    }
}

struct ExecutionContext<'a> {
    asg: &'a Asg,
    memo: Memo<ArrayD<f32>>,
    rng: &'a RefCell<StdRng>,
}

impl<'a> ExecutionContext<'a> {
    fn value(&self, node: NodeId, operand: NodeId) -> Result<&ArrayD<f32>> {
        self.memo
            .get(&operand)
            .ok_or(RuntimeError::MissingOperand { node, operand })
    }

    fn evaluate_node(&self, id: NodeId) -> Result<ArrayD<f32>> {
        let node = self.asg.get_node(id)?;
        let v = |operand: NodeId| self.value(id, operand);

        use NodeType::*;
        match &node.node_type {
            Input { name } => Err(RuntimeError::MissingInput(name.clone(), id)),
            Parameter { name } => Err(RuntimeError::MissingParameter(name.clone(), id)),
            Literal(value) => Ok(value.clone()),
            Scalar(x) => Ok(arr0(*x).into_dyn()),
            RandomNormal { like, channels } => {
                let mut shape = v(*like)?.shape().to_vec();
                if shape.len() < 2 {
                    return Err(RuntimeError::shape("RandomNormal", format!("{shape:?}")));
                }
                shape[1] = *channels;
                let mut rng = self.rng.borrow_mut();
                Ok(ArrayD::random_using(IxDyn(&shape), StandardNormal, &mut *rng))
            }

            Add(a, b) => op_binary("Add", v(*a)?, v(*b)?, |x, y| x + y),
            Subtract(a, b) => op_binary("Subtract", v(*a)?, v(*b)?, |x, y| x - y),
            Multiply(a, b) => op_binary("Multiply", v(*a)?, v(*b)?, |x, y| x * y),
            Divide(a, b) => op_binary("Divide", v(*a)?, v(*b)?, |x, y| x / y),
            GreaterThan(a, b) => {
                op_binary("GreaterThan", v(*a)?, v(*b)?, |x, y| if x > y { 1.0 } else { 0.0 })
            }
            MatrixMultiply(a, b) => op_matmul(v(*a)?, v(*b)?),

            Negate(x) => Ok(v(*x)?.mapv(|e| -e)),
            Exp(x) => Ok(v(*x)?.mapv(f32::exp)),
            Log(x) => Ok(v(*x)?.mapv(f32::ln)),
            Sqrt(x) => Ok(v(*x)?.mapv(f32::sqrt)),
            ReLU(x) => Ok(v(*x)?.mapv(|e| e.max(0.0))),
            LeakyReLU(x, slope) => Ok(v(*x)?.mapv(|e| if e > 0.0 { e } else { e * slope })),
            Sigmoid(x) => Ok(v(*x)?.mapv(sigmoid)),
            Tanh(x) => Ok(v(*x)?.mapv(f32::tanh)),
            Softplus(x) => Ok(v(*x)?.mapv(softplus)),

            Sum(x) => Ok(arr0(v(*x)?.sum()).into_dyn()),
            Mean(x) => {
                let x = v(*x)?;
                if x.is_empty() {
                    return Err(RuntimeError::shape("Mean", "empty tensor"));
                }
                Ok(arr0(x.sum() / x.len() as f32).into_dyn())
            }
            SumAxes { input, axes } => op_sum_axes("SumAxes", v(*input)?, axes),
            MeanAxes { input, axes } => {
                let x = v(*input)?;
                let summed = op_sum_axes("MeanAxes", x, axes)?;
                let count = reduced_count(x.shape(), Some(axes));
                Ok(summed / count as f32)
            }

            Reshape(x, spec) => {
                let x = v(*x)?;
                let shape = resolve_reshape(x.shape(), spec).ok_or_else(|| {
                    RuntimeError::shape("Reshape", format!("{:?} -> {:?}", x.shape(), spec))
                })?;
                reshape("Reshape", x, &shape)
            }
            ReshapeLike { input, like } => reshape("ReshapeLike", v(*input)?, v(*like)?.shape()),
            Transpose(x, a1, a2) => {
                let mut t = v(*x)?.clone();
                if *a1 >= t.ndim() || *a2 >= t.ndim() {
                    return Err(RuntimeError::shape("Transpose", format!("{:?}", t.shape())));
                }
                t.swap_axes(*a1, *a2);
                Ok(t.as_standard_layout().into_owned())
            }
            Concat { inputs, axis } => {
                let views = inputs
                    .iter()
                    .map(|&i| v(i).map(|a| a.view()))
                    .collect::<Result<Vec<_>>>()?;
                ndarray::concatenate(Axis(*axis), &views)
                    .map_err(|e| RuntimeError::shape("Concat", e.to_string()))
            }

            Conv2d {
                input,
                weight,
                stride,
                padding,
            } => op_conv2d(v(*input)?, v(*weight)?, *stride, *padding),
            Upsample2d {
                input,
                factor,
                mode,
            } => op_upsample2d(v(*input)?, *factor, *mode),
            AvgPool2d { input, size } => op_avg_pool2d(v(*input)?, *size),

            Broadcast { source, like } => {
                let (source, like) = (v(*source)?, v(*like)?);
                broadcast("Broadcast", source, like.shape())
            }
            BroadcastMean { source, like, axes } => {
                let (source, like) = (v(*source)?, v(*like)?);
                let count = reduced_count(like.shape(), axes.as_deref());
                Ok(broadcast("BroadcastMean", source, like.shape())? / count as f32)
            }
            ReduceSumTo { source, like } => op_reduce_sum_to(v(*source)?, v(*like)?.shape()),
            Split {
                source,
                parts,
                index,
                axis,
            } => {
                let mut offset = 0;
                for &p in &parts[..*index] {
                    offset += v(p)?.shape()[*axis];
                }
                let len = v(parts[*index])?.shape()[*axis];
                let source = v(*source)?;
                if offset + len > source.shape()[*axis] {
                    return Err(RuntimeError::shape("Split", format!("{:?}", source.shape())));
                }
                Ok(source
                    .slice_axis(Axis(*axis), Slice::from(offset..offset + len))
                    .to_owned())
            }
            Conv2dGradInput {
                grad,
                weight,
                like,
                stride,
                padding,
            } => op_conv2d_grad_input(v(*grad)?, v(*weight)?, v(*like)?.shape(), *stride, *padding),
            Conv2dGradWeight {
                input,
                grad,
                like,
                stride,
                padding,
            } => op_conv2d_grad_weight(v(*input)?, v(*grad)?, v(*like)?.shape(), *stride, *padding),
            Upsample2dGrad { grad, factor, mode } => op_upsample2d_grad(v(*grad)?, *factor, *mode),
            AvgPool2dGrad { grad, like, size } => op_avg_pool2d_grad(v(*grad)?, v(*like)?.shape(), *size),
        }
    }
}

// ---------------------------------------------------------------------------
// Elementwise and reductions
// ---------------------------------------------------------------------------

fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn op_binary(
    op: &'static str,
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    f: impl Fn(f32, f32) -> f32,
) -> Result<ArrayD<f32>> {
    let shape = broadcast_shapes(a.shape(), b.shape())
        .ok_or_else(|| RuntimeError::shape(op, format!("{:?} vs {:?}", a.shape(), b.shape())))?;
    let av = a
        .broadcast(&shape[..])
        .ok_or_else(|| RuntimeError::shape(op, format!("{:?}", a.shape())))?;
    let bv = b
        .broadcast(&shape[..])
        .ok_or_else(|| RuntimeError::shape(op, format!("{:?}", b.shape())))?;
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

fn op_matmul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let err = || RuntimeError::shape("MatrixMultiply", format!("{:?} x {:?}", a.shape(), b.shape()));
    let a2 = a.view().into_dimensionality::<Ix2>().map_err(|_| err())?;
    let b2 = b.view().into_dimensionality::<Ix2>().map_err(|_| err())?;
    if a2.ncols() != b2.nrows() {
        return Err(err());
    }
    Ok(a2.dot(&b2).into_dyn())
}

fn op_sum_axes(op: &'static str, x: &ArrayD<f32>, axes: &[usize]) -> Result<ArrayD<f32>> {
    let mut out = x.clone();
    for &axis in axes {
        if axis >= out.ndim() {
            return Err(RuntimeError::shape(op, format!("axis {axis} of {:?}", x.shape())));
        }
        out = out.sum_axis(Axis(axis)).insert_axis(Axis(axis));
    }
    Ok(out)
}

/// Number of elements folded into one output by a mean over `axes`.
fn reduced_count(shape: &[usize], axes: Option<&[usize]>) -> usize {
    match axes {
        None => shape.iter().product::<usize>(),
        Some(axes) => axes.iter().map(|&a| shape[a]).product::<usize>(),
    }
    .max(1)
}

fn reshape(op: &'static str, x: &ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    ArrayD::from_shape_vec(IxDyn(shape), x.iter().copied().collect())
        .map_err(|e| RuntimeError::shape(op, format!("{:?} -> {:?}: {e}", x.shape(), shape)))
}

fn broadcast(op: &'static str, source: &ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    source
        .broadcast(shape)
        .map(|view| view.to_owned())
        .ok_or_else(|| RuntimeError::shape(op, format!("{:?} -> {:?}", source.shape(), shape)))
}

/// Sums `source` down to `target_shape`, undoing a numpy broadcast.
fn op_reduce_sum_to(source: &ArrayD<f32>, target_shape: &[usize]) -> Result<ArrayD<f32>> {
    let mut out = source.clone();
    while out.ndim() > target_shape.len() {
        out = out.sum_axis(Axis(0));
    }
    for (axis, &dim) in target_shape.iter().enumerate() {
        if dim == 1 && out.shape()[axis] != 1 {
            out = out.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    if out.shape() != target_shape {
        return Err(RuntimeError::shape(
            "ReduceSumTo",
            format!("{:?} -> {:?}", source.shape(), target_shape),
        ));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Spatial operations (NCHW)
// ---------------------------------------------------------------------------

fn as4<'a>(op: &'static str, x: &'a ArrayD<f32>) -> Result<ArrayView4<'a, f32>> {
    x.view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| RuntimeError::shape(op, format!("expected 4-d tensor, got {:?}", x.shape())))
}

fn to_matrix<S, D>(x: &ArrayBase<S, D>, rows: usize, cols: usize) -> Result<Array2<f32>>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    Array2::from_shape_vec((rows, cols), x.iter().copied().collect())
        .map_err(|e| RuntimeError::shape("to_matrix", e.to_string()))
}

/// Unfolds one `(C, H, W)` sample into a `(C*kh*kw, oh*ow)` patch matrix.
fn im2col(
    x: ArrayView3<f32>,
    (kh, kw): (usize, usize),
    stride: usize,
    padding: usize,
    (oh, ow): (usize, usize),
) -> Array2<f32> {
    let (c, h, w) = x.dim();
    let mut cols = Array2::zeros((c * kh * kw, oh * ow));
    for ci in 0..c {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = (ci * kh + ki) * kw + kj;
                for oi in 0..oh {
                    let ii = (oi * stride + ki) as isize - padding as isize;
                    if ii < 0 || ii >= h as isize {
                        continue;
                    }
                    for oj in 0..ow {
                        let jj = (oj * stride + kj) as isize - padding as isize;
                        if jj < 0 || jj >= w as isize {
                            continue;
                        }
                        cols[[row, oi * ow + oj]] = x[[ci, ii as usize, jj as usize]];
                    }
                }
            }
        }
    }
    cols
}

/// Adjoint of [`im2col`]: scatters patch gradients back into `(C, H, W)`.
fn col2im(
    cols: &Array2<f32>,
    mut out: ArrayViewMut3<f32>,
    (kh, kw): (usize, usize),
    stride: usize,
    padding: usize,
    (oh, ow): (usize, usize),
) {
    let (c, h, w) = out.dim();
    for ci in 0..c {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = (ci * kh + ki) * kw + kj;
                for oi in 0..oh {
                    let ii = (oi * stride + ki) as isize - padding as isize;
                    if ii < 0 || ii >= h as isize {
                        continue;
                    }
                    for oj in 0..ow {
                        let jj = (oj * stride + kj) as isize - padding as isize;
                        if jj < 0 || jj >= w as isize {
                            continue;
                        }
                        out[[ci, ii as usize, jj as usize]] += cols[[row, oi * ow + oj]];
                    }
                }
            }
        }
    }
}

fn op_conv2d(x: &ArrayD<f32>, w: &ArrayD<f32>, stride: usize, padding: usize) -> Result<ArrayD<f32>> {
    let x4 = as4("Conv2d", x)?;
    let w4 = as4("Conv2d", w)?;
    let (n, c, h, wd) = x4.dim();
    let (o, wc, kh, kw) = w4.dim();
    let err = || RuntimeError::shape("Conv2d", format!("{:?} * {:?}", x.shape(), w.shape()));
    if c != wc {
        return Err(err());
    }
    let oh = conv_output_len(h, kh, stride, padding).ok_or_else(err)?;
    let ow = conv_output_len(wd, kw, stride, padding).ok_or_else(err)?;

    let wmat = to_matrix(&w4, o, c * kh * kw)?;
    let mut out = Array4::<f32>::zeros((n, o, oh, ow));
    for i in 0..n {
        let cols = im2col(x4.index_axis(Axis(0), i), (kh, kw), stride, padding, (oh, ow));
        let y = wmat
            .dot(&cols)
            .into_shape((o, oh, ow))
            .map_err(|e| RuntimeError::shape("Conv2d", e.to_string()))?;
        out.index_axis_mut(Axis(0), i).assign(&y);
    }
    Ok(out.into_dyn())
}

fn op_conv2d_grad_input(
    g: &ArrayD<f32>,
    w: &ArrayD<f32>,
    input_shape: &[usize],
    stride: usize,
    padding: usize,
) -> Result<ArrayD<f32>> {
    let g4 = as4("Conv2dGradInput", g)?;
    let w4 = as4("Conv2dGradInput", w)?;
    let (n, o, oh, ow) = g4.dim();
    let (wo, c, kh, kw) = w4.dim();
    if input_shape.len() != 4 || wo != o || input_shape[0] != n || input_shape[1] != c {
        return Err(RuntimeError::shape(
            "Conv2dGradInput",
            format!("grad {:?}, weight {:?}, input {:?}", g.shape(), w.shape(), input_shape),
        ));
    }

    let wmat_t = to_matrix(&w4, o, c * kh * kw)?.reversed_axes();
    let mut out = Array4::<f32>::zeros((n, c, input_shape[2], input_shape[3]));
    for i in 0..n {
        let gmat = to_matrix(&g4.index_axis(Axis(0), i), o, oh * ow)?;
        let dcols = wmat_t.dot(&gmat);
        col2im(&dcols, out.index_axis_mut(Axis(0), i), (kh, kw), stride, padding, (oh, ow));
    }
    Ok(out.into_dyn())
}

fn op_conv2d_grad_weight(
    x: &ArrayD<f32>,
    g: &ArrayD<f32>,
    weight_shape: &[usize],
    stride: usize,
    padding: usize,
) -> Result<ArrayD<f32>> {
    let x4 = as4("Conv2dGradWeight", x)?;
    let g4 = as4("Conv2dGradWeight", g)?;
    let (n, c, _, _) = x4.dim();
    let (gn, o, oh, ow) = g4.dim();
    if weight_shape.len() != 4 || gn != n || weight_shape[0] != o || weight_shape[1] != c {
        return Err(RuntimeError::shape(
            "Conv2dGradWeight",
            format!("input {:?}, grad {:?}, weight {:?}", x.shape(), g.shape(), weight_shape),
        ));
    }
    let (kh, kw) = (weight_shape[2], weight_shape[3]);

    let mut acc = Array2::<f32>::zeros((o, c * kh * kw));
    for i in 0..n {
        let cols = im2col(x4.index_axis(Axis(0), i), (kh, kw), stride, padding, (oh, ow));
        let gmat = to_matrix(&g4.index_axis(Axis(0), i), o, oh * ow)?;
        acc += &gmat.dot(&cols.t());
    }
    reshape("Conv2dGradWeight", &acc.into_dyn(), weight_shape)
}

fn strided(start: usize, step: usize) -> Slice {
    Slice::new(start as isize, None, step as isize)
}

fn op_upsample2d(x: &ArrayD<f32>, factor: usize, mode: UpsampleMode) -> Result<ArrayD<f32>> {
    let x4 = as4("Upsample2d", x)?;
    let (n, c, h, w) = x4.dim();
    let mut out = Array4::<f32>::zeros((n, c, h * factor, w * factor));
    let offsets: Vec<(usize, usize)> = match mode {
        UpsampleMode::Nearest => (0..factor)
            .flat_map(|di| (0..factor).map(move |dj| (di, dj)))
            .collect(),
        UpsampleMode::ZeroInsert => vec![(0, 0)],
    };
    for (di, dj) in offsets {
        let mut rows = out.slice_axis_mut(Axis(2), strided(di, factor));
        let mut block = rows.slice_axis_mut(Axis(3), strided(dj, factor));
        block.assign(&x4);
    }
    Ok(out.into_dyn())
}

fn op_upsample2d_grad(g: &ArrayD<f32>, factor: usize, mode: UpsampleMode) -> Result<ArrayD<f32>> {
    let g4 = as4("Upsample2dGrad", g)?;
    let (n, c, h, w) = g4.dim();
    if h % factor != 0 || w % factor != 0 {
        return Err(RuntimeError::shape("Upsample2dGrad", format!("{:?} / {factor}", g.shape())));
    }
    let mut out = Array4::<f32>::zeros((n, c, h / factor, w / factor));
    let offsets: Vec<(usize, usize)> = match mode {
        UpsampleMode::Nearest => (0..factor)
            .flat_map(|di| (0..factor).map(move |dj| (di, dj)))
            .collect(),
        UpsampleMode::ZeroInsert => vec![(0, 0)],
    };
    for (di, dj) in offsets {
        let block = g4
            .slice_axis(Axis(2), strided(di, factor))
            .slice_axis(Axis(3), strided(dj, factor))
            .to_owned();
        out += &block;
    }
    Ok(out.into_dyn())
}

fn op_avg_pool2d(x: &ArrayD<f32>, size: usize) -> Result<ArrayD<f32>> {
    let x4 = as4("AvgPool2d", x)?;
    let (n, c, h, w) = x4.dim();
    if size == 0 || h < size || w < size {
        return Err(RuntimeError::shape("AvgPool2d", format!("{:?} / {size}", x.shape())));
    }
    let (oh, ow) = (h / size, w / size);
    let mut out = Array4::<f32>::zeros((n, c, oh, ow));
    for di in 0..size {
        for dj in 0..size {
            let block = x4
                .slice_axis(Axis(2), Slice::new(di as isize, Some((oh * size) as isize), size as isize))
                .slice_axis(Axis(3), Slice::new(dj as isize, Some((ow * size) as isize), size as isize))
                .to_owned();
            out += &block;
        }
    }
    Ok((out / (size * size) as f32).into_dyn())
}

fn op_avg_pool2d_grad(g: &ArrayD<f32>, input_shape: &[usize], size: usize) -> Result<ArrayD<f32>> {
    let g4 = as4("AvgPool2dGrad", g)?;
    let (n, c, oh, ow) = g4.dim();
    if input_shape.len() != 4 || input_shape[0] != n || input_shape[1] != c {
        return Err(RuntimeError::shape(
            "AvgPool2dGrad",
            format!("grad {:?}, input {:?}", g.shape(), input_shape),
        ));
    }
    let share = g4.mapv(|e| e / (size * size) as f32);
    let mut out = Array4::<f32>::zeros((n, c, input_shape[2], input_shape[3]));
    for di in 0..size {
        for dj in 0..size {
            let mut rows = out.slice_axis_mut(
                Axis(2),
                Slice::new(di as isize, Some((oh * size) as isize), size as isize),
            );
            let mut block = rows.slice_axis_mut(
                Axis(3),
                Slice::new(dj as isize, Some((ow * size) as isize), size as isize),
            );
            block.assign(&share);
        }
    }
    Ok(out.into_dyn())
}
