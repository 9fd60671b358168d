//! Static shape propagation.
//!
//! Given concrete shapes for the graph inputs (the batch size included),
//! walks the ancestors of the requested nodes in topological order and
//! computes each node's output shape. Network assembly uses it to reject
//! incompatible module chains before anything is evaluated.

use crate::asg::{Asg, AsgError, NodeId, NodeType, Shape};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': {shape1:?} and {shape2:?}")]
    IncompatibleShapes {
        op: String,
        shape1: Shape,
        shape2: Shape,
    },

    #[error("Shape information missing for node {0}")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected {expected}D, got {actual}D")]
    InvalidRank {
        node_id: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("Cannot broadcast shapes {0:?} and {1:?} to a common shape")]
    BroadcastError(Shape, Shape),

    #[error("Matrix multiplication error: incompatible inner dimensions {0} and {1}")]
    MatmulDimensionError(usize, usize),

    #[error("Cannot reshape {from:?} into {to:?}")]
    InvalidReshape { from: Shape, to: Vec<isize> },

    #[error("Axis {axis} out of range for shape {shape:?}")]
    AxisOutOfRange { axis: usize, shape: Shape },
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Numpy broadcasting of two shapes, `None` when incompatible.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Shape> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

/// Resolves a reshape spec against the input shape `from`.
///
/// `0` copies the input dimension at the same position and at most one `-1`
/// is inferred from the remaining element count.
pub fn resolve_reshape(from: &[usize], spec: &[isize]) -> Option<Shape> {
    let numel: usize = from.iter().product();
    let mut inferred = None;
    let mut known = 1usize;
    let mut shape = Vec::with_capacity(spec.len());
    for (i, &d) in spec.iter().enumerate() {
        match d {
            -1 if inferred.is_none() => {
                inferred = Some(i);
                shape.push(0);
            }
            0 => {
                let copied = *from.get(i)?;
                known *= copied;
                shape.push(copied);
            }
            d if d > 0 => {
                known *= d as usize;
                shape.push(d as usize);
            }
            _ => return None,
        }
    }
    match inferred {
        Some(i) => {
            if known == 0 || numel % known != 0 {
                return None;
            }
            shape[i] = numel / known;
        }
        None if known != numel => return None,
        None => {}
    }
    Some(shape)
}

/// Output extent of a strided, padded convolution along one axis.
pub fn conv_output_len(len: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = len + 2 * padding;
    if stride == 0 || padded < kernel {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

pub struct ShapeInference;

impl ShapeInference {
    /// Infers the shapes of `roots` and all their ancestors.
    ///
    /// `initial_shapes` maps input names to concrete shapes. Parameters and
    /// literals carry their own static shapes.
    pub fn infer(
        asg: &Asg,
        roots: &[NodeId],
        initial_shapes: &HashMap<String, Shape>,
    ) -> Result<HashMap<NodeId, Shape>> {
        let mut shapes: HashMap<NodeId, Shape> = HashMap::new();
        for id in asg.ancestors(roots)? {
            let shape = Self::infer_node_shape(asg, id, &shapes, initial_shapes)?;
            shapes.insert(id, shape);
        }
        Ok(shapes)
    }

    /// Shapes of `outputs`, in order.
    pub fn output_shapes(
        asg: &Asg,
        outputs: &[NodeId],
        initial_shapes: &HashMap<String, Shape>,
    ) -> Result<Vec<Shape>> {
        let shapes = Self::infer(asg, outputs, initial_shapes)?;
        outputs
            .iter()
            .map(|id| {
                shapes
                    .get(id)
                    .cloned()
                    .ok_or(ShapeInferenceError::MissingShapeInfo(*id))
            })
            .collect()
    }

    fn infer_node_shape(
        asg: &Asg,
        id: NodeId,
        shapes: &HashMap<NodeId, Shape>,
        initial_shapes: &HashMap<String, Shape>,
    ) -> Result<Shape> {
        let node = asg.get_node(id)?;
        let get = |n: NodeId| -> Result<Shape> {
            shapes
                .get(&n)
                .cloned()
                .ok_or(ShapeInferenceError::MissingShapeInfo(n))
        };
        let rank = |n: NodeId, expected: usize| -> Result<Shape> {
            let s = get(n)?;
            if s.len() != expected {
                return Err(ShapeInferenceError::InvalidRank {
                    node_id: n,
                    expected,
                    actual: s.len(),
                });
            }
            Ok(s)
        };

        use NodeType::*;
        let shape = match &node.node_type {
            Input { name } => initial_shapes
                .get(name)
                .cloned()
                .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone()))?,
            Parameter { name } => match &node.shape {
                Some(s) => s.clone(),
                None => initial_shapes
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone()))?,
            },
            Literal(arr) => arr.shape().to_vec(),
            Scalar(_) => vec![],
            RandomNormal { like, channels } => {
                let mut s = get(*like)?;
                if s.len() < 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: *like,
                        expected: 2,
                        actual: s.len(),
                    });
                }
                s[1] = *channels;
                s
            }

            Add(a, b) | Subtract(a, b) | Multiply(a, b) | Divide(a, b) | GreaterThan(a, b) => {
                let (sa, sb) = (get(*a)?, get(*b)?);
                broadcast_shapes(&sa, &sb)
                    .ok_or_else(|| ShapeInferenceError::BroadcastError(sa.clone(), sb.clone()))?
            }
            MatrixMultiply(a, b) => {
                let sa = rank(*a, 2)?;
                let sb = rank(*b, 2)?;
                if sa[1] != sb[0] {
                    return Err(ShapeInferenceError::MatmulDimensionError(sa[1], sb[0]));
                }
                vec![sa[0], sb[1]]
            }

            Negate(x) | Exp(x) | Log(x) | Sqrt(x) | ReLU(x) | LeakyReLU(x, _) | Sigmoid(x)
            | Tanh(x) | Softplus(x) => get(*x)?,

            Sum(_) | Mean(_) => vec![],
            SumAxes { input, axes } | MeanAxes { input, axes } => {
                let mut s = get(*input)?;
                for &axis in axes {
                    if axis >= s.len() {
                        return Err(ShapeInferenceError::AxisOutOfRange { axis, shape: s });
                    }
                    s[axis] = 1;
                }
                s
            }

            Reshape(x, spec) => {
                let from = get(*x)?;
                resolve_reshape(&from, spec).ok_or_else(|| ShapeInferenceError::InvalidReshape {
                    from: from.clone(),
                    to: spec.clone(),
                })?
            }
            ReshapeLike { input, like } => {
                let (from, to) = (get(*input)?, get(*like)?);
                if from.iter().product::<usize>() != to.iter().product::<usize>() {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "ReshapeLike".into(),
                        shape1: from.clone(),
                        shape2: to.clone(),
                    });
                }
                to.clone()
            }
            Transpose(x, a1, a2) => {
                let mut s = get(*x)?;
                for &axis in [a1, a2] {
                    if axis >= s.len() {
                        return Err(ShapeInferenceError::AxisOutOfRange { axis, shape: s });
                    }
                }
                s.swap(*a1, *a2);
                s
            }
            Concat { inputs, axis } => {
                let first = get(inputs[0])?;
                if *axis >= first.len() {
                    return Err(ShapeInferenceError::AxisOutOfRange { axis: *axis, shape: first });
                }
                let mut out = first.clone();
                for other in &inputs[1..] {
                    let s = get(*other)?;
                    let compatible = s.len() == first.len()
                        && s.iter().zip(&first).enumerate().all(|(i, (x, y))| i == *axis || x == y);
                    if !compatible {
                        return Err(ShapeInferenceError::IncompatibleShapes {
                            op: "Concat".into(),
                            shape1: first.clone(),
                            shape2: s.clone(),
                        });
                    }
                    out[*axis] += s[*axis];
                }
                out
            }

            Conv2d {
                input,
                weight,
                stride,
                padding,
            } => {
                let x = rank(*input, 4)?;
                let w = rank(*weight, 4)?;
                let incompatible = || ShapeInferenceError::IncompatibleShapes {
                    op: "Conv2d".into(),
                    shape1: x.clone(),
                    shape2: w.clone(),
                };
                if x[1] != w[1] {
                    return Err(incompatible());
                }
                let h = conv_output_len(x[2], w[2], *stride, *padding).ok_or_else(incompatible)?;
                let wd = conv_output_len(x[3], w[3], *stride, *padding).ok_or_else(incompatible)?;
                vec![x[0], w[0], h, wd]
            }
            Upsample2d { input, factor, .. } => {
                let x = rank(*input, 4)?;
                vec![x[0], x[1], x[2] * factor, x[3] * factor]
            }
            AvgPool2d { input, size } => {
                let x = rank(*input, 4)?;
                vec![x[0], x[1], x[2] / size, x[3] / size]
            }

            Broadcast { like, .. } | BroadcastMean { like, .. } | ReduceSumTo { like, .. } => {
                get(*like)?
            }
            Split {
                source,
                parts,
                index,
                axis,
            } => {
                let mut s = get(*source)?;
                s[*axis] = get(parts[*index])?[*axis];
                s
            }
            Conv2dGradInput { like, .. }
            | Conv2dGradWeight { like, .. }
            | AvgPool2dGrad { like, .. } => get(*like)?,
            Upsample2dGrad { grad, factor, .. } => {
                let g = rank(*grad, 4)?;
                vec![g[0], g[1], g[2] / factor, g[3] / factor]
            }
        };
        Ok(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{GraphContext, Tensor};
    use ndarray::ArrayD;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn broadcasting_rules() {
        assert_eq!(broadcast_shapes(&[4, 3, 8, 8], &[1, 3, 1, 1]), Some(vec![4, 3, 8, 8]));
        assert_eq!(broadcast_shapes(&[], &[2, 5]), Some(vec![2, 5]));
        assert_eq!(broadcast_shapes(&[2, 3], &[3, 2]), None);
    }

    #[test]
    fn reshape_resolves_one_wildcard() {
        assert_eq!(resolve_reshape(&[4, 8, 2, 2], &[-1, 32]), Some(vec![4, 32]));
        assert_eq!(resolve_reshape(&[4, 32], &[-1, 8, 2, 2]), Some(vec![4, 8, 2, 2]));
        assert_eq!(resolve_reshape(&[4, 30], &[-1, 8, 2, 2]), None);
        assert_eq!(resolve_reshape(&[4, 30], &[-1, -1]), None);
        assert_eq!(resolve_reshape(&[4, 1, 8, 8], &[0, -1]), Some(vec![4, 64]));
        assert_eq!(resolve_reshape(&[4], &[0, 0]), None);
    }

    #[test]
    fn conv_and_upsample_shapes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let (w, _) = Tensor::new_parameter(&ctx, "w", ArrayD::zeros(vec![8, 3, 5, 5])).unwrap();
        let y = x.conv2d(&w, 2, 2);
        let up = y.upsample2d(2, crate::asg::UpsampleMode::ZeroInsert);
        let flat = up.flatten();

        let shapes = HashMap::from([("x".to_string(), vec![4, 3, 32, 32])]);
        let graph = ctx.borrow().main_graph().clone();
        let out = ShapeInference::output_shapes(
            &graph,
            &[y.node_id, up.node_id, flat.node_id],
            &shapes,
        )
        .unwrap();
        assert_eq!(out, vec![vec![4, 8, 16, 16], vec![4, 8, 32, 32], vec![4, 8192]]);
    }

    #[test]
    fn channel_mismatch_is_reported() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let (w, _) = Tensor::new_parameter(&ctx, "w", ArrayD::zeros(vec![8, 4, 3, 3])).unwrap();
        let y = x.conv2d(&w, 1, 1);
        let shapes = HashMap::from([("x".to_string(), vec![2, 3, 8, 8])]);
        let graph = ctx.borrow().main_graph().clone();
        let err = ShapeInference::infer(&graph, &[y.node_id], &shapes).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::IncompatibleShapes { .. }));
    }

    #[test]
    fn missing_input_shape() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = x.relu();
        let graph = ctx.borrow().main_graph().clone();
        let err = ShapeInference::infer(&graph, &[y.node_id], &HashMap::new()).unwrap_err();
        assert_eq!(err, ShapeInferenceError::MissingInitialShape("x".into()));
    }
}
