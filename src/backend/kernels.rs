//! Reference ndarray kernels for every [`Op`].
//!
//! Both the eager backend and the graph interpreter evaluate through [`eval`], which is what
//! makes a replayed graph bit-identical to the eager forward pass.

use ndarray::{concatenate, Array2, Array3, ArrayD, ArrayView, ArrayView1, Axis, Ix1, Ix2, Ix3, Ix4, Ix5, IxDyn, Slice, Zip};

use super::{BinaryOp, Op, ReduceKind, UnaryOp};
use crate::error::Error;
use crate::graph::infer;
use crate::tensor::{TensorMeta, Value};

pub fn eval(op: &Op, inputs: &[&Value]) -> Result<Vec<Value>, Error> {
    let metas: Vec<TensorMeta> = inputs.iter().map(|v| v.meta()).collect();
    let refs: Vec<&TensorMeta> = metas.iter().collect();
    let out = infer(op, &refs)?;
    let shape = &out[0].shape;

    let value = match op {
        Op::Binary(kind) => binary(*kind, inputs[0], inputs[1], shape)?,
        Op::Unary(kind) => Value::F32(unary(*kind, inputs[0].as_f32()?)),
        Op::ClampMin(min) => {
            let min = *min;
            Value::F32(inputs[0].as_f32()?.mapv(|x| x.max(min)))
        }
        Op::MatMul => Value::F32(matmul(inputs[0].as_f32()?, inputs[1].as_f32()?, shape)?),
        Op::Softmax { axis } => Value::F32(softmax(inputs[0].as_f32()?, *axis)),
        Op::LayerNorm { eps } => Value::F32(layer_norm(
            inputs[0].as_f32()?,
            inputs[1].as_f32()?,
            inputs[2].as_f32()?,
            *eps,
        )?),
        Op::Reshape { shape } => match inputs[0] {
            Value::F32(a) => Value::F32(reshape(a, shape)?),
            Value::I32(a) => Value::I32(reshape(a, shape)?),
            Value::Bool(a) => Value::Bool(reshape(a, shape)?),
        },
        Op::Permute { axes } => match inputs[0] {
            Value::F32(a) => Value::F32(permute(a, axes)),
            Value::I32(a) => Value::I32(permute(a, axes)),
            Value::Bool(a) => Value::Bool(permute(a, axes)),
        },
        Op::Concat { axis } => concat(inputs, *axis)?,
        Op::Slice { axis, start, end } => {
            let slice = Slice::from(*start..*end);
            match inputs[0] {
                Value::F32(a) => Value::F32(a.slice_axis(Axis(*axis), slice).to_owned()),
                Value::I32(a) => Value::I32(a.slice_axis(Axis(*axis), slice).to_owned()),
                Value::Bool(a) => Value::Bool(a.slice_axis(Axis(*axis), slice).to_owned()),
            }
        }
        Op::Reduce { kind, axis } => {
            let a = inputs[0].as_f32()?;
            match kind {
                ReduceKind::Sum => Value::F32(a.sum_axis(Axis(*axis))),
                ReduceKind::Max => {
                    Value::F32(a.fold_axis(Axis(*axis), f32::NEG_INFINITY, |m, &x| m.max(x)))
                }
            }
        }
        Op::TopK { k } => {
            let (values, indices) = top_k(inputs[0].as_f32()?, *k, shape)?;
            return Ok(vec![Value::F32(values), Value::I32(indices)]);
        }
        Op::Gather => {
            let indices = inputs[1].as_i32()?;
            match inputs[0] {
                Value::F32(a) => Value::F32(gather(a, indices, shape)?),
                Value::I32(a) => Value::I32(gather(a, indices, shape)?),
                Value::Bool(a) => Value::Bool(gather(a, indices, shape)?),
            }
        }
        Op::Select => {
            let mask = inputs[0].as_bool()?;
            match (inputs[1], inputs[2]) {
                (Value::F32(a), Value::F32(b)) => Value::F32(select(mask, a, b, shape)?),
                (Value::I32(a), Value::I32(b)) => Value::I32(select(mask, a, b, shape)?),
                (Value::Bool(a), Value::Bool(b)) => Value::Bool(select(mask, a, b, shape)?),
                _ => unreachable!("dtypes checked by infer"),
            }
        }
        Op::DeformableAggregation => Value::F32(deformable_aggregation(
            inputs[0].as_f32()?,
            inputs[1].as_i32()?,
            inputs[2].as_i32()?,
            inputs[3].as_f32()?,
            inputs[4].as_f32()?,
        )?),
    };

    Ok(vec![value])
}

fn broadcast_view<'a, T>(
    op: &'static str,
    a: &'a ArrayD<T>,
    shape: &[usize],
) -> Result<ArrayView<'a, T, IxDyn>, Error> {
    a.broadcast(IxDyn(shape))
        .ok_or_else(|| Error::shape(op, format!("cannot broadcast {:?} to {:?}", a.shape(), shape)))
}

fn zip_broadcast<A, B, C>(
    op: &'static str,
    a: &ArrayD<A>,
    b: &ArrayD<B>,
    shape: &[usize],
    f: impl Fn(&A, &B) -> C,
) -> Result<ArrayD<C>, Error> {
    let av = broadcast_view(op, a, shape)?;
    let bv = broadcast_view(op, b, shape)?;
    Ok(Zip::from(&av).and(&bv).map_collect(|x, y| f(x, y)))
}

fn binary(kind: BinaryOp, a: &Value, b: &Value, shape: &[usize]) -> Result<Value, Error> {
    let name = Op::Binary(kind).name();
    match (a, b) {
        (Value::F32(a), Value::F32(b)) => {
            let f: fn(&f32, &f32) -> f32 = match kind {
                BinaryOp::Add => |x: &f32, y: &f32| x + y,
                BinaryOp::Sub => |x: &f32, y: &f32| x - y,
                BinaryOp::Mul => |x: &f32, y: &f32| x * y,
                BinaryOp::Div => |x: &f32, y: &f32| x / y,
                BinaryOp::Max => |x: &f32, y: &f32| x.max(*y),
            };
            Ok(Value::F32(zip_broadcast(name, a, b, shape, f)?))
        }
        (Value::I32(a), Value::I32(b)) => {
            let f: fn(&i32, &i32) -> i32 = match kind {
                BinaryOp::Add => |x: &i32, y: &i32| x.wrapping_add(*y),
                BinaryOp::Sub => |x: &i32, y: &i32| x.wrapping_sub(*y),
                BinaryOp::Mul => |x: &i32, y: &i32| x.wrapping_mul(*y),
                BinaryOp::Div => |x: &i32, y: &i32| x.checked_div(*y).unwrap_or(0),
                BinaryOp::Max => |x: &i32, y: &i32| *x.max(y),
            };
            Ok(Value::I32(zip_broadcast(name, a, b, shape, f)?))
        }
        _ => Err(Error::DType {
            op: name,
            expected: a.dtype(),
            found: b.dtype(),
        }),
    }
}

fn unary(kind: UnaryOp, a: &ArrayD<f32>) -> ArrayD<f32> {
    match kind {
        UnaryOp::Relu => a.mapv(|x| x.max(0.0)),
        UnaryOp::Sigmoid => a.mapv(sigmoid),
        UnaryOp::Exp => a.mapv(f32::exp),
        UnaryOp::Neg => a.mapv(|x| -x),
    }
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn batched(
    a: &ArrayD<f32>,
    batch: &[usize],
    rows: usize,
    cols: usize,
) -> Result<Array3<f32>, Error> {
    let mut shape = batch.to_vec();
    shape.extend([rows, cols]);
    let view = broadcast_view("matmul", a, &shape)?;
    let count = batch.iter().product::<usize>();
    Array3::from_shape_vec((count, rows, cols), view.iter().cloned().collect())
        .map_err(|e| Error::shape("matmul", e.to_string()))
}

fn matmul(a: &ArrayD<f32>, b: &ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>, Error> {
    let rank = shape.len();
    let (m, n) = (shape[rank - 2], shape[rank - 1]);
    let k = a.shape()[a.ndim() - 1];
    let batch = &shape[..rank - 2];
    let count = batch.iter().product::<usize>();

    // shared right operand: one (count * m, k) x (k, n) product
    if b.shape()[..b.ndim() - 2].iter().product::<usize>() == 1 {
        let lhs = Array2::from_shape_vec((count * m, k), a.iter().cloned().collect())
            .map_err(|e| Error::shape("matmul", e.to_string()))?;
        let rhs = Array2::from_shape_vec((k, n), b.iter().cloned().collect())
            .map_err(|e| Error::shape("matmul", e.to_string()))?;
        return reshape(&lhs.dot(&rhs).into_dyn(), shape);
    }

    let lhs = batched(a, batch, m, k)?;
    let rhs = batched(b, batch, k, n)?;
    let mut out = Array3::<f32>::zeros((lhs.len_of(Axis(0)), m, n));

    for (i, mut slot) in out.outer_iter_mut().enumerate() {
        slot.assign(&lhs.index_axis(Axis(0), i).dot(&rhs.index_axis(Axis(0), i)));
    }

    reshape(&out.into_dyn(), shape)
}

fn softmax(a: &ArrayD<f32>, axis: usize) -> ArrayD<f32> {
    let mut out = a.clone();
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        lane.mapv_inplace(|x| (x - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|x| x / sum);
    }
    out
}

fn layer_norm(
    a: &ArrayD<f32>,
    gamma: &ArrayD<f32>,
    beta: &ArrayD<f32>,
    eps: f32,
) -> Result<ArrayD<f32>, Error> {
    let gamma = as_vector(gamma)?;
    let beta = as_vector(beta)?;

    let mut out = a.clone();
    let last = Axis(a.ndim() - 1);
    for mut lane in out.lanes_mut(last) {
        let n = lane.len() as f32;
        let mean = lane.sum() / n;
        let var = lane.fold(0.0, |acc, &x| acc + (x - mean) * (x - mean)) / n;
        let inv_std = 1.0 / (var + eps).sqrt();
        Zip::from(&mut lane)
            .and(&gamma)
            .and(&beta)
            .for_each(|x, &g, &b| *x = (*x - mean) * inv_std * g + b);
    }
    Ok(out)
}

fn as_vector(t: &ArrayD<f32>) -> Result<ArrayView1<'_, f32>, Error> {
    t.view()
        .into_dimensionality::<Ix1>()
        .map_err(|e| Error::shape("layer_norm", e.to_string()))
}

fn reshape<T: Clone>(a: &ArrayD<T>, shape: &[usize]) -> Result<ArrayD<T>, Error> {
    ArrayD::from_shape_vec(IxDyn(shape), a.iter().cloned().collect())
        .map_err(|e| Error::shape("reshape", e.to_string()))
}

fn permute<T: Clone>(a: &ArrayD<T>, axes: &[usize]) -> ArrayD<T> {
    a.view()
        .permuted_axes(IxDyn(axes))
        .as_standard_layout()
        .into_owned()
}

fn concat_typed<T: Clone>(parts: &[&ArrayD<T>], axis: usize) -> Result<ArrayD<T>, Error> {
    let views: Vec<_> = parts.iter().map(|a| a.view()).collect();
    concatenate(Axis(axis), &views).map_err(|e| Error::shape("concat", e.to_string()))
}

fn concat(inputs: &[&Value], axis: usize) -> Result<Value, Error> {
    match inputs[0] {
        Value::F32(_) => {
            let parts = inputs.iter().map(|v| v.as_f32()).collect::<Result<Vec<_>, _>>()?;
            Ok(Value::F32(concat_typed(&parts, axis)?))
        }
        Value::I32(_) => {
            let parts = inputs.iter().map(|v| v.as_i32()).collect::<Result<Vec<_>, _>>()?;
            Ok(Value::I32(concat_typed(&parts, axis)?))
        }
        Value::Bool(_) => {
            let parts = inputs.iter().map(|v| v.as_bool()).collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Bool(concat_typed(&parts, axis)?))
        }
    }
}

/// Descending selection along the last axis. Sorting is stable, so ties keep the lower index.
fn top_k(
    a: &ArrayD<f32>,
    k: usize,
    shape: &[usize],
) -> Result<(ArrayD<f32>, ArrayD<i32>), Error> {
    let n = a.shape().last().copied().unwrap_or(0);
    let mut values = Vec::with_capacity(shape.iter().product());
    let mut indices = Vec::with_capacity(values.capacity());

    if n > 0 && k > 0 {
        let data: Vec<f32> = a.iter().cloned().collect();
        let mut order: Vec<usize> = Vec::with_capacity(n);

        for row in data.chunks(n) {
            order.clear();
            order.extend(0..n);
            order.sort_by(|&i, &j| row[j].total_cmp(&row[i]));

            for &i in &order[..k] {
                values.push(row[i]);
                indices.push(i as i32);
            }
        }
    }

    let values = ArrayD::from_shape_vec(IxDyn(shape), values)
        .map_err(|e| Error::shape("top_k", e.to_string()))?;
    let indices = ArrayD::from_shape_vec(IxDyn(shape), indices)
        .map_err(|e| Error::shape("top_k", e.to_string()))?;

    Ok((values, indices))
}

fn gather<T: Clone + Default>(
    data: &ArrayD<T>,
    indices: &ArrayD<i32>,
    shape: &[usize],
) -> Result<ArrayD<T>, Error> {
    let indices = indices
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::shape("gather", e.to_string()))?;
    let len = data.shape()[1];
    let mut out = ArrayD::<T>::default(IxDyn(shape));

    for ((b, j), &index) in indices.indexed_iter() {
        if index < 0 || index as usize >= len {
            return Err(Error::Index {
                op: "gather",
                index: index as i64,
                len,
            });
        }

        let src = data.index_axis(Axis(0), b);
        let mut dst = out.index_axis_mut(Axis(0), b);
        dst.index_axis_mut(Axis(0), j)
            .assign(&src.index_axis(Axis(0), index as usize));
    }

    Ok(out)
}

fn select<T: Clone>(
    mask: &ArrayD<bool>,
    a: &ArrayD<T>,
    b: &ArrayD<T>,
    shape: &[usize],
) -> Result<ArrayD<T>, Error> {
    let mask = broadcast_view("select", mask, shape)?;
    let av = broadcast_view("select", a, shape)?;
    let bv = broadcast_view("select", b, shape)?;

    Ok(Zip::from(&mask)
        .and(&av)
        .and(&bv)
        .map_collect(|&m, x, y| if m { x.clone() } else { y.clone() }))
}

/// Multi-camera, multi-level bilinear sampling accumulated per weight group.
///
/// `feature` is `(bs, num_feat, C)` with every `(camera, level)` map flattened row-major
/// starting at `level_start_index[cam, level]`. Locations are normalized `(x, y)` per camera;
/// points outside the open unit square contribute nothing.
fn deformable_aggregation(
    feature: &ArrayD<f32>,
    spatial_shapes: &ArrayD<i32>,
    level_start_index: &ArrayD<i32>,
    sampling_location: &ArrayD<f32>,
    weights: &ArrayD<f32>,
) -> Result<ArrayD<f32>, Error> {
    const OP: &str = "deformable_aggregation";
    let dims = |e: ndarray::ShapeError| Error::shape(OP, e.to_string());

    let feature = feature.view().into_dimensionality::<Ix3>().map_err(dims)?;
    let spatial_shapes = spatial_shapes.view().into_dimensionality::<Ix3>().map_err(dims)?;
    let level_start_index = level_start_index.view().into_dimensionality::<Ix2>().map_err(dims)?;
    let location = sampling_location.view().into_dimensionality::<Ix4>().map_err(dims)?;
    let weights = weights.view().into_dimensionality::<Ix5>().map_err(dims)?;

    let (bs, num_feat, channels) = feature.dim();
    let (_, queries, cams, levels, groups) = weights.dim();
    let per_group = channels / groups;

    let mut levels_meta = Vec::with_capacity(cams * levels);
    for cam in 0..cams {
        for level in 0..levels {
            let h = spatial_shapes[[cam, level, 0]];
            let w = spatial_shapes[[cam, level, 1]];
            let start = level_start_index[[cam, level]];
            if h < 0 || w < 0 || start < 0 || start as usize + (h * w) as usize > num_feat {
                return Err(Error::Index {
                    op: OP,
                    index: start as i64 + (h as i64) * (w as i64),
                    len: num_feat,
                });
            }
            levels_meta.push((h as usize, w as usize, start as usize));
        }
    }

    let mut out = Array3::<f32>::zeros((bs, queries, channels));

    for b in 0..bs {
        let feat = feature.index_axis(Axis(0), b);
        for q in 0..queries {
            for cam in 0..cams {
                let x = location[[b, q, cam, 0]];
                let y = location[[b, q, cam, 1]];
                if !(x > 0.0 && x < 1.0 && y > 0.0 && y < 1.0) {
                    continue;
                }

                for level in 0..levels {
                    let (h, w, start) = levels_meta[cam * levels + level];
                    let h_im = y * h as f32 - 0.5;
                    let w_im = x * w as f32 - 0.5;
                    let corners = bilinear_corners(h_im, w_im, h, w);

                    for group in 0..groups {
                        let weight = weights[[b, q, cam, level, group]];
                        for ch in group * per_group..(group + 1) * per_group {
                            let mut sampled = 0.0;
                            for &(pos, coef) in corners.iter().flatten() {
                                sampled += coef * feat[[start + pos, ch]];
                            }
                            out[[b, q, ch]] += weight * sampled;
                        }
                    }
                }
            }
        }
    }

    Ok(out.into_dyn())
}

/// Flattened positions and weights of the four bilinear neighbours; out-of-map corners are `None`.
fn bilinear_corners(h_im: f32, w_im: f32, h: usize, w: usize) -> [Option<(usize, f32)>; 4] {
    let h_low = h_im.floor();
    let w_low = w_im.floor();
    let lh = h_im - h_low;
    let lw = w_im - w_low;
    let (hh, hw) = (1.0 - lh, 1.0 - lw);

    let (h_low, w_low) = (h_low as isize, w_low as isize);
    let (h_high, w_high) = (h_low + 1, w_low + 1);
    let (h, w) = (h as isize, w as isize);

    let corner = |r: isize, c: isize, coef: f32| {
        if r >= 0 && c >= 0 && r < h && c < w {
            Some(((r * w + c) as usize, coef))
        } else {
            None
        }
    };

    [
        corner(h_low, w_low, hh * hw),
        corner(h_low, w_high, hh * lw),
        corner(h_high, w_low, lh * hw),
        corner(h_high, w_high, lh * lw),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32s(shape: &[usize], data: &[f32]) -> Value {
        Value::from_f32(shape, data.to_vec()).unwrap()
    }

    #[test]
    fn top_k_orders_descending_and_keeps_first_tie() {
        let x = f32s(&[1, 5], &[0.5, 2.0, 0.5, -1.0, 2.0]);
        let out = eval(&Op::TopK { k: 3 }, &[&x]).unwrap();
        assert_eq!(out[0].as_f32().unwrap().iter().cloned().collect::<Vec<_>>(), vec![2.0, 2.0, 0.5]);
        assert_eq!(out[1].as_i32().unwrap().iter().cloned().collect::<Vec<_>>(), vec![1, 4, 0]);
    }

    #[test]
    fn top_k_of_zero_is_empty() {
        let x = f32s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = eval(&Op::TopK { k: 0 }, &[&x]).unwrap();
        assert_eq!(out[0].shape(), &[2, 0]);
        assert_eq!(out[1].shape(), &[2, 0]);
    }

    #[test]
    fn gather_rejects_out_of_range_index() {
        let data = f32s(&[1, 2, 1], &[1.0, 2.0]);
        let idx = Value::from_i32(&[1, 1], vec![2]).unwrap();
        assert!(matches!(eval(&Op::Gather, &[&data, &idx]), Err(Error::Index { .. })));
    }

    #[test]
    fn matmul_matches_manual_product() {
        let a = f32s(&[1, 2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = f32s(&[2, 1], &[1.0, -1.0]);
        let out = eval(&Op::MatMul, &[&a, &b]).unwrap();
        assert_eq!(out[0].shape(), &[1, 2, 1]);
        assert_eq!(out[0].as_f32().unwrap().iter().cloned().collect::<Vec<_>>(), vec![-1.0, -1.0]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = f32s(&[2, 3], &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        let out = eval(&Op::Softmax { axis: 1 }, &[&x]).unwrap();
        for row in out[0].as_f32().unwrap().outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn deformable_aggregation_samples_pixel_centres() {
        // one camera, one 2x2 level, two channels in one group
        let feature = f32s(&[1, 4, 2], &[1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0]);
        let shapes = Value::from_i32(&[1, 1, 2], vec![2, 2]).unwrap();
        let starts = Value::from_i32(&[1, 1], vec![0]).unwrap();
        let location = f32s(&[1, 2, 1, 2], &[0.75, 0.25, 1.5, 0.5]);
        let weights = f32s(&[1, 2, 1, 1, 1], &[0.5, 1.0]);

        let out = eval(
            &Op::DeformableAggregation,
            &[&feature, &shapes, &starts, &location, &weights],
        )
        .unwrap();
        let out = out[0].as_f32().unwrap();

        // (x=0.75, y=0.25) is the centre of pixel (row 0, col 1)
        assert_eq!(out[[0, 0, 0]], 1.0);
        assert_eq!(out[[0, 0, 1]], 10.0);
        // out-of-image locations are skipped
        assert_eq!(out[[0, 1, 0]], 0.0);
    }
}
