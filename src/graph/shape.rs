use crate::backend::{Op, ReduceKind};
use crate::error::Error;
use crate::tensor::{broadcast_shapes, DType, TensorMeta};

fn arity(op: &Op, inputs: &[&TensorMeta], expected: usize) -> Result<(), Error> {
    if inputs.len() != expected {
        return Err(Error::shape(
            op.name(),
            format!("expected {} inputs, got {}", expected, inputs.len()),
        ));
    }
    Ok(())
}

fn expect_dtype(op: &Op, meta: &TensorMeta, dtype: DType) -> Result<(), Error> {
    if meta.dtype != dtype {
        return Err(Error::DType {
            op: op.name(),
            expected: dtype,
            found: meta.dtype,
        });
    }
    Ok(())
}

fn expect_rank(op: &Op, meta: &TensorMeta, rank: usize) -> Result<(), Error> {
    if meta.rank() != rank {
        return Err(Error::shape(
            op.name(),
            format!("expected rank {}, got {:?}", rank, meta.shape),
        ));
    }
    Ok(())
}

fn expect_axis(op: &Op, meta: &TensorMeta, axis: usize) -> Result<(), Error> {
    if axis >= meta.rank() {
        return Err(Error::shape(
            op.name(),
            format!("axis {} out of range for {:?}", axis, meta.shape),
        ));
    }
    Ok(())
}

fn broadcast(op: &Op, a: &[usize], b: &[usize]) -> Result<Vec<usize>, Error> {
    broadcast_shapes(a, b)
        .ok_or_else(|| Error::shape(op.name(), format!("cannot broadcast {:?} with {:?}", a, b)))
}

/// Static output metadata of `op` applied to `inputs`.
pub fn infer(op: &Op, inputs: &[&TensorMeta]) -> Result<Vec<TensorMeta>, Error> {
    let out = match op {
        Op::Binary(_) => {
            arity(op, inputs, 2)?;
            let (a, b) = (inputs[0], inputs[1]);
            if a.dtype == DType::Bool {
                return Err(Error::DType {
                    op: op.name(),
                    expected: DType::F32,
                    found: DType::Bool,
                });
            }
            expect_dtype(op, b, a.dtype)?;
            TensorMeta::new(broadcast(op, &a.shape, &b.shape)?, a.dtype)
        }

        Op::Unary(_) | Op::ClampMin(_) => {
            arity(op, inputs, 1)?;
            expect_dtype(op, inputs[0], DType::F32)?;
            inputs[0].clone()
        }

        Op::MatMul => {
            arity(op, inputs, 2)?;
            let (a, b) = (inputs[0], inputs[1]);
            expect_dtype(op, a, DType::F32)?;
            expect_dtype(op, b, DType::F32)?;
            if a.rank() < 2 || b.rank() < 2 {
                return Err(Error::shape(
                    op.name(),
                    format!("operands must be at least 2-d, got {:?} and {:?}", a.shape, b.shape),
                ));
            }
            let (ar, br) = (a.rank(), b.rank());
            let (m, k) = (a.shape[ar - 2], a.shape[ar - 1]);
            let (k2, n) = (b.shape[br - 2], b.shape[br - 1]);
            if k != k2 {
                return Err(Error::shape(
                    op.name(),
                    format!("contraction mismatch {:?} x {:?}", a.shape, b.shape),
                ));
            }
            let mut shape = broadcast(op, &a.shape[..ar - 2], &b.shape[..br - 2])?;
            shape.extend([m, n]);
            TensorMeta::f32(shape)
        }

        Op::Softmax { axis } => {
            arity(op, inputs, 1)?;
            expect_dtype(op, inputs[0], DType::F32)?;
            expect_axis(op, inputs[0], *axis)?;
            inputs[0].clone()
        }

        Op::LayerNorm { .. } => {
            arity(op, inputs, 3)?;
            let x = inputs[0];
            expect_dtype(op, x, DType::F32)?;
            let last = match x.shape.last() {
                Some(&last) => last,
                None => return Err(Error::shape(op.name(), "cannot normalize a scalar")),
            };
            for affine in &inputs[1..] {
                expect_dtype(op, affine, DType::F32)?;
                if affine.shape != [last] {
                    return Err(Error::shape(
                        op.name(),
                        format!("affine shape {:?} does not match [{}]", affine.shape, last),
                    ));
                }
            }
            x.clone()
        }

        Op::Reshape { shape } => {
            arity(op, inputs, 1)?;
            let numel: usize = shape.iter().product();
            if numel != inputs[0].numel() {
                return Err(Error::shape(
                    op.name(),
                    format!("cannot reshape {:?} into {:?}", inputs[0].shape, shape),
                ));
            }
            TensorMeta::new(shape.clone(), inputs[0].dtype)
        }

        Op::Permute { axes } => {
            arity(op, inputs, 1)?;
            let x = inputs[0];
            let mut seen = vec![false; x.rank()];
            if axes.len() != x.rank() {
                return Err(Error::shape(
                    op.name(),
                    format!("permutation {:?} does not match rank of {:?}", axes, x.shape),
                ));
            }
            for &axis in axes {
                if axis >= x.rank() || seen[axis] {
                    return Err(Error::shape(
                        op.name(),
                        format!("{:?} is not a permutation", axes),
                    ));
                }
                seen[axis] = true;
            }
            TensorMeta::new(
                axes.iter().map(|&axis| x.shape[axis]).collect::<Vec<_>>(),
                x.dtype,
            )
        }

        Op::Concat { axis } => {
            let first = match inputs.first() {
                Some(first) => *first,
                None => return Err(Error::shape(op.name(), "nothing to concatenate")),
            };
            expect_axis(op, first, *axis)?;
            let mut shape = first.shape.clone();
            shape[*axis] = 0;
            for meta in inputs {
                expect_dtype(op, meta, first.dtype)?;
                expect_rank(op, meta, first.rank())?;
                for (i, (&d, &f)) in meta.shape.iter().zip(first.shape.iter()).enumerate() {
                    if i != *axis && d != f {
                        return Err(Error::shape(
                            op.name(),
                            format!("{:?} does not match {:?} off axis {}", meta.shape, first.shape, axis),
                        ));
                    }
                }
                shape[*axis] += meta.shape[*axis];
            }
            TensorMeta::new(shape, first.dtype)
        }

        Op::Slice { axis, start, end } => {
            arity(op, inputs, 1)?;
            let x = inputs[0];
            expect_axis(op, x, *axis)?;
            if start > end || *end > x.shape[*axis] {
                return Err(Error::shape(
                    op.name(),
                    format!("range {}..{} out of bounds for {:?} on axis {}", start, end, x.shape, axis),
                ));
            }
            let mut shape = x.shape.clone();
            shape[*axis] = end - start;
            TensorMeta::new(shape, x.dtype)
        }

        Op::Reduce { kind, axis } => {
            arity(op, inputs, 1)?;
            let x = inputs[0];
            expect_dtype(op, x, DType::F32)?;
            expect_axis(op, x, *axis)?;
            if *kind == ReduceKind::Max && x.shape[*axis] == 0 {
                return Err(Error::shape(op.name(), "max over an empty axis"));
            }
            let mut shape = x.shape.clone();
            shape.remove(*axis);
            TensorMeta::f32(shape)
        }

        Op::TopK { k } => {
            arity(op, inputs, 1)?;
            let x = inputs[0];
            expect_dtype(op, x, DType::F32)?;
            let last = match x.shape.last() {
                Some(&last) => last,
                None => return Err(Error::shape(op.name(), "top_k of a scalar")),
            };
            if *k > last {
                return Err(Error::shape(
                    op.name(),
                    format!("k = {} exceeds {} candidates", k, last),
                ));
            }
            let mut shape = x.shape.clone();
            let rank = shape.len();
            shape[rank - 1] = *k;
            return Ok(vec![
                TensorMeta::new(shape.clone(), DType::F32),
                TensorMeta::new(shape, DType::I32),
            ]);
        }

        Op::Gather => {
            arity(op, inputs, 2)?;
            let (data, indices) = (inputs[0], inputs[1]);
            expect_dtype(op, indices, DType::I32)?;
            expect_rank(op, indices, 2)?;
            if data.rank() < 2 || data.shape[0] != indices.shape[0] {
                return Err(Error::shape(
                    op.name(),
                    format!("cannot gather {:?} with indices {:?}", data.shape, indices.shape),
                ));
            }
            let mut shape = data.shape.clone();
            shape[1] = indices.shape[1];
            TensorMeta::new(shape, data.dtype)
        }

        Op::Select => {
            arity(op, inputs, 3)?;
            let (mask, a, b) = (inputs[0], inputs[1], inputs[2]);
            expect_dtype(op, mask, DType::Bool)?;
            expect_dtype(op, b, a.dtype)?;
            let values = broadcast(op, &a.shape, &b.shape)?;
            TensorMeta::new(broadcast(op, &mask.shape, &values)?, a.dtype)
        }

        Op::DeformableAggregation => {
            arity(op, inputs, 5)?;
            let (feature, shapes, starts, loc, weights) =
                (inputs[0], inputs[1], inputs[2], inputs[3], inputs[4]);
            expect_dtype(op, feature, DType::F32)?;
            expect_dtype(op, shapes, DType::I32)?;
            expect_dtype(op, starts, DType::I32)?;
            expect_dtype(op, loc, DType::F32)?;
            expect_dtype(op, weights, DType::F32)?;
            expect_rank(op, feature, 3)?;
            expect_rank(op, shapes, 3)?;
            expect_rank(op, starts, 2)?;
            expect_rank(op, loc, 4)?;
            expect_rank(op, weights, 5)?;

            let (bs, channels) = (feature.shape[0], feature.shape[2]);
            let (cams, levels) = (shapes.shape[0], shapes.shape[1]);
            let (queries, groups) = (loc.shape[1], weights.shape[4]);
            let consistent = shapes.shape[2] == 2
                && starts.shape == [cams, levels]
                && loc.shape == [bs, queries, cams, 2]
                && weights.shape[..4] == [bs, queries, cams, levels]
                && groups > 0
                && channels % groups == 0;
            if !consistent {
                return Err(Error::shape(
                    op.name(),
                    format!(
                        "feature {:?}, spatial_shapes {:?}, level_start_index {:?}, sampling_location {:?}, weights {:?}",
                        feature.shape, shapes.shape, starts.shape, loc.shape, weights.shape
                    ),
                ));
            }
            TensorMeta::f32(vec![bs, queries, channels])
        }
    };

    Ok(vec![out])
}
