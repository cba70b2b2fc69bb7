//! Parameterized building blocks shared by the decoder operators.
//!
//! Parameters live on the host as [`Value`]s and are lifted into the backend on every call, so
//! a traced graph embeds them as constants.

mod attention;
mod ffn;

pub use attention::MultiheadAttention;
pub use ffn::AsymmetricFfn;

use rand::Rng;

use crate::backend::Backend;
use crate::error::Error;
use crate::tensor::Value;

/// Xavier-uniform matrix of shape `(fan_in, fan_out)`.
pub fn xavier(fan_in: usize, fan_out: usize, rng: &mut impl Rng) -> Value {
    let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
    uniform(&[fan_in, fan_out], -bound, bound, rng)
}

pub fn uniform(shape: &[usize], low: f32, high: f32, rng: &mut impl Rng) -> Value {
    let numel = shape.iter().product::<usize>();
    let data = (0..numel).map(|_| rng.gen_range(low..high)).collect();
    Value::from_f32(shape, data).unwrap_or_else(|_| Value::zeros(shape))
}

/// Fully connected layer `y = x W + b`, with `W` stored as `(in, out)`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Value,
    pub bias: Value,
    in_dims: usize,
    out_dims: usize,
}

impl Linear {
    pub fn random(in_dims: usize, out_dims: usize, rng: &mut impl Rng) -> Self {
        Self {
            weight: xavier(in_dims, out_dims, rng),
            bias: Value::zeros(&[out_dims]),
            in_dims,
            out_dims,
        }
    }

    #[inline]
    pub fn in_dims(&self) -> usize {
        self.in_dims
    }

    #[inline]
    pub fn out_dims(&self) -> usize {
        self.out_dims
    }

    pub fn forward<B: Backend>(&self, b: &B, x: &B::Tensor) -> Result<B::Tensor, Error> {
        let weight = b.constant(self.weight.clone())?;
        let bias = b.constant(self.bias.clone())?;
        let y = b.matmul(x, &weight)?;
        b.add(&y, &bias)
    }
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub gamma: Value,
    pub beta: Value,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(dims: usize) -> Self {
        Self {
            gamma: Value::full_f32(&[dims], 1.0),
            beta: Value::zeros(&[dims]),
            eps: 1e-5,
        }
    }

    pub fn forward<B: Backend>(&self, b: &B, x: &B::Tensor) -> Result<B::Tensor, Error> {
        let gamma = b.constant(self.gamma.clone())?;
        let beta = b.constant(self.beta.clone())?;
        b.layer_norm(x, &gamma, &beta, self.eps)
    }
}

/// `out_loops` repetitions of `in_loops` x (Linear, ReLU) followed by a LayerNorm.
#[derive(Debug, Clone)]
pub struct LinearReluLn {
    blocks: Vec<(Vec<Linear>, LayerNorm)>,
}

impl LinearReluLn {
    pub fn random(
        embed_dims: usize,
        in_loops: usize,
        out_loops: usize,
        input_dims: usize,
        rng: &mut impl Rng,
    ) -> Self {
        let mut dims = input_dims;
        let mut blocks = Vec::with_capacity(out_loops);

        for _ in 0..out_loops {
            let mut linears = Vec::with_capacity(in_loops);
            for _ in 0..in_loops {
                linears.push(Linear::random(dims, embed_dims, rng));
                dims = embed_dims;
            }
            blocks.push((linears, LayerNorm::new(embed_dims)));
        }

        Self { blocks }
    }

    pub fn forward<B: Backend>(&self, b: &B, x: &B::Tensor) -> Result<B::Tensor, Error> {
        let mut x = x.clone();
        for (linears, norm) in &self.blocks {
            for linear in linears {
                x = b.relu(&linear.forward(b, &x)?)?;
            }
            x = norm.forward(b, &x)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Eager;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn linear_relu_ln_maps_to_embed_dims() {
        let mut rng = StdRng::seed_from_u64(3);
        let block = LinearReluLn::random(8, 2, 2, 3, &mut rng);
        let x = Value::full_f32(&[2, 5, 3], 0.25);
        let y = block.forward(&Eager, &x).unwrap();
        assert_eq!(y.shape(), &[2, 5, 8]);
    }

    #[test]
    fn layer_norm_centres_rows() {
        let norm = LayerNorm::new(4);
        let x = Value::from_f32(&[1, 4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = norm.forward(&Eager, &x).unwrap();
        let sum: f32 = y.as_f32().unwrap().sum();
        assert!(sum.abs() < 1e-5);
    }

    #[test]
    fn xavier_respects_bound() {
        let mut rng = StdRng::seed_from_u64(0);
        let w = xavier(10, 6, &mut rng);
        let bound = 0.5f32.sqrt() + 1e-6;
        assert!(w.as_f32().unwrap().iter().all(|x| x.abs() <= bound));
    }
}
