use rand::Rng;

use super::Linear;
use crate::backend::Backend;
use crate::error::Error;

/// Multi-head scaled dot-product attention with additive positional terms.
///
/// The positional terms are added to the query and key only. The un-embedded query is the
/// residual.
#[derive(Debug, Clone)]
pub struct MultiheadAttention {
    num_heads: usize,
    head_dims: usize,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
}

impl MultiheadAttention {
    pub fn random(embed_dims: usize, num_heads: usize, rng: &mut impl Rng) -> Self {
        Self {
            num_heads,
            head_dims: embed_dims / num_heads,
            q_proj: Linear::random(embed_dims, embed_dims, rng),
            k_proj: Linear::random(embed_dims, embed_dims, rng),
            v_proj: Linear::random(embed_dims, embed_dims, rng),
            out_proj: Linear::random(embed_dims, embed_dims, rng),
        }
    }

    /// `(bs, n, embed) -> (bs, heads, n, head_dims)`
    fn split_heads<B: Backend>(&self, b: &B, x: &B::Tensor) -> Result<B::Tensor, Error> {
        let shape = b.shape(x);
        let x = b.reshape(x, &[shape[0], shape[1], self.num_heads, self.head_dims])?;
        b.permute(&x, &[0, 2, 1, 3])
    }

    pub fn forward<B: Backend>(
        &self,
        b: &B,
        query: &B::Tensor,
        key: &B::Tensor,
        value: &B::Tensor,
        query_pos: &B::Tensor,
        key_pos: &B::Tensor,
    ) -> Result<B::Tensor, Error> {
        let shape = b.shape(query);
        let (bs, num_query, embed_dims) = (shape[0], shape[1], shape[2]);

        let q = self.q_proj.forward(b, &b.add(query, query_pos)?)?;
        let k = self.k_proj.forward(b, &b.add(key, key_pos)?)?;
        let v = self.v_proj.forward(b, value)?;

        let scale = b.scalar(1.0 / (self.head_dims as f32).sqrt())?;
        let q = b.mul(&self.split_heads(b, &q)?, &scale)?;
        let k = b.permute(&self.split_heads(b, &k)?, &[0, 1, 3, 2])?;
        let v = self.split_heads(b, &v)?;

        let attn = b.softmax(&b.matmul(&q, &k)?, 3)?;
        let out = b.matmul(&attn, &v)?;
        let out = b.permute(&out, &[0, 2, 1, 3])?;
        let out = b.reshape(&out, &[bs, num_query, embed_dims])?;
        let out = self.out_proj.forward(b, &out)?;

        b.add(query, &out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Eager;
    use crate::tensor::Value;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn cross_attention_keeps_query_shape() {
        let mut rng = StdRng::seed_from_u64(5);
        let mha = MultiheadAttention::random(8, 2, &mut rng);

        let query = Value::full_f32(&[2, 6, 8], 0.1);
        let key = Value::full_f32(&[2, 4, 8], -0.2);
        let query_pos = Value::zeros(&[2, 6, 8]);
        let key_pos = Value::zeros(&[2, 4, 8]);

        let out = mha
            .forward(&Eager, &query, &key, &key, &query_pos, &key_pos)
            .unwrap();
        assert_eq!(out.shape(), &[2, 6, 8]);
    }
}
