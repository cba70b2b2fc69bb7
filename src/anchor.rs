//! 3D box anchor layout and the anchor embedding encoder.

use rand::Rng;

use crate::backend::Backend;
use crate::config::{CombineMode, EncoderConfig};
use crate::error::Error;
use crate::nn::LinearReluLn;

pub const X: usize = 0;
pub const Y: usize = 1;
pub const Z: usize = 2;
pub const W: usize = 3;
pub const L: usize = 4;
pub const H: usize = 5;
pub const SIN_YAW: usize = 6;
pub const COS_YAW: usize = 7;
pub const VX: usize = 8;
pub const VY: usize = 9;
pub const VZ: usize = 10;

pub const ANCHOR_DIM: usize = 11;

/// Embeds position, log size, yaw and velocity of every anchor and combines the branches.
#[derive(Debug, Clone)]
pub struct SparseBox3DEncoder {
    mode: CombineMode,
    vel_dims: usize,
    pos_fc: LinearReluLn,
    size_fc: LinearReluLn,
    yaw_fc: LinearReluLn,
    vel_fc: Option<LinearReluLn>,
}

impl SparseBox3DEncoder {
    pub fn random(embed_dims: usize, config: &EncoderConfig, rng: &mut impl Rng) -> Self {
        let [pos, size, yaw, vel] = match config.mode {
            CombineMode::Cat => [embed_dims / 2, embed_dims / 8, embed_dims / 8, embed_dims / 4],
            CombineMode::Add => [embed_dims; 4],
        };
        let (inner, outer) = (config.in_loops, config.out_loops);

        Self {
            mode: config.mode,
            vel_dims: config.vel_dims,
            pos_fc: LinearReluLn::random(pos, inner, outer, 3, rng),
            size_fc: LinearReluLn::random(size, inner, outer, 3, rng),
            yaw_fc: LinearReluLn::random(yaw, inner, outer, 2, rng),
            vel_fc: (config.vel_dims > 0)
                .then(|| LinearReluLn::random(vel, inner, outer, config.vel_dims, rng)),
        }
    }

    /// `(bs, n, 11) -> (bs, n, embed_dims)`
    pub fn forward<B: Backend>(&self, b: &B, anchor: &B::Tensor) -> Result<B::Tensor, Error> {
        let last = b.shape(anchor).len() - 1;

        let mut parts = vec![
            self.pos_fc.forward(b, &b.slice(anchor, last, X, Z + 1)?)?,
            self.size_fc.forward(b, &b.slice(anchor, last, W, H + 1)?)?,
            self.yaw_fc.forward(b, &b.slice(anchor, last, SIN_YAW, COS_YAW + 1)?)?,
        ];
        if let Some(vel_fc) = &self.vel_fc {
            parts.push(vel_fc.forward(b, &b.slice(anchor, last, VX, VX + self.vel_dims)?)?);
        }

        match self.mode {
            CombineMode::Cat => b.concat(&parts.iter().collect::<Vec<_>>(), last),
            CombineMode::Add => {
                let mut out = parts[0].clone();
                for part in &parts[1..] {
                    out = b.add(&out, part)?;
                }
                Ok(out)
            }
        }
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
    fn both_modes_produce_embed_dims() {
        let mut rng = StdRng::seed_from_u64(11);
        let anchor = Value::full_f32(&[2, 5, ANCHOR_DIM], 0.3);

        for mode in [CombineMode::Cat, CombineMode::Add] {
            let config = EncoderConfig {
                mode,
                ..EncoderConfig::default()
            };
            let encoder = SparseBox3DEncoder::random(32, &config, &mut rng);
            let embed = encoder.forward(&Eager, &anchor).unwrap();
            assert_eq!(embed.shape(), &[2, 5, 32]);
        }
    }
}
