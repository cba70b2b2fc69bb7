use rand::Rng;

use super::{LayerNorm, Linear};
use crate::backend::Backend;
use crate::error::Error;

/// Two-layer feed-forward block whose input width may differ from its output width.
///
/// When the widths differ the residual branch goes through a linear projection.
#[derive(Debug, Clone)]
pub struct AsymmetricFfn {
    pre_norm: Option<LayerNorm>,
    fc1: Linear,
    fc2: Linear,
    identity_fc: Option<Linear>,
}

impl AsymmetricFfn {
    pub fn random(
        in_channels: usize,
        embed_dims: usize,
        feedforward_channels: usize,
        pre_norm: bool,
        rng: &mut impl Rng,
    ) -> Self {
        Self {
            pre_norm: pre_norm.then(|| LayerNorm::new(in_channels)),
            fc1: Linear::random(in_channels, feedforward_channels, rng),
            fc2: Linear::random(feedforward_channels, embed_dims, rng),
            identity_fc: (in_channels != embed_dims)
                .then(|| Linear::random(in_channels, embed_dims, rng)),
        }
    }

    pub fn forward<B: Backend>(&self, b: &B, x: &B::Tensor) -> Result<B::Tensor, Error> {
        let x = match &self.pre_norm {
            Some(norm) => norm.forward(b, x)?,
            None => x.clone(),
        };

        let out = b.relu(&self.fc1.forward(b, &x)?)?;
        let out = self.fc2.forward(b, &out)?;

        let identity = match &self.identity_fc {
            Some(fc) => fc.forward(b, &x)?,
            None => x,
        };

        b.add(&identity, &out)
    }
}
