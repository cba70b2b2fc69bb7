use rand::Rng;

use crate::anchor::{ANCHOR_DIM, COS_YAW, H, VX, X};
use crate::backend::Backend;
use crate::error::Error;
use crate::nn::{Linear, LinearReluLn};

pub struct RefineOutput<T> {
    pub anchor: T,
    pub class_score: Option<T>,
    pub quality_score: T,
}

/// Regresses anchor deltas plus class and quality scores from the instance features.
#[derive(Debug, Clone)]
pub struct SparseBox3DRefinement {
    refine_end: usize,
    layers: LinearReluLn,
    delta_fc: Linear,
    cls_layers: LinearReluLn,
    cls_fc: Linear,
    quality_layers: LinearReluLn,
    quality_fc: Linear,
}

impl SparseBox3DRefinement {
    pub fn random(
        embed_dims: usize,
        num_classes: usize,
        refine_yaw: bool,
        rng: &mut impl Rng,
    ) -> Self {
        Self {
            refine_end: if refine_yaw { COS_YAW + 1 } else { H + 1 },
            layers: LinearReluLn::random(embed_dims, 2, 2, embed_dims, rng),
            delta_fc: Linear::random(embed_dims, ANCHOR_DIM, rng),
            cls_layers: LinearReluLn::random(embed_dims, 1, 2, embed_dims, rng),
            cls_fc: Linear::random(embed_dims, num_classes, rng),
            quality_layers: LinearReluLn::random(embed_dims, 1, 2, embed_dims, rng),
            quality_fc: Linear::random(embed_dims, 2, rng),
        }
    }

    pub fn forward<B: Backend>(
        &self,
        b: &B,
        feature: &B::Tensor,
        anchor: &B::Tensor,
        anchor_embed: &B::Tensor,
        time_interval: &B::Tensor,
        return_cls: bool,
    ) -> Result<RefineOutput<B::Tensor>, Error> {
        let bs = b.shape(anchor)[0];
        let fused = b.add(feature, anchor_embed)?;
        let delta = self.delta_fc.forward(b, &self.layers.forward(b, &fused)?)?;

        let refined = b.add(
            &b.slice(&delta, 2, X, self.refine_end)?,
            &b.slice(anchor, 2, X, self.refine_end)?,
        )?;

        let dt = b.reshape(time_interval, &[bs, 1, 1])?;
        let velocity = b.div(&b.slice(&delta, 2, VX, ANCHOR_DIM)?, &dt)?;
        let velocity = b.add(&velocity, &b.slice(anchor, 2, VX, ANCHOR_DIM)?)?;

        let anchor = if self.refine_end < VX {
            let untouched = b.slice(&delta, 2, self.refine_end, VX)?;
            b.concat(&[&refined, &untouched, &velocity], 2)?
        } else {
            b.concat(&[&refined, &velocity], 2)?
        };

        let class_score = if return_cls {
            let cls = self.cls_layers.forward(b, feature)?;
            Some(self.cls_fc.forward(b, &cls)?)
        } else {
            None
        };

        let quality = self.quality_layers.forward(b, &fused)?;
        let quality_score = self.quality_fc.forward(b, &quality)?;

        Ok(RefineOutput {
            anchor,
            class_score,
            quality_score,
        })
    }
}
