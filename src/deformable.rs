//! Multi-camera deformable feature aggregation around 3D anchors.
//!
//! Every anchor spawns a fixed set of key points (box-relative offsets) plus learned offsets.
//! The key points are projected into every camera and bilinearly sampled from every feature
//! level. The samples are blended with softmax weights predicted per group.

use rand::Rng;

use crate::anchor::{COS_YAW, H, SIN_YAW, W, X, Z};
use crate::backend::Backend;
use crate::config::{CombineMode, DeformableConfig};
use crate::error::Error;
use crate::head::{FeatureMaps, Projection};
use crate::nn::{Linear, LinearReluLn};
use crate::tensor::Value;

#[derive(Debug, Clone)]
pub struct DeformableAggregation {
    embed_dims: usize,
    num_groups: usize,
    num_levels: usize,
    num_cams: usize,
    num_learnable_pts: usize,
    fix_scale: Value,
    residual_mode: CombineMode,
    learnable_fc: Option<Linear>,
    camera_encoder: Option<LinearReluLn>,
    weights_fc: Linear,
    output_proj: Linear,
}

impl DeformableAggregation {
    pub fn random(embed_dims: usize, config: &DeformableConfig, rng: &mut impl Rng) -> Self {
        let num_pts = config.num_pts();
        let fix_scale = Value::from_f32(
            &[1, 1, config.fix_scale.len(), 3],
            config.fix_scale.iter().flatten().copied().collect(),
        )
        .unwrap_or_else(|_| Value::zeros(&[1, 1, 0, 3]));

        let per_camera = config.num_groups * config.num_levels * num_pts;
        let (camera_encoder, weights_out) = if config.use_camera_embed {
            (Some(LinearReluLn::random(embed_dims, 1, 2, 12, rng)), per_camera)
        } else {
            (None, per_camera * config.num_cams)
        };

        Self {
            embed_dims,
            num_groups: config.num_groups,
            num_levels: config.num_levels,
            num_cams: config.num_cams,
            num_learnable_pts: config.num_learnable_pts,
            fix_scale,
            residual_mode: config.residual_mode,
            learnable_fc: (config.num_learnable_pts > 0)
                .then(|| Linear::random(embed_dims, config.num_learnable_pts * 3, rng)),
            camera_encoder,
            weights_fc: Linear::random(embed_dims, weights_out, rng),
            output_proj: Linear::random(embed_dims, embed_dims, rng),
        }
    }

    #[inline]
    pub fn num_pts(&self) -> usize {
        self.fix_scale.shape()[2] + self.num_learnable_pts
    }

    /// Width of the returned feature, doubled by the concatenating residual.
    pub fn out_dims(&self) -> usize {
        match self.residual_mode {
            CombineMode::Add => self.embed_dims,
            CombineMode::Cat => 2 * self.embed_dims,
        }
    }

    pub fn forward<B: Backend>(
        &self,
        b: &B,
        feature: &B::Tensor,
        anchor: &B::Tensor,
        anchor_embed: &B::Tensor,
        maps: &FeatureMaps<B::Tensor>,
        projection: &Projection<B::Tensor>,
    ) -> Result<B::Tensor, Error> {
        let shape = b.shape(feature);
        let (bs, num_anchor) = (shape[0], shape[1]);
        let num_pts = self.num_pts();

        let key_points = self.key_points(b, feature, anchor)?;
        let points_2d = self.project_points(b, &key_points, projection)?;
        let weights = self.weights(b, feature, anchor_embed, projection)?;

        let sampled = b.deformable_aggregation(
            &maps.feature,
            &maps.spatial_shapes,
            &maps.level_start_index,
            &points_2d,
            &weights,
        )?;
        let sampled = b.reshape(&sampled, &[bs, num_anchor, num_pts, self.embed_dims])?;
        let sampled = b.reduce_sum(&sampled, 2)?;
        let output = self.output_proj.forward(b, &sampled)?;

        match self.residual_mode {
            CombineMode::Add => b.add(&output, feature),
            CombineMode::Cat => b.concat(&[&output, feature], 2),
        }
    }

    /// `(bs, A, num_pts, 3)` key points in the ego frame.
    fn key_points<B: Backend>(
        &self,
        b: &B,
        feature: &B::Tensor,
        anchor: &B::Tensor,
    ) -> Result<B::Tensor, Error> {
        let shape = b.shape(anchor);
        let (bs, num_anchor) = (shape[0], shape[1]);

        let size = b.exp(&b.slice(anchor, 2, W, H + 1)?)?;
        let size = b.reshape(&size, &[bs, num_anchor, 1, 3])?;

        let fixed = b.mul(&b.constant(self.fix_scale.clone())?, &size)?;
        let scaled = match &self.learnable_fc {
            Some(fc) => {
                let learned = b.sigmoid(&fc.forward(b, feature)?)?;
                let learned = b.sub(&learned, &b.scalar(0.5)?)?;
                let learned =
                    b.reshape(&learned, &[bs, num_anchor, self.num_learnable_pts, 3])?;
                b.concat(&[&fixed, &b.mul(&learned, &size)?], 2)?
            }
            None => fixed,
        };

        let sin = b.reshape(&b.slice(anchor, 2, SIN_YAW, SIN_YAW + 1)?, &[bs, num_anchor, 1, 1])?;
        let cos = b.reshape(&b.slice(anchor, 2, COS_YAW, COS_YAW + 1)?, &[bs, num_anchor, 1, 1])?;
        let kx = b.slice(&scaled, 3, 0, 1)?;
        let ky = b.slice(&scaled, 3, 1, 2)?;
        let kz = b.slice(&scaled, 3, 2, 3)?;

        let rx = b.sub(&b.mul(&cos, &kx)?, &b.mul(&sin, &ky)?)?;
        let ry = b.add(&b.mul(&sin, &kx)?, &b.mul(&cos, &ky)?)?;
        let rotated = b.concat(&[&rx, &ry, &kz], 3)?;

        let center = b.reshape(&b.slice(anchor, 2, X, Z + 1)?, &[bs, num_anchor, 1, 3])?;
        b.add(&rotated, &center)
    }

    /// `(bs, A * num_pts, cams, 2)` normalized image coordinates.
    fn project_points<B: Backend>(
        &self,
        b: &B,
        key_points: &B::Tensor,
        projection: &Projection<B::Tensor>,
    ) -> Result<B::Tensor, Error> {
        let shape = b.shape(key_points);
        let (bs, num_anchor, num_pts) = (shape[0], shape[1], shape[2]);
        let cams = self.num_cams;
        let count = num_anchor * num_pts;

        let ones = b.constant(Value::full_f32(&[bs, num_anchor, num_pts, 1], 1.0))?;
        let homogeneous = b.concat(&[key_points, &ones], 3)?;
        let homogeneous = b.reshape(&homogeneous, &[bs, 1, count, 4])?;

        let transposed = b.permute(&projection.lidar2img, &[0, 1, 3, 2])?;
        let points = b.matmul(&homogeneous, &transposed)?;

        let depth = b.clamp_min(&b.slice(&points, 3, 2, 3)?, 1e-5)?;
        let points = b.div(&b.slice(&points, 3, 0, 2)?, &depth)?;
        let image_wh = b.reshape(&projection.image_wh, &[bs, cams, 1, 2])?;
        let points = b.div(&points, &image_wh)?;

        let points = b.reshape(&points, &[bs, cams, num_anchor, num_pts, 2])?;
        let points = b.permute(&points, &[0, 2, 3, 1, 4])?;
        b.reshape(&points, &[bs, count, cams, 2])
    }

    /// `(bs, A * num_pts, cams, levels, groups)` softmax weights.
    fn weights<B: Backend>(
        &self,
        b: &B,
        feature: &B::Tensor,
        anchor_embed: &B::Tensor,
        projection: &Projection<B::Tensor>,
    ) -> Result<B::Tensor, Error> {
        let shape = b.shape(feature);
        let (bs, num_anchor) = (shape[0], shape[1]);
        let (cams, levels, groups) = (self.num_cams, self.num_levels, self.num_groups);
        let num_pts = self.num_pts();

        let fused = b.add(feature, anchor_embed)?;
        let fused = match &self.camera_encoder {
            Some(encoder) => {
                let camera = b.slice(&projection.lidar2img, 2, 0, 3)?;
                let camera = b.reshape(&camera, &[bs, cams, 12])?;
                let camera = encoder.forward(b, &camera)?;
                let camera = b.reshape(&camera, &[bs, 1, cams, self.embed_dims])?;
                let fused = b.reshape(&fused, &[bs, num_anchor, 1, self.embed_dims])?;
                b.add(&fused, &camera)?
            }
            None => fused,
        };

        let weights = self.weights_fc.forward(b, &fused)?;
        let weights = b.reshape(&weights, &[bs, num_anchor, cams * levels * num_pts, groups])?;
        let weights = b.softmax(&weights, 2)?;
        let weights = b.reshape(&weights, &[bs, num_anchor, cams, levels, num_pts, groups])?;
        let weights = b.permute(&weights, &[0, 1, 4, 2, 3, 5])?;
        b.reshape(&weights, &[bs, num_anchor * num_pts, cams, levels, groups])
    }
}
