//! Sparse temporal decoder head.
//!
//! Both entry points replay the same [`DispatchSequence`] over a fixed pool of instances. The
//! first-frame head has no temporal state. The temporal head attends to the instances cached
//! from the previous frame and merges them in once the single-frame decoders are done.

mod first;
mod temporal;

pub use first::{FIRST_FRAME_INPUTS, FIRST_FRAME_OUTPUTS};
pub use temporal::{TEMPORAL_INPUTS, TEMPORAL_OUTPUTS};

use rand::Rng;
use tracing::trace;

use crate::anchor::{SparseBox3DEncoder, ANCHOR_DIM};
use crate::backend::Backend;
use crate::bank::BankSnapshot;
use crate::config::HeadConfig;
use crate::dispatch::{DispatchSequence, Stage};
use crate::error::Error;
use crate::parallel::Device;
use crate::tensor::DType;

/// Multi-camera, multi-level image features flattened along one axis.
#[derive(Debug, Clone)]
pub struct FeatureMaps<T> {
    /// `(bs, cams * sum(h * w), C)`
    pub feature: T,
    /// `(cams, levels, 2)` as `[h, w]`
    pub spatial_shapes: T,
    /// `(cams, levels)` offsets of every map into `feature`
    pub level_start_index: T,
}

#[derive(Debug, Clone)]
pub struct Projection<T> {
    /// `(bs, cams, 4, 4)`
    pub lidar2img: T,
    /// `(bs, cams, 2)` as `[w, h]`
    pub image_wh: T,
}

#[derive(Debug, Clone)]
pub struct HeadInputs<T> {
    pub instance_feature: T,
    pub anchor: T,
    pub time_interval: T,
    pub maps: FeatureMaps<T>,
    pub projection: Projection<T>,
}

impl<T> HeadInputs<T> {
    /// Tensors in graph input order, see [`FIRST_FRAME_INPUTS`].
    pub fn named(&self) -> [(&'static str, &T); 8] {
        [
            (FIRST_FRAME_INPUTS[0], &self.instance_feature),
            (FIRST_FRAME_INPUTS[1], &self.anchor),
            (FIRST_FRAME_INPUTS[2], &self.time_interval),
            (FIRST_FRAME_INPUTS[3], &self.maps.feature),
            (FIRST_FRAME_INPUTS[4], &self.maps.spatial_shapes),
            (FIRST_FRAME_INPUTS[5], &self.maps.level_start_index),
            (FIRST_FRAME_INPUTS[6], &self.projection.lidar2img),
            (FIRST_FRAME_INPUTS[7], &self.projection.image_wh),
        ]
    }

    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> HeadInputs<U> {
        HeadInputs {
            instance_feature: f(&self.instance_feature),
            anchor: f(&self.anchor),
            time_interval: f(&self.time_interval),
            maps: FeatureMaps {
                feature: f(&self.maps.feature),
                spatial_shapes: f(&self.maps.spatial_shapes),
                level_start_index: f(&self.maps.level_start_index),
            },
            projection: Projection {
                lidar2img: f(&self.projection.lidar2img),
                image_wh: f(&self.projection.image_wh),
            },
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        vec![
            self.instance_feature,
            self.anchor,
            self.time_interval,
            self.maps.feature,
            self.maps.spatial_shapes,
            self.maps.level_start_index,
            self.projection.lidar2img,
            self.projection.image_wh,
        ]
    }

    pub fn try_from_vec(values: Vec<T>) -> Result<Self, Error> {
        let count = values.len();
        let [instance_feature, anchor, time_interval, feature, spatial_shapes, level_start_index, lidar2img, image_wh]: [T; 8] =
            values.try_into().map_err(|_| {
                Error::shape("head_inputs", format!("expected 8 tensors, got {}", count))
            })?;

        Ok(Self {
            instance_feature,
            anchor,
            time_interval,
            maps: FeatureMaps {
                feature,
                spatial_shapes,
                level_start_index,
            },
            projection: Projection {
                lidar2img,
                image_wh,
            },
        })
    }
}

/// State carried over from the previous frame.
#[derive(Debug, Clone)]
pub struct TemporalInputs<T> {
    /// `(bs, num_temp_instances, embed_dims)`
    pub temp_instance_feature: T,
    /// `(bs, num_temp_instances, 11)`
    pub temp_anchor: T,
    /// `(bs,)` bool, `true` continues the previous frame
    pub mask: T,
    /// `(bs, num_anchor)` i32, `-1` for untracked instances
    pub track_id: T,
}

impl<T> TemporalInputs<T> {
    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> TemporalInputs<U> {
        TemporalInputs {
            temp_instance_feature: f(&self.temp_instance_feature),
            temp_anchor: f(&self.temp_anchor),
            mask: f(&self.mask),
            track_id: f(&self.track_id),
        }
    }

    /// Tensors in graph input order, see [`TEMPORAL_INPUTS`].
    pub fn named(&self) -> [(&'static str, &T); 4] {
        [
            (TEMPORAL_INPUTS[0], &self.temp_instance_feature),
            (TEMPORAL_INPUTS[1], &self.temp_anchor),
            (TEMPORAL_INPUTS[2], &self.mask),
            (TEMPORAL_INPUTS[3], &self.track_id),
        ]
    }

    pub fn into_vec(self) -> Vec<T> {
        vec![
            self.temp_instance_feature,
            self.temp_anchor,
            self.mask,
            self.track_id,
        ]
    }
}

#[derive(Debug, Clone)]
pub struct HeadOutputs<T> {
    pub instance_feature: T,
    pub anchor: T,
    pub class_score: T,
    pub quality_score: T,
    /// Only produced by the temporal head.
    pub track_id: Option<T>,
}

impl<T> HeadOutputs<T> {
    /// Tensors in graph output order.
    pub fn named(&self) -> Vec<(&'static str, &T)> {
        let mut named = vec![
            (FIRST_FRAME_OUTPUTS[0], &self.instance_feature),
            (FIRST_FRAME_OUTPUTS[1], &self.anchor),
            (FIRST_FRAME_OUTPUTS[2], &self.class_score),
            (FIRST_FRAME_OUTPUTS[3], &self.quality_score),
        ];
        if let Some(track_id) = &self.track_id {
            named.push((TEMPORAL_OUTPUTS[4], track_id));
        }
        named
    }

    pub fn try_from_vec(values: Vec<T>) -> Result<Self, Error> {
        let count = values.len();
        let mut values = values.into_iter();
        match (values.next(), values.next(), values.next(), values.next()) {
            (Some(instance_feature), Some(anchor), Some(class_score), Some(quality_score))
                if count <= 5 =>
            {
                Ok(Self {
                    instance_feature,
                    anchor,
                    class_score,
                    quality_score,
                    track_id: values.next(),
                })
            }
            _ => Err(Error::shape(
                "head_outputs",
                format!("expected 4 or 5 tensors, got {}", count),
            )),
        }
    }
}

pub(crate) struct TemporalState<T> {
    pub feature: T,
    pub anchor: T,
    pub anchor_embed: T,
    pub mask: T,
    pub track_id: T,
}

pub struct Sparse4DHead {
    snapshot: BankSnapshot,
    embed_dims: usize,
    num_classes: usize,
    encoder: SparseBox3DEncoder,
    sequence: DispatchSequence,
    device: Device,
}

impl Sparse4DHead {
    pub fn random(config: &HeadConfig, rng: &mut impl Rng) -> Result<Self, Error> {
        config.validate()?;

        Ok(Self {
            snapshot: BankSnapshot::from(&config.bank),
            embed_dims: config.embed_dims,
            num_classes: config.num_classes,
            encoder: SparseBox3DEncoder::random(config.embed_dims, &config.encoder, rng),
            sequence: DispatchSequence::resolve(config, rng)?,
            device: Device::CPU,
        })
    }

    #[inline]
    pub fn snapshot(&self) -> &BankSnapshot {
        &self.snapshot
    }

    #[inline]
    pub fn embed_dims(&self) -> usize {
        self.embed_dims
    }

    #[inline]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    #[inline]
    pub fn sequence(&self) -> &DispatchSequence {
        &self.sequence
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Moves every parameter to `device`.
    pub fn to(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub(crate) fn check_inputs<B: Backend>(
        &self,
        b: &B,
        inputs: &HeadInputs<B::Tensor>,
    ) -> Result<usize, Error> {
        let feature = b.meta(&inputs.instance_feature);
        let anchor = b.meta(&inputs.anchor);
        let time_interval = b.meta(&inputs.time_interval);
        let bs = feature.shape.first().copied().unwrap_or(0);

        let expected = [
            ("instance_feature", &feature, vec![bs, self.snapshot.num_anchor, self.embed_dims]),
            ("anchor", &anchor, vec![bs, self.snapshot.num_anchor, ANCHOR_DIM]),
            ("time_interval", &time_interval, vec![bs]),
        ];
        for (name, meta, shape) in expected.iter() {
            if meta.shape != *shape || meta.dtype != DType::F32 {
                return Err(Error::shape(
                    "sparse4d_head",
                    format!("{} must be {:?}:float32, got {}", name, shape, meta),
                ));
            }
        }

        Ok(bs)
    }

    /// Replays the dispatch sequence; `temporal` switches on attention to and merging of the
    /// previous frame.
    pub(crate) fn decode<B: Backend>(
        &self,
        b: &B,
        inputs: &HeadInputs<B::Tensor>,
        mut temporal: Option<TemporalState<B::Tensor>>,
    ) -> Result<HeadOutputs<B::Tensor>, Error> {
        let mut feature = inputs.instance_feature.clone();
        let mut anchor = inputs.anchor.clone();
        let mut anchor_embed = self.encoder.forward(b, &anchor)?;
        let mut class_score = None;
        let mut quality_score = None;

        for (position, (stage, plan)) in self.sequence.iter().enumerate() {
            trace!(position, stage = %stage.kind(), present = stage.is_present(), "dispatch");

            match stage {
                Stage::TempGnn(Some(attention)) => {
                    feature = match &temporal {
                        Some(state) => attention.forward(
                            b,
                            &feature,
                            &state.feature,
                            &state.feature,
                            &anchor_embed,
                            &state.anchor_embed,
                        )?,
                        None => attention.forward(
                            b,
                            &feature,
                            &feature,
                            &feature,
                            &anchor_embed,
                            &anchor_embed,
                        )?,
                    };
                }
                Stage::Gnn(Some(attention)) => {
                    feature = attention.forward(
                        b,
                        &feature,
                        &feature,
                        &feature,
                        &anchor_embed,
                        &anchor_embed,
                    )?;
                }
                Stage::Norm(Some(norm)) => feature = norm.forward(b, &feature)?,
                Stage::Ffn(Some(ffn)) => feature = ffn.forward(b, &feature)?,
                Stage::Deformable(Some(op)) => {
                    feature = op.forward(
                        b,
                        &feature,
                        &anchor,
                        &anchor_embed,
                        &inputs.maps,
                        &inputs.projection,
                    )?;
                }
                Stage::Refine(Some(refine)) => {
                    let out = refine.forward(
                        b,
                        &feature,
                        &anchor,
                        &anchor_embed,
                        &inputs.time_interval,
                        plan.return_cls,
                    )?;
                    anchor = out.anchor;

                    if plan.merge {
                        if let (Some(state), Some(cls)) = (temporal.as_mut(), &out.class_score) {
                            let (merged_feature, merged_anchor) =
                                self.merge(b, &feature, &anchor, cls, state)?;
                            feature = merged_feature;
                            anchor = merged_anchor;
                        }
                    }
                    if plan.re_embed {
                        anchor_embed = self.encoder.forward(b, &anchor)?;
                    }
                    if plan.refresh_temp_embed {
                        if let Some(state) = temporal.as_mut() {
                            state.anchor_embed =
                                b.slice(&anchor_embed, 1, 0, self.snapshot.num_temp_instances)?;
                        }
                    }

                    class_score = out.class_score;
                    quality_score = Some(out.quality_score);
                }
                _ => {}
            }
        }

        Ok(HeadOutputs {
            instance_feature: feature,
            anchor,
            class_score: class_score.ok_or(Error::MissingOutput("class_score"))?,
            quality_score: quality_score.ok_or(Error::MissingOutput("quality_score"))?,
            track_id: temporal.map(|state| state.track_id),
        })
    }
}
