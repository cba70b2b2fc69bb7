use tracing::debug;

use super::{HeadInputs, HeadOutputs, Sparse4DHead, TemporalInputs, TemporalState};
use crate::anchor::ANCHOR_DIM;
use crate::backend::{Backend, Tracer};
use crate::error::Error;
use crate::graph::Graph;
use crate::tensor::{DType, TensorMeta, Value};
use crate::topk::top_k;

pub const TEMPORAL_INPUTS: [&str; 12] = [
    "temp_instance_feature",
    "temp_anchor",
    "mask",
    "track_id",
    "instance_feature",
    "anchor",
    "time_interval",
    "feature",
    "spatial_shapes",
    "level_start_index",
    "lidar2img",
    "image_wh",
];

pub const TEMPORAL_OUTPUTS: [&str; 5] = [
    "instance_feature",
    "anchor",
    "class_score",
    "quality_score",
    "track_id",
];

impl Sparse4DHead {
    /// Decodes a frame that may continue the previous one.
    ///
    /// Samples whose `mask` is `false` restart: the merge keeps their pre-merge instances and
    /// resets every track id to `-1`.
    pub fn forward_temporal<B: Backend>(
        &self,
        b: &B,
        temporal: &TemporalInputs<B::Tensor>,
        inputs: &HeadInputs<B::Tensor>,
    ) -> Result<HeadOutputs<B::Tensor>, Error> {
        let bs = self.check_inputs(b, inputs)?;
        self.check_temporal(b, temporal, bs)?;

        let state = TemporalState {
            feature: temporal.temp_instance_feature.clone(),
            anchor: temporal.temp_anchor.clone(),
            anchor_embed: self.encoder.forward(b, &temporal.temp_anchor)?,
            mask: temporal.mask.clone(),
            track_id: temporal.track_id.clone(),
        };

        self.decode(b, inputs, Some(state))
    }

    /// Records [`forward_temporal`](Self::forward_temporal) for inputs of the given shapes.
    pub fn trace_temporal(
        &self,
        name: &str,
        temporal: &TemporalInputs<TensorMeta>,
        inputs: &HeadInputs<TensorMeta>,
    ) -> Result<Graph, Error> {
        let tracer = Tracer::new(name);
        let temporal = TemporalInputs {
            temp_instance_feature: tracer
                .input(TEMPORAL_INPUTS[0], temporal.temp_instance_feature.clone()),
            temp_anchor: tracer.input(TEMPORAL_INPUTS[1], temporal.temp_anchor.clone()),
            mask: tracer.input(TEMPORAL_INPUTS[2], temporal.mask.clone()),
            track_id: tracer.input(TEMPORAL_INPUTS[3], temporal.track_id.clone()),
        };
        let traced = inputs
            .named()
            .iter()
            .map(|(port, meta)| tracer.input(port, (*meta).clone()))
            .collect::<Vec<_>>();

        let outputs =
            self.forward_temporal(&tracer, &temporal, &HeadInputs::try_from_vec(traced)?)?;
        let graph = tracer.finish(&outputs.named());
        debug!(graph = name, nodes = graph.nodes.len(), "traced temporal head");

        Ok(graph)
    }

    fn check_temporal<B: Backend>(
        &self,
        b: &B,
        temporal: &TemporalInputs<B::Tensor>,
        bs: usize,
    ) -> Result<(), Error> {
        let (num_anchor, num_temp) = (self.snapshot.num_anchor, self.snapshot.num_temp_instances);
        let expected = [
            (
                "temp_instance_feature",
                b.meta(&temporal.temp_instance_feature),
                TensorMeta::f32(vec![bs, num_temp, self.embed_dims]),
            ),
            (
                "temp_anchor",
                b.meta(&temporal.temp_anchor),
                TensorMeta::f32(vec![bs, num_temp, ANCHOR_DIM]),
            ),
            ("mask", b.meta(&temporal.mask), TensorMeta::new(vec![bs], DType::Bool)),
            (
                "track_id",
                b.meta(&temporal.track_id),
                TensorMeta::new(vec![bs, num_anchor], DType::I32),
            ),
        ];

        for (name, found, expected) in expected.iter() {
            if found != expected {
                return Err(Error::shape(
                    "sparse4d_head",
                    format!("{} must be {}, got {}", name, expected, found),
                ));
            }
        }
        Ok(())
    }

    /// Keeps the cached instances and fills the remaining slots with the best current ones,
    /// then picks per sample between the merged and the current state.
    pub(crate) fn merge<B: Backend>(
        &self,
        b: &B,
        feature: &B::Tensor,
        anchor: &B::Tensor,
        class_score: &B::Tensor,
        state: &mut TemporalState<B::Tensor>,
    ) -> Result<(B::Tensor, B::Tensor), Error> {
        let bs = b.shape(feature)[0];
        let fresh = self.snapshot.num_anchor - self.snapshot.num_temp_instances;

        let (merged_feature, merged_anchor) = if fresh == 0 {
            (state.feature.clone(), state.anchor.clone())
        } else {
            let confidence = b.reduce_max(class_score, 2)?;
            let selected = top_k(b, &confidence, fresh, feature, anchor)?;
            (
                b.concat(&[&state.feature, &selected.feature], 1)?,
                b.concat(&[&state.anchor, &selected.anchor], 1)?,
            )
        };

        let mask = b.reshape(&state.mask, &[bs, 1, 1])?;
        let feature = b.select(&mask, &merged_feature, feature)?;
        let anchor = b.select(&mask, &merged_anchor, anchor)?;

        let mask = b.reshape(&state.mask, &[bs, 1])?;
        let untracked = b.constant(Value::scalar_i32(-1))?;
        state.track_id = b.select(&mask, &state.track_id, &untracked)?;

        Ok((feature, anchor))
    }
}
