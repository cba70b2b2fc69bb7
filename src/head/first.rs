use tracing::debug;

use super::{HeadInputs, HeadOutputs, Sparse4DHead};
use crate::backend::{Backend, Tracer};
use crate::error::Error;
use crate::graph::Graph;
use crate::tensor::TensorMeta;

pub const FIRST_FRAME_INPUTS: [&str; 8] = [
    "instance_feature",
    "anchor",
    "time_interval",
    "feature",
    "spatial_shapes",
    "level_start_index",
    "lidar2img",
    "image_wh",
];

pub const FIRST_FRAME_OUTPUTS: [&str; 4] =
    ["instance_feature", "anchor", "class_score", "quality_score"];

impl Sparse4DHead {
    /// Decodes a frame without temporal state. A pure function of its inputs.
    pub fn forward_first<B: Backend>(
        &self,
        b: &B,
        inputs: &HeadInputs<B::Tensor>,
    ) -> Result<HeadOutputs<B::Tensor>, Error> {
        self.check_inputs(b, inputs)?;
        self.decode(b, inputs, None)
    }

    /// Records [`forward_first`](Self::forward_first) for inputs of the given shapes.
    pub fn trace_first(&self, name: &str, inputs: &HeadInputs<TensorMeta>) -> Result<Graph, Error> {
        let tracer = Tracer::new(name);
        let traced = inputs
            .named()
            .iter()
            .map(|(port, meta)| tracer.input(port, (*meta).clone()))
            .collect::<Vec<_>>();

        let outputs = self.forward_first(&tracer, &HeadInputs::try_from_vec(traced)?)?;
        let graph = tracer.finish(&outputs.named());
        debug!(graph = name, nodes = graph.nodes.len(), "traced first-frame head");

        Ok(graph)
    }
}
