use std::path::Path;
use tracing::info;

use crate::backend::Eager;
use crate::error::Error;
use crate::graph::{check, Graph};
use crate::head::{
    HeadInputs, HeadOutputs, Sparse4DHead, TemporalInputs, FIRST_FRAME_INPUTS,
    FIRST_FRAME_OUTPUTS, TEMPORAL_INPUTS, TEMPORAL_OUTPUTS,
};
use crate::tensor::Value;

/// Runs the first-frame and the temporal head on host tensors.
pub trait HeadExecutor {
    fn first(&self, inputs: &HeadInputs<Value>) -> Result<HeadOutputs<Value>, Error>;

    fn temporal(
        &self,
        temporal: &TemporalInputs<Value>,
        inputs: &HeadInputs<Value>,
    ) -> Result<HeadOutputs<Value>, Error>;
}

impl HeadExecutor for Sparse4DHead {
    #[inline]
    fn first(&self, inputs: &HeadInputs<Value>) -> Result<HeadOutputs<Value>, Error> {
        self.forward_first(&Eager, inputs)
    }

    #[inline]
    fn temporal(
        &self,
        temporal: &TemporalInputs<Value>,
        inputs: &HeadInputs<Value>,
    ) -> Result<HeadOutputs<Value>, Error> {
        self.forward_temporal(&Eager, temporal, inputs)
    }
}

/// Replays a pair of exported graphs.
pub struct GraphExecutor {
    first: Graph,
    temporal: Graph,
}

impl GraphExecutor {
    pub fn new(first: Graph, temporal: Graph) -> Result<Self, Error> {
        expect_ports(&first, &FIRST_FRAME_INPUTS, &FIRST_FRAME_OUTPUTS)?;
        expect_ports(&temporal, &TEMPORAL_INPUTS, &TEMPORAL_OUTPUTS)?;
        check(&first)?;
        check(&temporal)?;

        Ok(Self { first, temporal })
    }

    pub fn load<P: AsRef<Path>>(first: P, temporal: P) -> Result<Self, Error> {
        let executor = Self::new(Graph::load(&first)?, Graph::load(&temporal)?)?;
        info!(
            first = %first.as_ref().display(),
            temporal = %temporal.as_ref().display(),
            "loaded head graphs"
        );
        Ok(executor)
    }
}

impl HeadExecutor for GraphExecutor {
    fn first(&self, inputs: &HeadInputs<Value>) -> Result<HeadOutputs<Value>, Error> {
        HeadOutputs::try_from_vec(self.first.run(&inputs.clone().into_vec())?)
    }

    fn temporal(
        &self,
        temporal: &TemporalInputs<Value>,
        inputs: &HeadInputs<Value>,
    ) -> Result<HeadOutputs<Value>, Error> {
        let mut values = temporal.clone().into_vec();
        values.extend(inputs.clone().into_vec());
        HeadOutputs::try_from_vec(self.temporal.run(&values)?)
    }
}

fn expect_ports(graph: &Graph, inputs: &[&str], outputs: &[&str]) -> Result<(), Error> {
    if graph.input_names() != inputs || graph.output_names() != outputs {
        return Err(graph.invalid(format!(
            "ports {:?} -> {:?}, expected {:?} -> {:?}",
            graph.input_names(),
            graph.output_names(),
            inputs,
            outputs
        )));
    }
    Ok(())
}
