//! Static inference graph recorded by the [`Tracer`](crate::backend::Tracer).
//!
//! A graph is a flat list of tensors and nodes in topological order. Each tensor is either a
//! named input, an embedded constant or the output of exactly one node, and every tensor carries
//! the metadata inferred when it was recorded.

mod check;
mod shape;
mod simplify;

pub use check::check;
pub use shape::infer;
pub use simplify::{simplify, SimplifyStats};

use serde_derive::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::backend::{kernels, Op};
use crate::error::Error;
use crate::tensor::{TensorMeta, Value};

pub type TensorId = usize;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Source {
    Input,
    Constant(Value),
    /// Output of `nodes[index]`.
    Node(usize),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub meta: TensorMeta,
    pub source: Source,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Port {
    pub name: String,
    pub tensor: TensorId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Graph {
    pub name: String,
    pub tensors: Vec<TensorInfo>,
    pub nodes: Vec<Node>,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
}

impl Graph {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tensors: Vec::new(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn add_input(&mut self, name: &str, meta: TensorMeta) -> TensorId {
        let id = self.push_tensor(meta, Source::Input);
        self.inputs.push(Port {
            name: name.to_string(),
            tensor: id,
        });
        id
    }

    pub fn add_constant(&mut self, value: Value) -> TensorId {
        self.push_tensor(value.meta(), Source::Constant(value))
    }

    /// Appends a node, inferring the metadata of its outputs.
    pub fn add_node(&mut self, op: Op, inputs: Vec<TensorId>) -> Result<Vec<TensorId>, Error> {
        let metas = inputs
            .iter()
            .map(|&id| {
                self.tensors
                    .get(id)
                    .map(|t| &t.meta)
                    .ok_or_else(|| self.invalid(format!("unknown tensor {} fed to {}", id, op)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let out_metas = infer(&op, &metas)?;
        let index = self.nodes.len();
        let outputs = out_metas
            .into_iter()
            .map(|meta| self.push_tensor(meta, Source::Node(index)))
            .collect::<Vec<_>>();

        self.nodes.push(Node {
            op,
            inputs,
            outputs: outputs.clone(),
        });

        Ok(outputs)
    }

    pub fn add_output(&mut self, name: &str, tensor: TensorId) {
        self.outputs.push(Port {
            name: name.to_string(),
            tensor,
        });
    }

    fn push_tensor(&mut self, meta: TensorMeta, source: Source) -> TensorId {
        self.tensors.push(TensorInfo { meta, source });
        self.tensors.len() - 1
    }

    pub(crate) fn invalid(&self, detail: impl Into<String>) -> Error {
        Error::InvalidGraph {
            graph: self.name.clone(),
            detail: detail.into(),
        }
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn num_constants(&self) -> usize {
        self.tensors
            .iter()
            .filter(|t| matches!(t.source, Source::Constant(_)))
            .count()
    }

    /// Replays the graph on host values given in input-port order, returning the outputs in
    /// output-port order.
    pub fn run(&self, inputs: &[Value]) -> Result<Vec<Value>, Error> {
        if inputs.len() != self.inputs.len() {
            return Err(self.invalid(format!(
                "expected {} inputs, got {}",
                self.inputs.len(),
                inputs.len()
            )));
        }

        let mut values: Vec<Option<Value>> = vec![None; self.tensors.len()];
        for (port, value) in self.inputs.iter().zip(inputs) {
            let expected = &self
                .tensors
                .get(port.tensor)
                .ok_or_else(|| self.invalid(format!("input `{}` has no tensor", port.name)))?
                .meta;
            if value.meta() != *expected {
                return Err(self.invalid(format!(
                    "input `{}` expects {}, got {}",
                    port.name,
                    expected,
                    value.meta()
                )));
            }
            *self.slot(&mut values, port.tensor)? = Some(value.clone());
        }

        for node in &self.nodes {
            let args = node
                .inputs
                .iter()
                .map(|&id| self.lookup(&values, id))
                .collect::<Result<Vec<_>, _>>()?;
            let results = kernels::eval(&node.op, &args)?;

            for (&id, value) in node.outputs.iter().zip(results) {
                *self.slot(&mut values, id)? = Some(value);
            }
        }

        self.outputs
            .iter()
            .map(|port| self.lookup(&values, port.tensor).map(Value::clone))
            .collect()
    }

    fn lookup<'a>(&'a self, values: &'a [Option<Value>], id: TensorId) -> Result<&'a Value, Error> {
        match self.tensors.get(id).map(|t| &t.source) {
            Some(Source::Constant(value)) => Ok(value),
            Some(_) => values
                .get(id)
                .and_then(Option::as_ref)
                .ok_or_else(|| self.invalid(format!("tensor {} read before it was produced", id))),
            None => Err(self.invalid(format!("unknown tensor {}", id))),
        }
    }

    fn slot<'a>(
        &self,
        values: &'a mut [Option<Value>],
        id: TensorId,
    ) -> Result<&'a mut Option<Value>, Error> {
        values
            .get_mut(id)
            .ok_or_else(|| self.invalid(format!("unknown tensor {}", id)))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, Eager, Tracer};

    fn affine<B: Backend>(b: &B, x: &B::Tensor) -> Result<B::Tensor, Error> {
        let w = b.constant(Value::from_f32(&[2, 2], vec![1.0, 2.0, 3.0, 4.0])?)?;
        let y = b.matmul(x, &w)?;
        let y = b.relu(&y)?;
        b.reshape(&y, &[4])
    }

    #[test]
    fn replay_matches_eager() {
        let x = Value::from_f32(&[2, 2], vec![1.0, -1.0, 0.5, 2.0]).unwrap();
        let eager = affine(&Eager, &x).unwrap();

        let tracer = Tracer::new("affine");
        let input = tracer.input("x", x.meta());
        let out = affine(&tracer, &input).unwrap();
        let graph = tracer.finish(&[("y", &out)]);

        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.run(&[x]).unwrap(), vec![eager]);
    }

    #[test]
    fn run_rejects_wrong_input_meta() {
        let tracer = Tracer::new("affine");
        let input = tracer.input("x", TensorMeta::f32(vec![2, 2]));
        let out = affine(&tracer, &input).unwrap();
        let graph = tracer.finish(&[("y", &out)]);

        let bad = Value::zeros(&[3, 2]);
        assert!(matches!(graph.run(&[bad]), Err(Error::InvalidGraph { .. })));
    }

    #[test]
    fn run_rejects_dangling_tensor_ids() {
        let x = Value::from_f32(&[2, 2], vec![1.0, -1.0, 0.5, 2.0]).unwrap();
        let tracer = Tracer::new("affine");
        let input = tracer.input("x", x.meta());
        let out = affine(&tracer, &input).unwrap();
        let graph = tracer.finish(&[("y", &out)]);

        let mut broken = graph.clone();
        broken.nodes[0].inputs[0] = 99;
        assert!(matches!(broken.run(&[x.clone()]), Err(Error::InvalidGraph { .. })));

        let mut broken = graph.clone();
        broken.nodes[1].outputs[0] = 99;
        assert!(matches!(broken.run(&[x.clone()]), Err(Error::InvalidGraph { .. })));

        let mut broken = graph;
        broken.outputs[0].tensor = 99;
        assert!(matches!(broken.run(&[x]), Err(Error::InvalidGraph { .. })));
    }
}
