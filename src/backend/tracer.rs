use std::cell::RefCell;

use super::{Backend, Op};
use crate::error::Error;
use crate::graph::{Graph, TensorId};
use crate::tensor::{TensorMeta, Value};

/// Symbolic tensor handed out while tracing: only the id and the static metadata are known.
#[derive(Debug, Clone, PartialEq)]
pub struct Traced {
    pub id: TensorId,
    pub meta: TensorMeta,
}

/// Records every applied op as a node of a static [`Graph`] instead of computing it.
pub struct Tracer {
    graph: RefCell<Graph>,
}

impl Tracer {
    pub fn new(name: &str) -> Self {
        Self {
            graph: RefCell::new(Graph::new(name)),
        }
    }

    pub fn input(&self, name: &str, meta: TensorMeta) -> Traced {
        let id = self.graph.borrow_mut().add_input(name, meta.clone());
        Traced { id, meta }
    }

    pub fn finish(self, outputs: &[(&str, &Traced)]) -> Graph {
        let mut graph = self.graph.into_inner();
        for (name, tensor) in outputs {
            graph.add_output(name, tensor.id);
        }
        graph
    }
}

impl Backend for Tracer {
    type Tensor = Traced;

    #[inline]
    fn meta(&self, tensor: &Traced) -> TensorMeta {
        tensor.meta.clone()
    }

    fn constant(&self, value: Value) -> Result<Traced, Error> {
        let meta = value.meta();
        let id = self.graph.borrow_mut().add_constant(value);
        Ok(Traced { id, meta })
    }

    fn apply(&self, op: Op, inputs: &[&Traced]) -> Result<Vec<Traced>, Error> {
        let ids: Vec<TensorId> = inputs.iter().map(|t| t.id).collect();
        let mut graph = self.graph.borrow_mut();
        let outputs = graph.add_node(op, ids)?;

        Ok(outputs
            .into_iter()
            .map(|id| Traced {
                id,
                meta: graph.tensors[id].meta.clone(),
            })
            .collect())
    }
}
