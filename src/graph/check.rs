use std::collections::HashSet;

use super::{infer, Graph, Source};
use crate::error::Error;

/// Structural validation of a graph before it is persisted or executed.
pub fn check(graph: &Graph) -> Result<(), Error> {
    let count = graph.tensors.len();
    let mut defined = vec![false; count];
    let mut producer: Vec<Option<usize>> = vec![None; count];

    for (id, info) in graph.tensors.iter().enumerate() {
        match &info.source {
            Source::Input => {}
            Source::Constant(value) => {
                if value.meta() != info.meta {
                    return Err(graph.invalid(format!(
                        "constant {} holds {} but is recorded as {}",
                        id,
                        value.meta(),
                        info.meta
                    )));
                }
                defined[id] = true;
            }
            Source::Node(index) => {
                let listed = graph
                    .nodes
                    .get(*index)
                    .map_or(false, |node| node.outputs.contains(&id));
                if !listed {
                    return Err(graph.invalid(format!(
                        "tensor {} claims node {} as producer",
                        id, index
                    )));
                }
            }
        }
    }

    let mut names = HashSet::new();
    for port in &graph.inputs {
        if !names.insert(port.name.as_str()) {
            return Err(graph.invalid(format!("duplicate input `{}`", port.name)));
        }
        match graph.tensors.get(port.tensor).map(|t| &t.source) {
            Some(Source::Input) => defined[port.tensor] = true,
            _ => {
                return Err(graph.invalid(format!(
                    "input `{}` is not bound to an input tensor",
                    port.name
                )))
            }
        }
    }

    for (index, node) in graph.nodes.iter().enumerate() {
        let mut metas = Vec::with_capacity(node.inputs.len());
        for &t in &node.inputs {
            if t >= count || !defined[t] {
                return Err(graph.invalid(format!(
                    "node {} ({}) reads tensor {} before it is defined",
                    index, node.op, t
                )));
            }
            metas.push(&graph.tensors[t].meta);
        }

        let inferred = infer(&node.op, &metas).map_err(|e| {
            graph.invalid(format!("node {} ({}) is ill-typed: {}", index, node.op, e))
        })?;
        if inferred.len() != node.outputs.len() {
            return Err(graph.invalid(format!(
                "node {} ({}) has {} outputs, expected {}",
                index,
                node.op,
                node.outputs.len(),
                inferred.len()
            )));
        }

        for (&t, meta) in node.outputs.iter().zip(&inferred) {
            if t >= count {
                return Err(graph.invalid(format!("node {} writes unknown tensor {}", index, t)));
            }
            if producer[t].replace(index).is_some() || graph.tensors[t].source != Source::Node(index) {
                return Err(graph.invalid(format!("tensor {} has more than one producer", t)));
            }
            if graph.tensors[t].meta != *meta {
                return Err(graph.invalid(format!(
                    "node {} ({}) records {} but infers {}",
                    index, node.op, graph.tensors[t].meta, meta
                )));
            }
            defined[t] = true;
        }
    }

    if graph.outputs.is_empty() {
        return Err(graph.invalid("graph has no outputs"));
    }

    let mut names = HashSet::new();
    for port in &graph.outputs {
        if !names.insert(port.name.as_str()) {
            return Err(graph.invalid(format!("duplicate output `{}`", port.name)));
        }
        if port.tensor >= count || !defined[port.tensor] {
            return Err(graph.invalid(format!(
                "output `{}` refers to an undefined tensor",
                port.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, Tracer};
    use crate::tensor::TensorMeta;

    fn small_graph() -> Graph {
        let tracer = Tracer::new("small");
        let x = tracer.input("x", TensorMeta::f32(vec![2, 3]));
        let y = tracer.sigmoid(&x).unwrap();
        let z = tracer.reduce_sum(&y, 1).unwrap();
        tracer.finish(&[("y", &y), ("z", &z)])
    }

    #[test]
    fn accepts_traced_graph() {
        check(&small_graph()).unwrap();
    }

    #[test]
    fn rejects_out_of_order_nodes() {
        let mut graph = small_graph();
        graph.nodes.swap(0, 1);
        assert!(matches!(check(&graph), Err(Error::InvalidGraph { .. })));
    }

    #[test]
    fn rejects_tampered_metadata() {
        let mut graph = small_graph();
        let z = graph.outputs[1].tensor;
        graph.tensors[z].meta = TensorMeta::f32(vec![3]);
        assert!(check(&graph).is_err());
    }

    #[test]
    fn rejects_duplicate_output_names() {
        let mut graph = small_graph();
        graph.outputs[1].name = "y".to_string();
        assert!(check(&graph).is_err());
    }
}
