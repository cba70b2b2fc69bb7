use std::collections::HashMap;

use tracing::debug;

use super::{Graph, Node, Port, Source, TensorId};
use crate::backend::{kernels, Op};
use crate::error::Error;
use crate::tensor::Value;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimplifyStats {
    pub folded: usize,
    pub identities: usize,
    pub deduplicated: usize,
    pub removed: usize,
}

/// Constant folding, identity elimination, common-subexpression elimination and dead-node
/// removal, followed by renumbering of the surviving tensors.
pub fn simplify(graph: &mut Graph) -> Result<SimplifyStats, Error> {
    let mut stats = SimplifyStats::default();
    let before = graph.nodes.len();

    let mut alias: Vec<TensorId> = (0..graph.tensors.len()).collect();
    let mut dead = vec![false; graph.nodes.len()];
    let mut seen: HashMap<(String, Vec<TensorId>), Vec<TensorId>> = HashMap::new();

    for index in 0..graph.nodes.len() {
        let inputs: Vec<TensorId> = graph.nodes[index].inputs.iter().map(|&t| alias[t]).collect();
        graph.nodes[index].inputs = inputs.clone();
        let node = &graph.nodes[index];

        if let Some(source) = identity_source(graph, node) {
            alias[node.outputs[0]] = source;
            dead[index] = true;
            stats.identities += 1;
            continue;
        }

        let constant_inputs = inputs
            .iter()
            .map(|&t| match &graph.tensors[t].source {
                Source::Constant(value) => Some(value),
                _ => None,
            })
            .collect::<Option<Vec<&Value>>>();

        if let Some(args) = constant_inputs {
            let folded = kernels::eval(&node.op, &args)?;
            let outputs = node.outputs.clone();
            for (id, value) in outputs.into_iter().zip(folded) {
                graph.tensors[id].source = Source::Constant(value);
            }
            dead[index] = true;
            stats.folded += 1;
            continue;
        }

        let key = (format!("{:?}", node.op), inputs);
        match seen.get(&key) {
            Some(previous) => {
                for (&out, &prev) in node.outputs.iter().zip(previous) {
                    alias[out] = prev;
                }
                dead[index] = true;
                stats.deduplicated += 1;
            }
            None => {
                seen.insert(key, node.outputs.clone());
            }
        }
    }

    for port in graph.outputs.iter_mut() {
        port.tensor = alias[port.tensor];
    }

    eliminate_dead(graph, &mut dead);
    compact(graph, &dead);

    stats.removed = before - graph.nodes.len();
    debug!(
        graph = %graph.name,
        folded = stats.folded,
        identities = stats.identities,
        deduplicated = stats.deduplicated,
        removed = stats.removed,
        nodes = graph.nodes.len(),
        "simplified graph"
    );

    Ok(stats)
}

/// Input the node passes through unchanged, if it is a no-op.
fn identity_source(graph: &Graph, node: &Node) -> Option<TensorId> {
    let input = *node.inputs.first()?;
    let meta = &graph.tensors[input].meta;

    let is_identity = match &node.op {
        Op::Reshape { shape } => *shape == meta.shape,
        Op::Permute { axes } => axes.iter().enumerate().all(|(i, &a)| i == a),
        Op::Slice { axis, start, end } => *start == 0 && *end == meta.shape[*axis],
        Op::Concat { .. } => node.inputs.len() == 1,
        _ => false,
    };

    is_identity.then_some(input)
}

fn eliminate_dead(graph: &Graph, dead: &mut [bool]) {
    let mut live = vec![false; graph.tensors.len()];
    for port in &graph.outputs {
        live[port.tensor] = true;
    }

    for (index, node) in graph.nodes.iter().enumerate().rev() {
        if dead[index] || !node.outputs.iter().any(|&t| live[t]) {
            dead[index] = true;
            continue;
        }
        for &t in &node.inputs {
            live[t] = true;
        }
    }
}

fn compact(graph: &mut Graph, dead: &[bool]) {
    let mut used = vec![false; graph.tensors.len()];
    for port in graph.inputs.iter().chain(graph.outputs.iter()) {
        used[port.tensor] = true;
    }
    for (node, _) in graph.nodes.iter().zip(dead).filter(|(_, d)| !**d) {
        for &t in node.inputs.iter().chain(node.outputs.iter()) {
            used[t] = true;
        }
    }

    let mut remap = vec![usize::MAX; graph.tensors.len()];
    let mut node_remap = vec![usize::MAX; graph.nodes.len()];
    let mut next_node = 0;
    for (index, &d) in dead.iter().enumerate() {
        if !d {
            node_remap[index] = next_node;
            next_node += 1;
        }
    }

    let tensors = std::mem::take(&mut graph.tensors);
    for (id, mut info) in tensors.into_iter().enumerate() {
        if !used[id] {
            continue;
        }
        if let Source::Node(index) = info.source {
            info.source = Source::Node(node_remap[index]);
        }
        remap[id] = graph.tensors.len();
        graph.tensors.push(info);
    }

    let nodes = std::mem::take(&mut graph.nodes);
    graph.nodes = nodes
        .into_iter()
        .zip(dead)
        .filter(|(_, d)| !**d)
        .map(|(node, _)| Node {
            op: node.op,
            inputs: node.inputs.iter().map(|&t| remap[t]).collect(),
            outputs: node.outputs.iter().map(|&t| remap[t]).collect(),
        })
        .collect();

    let rename = |ports: &mut Vec<Port>| {
        for port in ports.iter_mut() {
            port.tensor = remap[port.tensor];
        }
    };
    rename(&mut graph.inputs);
    rename(&mut graph.outputs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, Tracer};
    use crate::graph::check;
    use crate::tensor::TensorMeta;

    #[test]
    fn folds_constants_and_drops_identities() {
        let tracer = Tracer::new("fold");
        let x = tracer.input("x", TensorMeta::f32(vec![2, 3]));

        let a = tracer.scalar(2.0).unwrap();
        let b = tracer.scalar(3.0).unwrap();
        let c = tracer.mul(&a, &b).unwrap();
        let y = tracer.reshape(&x, &[2, 3]).unwrap();
        let y = tracer.mul(&y, &c).unwrap();
        let graph_out = tracer.permute(&y, &[0, 1]).unwrap();

        let mut graph = tracer.finish(&[("y", &graph_out)]);
        let stats = simplify(&mut graph).unwrap();

        assert_eq!(stats.folded, 1);
        assert_eq!(stats.identities, 2);
        assert_eq!(graph.nodes.len(), 1);
        check(&graph).unwrap();

        let x = Value::full_f32(&[2, 3], 1.5);
        let out = graph.run(&[x]).unwrap();
        assert_eq!(out[0], Value::full_f32(&[2, 3], 9.0));
    }

    #[test]
    fn merges_duplicates_and_removes_dead_nodes() {
        let tracer = Tracer::new("cse");
        let x = tracer.input("x", TensorMeta::f32(vec![4]));

        let a = tracer.relu(&x).unwrap();
        let b = tracer.relu(&x).unwrap();
        let _unused = tracer.exp(&x).unwrap();
        let y = tracer.add(&a, &b).unwrap();

        let mut graph = tracer.finish(&[("y", &y)]);
        let stats = simplify(&mut graph).unwrap();

        assert_eq!(stats.deduplicated, 1);
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.nodes[1].inputs[0], graph.nodes[1].inputs[1]);
        check(&graph).unwrap();
    }
}
