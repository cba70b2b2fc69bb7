//! Static-graph export of both decoder heads.
//!
//! Each head is traced on dummy inputs, simplified and checked. Both graphs must pass before
//! either is written, so a failed export never leaves a partial result behind.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::anchor::ANCHOR_DIM;
use crate::backend::Eager;
use crate::bank::InstanceBank;
use crate::config::{ExportConfig, HeadConfig};
use crate::error::Error;
use crate::graph::{check, simplify, Graph, SimplifyStats};
use crate::head::{FeatureMaps, HeadInputs, HeadOutputs, Projection, Sparse4DHead, TemporalInputs};
use crate::nn::uniform;
use crate::tensor::{level_start_index, Value};

pub const FIRST_FRAME_GRAPH: &str = "sparse4d_head_first_frame";
pub const TEMPORAL_GRAPH: &str = "sparse4d_head_temporal";

/// Largest deviation tolerated between the exported graph and the eager head.
pub const VERIFY_TOLERANCE: f32 = 1e-3;

/// Inputs used for tracing and verification.
#[derive(Debug, Clone)]
pub struct DummyInputs {
    pub head: HeadInputs<Value>,
    pub temporal: TemporalInputs<Value>,
}

impl DummyInputs {
    /// Learned bank state for every sample, an empty temporal cache with a random
    /// continuation mask and random camera features and projections.
    pub fn generate(
        bank: &InstanceBank,
        embed_dims: usize,
        config: &ExportConfig,
        rng: &mut impl Rng,
    ) -> Result<Self, Error> {
        let snapshot = bank.snapshot();
        let bs = config.batch_size;
        let cams = config.num_cams;
        let shapes = config.spatial_shapes();
        let levels = shapes.len();
        let feature_size = cams * shapes.iter().map(|[h, w]| h * w).sum::<usize>();

        let (instance_feature, anchor) = bank.learned(bs);
        let mask = (0..bs).map(|_| rng.gen_bool(0.5)).collect();
        let feature = uniform(&[bs, feature_size, embed_dims], -1.0, 1.0, rng);
        let lidar2img = uniform(&[bs, cams, 4, 4], -1.0, 1.0, rng);

        let spatial_shapes = shapes
            .iter()
            .cycle()
            .take(cams * levels)
            .flat_map(|[h, w]| [*h as i32, *w as i32])
            .collect();
        let image_wh = (0..bs * cams)
            .flat_map(|_| [config.input_w as f32, config.input_h as f32])
            .collect();

        Ok(Self {
            head: HeadInputs {
                instance_feature,
                anchor,
                time_interval: Value::full_f32(&[bs], snapshot.default_time_interval),
                maps: FeatureMaps {
                    feature,
                    spatial_shapes: Value::from_i32(&[cams, levels, 2], spatial_shapes)?,
                    level_start_index: Value::from_i32(
                        &[cams, levels],
                        level_start_index(&shapes, cams),
                    )?,
                },
                projection: Projection {
                    lidar2img,
                    image_wh: Value::from_f32(&[bs, cams, 2], image_wh)?,
                },
            },
            temporal: TemporalInputs {
                temp_instance_feature: Value::zeros(&[bs, snapshot.num_temp_instances, embed_dims]),
                temp_anchor: Value::zeros(&[bs, snapshot.num_temp_instances, ANCHOR_DIM]),
                mask: Value::from_bool(&[bs], mask)?,
                track_id: Value::full_i32(&[bs, snapshot.num_anchor], -1),
            },
        })
    }

    pub fn log(&self, device: impl std::fmt::Display) {
        let named = self.head.named().into_iter().chain(self.temporal.named());
        for (name, value) in named {
            debug!(
                "dummy_{}\t:\tshape={:?},\tdtype={},\tdevice={}",
                name,
                value.shape(),
                value.dtype(),
                device
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub save_first: PathBuf,
    pub save_second: PathBuf,
    /// Skips the first-frame head.
    pub only_second: bool,
    /// Replays each simplified graph and compares it with the eager head.
    pub verify: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            save_first: PathBuf::from("deploy/graphs/sparse4dhead1st_frame.json"),
            save_second: PathBuf::from("deploy/graphs/sparse4dhead2nd.json"),
            only_second: false,
            verify: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportedGraph {
    pub path: PathBuf,
    pub nodes: usize,
    pub constants: usize,
    pub stats: SimplifyStats,
    pub max_abs_diff: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub first: Option<ExportedGraph>,
    pub second: ExportedGraph,
}

/// Builds the head and bank from `head_config` and exports both graphs.
pub fn export(
    head_config: &HeadConfig,
    export_config: &ExportConfig,
    options: &ExportOptions,
) -> Result<ExportReport, Error> {
    head_config.validate()?;
    export_config.validate(head_config)?;

    let mut rng = StdRng::seed_from_u64(head_config.seed);
    let head = Sparse4DHead::random(head_config, &mut rng)?;
    let bank = InstanceBank::random(&head_config.bank, head_config.embed_dims, &mut rng);

    export_head(&head, &bank, export_config, options)
}

pub fn export_head(
    head: &Sparse4DHead,
    bank: &InstanceBank,
    export_config: &ExportConfig,
    options: &ExportOptions,
) -> Result<ExportReport, Error> {
    let mut rng = StdRng::seed_from_u64(export_config.seed);
    let dummy = DummyInputs::generate(bank, head.embed_dims(), export_config, &mut rng)?;
    dummy.log(head.device());

    let first = if options.only_second {
        None
    } else {
        info!("Export {} graph", FIRST_FRAME_GRAPH);
        let graph = head.trace_first(FIRST_FRAME_GRAPH, &dummy.head.map(Value::meta))?;
        let reference = if options.verify {
            Some(head.forward_first(&Eager, &dummy.head)?)
        } else {
            None
        };
        Some(finalize(graph, dummy.head.clone().into_vec(), reference)?)
    };

    info!("Export {} graph", TEMPORAL_GRAPH);
    let graph = head.trace_temporal(
        TEMPORAL_GRAPH,
        &dummy.temporal.map(Value::meta),
        &dummy.head.map(Value::meta),
    )?;
    let reference = if options.verify {
        Some(head.forward_temporal(&Eager, &dummy.temporal, &dummy.head)?)
    } else {
        None
    };
    let mut inputs = dummy.temporal.clone().into_vec();
    inputs.extend(dummy.head.clone().into_vec());
    let second = finalize(graph, inputs, reference)?;

    let first = match first {
        Some((graph, summary)) => Some(persist(&graph, summary, &options.save_first)?),
        None => None,
    };
    let second = persist(&second.0, second.1, &options.save_second)?;

    Ok(ExportReport { first, second })
}

struct Summary {
    nodes: usize,
    constants: usize,
    stats: SimplifyStats,
    max_abs_diff: Option<f32>,
}

fn finalize(
    mut graph: Graph,
    inputs: Vec<Value>,
    reference: Option<HeadOutputs<Value>>,
) -> Result<(Graph, Summary), Error> {
    let stats = simplify(&mut graph)?;
    check(&graph)?;
    debug!(
        graph = %graph.name,
        nodes = graph.nodes.len(),
        constants = graph.num_constants(),
        ?stats,
        "simplified graph"
    );

    let max_abs_diff = match reference {
        Some(reference) => {
            let replayed = graph.run(&inputs)?;
            let mut worst = 0.0f32;
            for ((name, expected), found) in reference.named().into_iter().zip(&replayed) {
                let diff = match expected {
                    Value::F32(_) => expected.max_abs_diff(found)?,
                    _ if expected == found => 0.0,
                    _ => f32::INFINITY,
                };
                debug!(graph = %graph.name, output = name, diff, "verified output");
                worst = worst.max(diff);
            }
            if !(worst < VERIFY_TOLERANCE) {
                return Err(graph.invalid(format!(
                    "replay deviates from the eager head by {}",
                    worst
                )));
            }
            Some(worst)
        }
        None => None,
    };

    let summary = Summary {
        nodes: graph.nodes.len(),
        constants: graph.num_constants(),
        stats,
        max_abs_diff,
    };
    Ok((graph, summary))
}

fn persist(graph: &Graph, summary: Summary, path: &Path) -> Result<ExportedGraph, Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    graph.save(path)?;
    info!("Export completed. Graph `{}` saved in {:?}", graph.name, path);

    Ok(ExportedGraph {
        path: path.to_path_buf(),
        nodes: summary.nodes,
        constants: summary.constants,
        stats: summary.stats,
        max_abs_diff: summary.max_abs_diff,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeformableConfig;

    fn small() -> (HeadConfig, ExportConfig) {
        let mut head = HeadConfig {
            embed_dims: 16,
            num_heads: 2,
            num_classes: 3,
            deformable: DeformableConfig {
                num_groups: 2,
                num_cams: 2,
                num_levels: 2,
                ..Default::default()
            },
            ..HeadConfig::default()
        };
        head.bank.num_anchor = 12;
        head.bank.num_temp_instances = 8;
        head.ffn.feedforward_channels = 32;

        let export = ExportConfig {
            batch_size: 2,
            num_cams: 2,
            input_h: 32,
            input_w: 64,
            strides: vec![8, 16],
            seed: 3,
        };
        (head, export)
    }

    #[test]
    fn dummy_inputs_have_graph_shapes() {
        let (head, export) = small();
        let mut rng = StdRng::seed_from_u64(0);
        let bank = InstanceBank::random(&head.bank, head.embed_dims, &mut rng);
        let dummy = DummyInputs::generate(&bank, 16, &export, &mut rng).unwrap();

        assert_eq!(dummy.head.maps.feature.shape(), &[2, 2 * (4 * 8 + 2 * 4), 16]);
        assert_eq!(
            dummy.head.maps.level_start_index,
            Value::from_i32(&[2, 2], vec![0, 32, 40, 72]).unwrap()
        );
        assert_eq!(dummy.temporal.track_id, Value::full_i32(&[2, 12], -1));
        assert_eq!(dummy.temporal.temp_anchor.shape(), &[2, 8, ANCHOR_DIM]);
        assert_eq!(
            dummy.head.projection.image_wh.as_f32().unwrap()[[1, 1, 0]],
            64.0
        );
    }

    #[test]
    fn exports_small_head_and_verifies_replay() {
        let (mut head, export) = small();
        head.operation_order = vec!["gnn".into(), "refine".into()];
        let mut rng = StdRng::seed_from_u64(head.seed);
        let model = Sparse4DHead::random(&head, &mut rng).unwrap();
        let bank = InstanceBank::random(&head.bank, head.embed_dims, &mut rng);

        let dir = std::env::temp_dir().join(format!("sparse4d-export-{}", std::process::id()));
        let options = ExportOptions {
            save_first: dir.join("first.json"),
            save_second: dir.join("second.json"),
            only_second: false,
            verify: true,
        };
        let report = export_head(&model, &bank, &export, &options).unwrap();
        assert!(report.first.is_some());
        assert!(report.second.max_abs_diff.unwrap() < VERIFY_TOLERANCE);
        assert!(options.save_second.exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn nan_in_replay_fails_verification() {
        let (mut head, export) = small();
        head.operation_order = vec!["gnn".into(), "refine".into()];
        let mut rng = StdRng::seed_from_u64(0);
        let model = Sparse4DHead::random(&head, &mut rng).unwrap();
        let bank = InstanceBank::random(&head.bank, head.embed_dims, &mut rng);
        let dummy = DummyInputs::generate(&bank, 16, &export, &mut rng).unwrap();

        let graph = model
            .trace_first(FIRST_FRAME_GRAPH, &dummy.head.map(Value::meta))
            .unwrap();
        let mut reference = model.forward_first(&Eager, &dummy.head).unwrap();
        if let Value::F32(scores) = &mut reference.class_score {
            scores[[0, 0, 0]] = f32::NAN;
        }

        assert!(matches!(
            finalize(graph, dummy.head.into_vec(), Some(reference)),
            Err(Error::InvalidGraph { .. })
        ));
    }

    #[test]
    fn tampered_graph_fails_before_saving() {
        let (mut head, export) = small();
        head.operation_order = vec!["gnn".into(), "refine".into()];
        let mut rng = StdRng::seed_from_u64(0);
        let model = Sparse4DHead::random(&head, &mut rng).unwrap();
        let bank = InstanceBank::random(&head.bank, head.embed_dims, &mut rng);
        let dummy = DummyInputs::generate(&bank, 16, &export, &mut rng).unwrap();

        let mut graph = model
            .trace_first(FIRST_FRAME_GRAPH, &dummy.head.map(Value::meta))
            .unwrap();
        let last = graph.outputs[0].tensor;
        graph.tensors[last].meta.shape.push(1);

        assert!(matches!(
            finalize(graph, dummy.head.into_vec(), None),
            Err(Error::InvalidGraph { .. })
        ));
    }
}
