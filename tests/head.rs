use ndarray::s;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sparse4d_head::backend::{Eager, Op};
use sparse4d_head::bank::InstanceBank;
use sparse4d_head::config::{DeformableConfig, ExportConfig, HeadConfig};
use sparse4d_head::export::DummyInputs;
use sparse4d_head::graph::{check, simplify, Graph};
use sparse4d_head::head::{
    FeatureMaps, HeadInputs, Projection, TemporalInputs, FIRST_FRAME_OUTPUTS, TEMPORAL_OUTPUTS,
};
use sparse4d_head::nn::uniform;
use sparse4d_head::tensor::{DType, TensorMeta, Value};
use sparse4d_head::topk::top_k;
use sparse4d_head::Sparse4DHead;

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

fn build(config: &HeadConfig, export: &ExportConfig) -> (Sparse4DHead, DummyInputs) {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let head = Sparse4DHead::random(config, &mut rng).unwrap();
    let bank = InstanceBank::random(&config.bank, config.embed_dims, &mut rng);
    let mut rng = StdRng::seed_from_u64(export.seed);
    let dummy = DummyInputs::generate(&bank, config.embed_dims, export, &mut rng).unwrap();
    (head, dummy)
}

/// Input metadata of the full-size head without allocating any feature map.
fn full_size_metas(bs: usize) -> (HeadInputs<TensorMeta>, TemporalInputs<TensorMeta>) {
    let export = ExportConfig::default();
    let shapes = export.spatial_shapes();
    let cams = export.num_cams;
    let levels = shapes.len();
    let pixels = cams * shapes.iter().map(|[h, w]| h * w).sum::<usize>();

    let head = HeadInputs {
        instance_feature: TensorMeta::f32(vec![bs, 900, 256]),
        anchor: TensorMeta::f32(vec![bs, 900, 11]),
        time_interval: TensorMeta::f32(vec![bs]),
        maps: FeatureMaps {
            feature: TensorMeta::f32(vec![bs, pixels, 256]),
            spatial_shapes: TensorMeta::new(vec![cams, levels, 2], DType::I32),
            level_start_index: TensorMeta::new(vec![cams, levels], DType::I32),
        },
        projection: Projection {
            lidar2img: TensorMeta::f32(vec![bs, cams, 4, 4]),
            image_wh: TensorMeta::f32(vec![bs, cams, 2]),
        },
    };
    let temporal = TemporalInputs {
        temp_instance_feature: TensorMeta::f32(vec![bs, 600, 256]),
        temp_anchor: TensorMeta::f32(vec![bs, 600, 11]),
        mask: TensorMeta::new(vec![bs], DType::Bool),
        track_id: TensorMeta::new(vec![bs, 900], DType::I32),
    };
    (head, temporal)
}

fn output_shapes(graph: &Graph) -> Vec<Vec<usize>> {
    graph
        .outputs
        .iter()
        .map(|port| graph.tensors[port.tensor].meta.shape.clone())
        .collect()
}

#[test]
fn same_seed_builds_the_same_head() {
    let (config, export) = small();
    let (a, dummy) = build(&config, &export);
    let (b, _) = build(&config, &export);

    let x = a.forward_first(&Eager, &dummy.head).unwrap();
    let y = b.forward_first(&Eager, &dummy.head).unwrap();
    assert_eq!(x.instance_feature, y.instance_feature);
    assert_eq!(x.anchor, y.anchor);
    assert_eq!(x.class_score, y.class_score);
    assert_eq!(x.quality_score, y.quality_score);
}

#[test]
fn top_k_keeps_the_best_scores_in_order() {
    let mut rng = StdRng::seed_from_u64(11);
    let data: Vec<f32> = (0..40).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let scores = Value::from_f32(&[2, 20], data.clone()).unwrap();
    let feature = Value::from_f32(&[2, 20, 1], data).unwrap();
    let anchor = Value::zeros(&[2, 20, 11]);

    let sel = top_k(&Eager, &scores, 5, &feature, &anchor).unwrap();
    let all = scores.as_f32().unwrap();
    let picked = sel.scores.as_f32().unwrap();
    let indices = sel.indices.as_i32().unwrap();
    let gathered = sel.feature.as_f32().unwrap();

    assert_eq!(sel.anchor.shape(), &[2, 5, 11]);
    for b in 0..2 {
        for k in 0..5 {
            assert_eq!(picked[[b, k]], all[[b, indices[[b, k]] as usize]]);
            assert_eq!(gathered[[b, k, 0]], picked[[b, k]]);
            if k > 0 {
                assert!(picked[[b, k - 1]] >= picked[[b, k]]);
            }
        }
        let lowest = picked[[b, 4]];
        let above = (0..20).filter(|&n| all[[b, n]] > lowest).count();
        assert!(above <= 4);
    }
}

#[test]
fn restarting_samples_keep_their_pre_merge_state() {
    let (mut config, export) = small();
    config.operation_order = vec!["gnn".into(), "refine".into()];
    let (head, mut dummy) = build(&config, &export);

    let mut rng = StdRng::seed_from_u64(4);
    dummy.temporal = TemporalInputs {
        temp_instance_feature: uniform(&[2, 8, 16], -1.0, 1.0, &mut rng),
        temp_anchor: uniform(&[2, 8, 11], -1.0, 1.0, &mut rng),
        mask: Value::from_bool(&[2], vec![true, false]).unwrap(),
        track_id: Value::from_i32(&[2, 12], (0..24).collect()).unwrap(),
    };

    let first = head.forward_first(&Eager, &dummy.head).unwrap();
    let out = head
        .forward_temporal(&Eager, &dummy.temporal, &dummy.head)
        .unwrap();

    let ids = out.track_id.as_ref().unwrap().as_i32().unwrap();
    assert!(ids.slice(s![1, ..]).iter().all(|&id| id == -1));
    assert_eq!(
        ids.slice(s![0, ..]).to_vec(),
        (0..12).collect::<Vec<i32>>()
    );

    let feature = out.instance_feature.as_f32().unwrap();
    let anchor = out.anchor.as_f32().unwrap();
    assert_eq!(
        feature.slice(s![1, .., ..]),
        first.instance_feature.as_f32().unwrap().slice(s![1, .., ..])
    );
    assert_eq!(
        anchor.slice(s![1, .., ..]),
        first.anchor.as_f32().unwrap().slice(s![1, .., ..])
    );

    assert_eq!(
        feature.slice(s![0, ..8, ..]),
        dummy.temporal.temp_instance_feature.as_f32().unwrap().slice(s![0, .., ..])
    );
    assert_eq!(
        anchor.slice(s![0, ..8, ..]),
        dummy.temporal.temp_anchor.as_f32().unwrap().slice(s![0, .., ..])
    );
}

#[test]
fn full_temporal_pool_carries_the_cache_over() {
    let (mut config, export) = small();
    config.operation_order = vec!["gnn".into(), "refine".into()];
    config.bank.num_anchor = 8;
    let (head, mut dummy) = build(&config, &export);

    let mut rng = StdRng::seed_from_u64(5);
    dummy.temporal = TemporalInputs {
        temp_instance_feature: uniform(&[2, 8, 16], -1.0, 1.0, &mut rng),
        temp_anchor: uniform(&[2, 8, 11], -1.0, 1.0, &mut rng),
        mask: Value::from_bool(&[2], vec![true, false]).unwrap(),
        track_id: Value::from_i32(&[2, 8], (0..16).collect()).unwrap(),
    };

    let first = head.forward_first(&Eager, &dummy.head).unwrap();
    let out = head
        .forward_temporal(&Eager, &dummy.temporal, &dummy.head)
        .unwrap();

    let feature = out.instance_feature.as_f32().unwrap();
    let anchor = out.anchor.as_f32().unwrap();
    assert_eq!(feature.shape(), &[2, 8, 16]);
    assert_eq!(
        feature.slice(s![0, .., ..]),
        dummy.temporal.temp_instance_feature.as_f32().unwrap().slice(s![0, .., ..])
    );
    assert_eq!(
        anchor.slice(s![0, .., ..]),
        dummy.temporal.temp_anchor.as_f32().unwrap().slice(s![0, .., ..])
    );
    assert_eq!(
        feature.slice(s![1, .., ..]),
        first.instance_feature.as_f32().unwrap().slice(s![1, .., ..])
    );
    assert_eq!(
        anchor.slice(s![1, .., ..]),
        first.anchor.as_f32().unwrap().slice(s![1, .., ..])
    );

    let ids = out.track_id.as_ref().unwrap().as_i32().unwrap();
    assert_eq!(ids.slice(s![0, ..]).to_vec(), (0..8).collect::<Vec<i32>>());
    assert!(ids.slice(s![1, ..]).iter().all(|&id| id == -1));

    let graph = head
        .trace_temporal(
            "temporal",
            &dummy.temporal.map(Value::meta),
            &dummy.head.map(Value::meta),
        )
        .unwrap();
    assert!(!graph
        .nodes
        .iter()
        .any(|node| matches!(node.op, Op::TopK { .. })));
}

#[test]
fn full_size_first_frame_graph_shapes() {
    let mut rng = StdRng::seed_from_u64(0);
    let head = Sparse4DHead::random(&HeadConfig::default(), &mut rng).unwrap();
    let (inputs, _) = full_size_metas(2);

    assert_eq!(head.num_classes(), 10);
    assert_eq!(head.snapshot().num_anchor, 900);
    assert_eq!(head.sequence().len(), 39);

    let graph = head.trace_first("first", &inputs).unwrap();
    assert_eq!(graph.output_names(), FIRST_FRAME_OUTPUTS);
    assert_eq!(
        output_shapes(&graph),
        vec![
            vec![2, 900, 256],
            vec![2, 900, 11],
            vec![2, 900, 10],
            vec![2, 900, 2],
        ]
    );
    assert!(!graph
        .nodes
        .iter()
        .any(|node| matches!(node.op, Op::TopK { .. })));
}

#[test]
fn full_size_temporal_merge_selects_three_hundred() {
    let mut rng = StdRng::seed_from_u64(0);
    let head = Sparse4DHead::random(&HeadConfig::default(), &mut rng).unwrap();
    let (inputs, temporal) = full_size_metas(1);

    let graph = head.trace_temporal("temporal", &temporal, &inputs).unwrap();
    assert_eq!(graph.output_names(), TEMPORAL_OUTPUTS);

    let selections: Vec<_> = graph
        .nodes
        .iter()
        .filter(|node| matches!(node.op, Op::TopK { .. }))
        .collect();
    assert_eq!(selections.len(), 1);
    assert_eq!(selections[0].op, Op::TopK { k: 300 });
    assert_eq!(graph.tensors[selections[0].outputs[1]].meta.shape, vec![1, 300]);

    let rebuilt = graph.nodes.iter().any(|node| {
        matches!(node.op, Op::Concat { axis: 1 })
            && graph.tensors[node.outputs[0]].meta.shape == vec![1, 900, 256]
    });
    assert!(rebuilt);

    let shapes = output_shapes(&graph);
    assert_eq!(shapes[0], vec![1, 900, 256]);
    assert_eq!(shapes[4], vec![1, 900]);
    assert_eq!(graph.tensors[graph.outputs[4].tensor].meta.dtype, DType::I32);
}

#[test]
fn saved_graph_replays_bit_identically() {
    let (config, export) = small();
    let (head, dummy) = build(&config, &export);

    let mut graph = head
        .trace_temporal(
            "temporal",
            &dummy.temporal.map(Value::meta),
            &dummy.head.map(Value::meta),
        )
        .unwrap();
    simplify(&mut graph).unwrap();
    check(&graph).unwrap();

    let path = std::env::temp_dir().join(format!("sparse4d-roundtrip-{}.json", std::process::id()));
    graph.save(&path).unwrap();
    let loaded = Graph::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(loaded, graph);

    let mut inputs = dummy.temporal.clone().into_vec();
    inputs.extend(dummy.head.clone().into_vec());
    assert_eq!(loaded.run(&inputs).unwrap(), graph.run(&inputs).unwrap());

    let eager = head
        .forward_temporal(&Eager, &dummy.temporal, &dummy.head)
        .unwrap();
    let replayed = loaded.run(&inputs).unwrap();
    assert_eq!(replayed[4], *eager.track_id.as_ref().unwrap());
}
