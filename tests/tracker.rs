use nalgebra as na;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;
use std::f32::consts::FRAC_PI_2;

use sparse4d_head::backend::Eager;
use sparse4d_head::config::{DecoderConfig, DeformableConfig, ExportConfig, HeadConfig};
use sparse4d_head::decoder::SparseBox3DDecoder;
use sparse4d_head::export::DummyInputs;
use sparse4d_head::frame::Camera;
use sparse4d_head::head::FIRST_FRAME_INPUTS;
use sparse4d_head::nn::uniform;
use sparse4d_head::parallel::{Batch, DataContainer, DataParallel, Device, Inputs};
use sparse4d_head::tensor::Value;
use sparse4d_head::{Frame, GraphExecutor, InstanceBank, Sparse4DHead, SparseTracker, Tracking};

const SPATIAL_SHAPES: [[usize; 2]; 2] = [[4, 8], [2, 4]];

fn small() -> HeadConfig {
    let mut config = HeadConfig {
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
    config.operation_order.truncate(4 + 7);
    config.bank.num_anchor = 12;
    config.bank.num_temp_instances = 8;
    config.ffn.feedforward_channels = 32;
    config
}

fn frames(count: usize, rng: &mut StdRng) -> Vec<Frame> {
    let front = na::Isometry3::from_parts(
        na::Translation3::new(1.5, 0.0, 1.6),
        na::UnitQuaternion::from_euler_angles(-FRAC_PI_2, 0.0, -FRAC_PI_2),
    );
    let back = na::Isometry3::from_parts(
        na::Translation3::new(-1.0, 0.0, 1.6),
        na::UnitQuaternion::from_euler_angles(-FRAC_PI_2, 0.0, FRAC_PI_2),
    );
    let pixels = 2 * SPATIAL_SHAPES.iter().map(|[h, w]| h * w).sum::<usize>();

    (0..count)
        .map(|i| {
            let mut ego_to_global = na::Matrix4::identity();
            ego_to_global[(0, 3)] = i as f32;
            Frame {
                timestamp: i as f64 * 0.5,
                ego_to_global,
                cameras: vec![
                    Camera::pinhole(40.0, 40.0, 32.0, 16.0, &front, (64.0, 32.0)),
                    Camera::pinhole(40.0, 40.0, 32.0, 16.0, &back, (64.0, 32.0)),
                ],
                feature: uniform(&[pixels, 16], -1.0, 1.0, rng),
            }
        })
        .collect()
}

fn tracker<E: sparse4d_head::HeadExecutor>(executor: E, bank: InstanceBank) -> SparseTracker<E> {
    SparseTracker::new(
        executor,
        bank,
        SparseBox3DDecoder::new(DecoderConfig::default()),
        SPATIAL_SHAPES.to_vec(),
    )
}

#[test]
fn tracker_carries_ids_into_the_next_frame() {
    let config = small();
    let mut rng = StdRng::seed_from_u64(0);
    let head = Sparse4DHead::random(&config, &mut rng).unwrap();
    let bank = InstanceBank::random(&config.bank, config.embed_dims, &mut rng);
    let frames = frames(2, &mut rng);
    let mut tracker = tracker(head, bank);

    let first = tracker.step(&frames[0], "cam-rig").unwrap();
    assert_eq!(first.len(), 12);
    let first_ids: BTreeSet<i32> = first.iter().filter_map(|d| d.track_id).collect();
    assert_eq!(first_ids, (0..12).collect::<BTreeSet<i32>>());

    let second = tracker.step(&frames[1], "cam-rig").unwrap();
    let second_ids: BTreeSet<i32> = second.iter().filter_map(|d| d.track_id).collect();
    assert_eq!(second_ids.len(), 12);
    assert_eq!(second_ids.intersection(&first_ids).count(), 8);
    assert!(second_ids.range(12..).eq([12, 13, 14, 15].iter()));

    let tracks = tracker.tracks("cam-rig");
    let track_ids: Vec<i32> = tracks.iter().map(|t| t.track_id).collect();
    assert_eq!(track_ids, second_ids.iter().copied().collect::<Vec<i32>>());
    assert!(tracks.iter().all(|t| t.last_seen == 0.5));
    assert_eq!(tracks.iter().filter(|t| t.hits == 2).count(), 8);
    assert!(tracker.tracks("other").is_empty());

    tracker.reset("cam-rig");
    assert!(tracker.tracks("cam-rig").is_empty());
}

#[test]
fn exported_graphs_track_like_the_eager_head() {
    let config = small();
    let mut rng = StdRng::seed_from_u64(1);
    let head = Sparse4DHead::random(&config, &mut rng).unwrap();
    let bank = InstanceBank::random(&config.bank, config.embed_dims, &mut rng);
    let frames = frames(3, &mut rng);

    let export = ExportConfig {
        batch_size: 1,
        num_cams: 2,
        input_h: 32,
        input_w: 64,
        strides: vec![8, 16],
        seed: 0,
    };
    let dummy = DummyInputs::generate(&bank, config.embed_dims, &export, &mut rng).unwrap();
    let metas = dummy.head.map(Value::meta);
    let graphs = GraphExecutor::new(
        head.trace_first("first", &metas).unwrap(),
        head.trace_temporal("temporal", &dummy.temporal.map(Value::meta), &metas)
            .unwrap(),
    )
    .unwrap();

    let mut eager = tracker(head, bank.fork());
    let mut replay = tracker(graphs, bank);
    for frame in &frames {
        assert_eq!(
            eager.step(frame, "src").unwrap(),
            replay.step(frame, "src").unwrap()
        );
    }
}

#[test]
fn data_parallel_splits_the_batch_across_devices() {
    let config = small();
    let mut rng = StdRng::seed_from_u64(2);
    let head = Sparse4DHead::random(&config, &mut rng).unwrap();
    let bank = InstanceBank::random(&config.bank, config.embed_dims, &mut rng);
    let export = ExportConfig {
        batch_size: 2,
        num_cams: 2,
        input_h: 32,
        input_w: 64,
        strides: vec![8, 16],
        seed: 0,
    };
    let dummy = DummyInputs::generate(&bank, config.embed_dims, &export, &mut rng).unwrap();
    let expected = head.forward_first(&Eager, &dummy.head).unwrap();

    let devices = vec![Device::cuda(0), Device::cuda(1)];
    let kwargs = dummy.head.named().into_iter().map(|(name, value)| {
        let batch = Batch::Tensor(value.clone());
        let batch = if name == FIRST_FRAME_INPUTS[4] || name == FIRST_FRAME_INPUTS[5] {
            Batch::Container(DataContainer::replicate(batch, devices.len()))
        } else {
            batch
        };
        (name.to_string(), batch)
    });
    let inputs = Inputs::kwargs(kwargs);

    let dp = DataParallel::new(head.to(Device::cuda(0)), devices);
    let gathered = dp.forward(&inputs).unwrap();
    let outputs = gathered.as_map().unwrap();

    assert_eq!(outputs.len(), 4);
    for (name, value) in expected.named() {
        let found = outputs[name].as_tensor().unwrap();
        assert_eq!(found.shape(), value.shape());
        assert!(value.max_abs_diff(found).unwrap() < 1e-5, "{} deviates", name);
    }
}
