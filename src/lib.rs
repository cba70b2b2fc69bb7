pub mod anchor;
pub mod backend;
pub mod bank;
pub mod bbox;
pub mod config;
pub mod decoder;
pub mod deformable;
pub mod detection;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod export;
pub mod frame;
pub mod graph;
pub mod head;
pub mod nn;
pub mod parallel;
pub mod refine;
pub mod scene;
pub mod tensor;
pub mod topk;

mod track;

pub use bank::InstanceBank;
pub use detection::Detection;
pub use executor::{GraphExecutor, HeadExecutor};
pub use frame::Frame;
pub use head::Sparse4DHead;
pub use track::Track;

use decoder::SparseBox3DDecoder;
use error::Error;
use head::HeadInputs;
use std::collections::HashMap;
use std::rc::Rc;
use std::slice;
use tracing::debug;

pub trait Tracking {
    fn update(&mut self, frames: &[Frame], src: &str) -> Result<(), error::Error>;
    fn tracks(&self, src: &str) -> Rc<[Track]>;
    fn reset(&mut self, src: &str);
}

/// Tracks 3D objects of any number of sources with one decoder head.
///
/// Every source keeps its own instance bank, so the first frame of a source runs the
/// first-frame head and every later frame the temporal one.
pub struct SparseTracker<E: HeadExecutor> {
    executor: E,
    bank: InstanceBank,
    decoder: SparseBox3DDecoder,
    spatial_shapes: Vec<[usize; 2]>,
    scenes: HashMap<String, scene::Scene>,
}

impl<E: HeadExecutor> SparseTracker<E> {
    pub fn new(
        executor: E,
        bank: InstanceBank,
        decoder: SparseBox3DDecoder,
        spatial_shapes: Vec<[usize; 2]>,
    ) -> Self {
        Self {
            executor,
            bank,
            decoder,
            spatial_shapes,
            scenes: HashMap::new(),
        }
    }

    #[inline]
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Decoded detections of every sample of the latest frame of `src`, tracked or not.
    pub fn step(&mut self, frame: &Frame, src: &str) -> Result<Vec<Detection>, Error> {
        let bank = &self.bank;
        let scene = self
            .scenes
            .entry(src.to_string())
            .or_insert_with(|| scene::Scene::new(bank.fork()));

        let frames = slice::from_ref(frame);
        let state = scene.bank.get(frames)?;
        let (maps, projection) = frame::batch(frames, &self.spatial_shapes)?;
        let inputs = HeadInputs {
            instance_feature: state.instance_feature,
            anchor: state.anchor,
            time_interval: state.time_interval,
            maps,
            projection,
        };

        let outputs = match &state.temporal {
            Some(temporal) => self.executor.temporal(temporal, &inputs)?,
            None => self.executor.first(&inputs)?,
        };
        let ids = scene.bank.update(&outputs)?;
        let detections = self
            .decoder
            .decode(&outputs, Some(&ids))?
            .into_iter()
            .next()
            .unwrap_or_default();

        scene.update(frame.timestamp, &detections);
        debug!(
            src,
            frame = scene.frames(),
            temporal = state.temporal.is_some(),
            detections = detections.len(),
            "tracker step"
        );

        Ok(detections)
    }
}

impl<E: HeadExecutor> crate::Tracking for SparseTracker<E> {
    fn update(&mut self, frames: &[Frame], src: &str) -> Result<(), Error> {
        for frame in frames {
            self.step(frame, src)?;
        }
        Ok(())
    }

    /// Tracks of `src` decoded in its latest frame, ordered by id.
    fn tracks(&self, src: &str) -> Rc<[Track]> {
        match self.scenes.get(src) {
            Some(scene) => scene.tracks().into(),
            None => Rc::new([]),
        }
    }

    fn reset(&mut self, src: &str) {
        if let Some(scene) = self.scenes.get_mut(src) {
            scene.reset();
        }
    }
}
