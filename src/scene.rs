use std::collections::BTreeMap;
use tracing::trace;

use crate::bank::InstanceBank;
use crate::detection::Detection;
use crate::track::Track;

/// Frames a track survives without being decoded again.
const MAX_TIME_SINCE_UPDATE: i32 = 3;

/// Tracking state of a single source: its instance bank and the live tracks.
pub struct Scene {
    pub(crate) bank: InstanceBank,
    tracks: BTreeMap<i32, Track>,
    frames: u64,
}

impl Scene {
    pub fn new(bank: InstanceBank) -> Self {
        Self {
            bank,
            tracks: BTreeMap::new(),
            frames: 0,
        }
    }

    #[inline]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Applies the tracked detections of one frame; untracked detections are ignored.
    pub fn update(&mut self, timestamp: f64, detections: &[Detection]) {
        self.frames += 1;
        for track in self.tracks.values_mut() {
            track.time_since_update += 1;
        }

        for det in detections.iter().filter(|d| d.is_tracked()) {
            let id = det.track_id.unwrap_or(-1);
            self.tracks
                .entry(id)
                .and_modify(|track| track.update(timestamp, det))
                .or_insert_with(|| Track::new(id, timestamp, det));
        }

        let before = self.tracks.len();
        self.tracks
            .retain(|_, track| track.time_since_update <= MAX_TIME_SINCE_UPDATE);
        trace!(
            frame = self.frames,
            live = self.tracks.len(),
            dropped = before - self.tracks.len(),
            "scene updated"
        );
    }

    /// Tracks decoded in the latest frame, by id.
    pub fn tracks(&self) -> Vec<Track> {
        self.tracks
            .values()
            .filter(|track| track.time_since_update == 0)
            .cloned()
            .collect()
    }

    pub fn reset(&mut self) {
        self.bank.reset();
        self.tracks.clear();
        self.frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbox::Box3D;
    use crate::config::BankConfig;
    use ndarray::Array2;

    fn det(track_id: i32, x: f32) -> Detection {
        Detection {
            bbox: Box3D {
                center: [x, 0.0, 0.0],
                size: [1.0; 3],
                yaw: 0.0,
                velocity: [0.0; 3],
            },
            confidence: 0.9,
            class: 0,
            cls_score: None,
            track_id: Some(track_id),
        }
    }

    fn scene() -> Scene {
        Scene::new(InstanceBank::new(
            BankConfig::default(),
            Array2::zeros((0, 0)),
            Array2::zeros((0, 0)),
        ))
    }

    #[test]
    fn follows_ids_across_frames() {
        let mut scene = scene();
        scene.update(0.0, &[det(0, 1.0), det(-1, 5.0)]);
        scene.update(0.5, &[det(0, 2.0), det(1, 3.0)]);

        let tracks = scene.tracks();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].hits, 2);
        assert_eq!(tracks[0].bbox.center[0], 2.0);
        assert_eq!(tracks[0].age(), 0.5);
        assert_eq!(tracks[1].track_id, 1);
    }

    #[test]
    fn drops_stale_tracks() {
        let mut scene = scene();
        scene.update(0.0, &[det(4, 1.0)]);
        for i in 1..=MAX_TIME_SINCE_UPDATE {
            scene.update(i as f64, &[]);
            assert!(scene.tracks().is_empty());
            assert_eq!(scene.tracks.len(), 1);
        }
        scene.update(10.0, &[]);
        assert!(scene.tracks.is_empty());
    }
}
