use crate::bbox::Box3D;
use crate::detection::Detection;

#[derive(Debug, Clone)]
pub struct Track {
    pub track_id: i32,
    /// Frames since this id was last decoded.
    pub time_since_update: i32,
    pub class: i32,
    pub confidence: f32,
    pub bbox: Box3D,
    pub hits: u32,

    // in seconds
    pub first_seen: f64,
    pub last_seen: f64,
}

impl Track {
    pub fn new(track_id: i32, timestamp: f64, det: &Detection) -> Self {
        Self {
            track_id,
            time_since_update: 0,
            class: det.class,
            confidence: det.confidence,
            bbox: det.bbox,
            hits: 1,
            first_seen: timestamp,
            last_seen: timestamp,
        }
    }

    pub fn update(&mut self, timestamp: f64, det: &Detection) {
        self.time_since_update = 0;
        self.class = det.class;
        self.confidence = det.confidence;
        self.bbox = det.bbox;
        self.hits += 1;
        self.last_seen = timestamp;
    }

    #[inline]
    pub fn age(&self) -> f64 {
        self.last_seen - self.first_seen
    }
}
