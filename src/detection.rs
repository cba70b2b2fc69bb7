use serde_derive::{Deserialize, Serialize};

use crate::bbox::Box3D;

/// One decoded instance of a frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: Box3D,
    #[serde(rename = "p")]
    pub confidence: f32,
    #[serde(rename = "c")]
    pub class: i32,
    /// Class confidence before the centerness reweighting.
    pub cls_score: Option<f32>,
    pub track_id: Option<i32>,
}

impl Detection {
    #[inline]
    pub fn is_tracked(&self) -> bool {
        self.track_id.map_or(false, |id| id >= 0)
    }
}
