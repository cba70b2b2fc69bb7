use nalgebra as na;
use serde_derive::{Deserialize, Serialize};

use crate::anchor::{ANCHOR_DIM, COS_YAW, H, L, SIN_YAW, VX, VY, VZ, W, X, Y, Z};

/// Decoded 3D box in the ego frame: centre, metric size `(w, l, h)`, heading and velocity.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Box3D {
    pub center: [f32; 3],
    pub size: [f32; 3],
    /// Radians, counter-clockwise from `+x`.
    pub yaw: f32,
    pub velocity: [f32; 3],
}

impl Box3D {
    /// Decodes an anchor row: sizes are stored as logarithms and the heading as `(sin, cos)`.
    pub fn from_anchor(anchor: &[f32]) -> Self {
        let at = |i: usize| anchor.get(i).copied().unwrap_or(0.0);

        Self {
            center: [at(X), at(Y), at(Z)],
            size: [at(W).exp(), at(L).exp(), at(H).exp()],
            yaw: at(SIN_YAW).atan2(at(COS_YAW)),
            velocity: [at(VX), at(VY), at(VZ)],
        }
    }

    pub fn to_anchor(&self) -> [f32; ANCHOR_DIM] {
        let mut anchor = [0.0; ANCHOR_DIM];
        anchor[X] = self.center[0];
        anchor[Y] = self.center[1];
        anchor[Z] = self.center[2];
        anchor[W] = self.size[0].ln();
        anchor[L] = self.size[1].ln();
        anchor[H] = self.size[2].ln();
        anchor[SIN_YAW] = self.yaw.sin();
        anchor[COS_YAW] = self.yaw.cos();
        anchor[VX] = self.velocity[0];
        anchor[VY] = self.velocity[1];
        anchor[VZ] = self.velocity[2];
        anchor
    }

    #[inline(always)]
    pub fn x(&self) -> f32 {
        self.center[0]
    }

    #[inline(always)]
    pub fn y(&self) -> f32 {
        self.center[1]
    }

    #[inline(always)]
    pub fn speed(&self) -> f32 {
        na::Vector2::new(self.velocity[0], self.velocity[1]).norm()
    }

    /// Bird's-eye-view distance between the two centres.
    #[inline]
    pub fn bev_distance(&self, other: &Box3D) -> f32 {
        na::distance(
            &na::Point2::new(self.x(), self.y()),
            &na::Point2::new(other.x(), other.y()),
        )
    }

    /// Moves the box into another frame given the rigid transform from its current one.
    pub fn transform(&self, m: &na::Isometry3<f32>) -> Self {
        let center = m * na::Point3::from(self.center);
        let velocity = m.rotation * na::Vector3::from(self.velocity);
        let heading = m.rotation * na::Vector3::new(self.yaw.cos(), self.yaw.sin(), 0.0);

        Self {
            center: [center.x, center.y, center.z],
            size: self.size,
            yaw: heading.y.atan2(heading.x),
            velocity: [velocity.x, velocity.y, velocity.z],
        }
    }
}

impl From<Box3D> for [f32; ANCHOR_DIM] {
    fn from(bbox: Box3D) -> Self {
        bbox.to_anchor()
    }
}
