use nalgebra as na;
use ndarray::{Array2, Array3, Array4, Axis};

use crate::error::Error;
use crate::head::{FeatureMaps, Projection};
use crate::tensor::{level_start_index, Value};

/// Pinhole camera rigidly mounted on the ego vehicle.
#[derive(Debug, Clone)]
pub struct Camera {
    /// Ego (lidar) frame to image pixels, homogeneous.
    pub lidar2img: na::Matrix4<f32>,
    /// `(width, height)` in pixels.
    pub image_wh: (f32, f32),
}

impl Camera {
    /// Builds `K [R | t]` from intrinsics and the camera pose in the ego frame.
    pub fn pinhole(
        fx: f32,
        fy: f32,
        cx: f32,
        cy: f32,
        cam_to_ego: &na::Isometry3<f32>,
        image_wh: (f32, f32),
    ) -> Self {
        let mut intrinsic = na::Matrix4::identity();
        intrinsic[(0, 0)] = fx;
        intrinsic[(1, 1)] = fy;
        intrinsic[(0, 2)] = cx;
        intrinsic[(1, 2)] = cy;

        Self {
            lidar2img: intrinsic * cam_to_ego.inverse().to_homogeneous(),
            image_wh,
        }
    }
}

/// One synchronized multi-camera capture of a single source.
pub struct Frame {
    pub timestamp: f64, // in seconds
    pub ego_to_global: na::Matrix4<f32>,
    pub cameras: Vec<Camera>,
    /// `(cams * sum(h * w), embed_dims)`, levels flattened camera by camera.
    pub feature: Value,
}

impl Frame {
    #[inline]
    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Camera> {
        self.cameras.iter()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}

/// Stacks the frames of a batch into head inputs.
pub fn batch(
    frames: &[Frame],
    spatial_shapes: &[[usize; 2]],
) -> Result<(FeatureMaps<Value>, Projection<Value>), Error> {
    let num_cams = frames.first().map(Frame::len).unwrap_or(0);
    if frames.iter().any(|f| f.len() != num_cams) {
        return Err(Error::shape(
            "frame_batch",
            "every frame of a batch needs the same cameras",
        ));
    }

    let features = frames
        .iter()
        .map(|f| f.feature.as_f32().map(|a| a.view()))
        .collect::<Result<Vec<_>, Error>>()?;
    let feature = ndarray::stack(Axis(0), &features)
        .map_err(|e| Error::shape("frame_batch", e.to_string()))?;

    let levels = spatial_shapes.len();
    let mut shapes = Array3::<i32>::zeros((num_cams, levels, 2));
    for cam in 0..num_cams {
        for (level, [h, w]) in spatial_shapes.iter().enumerate() {
            shapes[[cam, level, 0]] = *h as i32;
            shapes[[cam, level, 1]] = *w as i32;
        }
    }
    let starts = Array2::from_shape_vec((num_cams, levels), level_start_index(spatial_shapes, num_cams))
        .map_err(|e| Error::shape("frame_batch", e.to_string()))?;

    let bs = frames.len();
    let mut lidar2img = Array4::<f32>::zeros((bs, num_cams, 4, 4));
    let mut image_wh = Array3::<f32>::zeros((bs, num_cams, 2));
    for (i, frame) in frames.iter().enumerate() {
        for (c, camera) in frame.iter().enumerate() {
            for r in 0..4 {
                for k in 0..4 {
                    lidar2img[[i, c, r, k]] = camera.lidar2img[(r, k)];
                }
            }
            image_wh[[i, c, 0]] = camera.image_wh.0;
            image_wh[[i, c, 1]] = camera.image_wh.1;
        }
    }

    Ok((
        FeatureMaps {
            feature: Value::F32(feature.into_dyn()),
            spatial_shapes: Value::I32(shapes.into_dyn()),
            level_start_index: Value::I32(starts.into_dyn()),
        },
        Projection {
            lidar2img: Value::F32(lidar2img.into_dyn()),
            image_wh: Value::F32(image_wh.into_dyn()),
        },
    ))
}
