//! Instance bank: the learned instance pool plus the cross-frame cache of a single source.
//!
//! The heads never own any of this. They receive a [`BankSnapshot`] at construction and the
//! tiled tensors of [`InstanceBank::get`] at every call.

use nalgebra as na;
use ndarray::{s, Array1, Array2, Array3, Axis, Ix2, Ix3};
use rand::Rng;
use tracing::{debug, warn};

use crate::anchor::{ANCHOR_DIM, COS_YAW, H, L, SIN_YAW, VX, VY, VZ, W, X, Y, Z};
use crate::backend::kernels::sigmoid;
use crate::config::BankConfig;
use crate::error::Error;
use crate::frame::Frame;
use crate::head::{HeadOutputs, TemporalInputs};
use crate::tensor::Value;

/// Sizes the heads need from the bank, fixed for the lifetime of a head.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BankSnapshot {
    pub num_anchor: usize,
    pub num_temp_instances: usize,
    pub default_time_interval: f32,
}

impl From<&BankConfig> for BankSnapshot {
    fn from(config: &BankConfig) -> Self {
        Self {
            num_anchor: config.num_anchor,
            num_temp_instances: config.num_temp_instances,
            default_time_interval: config.default_time_interval,
        }
    }
}

/// Inputs for the next head call.
#[derive(Debug, Clone)]
pub struct BankState {
    pub instance_feature: Value,
    pub anchor: Value,
    pub time_interval: Value,
    /// `None` until a batch of the same size has been cached.
    pub temporal: Option<TemporalInputs<Value>>,
}

struct Cache {
    feature: Array3<f32>,
    anchor: Array3<f32>,
    confidence: Array2<f32>,
    track_id: Array2<i32>,
    timestamps: Vec<f64>,
    ego_to_global: Vec<na::Matrix4<f32>>,
}

pub struct InstanceBank {
    config: BankConfig,
    feature: Array2<f32>,
    anchor: Array2<f32>,
    cache: Option<Cache>,
    pending: Option<Pending>,
    next_id: i32,
}

/// Frame metadata recorded by `get` and consumed by `update`.
struct Pending {
    mask: Vec<bool>,
    timestamps: Vec<f64>,
    ego_to_global: Vec<na::Matrix4<f32>>,
}

impl InstanceBank {
    /// Zero instance features and anchors spread uniformly over `anchor_range`, facing `+x`
    /// and at rest.
    pub fn random(config: &BankConfig, embed_dims: usize, rng: &mut impl Rng) -> Self {
        let [x0, y0, z0, x1, y1, z1] = config.anchor_range;
        let mut anchor = Array2::<f32>::zeros((config.num_anchor, ANCHOR_DIM));

        for mut row in anchor.rows_mut() {
            row[X] = rng.gen_range(x0..x1);
            row[Y] = rng.gen_range(y0..y1);
            row[Z] = rng.gen_range(z0..z1);
            for dim in [W, L, H] {
                row[dim] = rng.gen_range(0.5f32..4.0).ln();
            }
            row[COS_YAW] = 1.0;
        }

        Self::new(
            config.clone(),
            Array2::zeros((config.num_anchor, embed_dims)),
            anchor,
        )
    }

    pub fn new(config: BankConfig, feature: Array2<f32>, anchor: Array2<f32>) -> Self {
        Self {
            config,
            feature,
            anchor,
            cache: None,
            pending: None,
            next_id: 0,
        }
    }

    /// A bank with the same learned pool, an empty cache and a fresh id counter.
    pub fn fork(&self) -> Self {
        Self::new(self.config.clone(), self.feature.clone(), self.anchor.clone())
    }

    #[inline]
    pub fn snapshot(&self) -> BankSnapshot {
        BankSnapshot::from(&self.config)
    }

    #[inline]
    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Drops the cache; the next frame starts from the learned pool.
    pub fn reset(&mut self) {
        self.cache = None;
        self.pending = None;
    }

    /// Learned instance feature and anchor tiled to `(bs, num_anchor, ..)`.
    pub fn learned(&self, bs: usize) -> (Value, Value) {
        (tile(&self.feature, bs), tile(&self.anchor, bs))
    }

    /// Head inputs for `frames`, one frame per sample.
    ///
    /// Cached anchors are moved into the current ego frame and advanced by their velocity.
    /// A sample continues its track when the cache is at most `max_time_interval` old.
    pub fn get(&mut self, frames: &[Frame]) -> Result<BankState, Error> {
        let bs = frames.len();
        let (instance_feature, anchor) = self.learned(bs);
        let mut time_interval = vec![self.config.default_time_interval; bs];
        let mut mask = vec![false; bs];

        let cache = match self.cache.as_ref() {
            Some(cache) if cache.timestamps.len() == bs => Some(cache),
            Some(cache) => {
                warn!(cached = cache.timestamps.len(), bs, "batch size changed, resetting instance bank");
                None
            }
            None => None,
        };

        let temporal = match cache {
            Some(cache) => {
                let mut temp_anchor = cache.anchor.clone();
                for (i, frame) in frames.iter().enumerate() {
                    let dt = (frame.timestamp - cache.timestamps[i]) as f32;
                    mask[i] = dt.abs() <= self.config.max_time_interval;
                    if dt != 0.0 && mask[i] {
                        time_interval[i] = dt;
                    }

                    let global_to_ego = frame.ego_to_global.try_inverse().ok_or_else(|| {
                        Error::Config(format!("ego pose of sample {} is singular", i))
                    })?;
                    let temp_to_cur = global_to_ego * cache.ego_to_global[i];
                    project_anchors(temp_anchor.index_axis_mut(Axis(0), i), &temp_to_cur, dt);
                }
                debug!(?mask, ?time_interval, "instance bank continues cached instances");

                Some(TemporalInputs {
                    temp_instance_feature: Value::F32(cache.feature.clone().into_dyn()),
                    temp_anchor: Value::F32(temp_anchor.into_dyn()),
                    mask: Value::Bool(Array1::from(mask.clone()).into_dyn()),
                    track_id: Value::I32(cache.track_id.clone().into_dyn()),
                })
            }
            None => {
                self.cache = None;
                None
            }
        };

        self.pending = Some(Pending {
            mask,
            timestamps: frames.iter().map(|f| f.timestamp).collect(),
            ego_to_global: frames.iter().map(|f| f.ego_to_global).collect(),
        });

        Ok(BankState {
            instance_feature,
            anchor,
            time_interval: Value::from_f32(&[bs], time_interval)?,
            temporal,
        })
    }

    /// Caches the best `num_temp_instances` of the head outputs and assigns track ids.
    ///
    /// Returns the ids of all `num_anchor` instances, `-1` for instances still below the
    /// track threshold.
    pub fn update(&mut self, outputs: &HeadOutputs<Value>) -> Result<Array2<i32>, Error> {
        let pending = self
            .pending
            .take()
            .ok_or(Error::Unsupported("instance bank update without a preceding get"))?;

        let feature = outputs
            .instance_feature
            .as_f32()?
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|e| Error::shape("instance_bank", e.to_string()))?;
        let anchor = outputs
            .anchor
            .as_f32()?
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|e| Error::shape("instance_bank", e.to_string()))?;
        let class_score = outputs
            .class_score
            .as_f32()?
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|e| Error::shape("instance_bank", e.to_string()))?;

        let (bs, num_anchor) = (feature.shape()[0], feature.shape()[1]);
        let num_temp = self.config.num_temp_instances;
        if bs != pending.mask.len() || num_anchor != self.config.num_anchor {
            return Err(Error::shape(
                "instance_bank",
                format!(
                    "outputs for {} x {} instances, expected {} x {}",
                    bs,
                    num_anchor,
                    pending.mask.len(),
                    self.config.num_anchor
                ),
            ));
        }

        let confidence =
            class_score.map_axis(Axis(2), |row| sigmoid(row.fold(f32::NEG_INFINITY, |a, &b| a.max(b))));

        let mut temp_confidence = confidence.clone();
        if let Some(cache) = &self.cache {
            for i in (0..bs).filter(|&i| pending.mask[i]) {
                for j in 0..num_temp {
                    let decayed = cache.confidence[[i, j]] * self.config.confidence_decay;
                    temp_confidence[[i, j]] = temp_confidence[[i, j]].max(decayed);
                }
            }
        }

        let mut track_id = match &outputs.track_id {
            Some(ids) => ids
                .as_i32()?
                .view()
                .into_dimensionality::<Ix2>()
                .map_err(|e| Error::shape("instance_bank", e.to_string()))?
                .to_owned(),
            None => Array2::from_elem((bs, num_anchor), -1),
        };
        let mut assigned = 0;
        for ((i, j), id) in track_id.indexed_iter_mut() {
            let confident = self
                .config
                .track_threshold
                .map_or(true, |threshold| confidence[[i, j]] >= threshold);
            if *id < 0 && confident {
                *id = self.next_id;
                self.next_id += 1;
                assigned += 1;
            }
        }
        debug!(assigned, next_id = self.next_id, "assigned track ids");

        let mut cache = Cache {
            feature: Array3::zeros((bs, num_temp, feature.shape()[2])),
            anchor: Array3::zeros((bs, num_temp, ANCHOR_DIM)),
            confidence: Array2::zeros((bs, num_temp)),
            track_id: Array2::from_elem((bs, num_anchor), -1),
            timestamps: pending.timestamps,
            ego_to_global: pending.ego_to_global,
        };
        for i in 0..bs {
            for (slot, j) in top_indices(temp_confidence.row(i), num_temp).into_iter().enumerate() {
                cache
                    .feature
                    .slice_mut(s![i, slot, ..])
                    .assign(&feature.slice(s![i, j, ..]));
                cache
                    .anchor
                    .slice_mut(s![i, slot, ..])
                    .assign(&anchor.slice(s![i, j, ..]));
                cache.confidence[[i, slot]] = temp_confidence[[i, j]];
                cache.track_id[[i, slot]] = track_id[[i, j]];
            }
        }
        self.cache = Some(cache);

        Ok(track_id)
    }
}

fn tile(data: &Array2<f32>, bs: usize) -> Value {
    let views = vec![data.view(); bs];
    match ndarray::stack(Axis(0), &views) {
        Ok(tiled) => Value::F32(tiled.into_dyn()),
        Err(_) => Value::zeros(&[0, data.nrows(), data.ncols()]),
    }
}

/// Indices of the `k` largest values, highest first, ties by lower index.
fn top_indices(values: ndarray::ArrayView1<f32>, k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    order.truncate(k);
    order
}

/// Moves anchors of the previous ego frame into the current one, `dt` seconds later.
fn project_anchors(mut anchors: ndarray::ArrayViewMut2<f32>, temp_to_cur: &na::Matrix4<f32>, dt: f32) {
    let rotation: na::Matrix3<f32> = temp_to_cur.fixed_slice::<3, 3>(0, 0).into_owned();
    let translation: na::Vector3<f32> = temp_to_cur.fixed_slice::<3, 1>(0, 3).into_owned();
    let planar: na::Matrix2<f32> = temp_to_cur.fixed_slice::<2, 2>(0, 0).into_owned();

    for mut row in anchors.rows_mut() {
        let velocity = na::Vector3::new(row[VX], row[VY], row[VZ]);
        let center = na::Vector3::new(row[X], row[Y], row[Z]) + velocity * dt;
        let center = rotation * center + translation;
        let yaw = planar * na::Vector2::new(row[COS_YAW], row[SIN_YAW]);
        let velocity = rotation * velocity;

        row[X] = center.x;
        row[Y] = center.y;
        row[Z] = center.z;
        row[SIN_YAW] = yaw.y;
        row[COS_YAW] = yaw.x;
        row[VX] = velocity.x;
        row[VY] = velocity.y;
        row[VZ] = velocity.z;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config() -> BankConfig {
        BankConfig {
            num_anchor: 4,
            num_temp_instances: 2,
            ..BankConfig::default()
        }
    }

    fn frame(timestamp: f64, ego_to_global: na::Matrix4<f32>) -> Frame {
        Frame {
            timestamp,
            ego_to_global,
            cameras: vec![],
            feature: Value::zeros(&[0, 3]),
        }
    }

    fn outputs(cls: Vec<f32>, track_id: Option<Vec<i32>>) -> HeadOutputs<Value> {
        let feature = (0..12).map(|x| x as f32).collect();
        let anchor = (0..44).map(|x| x as f32).collect();
        HeadOutputs {
            instance_feature: Value::from_f32(&[1, 4, 3], feature).unwrap(),
            anchor: Value::from_f32(&[1, 4, ANCHOR_DIM], anchor).unwrap(),
            class_score: Value::from_f32(&[1, 4, 1], cls).unwrap(),
            quality_score: Value::zeros(&[1, 4, 2]),
            track_id: track_id.map(|ids| Value::from_i32(&[1, 4], ids).unwrap()),
        }
    }

    #[test]
    fn first_frame_has_no_temporal_inputs() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut bank = InstanceBank::random(&config(), 3, &mut rng);
        let state = bank.get(&[frame(0.0, na::Matrix4::identity())]).unwrap();

        assert!(state.temporal.is_none());
        assert_eq!(state.instance_feature.shape(), &[1, 4, 3]);
        assert_eq!(state.anchor.shape(), &[1, 4, ANCHOR_DIM]);
        assert_eq!(state.time_interval, Value::full_f32(&[1], 0.5));
    }

    #[test]
    fn caches_most_confident_instances_with_new_ids() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut bank = InstanceBank::random(&config(), 3, &mut rng);
        bank.get(&[frame(0.0, na::Matrix4::identity())]).unwrap();

        assert!(!bank.has_cache());
        let ids = bank.update(&outputs(vec![0.0, 3.0, -1.0, 2.0], None)).unwrap();
        assert_eq!(ids.as_slice().unwrap(), &[0, 1, 2, 3]);
        assert!(bank.has_cache());

        let state = bank.get(&[frame(0.1, na::Matrix4::identity())]).unwrap();
        let temporal = state.temporal.unwrap();
        assert_eq!(temporal.mask, Value::from_bool(&[1], vec![true]).unwrap());
        assert_eq!(
            temporal.track_id,
            Value::from_i32(&[1, 4], vec![1, 3, -1, -1]).unwrap()
        );
        assert_eq!(
            temporal.temp_instance_feature,
            Value::from_f32(&[1, 2, 3], vec![3.0, 4.0, 5.0, 9.0, 10.0, 11.0]).unwrap()
        );
        assert!((state.time_interval.as_f32().unwrap()[[0]] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn stale_cache_restarts_sample() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut bank = InstanceBank::random(&config(), 3, &mut rng);
        bank.get(&[frame(0.0, na::Matrix4::identity())]).unwrap();
        bank.update(&outputs(vec![0.0; 4], None)).unwrap();

        let state = bank.get(&[frame(10.0, na::Matrix4::identity())]).unwrap();
        assert_eq!(
            state.temporal.unwrap().mask,
            Value::from_bool(&[1], vec![false]).unwrap()
        );
        assert_eq!(state.time_interval, Value::full_f32(&[1], 0.5));
    }

    #[test]
    fn threshold_keeps_unconfident_instances_untracked() {
        let mut rng = StdRng::seed_from_u64(0);
        let config = BankConfig {
            track_threshold: Some(0.5),
            ..config()
        };
        let mut bank = InstanceBank::random(&config, 3, &mut rng);
        bank.get(&[frame(0.0, na::Matrix4::identity())]).unwrap();

        let ids = bank
            .update(&outputs(vec![1.0, -1.0, 2.0, -3.0], Some(vec![7, -1, -1, -1])))
            .unwrap();
        assert_eq!(ids.as_slice().unwrap(), &[7, -1, 0, -1]);
    }

    #[test]
    fn projection_follows_ego_motion_and_velocity() {
        let mut anchors = Array2::<f32>::zeros((1, ANCHOR_DIM));
        anchors[[0, X]] = 1.0;
        anchors[[0, COS_YAW]] = 1.0;
        anchors[[0, VX]] = 2.0;

        // The ego moved 1 m forward and turned left by 90 degrees.
        let rotation =
            na::UnitQuaternion::from_axis_angle(&na::Vector3::z_axis(), std::f32::consts::FRAC_PI_2);
        let cur = na::Isometry3::from_parts(na::Translation3::new(1.0, 0.0, 0.0), rotation);
        let temp_to_cur = cur.inverse().to_homogeneous();

        project_anchors(anchors.view_mut(), &temp_to_cur, 0.5);

        // Centre 2 m ahead in the old frame, 1 m ahead of the new position, now to the right.
        assert!((anchors[[0, X]] - 0.0).abs() < 1e-5);
        assert!((anchors[[0, Y]] + 1.0).abs() < 1e-5);
        assert!((anchors[[0, SIN_YAW]] + 1.0).abs() < 1e-5);
        assert!((anchors[[0, COS_YAW]] - 0.0).abs() < 1e-5);
        assert!((anchors[[0, VY]] + 2.0).abs() < 1e-5);
    }

    #[test]
    fn update_requires_get() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut bank = InstanceBank::random(&config(), 3, &mut rng);
        assert!(bank.update(&outputs(vec![0.0; 4], None)).is_err());
    }
}
