use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::dispatch::OpKind;
use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    Add,
    Cat,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BankConfig {
    pub num_anchor: usize,
    pub num_temp_instances: usize,
    pub default_time_interval: f32,
    pub max_time_interval: f32,
    pub confidence_decay: f32,
    /// Instances below this confidence keep the `-1` track id.
    pub track_threshold: Option<f32>,
    /// `[x_min, y_min, z_min, x_max, y_max, z_max]` for the initial anchor centres.
    pub anchor_range: [f32; 6],
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            num_anchor: 900,
            num_temp_instances: 600,
            default_time_interval: 0.5,
            max_time_interval: 2.0,
            confidence_decay: 0.6,
            track_threshold: None,
            anchor_range: [-51.2, -51.2, -5.0, 51.2, 51.2, 3.0],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EncoderConfig {
    pub mode: CombineMode,
    pub vel_dims: usize,
    pub in_loops: usize,
    pub out_loops: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            mode: CombineMode::Cat,
            vel_dims: 3,
            in_loops: 1,
            out_loops: 4,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DeformableConfig {
    pub num_groups: usize,
    pub num_levels: usize,
    pub num_cams: usize,
    pub num_learnable_pts: usize,
    pub fix_scale: Vec<[f32; 3]>,
    pub use_camera_embed: bool,
    pub residual_mode: CombineMode,
}

impl Default for DeformableConfig {
    fn default() -> Self {
        Self {
            num_groups: 8,
            num_levels: 4,
            num_cams: 6,
            num_learnable_pts: 6,
            fix_scale: vec![
                [0.0, 0.0, 0.0],
                [0.45, 0.0, 0.0],
                [-0.45, 0.0, 0.0],
                [0.0, 0.45, 0.0],
                [0.0, -0.45, 0.0],
                [0.0, 0.0, 0.45],
                [0.0, 0.0, -0.45],
            ],
            use_camera_embed: true,
            residual_mode: CombineMode::Cat,
        }
    }
}

impl DeformableConfig {
    #[inline]
    pub fn num_pts(&self) -> usize {
        self.fix_scale.len() + self.num_learnable_pts
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FfnConfig {
    pub feedforward_channels: usize,
    pub pre_norm: bool,
}

impl Default for FfnConfig {
    fn default() -> Self {
        Self {
            feedforward_channels: 1024,
            pre_norm: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HeadConfig {
    pub embed_dims: usize,
    pub num_classes: usize,
    pub num_heads: usize,
    pub num_single_frame_decoder: usize,
    pub refine_yaw: bool,
    pub operation_order: Vec<String>,
    /// Stages listed here keep their position in the order but carry no operator.
    pub disabled_operations: BTreeSet<OpKind>,
    pub seed: u64,
    pub bank: BankConfig,
    pub encoder: EncoderConfig,
    pub deformable: DeformableConfig,
    pub ffn: FfnConfig,
}

impl Default for HeadConfig {
    fn default() -> Self {
        let mut operation_order: Vec<String> = ["deformable", "ffn", "norm", "refine"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        for _ in 0..5 {
            operation_order.extend(
                ["temp_gnn", "gnn", "norm", "deformable", "ffn", "norm", "refine"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }

        Self {
            embed_dims: 256,
            num_classes: 10,
            num_heads: 8,
            num_single_frame_decoder: 1,
            refine_yaw: true,
            operation_order,
            disabled_operations: BTreeSet::new(),
            seed: 0,
            bank: BankConfig::default(),
            encoder: EncoderConfig::default(),
            deformable: DeformableConfig::default(),
            ffn: FfnConfig::default(),
        }
    }
}

impl HeadConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let reader = BufReader::new(File::open(path)?);
        let config: HeadConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed operation order; unknown tags are rejected.
    pub fn operations(&self) -> Result<Vec<OpKind>, Error> {
        self.operation_order.iter().map(|tag| tag.parse()).collect()
    }

    pub fn validate(&self) -> Result<(), Error> {
        let embed = self.embed_dims;
        if embed == 0 {
            return Err(Error::Config("embed_dims must be positive".into()));
        }
        if self.num_heads == 0 || embed % self.num_heads != 0 {
            return Err(Error::Config(format!(
                "embed_dims {} is not divisible by num_heads {}",
                embed, self.num_heads
            )));
        }
        if self.deformable.num_groups == 0 || embed % self.deformable.num_groups != 0 {
            return Err(Error::Config(format!(
                "embed_dims {} is not divisible by num_groups {}",
                embed, self.deformable.num_groups
            )));
        }
        if self.encoder.mode == CombineMode::Cat && embed % 8 != 0 {
            return Err(Error::Config(format!(
                "concatenating anchor encoder needs embed_dims divisible by 8, got {}",
                embed
            )));
        }
        let vel_dims = self.encoder.vel_dims;
        if vel_dims > 3 || (vel_dims == 0 && self.encoder.mode == CombineMode::Cat) {
            return Err(Error::Config(format!(
                "vel_dims {} must be in {}..=3",
                vel_dims,
                if self.encoder.mode == CombineMode::Cat { 1 } else { 0 }
            )));
        }
        if self.num_classes == 0 {
            return Err(Error::Config("num_classes must be positive".into()));
        }

        let bank = &self.bank;
        if bank.num_temp_instances == 0 || bank.num_temp_instances > bank.num_anchor {
            return Err(Error::Config(format!(
                "num_temp_instances {} must be in 1..={}",
                bank.num_temp_instances, bank.num_anchor
            )));
        }
        if bank.default_time_interval <= 0.0 {
            return Err(Error::Config("default_time_interval must be positive".into()));
        }

        let refines = self
            .operations()?
            .into_iter()
            .filter(|kind| *kind == OpKind::Refine && !self.disabled_operations.contains(kind))
            .count();
        if self.num_single_frame_decoder == 0 || self.num_single_frame_decoder > refines {
            return Err(Error::Config(format!(
                "num_single_frame_decoder {} must be in 1..={} (refine stages)",
                self.num_single_frame_decoder, refines
            )));
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ExportConfig {
    pub batch_size: usize,
    pub num_cams: usize,
    pub input_h: usize,
    pub input_w: usize,
    pub strides: Vec<usize>,
    pub seed: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_cams: 6,
            input_h: 256,
            input_w: 704,
            strides: vec![4, 8, 16, 32],
            seed: 1,
        }
    }
}

impl ExportConfig {
    /// `[h, w]` of every feature level.
    pub fn spatial_shapes(&self) -> Vec<[usize; 2]> {
        self.strides
            .iter()
            .map(|s| [self.input_h / s, self.input_w / s])
            .collect()
    }

    pub fn validate(&self, head: &HeadConfig) -> Result<(), Error> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.num_cams != head.deformable.num_cams {
            return Err(Error::Config(format!(
                "export uses {} cameras but the head was built for {}",
                self.num_cams, head.deformable.num_cams
            )));
        }
        if self.strides.len() != head.deformable.num_levels {
            return Err(Error::Config(format!(
                "{} strides given for {} feature levels",
                self.strides.len(),
                head.deformable.num_levels
            )));
        }
        if self.spatial_shapes().iter().any(|[h, w]| h * w == 0) {
            return Err(Error::Config(format!(
                "input {}x{} is too small for strides {:?}",
                self.input_h, self.input_w, self.strides
            )));
        }
        Ok(())
    }
}

/// Post-processing of the head outputs into detections.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DecoderConfig {
    pub num_output: usize,
    pub score_threshold: Option<f32>,
    /// Reweights class confidence by the predicted centerness.
    pub use_centerness: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            num_output: 300,
            score_threshold: None,
            use_centerness: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_head_is_valid() {
        let config = HeadConfig::default();
        config.validate().unwrap();
        assert_eq!(config.operation_order.len(), 39);
    }

    #[test]
    fn rejects_more_temporal_than_anchors() {
        let mut config = HeadConfig::default();
        config.bank.num_temp_instances = 901;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_velocity_outside_the_anchor() {
        let mut config = HeadConfig::default();
        config.encoder.vel_dims = 4;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.encoder.vel_dims = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.encoder.mode = CombineMode::Add;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_operation() {
        let mut config = HeadConfig::default();
        config.operation_order.push("conv".into());
        assert!(matches!(config.validate(), Err(Error::UnknownOperation(_))));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: HeadConfig =
            serde_json::from_str(r#"{ "embed_dims": 64, "bank": { "num_anchor": 32 } }"#).unwrap();
        assert_eq!(config.embed_dims, 64);
        assert_eq!(config.bank.num_anchor, 32);
        assert_eq!(config.bank.num_temp_instances, 600);
        assert_eq!(config.num_classes, 10);
    }
}
