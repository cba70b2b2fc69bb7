//! Operation order of the decoder, resolved once into typed stages.
//!
//! Resolution also fixes, per position, whether a refine stage emits class scores, triggers
//! the temporal merge, re-encodes the anchors and refreshes the temporal anchor embedding.
//! All of it is known before the first forward call, so a traced graph has no data-dependent
//! control flow.

use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::HeadConfig;
use crate::deformable::DeformableAggregation;
use crate::error::Error;
use crate::nn::{AsymmetricFfn, LayerNorm, MultiheadAttention};
use crate::refine::SparseBox3DRefinement;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    TempGnn,
    Gnn,
    Norm,
    Ffn,
    Deformable,
    Refine,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::TempGnn => "temp_gnn",
            OpKind::Gnn => "gnn",
            OpKind::Norm => "norm",
            OpKind::Ffn => "ffn",
            OpKind::Deformable => "deformable",
            OpKind::Refine => "refine",
        }
    }
}

impl FromStr for OpKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "temp_gnn" => Ok(OpKind::TempGnn),
            "gnn" => Ok(OpKind::Gnn),
            "norm" => Ok(OpKind::Norm),
            "ffn" => Ok(OpKind::Ffn),
            "deformable" => Ok(OpKind::Deformable),
            "refine" => Ok(OpKind::Refine),
            other => Err(Error::UnknownOperation(other.to_string())),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A position of the operation order. `None` operators are skipped at run time.
#[derive(Debug, Clone)]
pub enum Stage {
    TempGnn(Option<MultiheadAttention>),
    Gnn(Option<MultiheadAttention>),
    Norm(Option<LayerNorm>),
    Ffn(Option<AsymmetricFfn>),
    Deformable(Option<DeformableAggregation>),
    Refine(Option<SparseBox3DRefinement>),
}

impl Stage {
    pub fn kind(&self) -> OpKind {
        match self {
            Stage::TempGnn(_) => OpKind::TempGnn,
            Stage::Gnn(_) => OpKind::Gnn,
            Stage::Norm(_) => OpKind::Norm,
            Stage::Ffn(_) => OpKind::Ffn,
            Stage::Deformable(_) => OpKind::Deformable,
            Stage::Refine(_) => OpKind::Refine,
        }
    }

    pub fn is_present(&self) -> bool {
        match self {
            Stage::TempGnn(op) | Stage::Gnn(op) => op.is_some(),
            Stage::Norm(op) => op.is_some(),
            Stage::Ffn(op) => op.is_some(),
            Stage::Deformable(op) => op.is_some(),
            Stage::Refine(op) => op.is_some(),
        }
    }
}

/// Static decisions attached to a position. Only refine positions set any of them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StepPlan {
    pub return_cls: bool,
    pub merge: bool,
    pub re_embed: bool,
    pub refresh_temp_embed: bool,
}

#[derive(Debug, Clone)]
pub struct DispatchSequence {
    steps: Vec<(Stage, StepPlan)>,
}

impl DispatchSequence {
    pub fn resolve(config: &HeadConfig, rng: &mut impl Rng) -> Result<Self, Error> {
        let kinds = config.operations()?;
        let embed = config.embed_dims;
        let mut width = embed;
        let mut stages = Vec::with_capacity(kinds.len());

        for (position, &kind) in kinds.iter().enumerate() {
            let enabled = !config.disabled_operations.contains(&kind);
            let expect_embed = |width: usize| {
                if width != embed {
                    return Err(Error::Config(format!(
                        "{} at position {} receives width {} instead of {}",
                        kind, position, width, embed
                    )));
                }
                Ok(())
            };

            let stage = match kind {
                OpKind::TempGnn | OpKind::Gnn => {
                    let attention = if enabled {
                        expect_embed(width)?;
                        Some(MultiheadAttention::random(embed, config.num_heads, rng))
                    } else {
                        None
                    };
                    match kind {
                        OpKind::TempGnn => Stage::TempGnn(attention),
                        _ => Stage::Gnn(attention),
                    }
                }
                OpKind::Norm => Stage::Norm(if enabled {
                    expect_embed(width)?;
                    Some(LayerNorm::new(embed))
                } else {
                    None
                }),
                OpKind::Ffn => Stage::Ffn(if enabled {
                    let ffn = AsymmetricFfn::random(
                        width,
                        embed,
                        config.ffn.feedforward_channels,
                        config.ffn.pre_norm,
                        rng,
                    );
                    width = embed;
                    Some(ffn)
                } else {
                    None
                }),
                OpKind::Deformable => Stage::Deformable(if enabled {
                    expect_embed(width)?;
                    let op = DeformableAggregation::random(embed, &config.deformable, rng);
                    width = op.out_dims();
                    Some(op)
                } else {
                    None
                }),
                OpKind::Refine => Stage::Refine(if enabled {
                    expect_embed(width)?;
                    Some(SparseBox3DRefinement::random(
                        embed,
                        config.num_classes,
                        config.refine_yaw,
                        rng,
                    ))
                } else {
                    None
                }),
            };
            stages.push(stage);
        }

        if width != embed {
            return Err(Error::Config(format!(
                "operation order ends with width {} instead of {}",
                width, embed
            )));
        }

        let present: Vec<bool> = stages.iter().map(Stage::is_present).collect();
        let plans = plan(&kinds, &present, config.num_single_frame_decoder)?;

        Ok(Self {
            steps: stages.into_iter().zip(plans).collect(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Stage, StepPlan)> {
        self.steps.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn plans(&self) -> Vec<StepPlan> {
        self.steps.iter().map(|(_, plan)| *plan).collect()
    }
}

/// Per-position plan from the operation kinds and which positions carry an operator.
pub fn plan(
    kinds: &[OpKind],
    present: &[bool],
    num_single_frame_decoder: usize,
) -> Result<Vec<StepPlan>, Error> {
    let last = kinds.len().saturating_sub(1);
    let mut refines = 0;
    let mut final_refine = None;

    let plans: Vec<StepPlan> = kinds
        .iter()
        .zip(present)
        .enumerate()
        .map(|(position, (&kind, &present))| {
            if kind != OpKind::Refine || !present {
                return StepPlan::default();
            }
            refines += 1;
            let plan = StepPlan {
                return_cls: refines == num_single_frame_decoder || position == last,
                merge: refines == num_single_frame_decoder,
                re_embed: position != last,
                refresh_temp_embed: refines > num_single_frame_decoder,
            };
            final_refine = Some(plan);
            plan
        })
        .collect();

    match final_refine {
        None => Err(Error::MissingOutput("anchor")),
        Some(plan) if !plan.return_cls => Err(Error::MissingOutput("class_score")),
        Some(_) => Ok(plans),
    }
}
