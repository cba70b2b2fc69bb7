use ndarray::{s, Array2, ArrayView2, Axis, Ix3};

use crate::backend::kernels::sigmoid;
use crate::bbox::Box3D;
use crate::config::DecoderConfig;
use crate::detection::Detection;
use crate::error::Error;
use crate::head::HeadOutputs;
use crate::tensor::Value;

/// Index of the centerness logit in the quality score.
const CNS: usize = 0;

/// Turns raw head outputs into per-sample detections.
pub struct SparseBox3DDecoder {
    config: DecoderConfig,
}

struct Candidate {
    instance: usize,
    class: usize,
    score: f32,
    cls_score: f32,
    keep: bool,
}

impl SparseBox3DDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    /// Decodes every sample of the batch.
    ///
    /// With `track_id` every instance contributes only its best class, otherwise each
    /// `(instance, class)` pair competes for the `num_output` slots.
    pub fn decode(
        &self,
        outputs: &HeadOutputs<Value>,
        track_id: Option<&Array2<i32>>,
    ) -> Result<Vec<Vec<Detection>>, Error> {
        let class_score = outputs
            .class_score
            .as_f32()?
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|e| Error::shape("box_decoder", e.to_string()))?;
        let quality = outputs
            .quality_score
            .as_f32()?
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|e| Error::shape("box_decoder", e.to_string()))?;
        let anchor = outputs
            .anchor
            .as_f32()?
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|e| Error::shape("box_decoder", e.to_string()))?;

        let instances = &class_score.shape()[..2];
        if &quality.shape()[..2] != instances
            || &anchor.shape()[..2] != instances
            || quality.shape()[2] <= CNS
        {
            return Err(Error::shape(
                "box_decoder",
                format!(
                    "class {:?}, quality {:?} and anchor {:?} disagree",
                    class_score.shape(),
                    quality.shape(),
                    anchor.shape()
                ),
            ));
        }
        if let Some(ids) = track_id {
            if ids.dim() != (class_score.shape()[0], class_score.shape()[1]) {
                return Err(Error::shape(
                    "box_decoder",
                    format!("track ids {:?} for scores {:?}", ids.dim(), class_score.shape()),
                ));
            }
        }

        let mut batch = Vec::with_capacity(class_score.shape()[0]);
        for (i, scores) in class_score.outer_iter().enumerate() {
            let mut candidates = self.candidates(scores, track_id.is_some());

            if self.config.use_centerness {
                for c in candidates.iter_mut() {
                    c.score *= sigmoid(quality[[i, c.instance, CNS]]);
                }
                candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
            }

            let detections = candidates
                .into_iter()
                .filter(|c| c.keep)
                .map(|c| {
                    let row = anchor.slice(s![i, c.instance, ..]);
                    Detection {
                        bbox: Box3D::from_anchor(&row.to_vec()),
                        confidence: c.score,
                        class: c.class as i32,
                        cls_score: Some(c.cls_score).filter(|_| self.config.use_centerness),
                        track_id: track_id.map(|ids| ids[[i, c.instance]]),
                    }
                })
                .collect();
            batch.push(detections);
        }

        Ok(batch)
    }

    /// The `num_output` best candidates by sigmoid score, highest first.
    fn candidates(&self, scores: ArrayView2<f32>, squeeze_cls: bool) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = if squeeze_cls {
            scores
                .axis_iter(Axis(0))
                .enumerate()
                .map(|(instance, row)| {
                    let (class, logit) = row
                        .iter()
                        .enumerate()
                        .fold((0, f32::NEG_INFINITY), |best, (c, &v)| if v > best.1 { (c, v) } else { best });
                    (instance, class, sigmoid(logit))
                })
                .map(|(instance, class, score)| self.candidate(instance, class, score))
                .collect()
        } else {
            scores
                .indexed_iter()
                .map(|((instance, class), &logit)| self.candidate(instance, class, sigmoid(logit)))
                .collect()
        };

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(self.config.num_output);
        candidates
    }

    fn candidate(&self, instance: usize, class: usize, score: f32) -> Candidate {
        Candidate {
            instance,
            class,
            score,
            cls_score: score,
            keep: self.config.score_threshold.map_or(true, |t| score >= t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::{ANCHOR_DIM, W, X};

    fn outputs() -> HeadOutputs<Value> {
        let mut anchor = vec![0.0; 3 * ANCHOR_DIM];
        for i in 0..3 {
            anchor[i * ANCHOR_DIM + X] = i as f32;
            anchor[i * ANCHOR_DIM + W] = 1.0;
        }

        HeadOutputs {
            instance_feature: Value::zeros(&[1, 3, 4]),
            anchor: Value::from_f32(&[1, 3, ANCHOR_DIM], anchor).unwrap(),
            class_score: Value::from_f32(&[1, 3, 2], vec![-2.0, 1.0, 3.0, 0.0, 0.5, -1.0]).unwrap(),
            quality_score: Value::zeros(&[1, 3, 2]),
            track_id: None,
        }
    }

    #[test]
    fn ranks_instance_class_pairs() {
        let decoder = SparseBox3DDecoder::new(DecoderConfig {
            num_output: 3,
            score_threshold: None,
            use_centerness: false,
        });
        let dets = decoder.decode(&outputs(), None).unwrap();

        let picked: Vec<(f32, i32)> = dets[0].iter().map(|d| (d.bbox.center[0], d.class)).collect();
        assert_eq!(picked, vec![(1.0, 0), (0.0, 1), (2.0, 0)]);
        assert!((dets[0][0].bbox.size[0] - 1f32.exp()).abs() < 1e-5);
        assert!(dets[0][0].cls_score.is_none());
    }

    #[test]
    fn nan_scores_do_not_scramble_the_ranking() {
        let mut out = outputs();
        out.class_score =
            Value::from_f32(&[1, 3, 2], vec![-2.0, 1.0, 3.0, 0.0, 0.5, f32::NAN]).unwrap();
        let decoder = SparseBox3DDecoder::new(DecoderConfig {
            num_output: 6,
            score_threshold: None,
            use_centerness: false,
        });
        let dets = decoder.decode(&out, None).unwrap();

        let nan_at = dets[0].iter().position(|d| d.confidence.is_nan()).unwrap();
        assert!(nan_at == 0 || nan_at == 5);
        let finite: Vec<(f32, i32)> = dets[0]
            .iter()
            .filter(|d| !d.confidence.is_nan())
            .map(|d| (d.bbox.center[0], d.class))
            .collect();
        assert_eq!(finite, vec![(1.0, 0), (0.0, 1), (2.0, 0), (1.0, 1), (0.0, 0)]);
    }

    #[test]
    fn squeezes_classes_for_tracked_instances() {
        let decoder = SparseBox3DDecoder::new(DecoderConfig {
            num_output: 10,
            score_threshold: Some(0.7),
            use_centerness: true,
        });
        let ids = Array2::from_shape_vec((1, 3), vec![4, 5, -1]).unwrap();
        let dets = decoder.decode(&outputs(), Some(&ids)).unwrap();

        // Zero centerness halves every score after the threshold was applied on raw scores.
        assert_eq!(dets[0].len(), 2);
        assert_eq!(dets[0][0].track_id, Some(5));
        assert_eq!(dets[0][1].track_id, Some(4));
        assert!((dets[0][0].confidence - 0.5 * sigmoid(3.0)).abs() < 1e-6);
        assert_eq!(dets[0][0].cls_score, Some(sigmoid(3.0)));
    }
}
