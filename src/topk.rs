use crate::backend::Backend;
use crate::error::Error;

/// The best `k` instances of every sample, highest score first.
pub struct Selection<T> {
    pub scores: T,
    pub indices: T,
    pub feature: T,
    pub anchor: T,
}

/// Selects the top-`k` `(feature, anchor)` pairs of each sample by `scores` of shape `(bs, n)`.
///
/// Ties keep the lower index first, and `k == 0` yields empty selections of the same rank.
pub fn top_k<B: Backend>(
    b: &B,
    scores: &B::Tensor,
    k: usize,
    feature: &B::Tensor,
    anchor: &B::Tensor,
) -> Result<Selection<B::Tensor>, Error> {
    let shape = b.shape(scores);
    if shape.len() != 2 {
        return Err(Error::shape(
            "top_k",
            format!("scores must be (bs, n), got {:?}", shape),
        ));
    }

    let (scores, indices) = b.top_k(scores, k)?;
    let feature = b.gather(feature, &indices)?;
    let anchor = b.gather(anchor, &indices)?;

    Ok(Selection {
        scores,
        indices,
        feature,
        anchor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Eager;
    use crate::tensor::Value;

    #[test]
    fn gathers_rows_of_the_best_scores() {
        let scores = Value::from_f32(&[1, 4], vec![0.1, 0.9, 0.4, 0.9]).unwrap();
        let feature = Value::from_f32(&[1, 4, 1], vec![10.0, 11.0, 12.0, 13.0]).unwrap();
        let anchor = Value::from_f32(&[1, 4, 2], (0..8).map(|x| x as f32).collect()).unwrap();

        let sel = top_k(&Eager, &scores, 3, &feature, &anchor).unwrap();

        assert_eq!(sel.indices, Value::from_i32(&[1, 3], vec![1, 3, 2]).unwrap());
        assert_eq!(sel.feature, Value::from_f32(&[1, 3, 1], vec![11.0, 13.0, 12.0]).unwrap());
        assert_eq!(
            sel.anchor,
            Value::from_f32(&[1, 3, 2], vec![2.0, 3.0, 6.0, 7.0, 4.0, 5.0]).unwrap()
        );
    }

    #[test]
    fn zero_selects_nothing() {
        let scores = Value::zeros(&[2, 5]);
        let feature = Value::zeros(&[2, 5, 3]);
        let anchor = Value::zeros(&[2, 5, 11]);

        let sel = top_k(&Eager, &scores, 0, &feature, &anchor).unwrap();
        assert_eq!(sel.feature.shape(), &[2, 0, 3]);
        assert_eq!(sel.anchor.shape(), &[2, 0, 11]);
    }

    #[test]
    fn rejects_unbatched_scores() {
        let scores = Value::zeros(&[5]);
        let feature = Value::zeros(&[1, 5, 3]);
        assert!(top_k(&Eager, &scores, 1, &feature, &feature).is_err());
    }
}
