//! Turn semantic segmentation logits into labeled segments

use crate::{
    error::{Result, WhiteBgError},
    models::LabelMap,
    types::{MaskData, SegmentRecord},
};
use ndarray::{ArrayViewD, Ix4};

/// Decode `[1, classes, height, width]` logits into one segment per present class.
///
/// Each pixel belongs to its argmax class; the class's mask is 255 on its
/// pixels and 0 elsewhere at logits resolution. A segment's score is the mean
/// softmax probability of its pixels; segments scoring below
/// `confidence_threshold` are dropped. Segments are ordered by class id.
///
/// # Errors
/// Returns `WhiteBgError::Inference` for logits that are not rank 4 with batch 1
pub fn segments_from_logits(
    logits: ArrayViewD<'_, f32>,
    labels: &LabelMap,
    confidence_threshold: f32,
) -> Result<Vec<SegmentRecord>> {
    let shape = logits.shape().to_vec();
    let logits = logits.into_dimensionality::<Ix4>().map_err(|_| {
        WhiteBgError::inference(format!(
            "Expected logits of shape [1, classes, height, width], got {:?}",
            shape
        ))
    })?;

    let (batch, classes, height, width) = logits.dim();
    if batch != 1 || classes == 0 || height == 0 || width == 0 {
        return Err(WhiteBgError::inference(format!(
            "Unsupported logits shape {:?}",
            shape
        )));
    }

    let pixels = height * width;
    let mut assignment = vec![0usize; pixels];
    let mut confidence_sum = vec![0f64; classes];
    let mut pixel_count = vec![0usize; classes];

    for y in 0..height {
        for x in 0..width {
            let mut best_class = 0;
            let mut best_logit = f32::NEG_INFINITY;
            for class in 0..classes {
                let value = logits[[0, class, y, x]];
                if value > best_logit {
                    best_logit = value;
                    best_class = class;
                }
            }

            // softmax probability of the argmax class: 1 / sum(exp(l - max))
            let mut denominator = 0f64;
            for class in 0..classes {
                denominator += f64::from(logits[[0, class, y, x]] - best_logit).exp();
            }

            let index = y * width + x;
            if let Some(slot) = assignment.get_mut(index) {
                *slot = best_class;
            }
            if let (Some(sum), Some(count)) = (
                confidence_sum.get_mut(best_class),
                pixel_count.get_mut(best_class),
            ) {
                *sum += 1.0 / denominator;
                *count += 1;
            }
        }
    }

    let mut segments = Vec::new();
    for (class, (&count, &sum)) in pixel_count.iter().zip(&confidence_sum).enumerate() {
        if count == 0 {
            continue;
        }
        let score = (sum / count as f64) as f32;
        let label = labels.label(class);
        if score < confidence_threshold {
            log::debug!(
                "Dropping segment '{}' with score {:.3} below threshold {:.3}",
                label,
                score,
                confidence_threshold
            );
            continue;
        }

        let data = assignment
            .iter()
            .map(|&assigned| if assigned == class { 255 } else { 0 })
            .collect();
        segments.push(SegmentRecord {
            label,
            score: Some(score.clamp(0.0, 1.0)),
            mask: MaskData::Raw {
                width: width as u32,
                height: height as u32,
                data,
            },
        });
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn labels() -> LabelMap {
        LabelMap::new([(0, "sky"), (1, "road"), (2, "car")])
    }

    #[test]
    fn test_argmax_masks() {
        // 2x2 image: left column car, right column sky
        let mut logits = Array4::<f32>::zeros((1, 3, 2, 2));
        for y in 0..2 {
            logits[[0, 2, y, 0]] = 10.0;
            logits[[0, 0, y, 1]] = 10.0;
        }

        let segments = segments_from_logits(logits.view().into_dyn(), &labels(), 0.5).unwrap();
        let names: Vec<_> = segments.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(names, vec!["sky", "car"]);

        let MaskData::Raw { width, height, data } = &segments[1].mask else {
            panic!("expected raw mask");
        };
        assert_eq!((*width, *height), (2, 2));
        assert_eq!(data, &vec![255, 0, 255, 0]);
        assert!(segments[1].score.unwrap() > 0.99);
    }

    #[test]
    fn test_low_confidence_segments_dropped() {
        // uniform logits: every class has probability 1/3
        let logits = Array4::<f32>::zeros((1, 3, 2, 2));
        let segments = segments_from_logits(logits.view().into_dyn(), &labels(), 0.5).unwrap();
        assert!(segments.is_empty());

        let segments = segments_from_logits(logits.view().into_dyn(), &labels(), 0.3).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].label, "sky");
    }

    #[test]
    fn test_zero_threshold_keeps_uncertain_subject() {
        // car wins every pixel, but only barely
        let mut logits = Array4::<f32>::zeros((1, 3, 2, 2));
        for y in 0..2 {
            for x in 0..2 {
                logits[[0, 2, y, x]] = 0.1;
            }
        }

        let filtered = segments_from_logits(logits.view().into_dyn(), &labels(), 0.5).unwrap();
        assert!(filtered.is_empty());

        let kept = segments_from_logits(logits.view().into_dyn(), &labels(), 0.0).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].label, "car");
        assert!(kept[0].score.unwrap() < 0.5);
    }

    #[test]
    fn test_bad_shape_rejected() {
        let logits = ndarray::Array3::<f32>::zeros((3, 2, 2));
        assert!(segments_from_logits(logits.view().into_dyn(), &labels(), 0.5).is_err());

        let batched = Array4::<f32>::zeros((2, 3, 2, 2));
        assert!(segments_from_logits(batched.view().into_dyn(), &labels(), 0.5).is_err());
    }
}
