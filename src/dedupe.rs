//! Cross-source suppression for detections from independently run models.

use crate::Detection;

/// Greedy IoU suppression across detection sources.
///
/// Stateless per call. The higher-confidence box always wins, regardless of
/// which model produced it.
#[derive(Clone, Copy, Debug)]
pub struct CrossSourceDeduplicator {
    iou_threshold: f32,
}

impl CrossSourceDeduplicator {
    pub fn new(iou_threshold: f32) -> Self {
        Self { iou_threshold }
    }

    pub fn dedupe(&self, detections: Vec<Detection>) -> Vec<Detection> {
        dedupe(detections, self.iou_threshold)
    }
}

/// Keeps a detection unless its IoU with an already kept one exceeds
/// `iou_threshold`. Output is ordered by descending score.
pub fn dedupe(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    // Stable sort: equal scores keep arrival order.
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept
            .iter()
            .any(|accepted| accepted.bbox.iou(&candidate.bbox) > iou_threshold);
        if suppressed {
            log::debug!(
                "suppressed {} ({}, score {:.2}) overlapping a stronger detection",
                candidate.class,
                candidate.source,
                candidate.score
            );
            continue;
        }
        kept.push(candidate);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BBox, TrackIdentity};

    fn det(bbox: BBox, class: &str, score: f32, source: &str) -> Detection {
        Detection {
            bbox,
            class: class.to_string(),
            score,
            source: source.to_string(),
            track: TrackIdentity::Synthetic(0),
        }
    }

    #[test]
    fn predator_beats_overlapping_human() {
        // 100x100 boxes shifted 17.6px: IoU ~0.7
        let predator = det(BBox::new(0.0, 0.0, 100.0, 100.0), "predator", 0.9, "predator");
        let human = det(BBox::new(17.6, 0.0, 117.6, 100.0), "human", 0.6, "human");
        assert!(predator.bbox.iou(&human.bbox) > 0.69);

        let kept = dedupe(vec![human, predator], 0.5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].class, "predator");
    }

    #[test]
    fn iou_at_threshold_keeps_both() {
        // Intersection 50, union 100: IoU exactly 0.5
        let a = det(BBox::new(0.0, 0.0, 10.0, 7.5), "turtle", 0.8, "species");
        let b = det(BBox::new(0.0, 2.5, 10.0, 10.0), "turtle", 0.7, "species");
        assert!((a.bbox.iou(&b.bbox) - 0.5).abs() < 1e-6);

        let kept = CrossSourceDeduplicator::new(0.5).dedupe(vec![a, b]);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn output_is_sorted_by_score() {
        let a = det(BBox::new(0.0, 0.0, 10.0, 10.0), "turtle", 0.3, "species");
        let b = det(BBox::new(50.0, 50.0, 60.0, 60.0), "turtle", 0.9, "species");
        let kept = dedupe(vec![a, b], 0.5);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.3);
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(dedupe(Vec::new(), 0.5).is_empty());
    }
}
