//! Result aggregation
//!
//! Pure, deterministic fan-in: merges recorded per-view results into one
//! combined document plus a derived feedback string. No I/O, so the
//! whole module tests against fixed fixtures.

use crate::models::{CombinedResult, View, ViewResult};
use std::collections::BTreeMap;

/// Merge per-view results into the combined session document
///
/// Views are emitted in the fixed order front, left, right, back
/// (`View`'s ordering), with `single` standing alone for one-file
/// sessions. Feedback concatenates one phrase per view in that order.
pub fn aggregate(model_name: &str, received_views: &BTreeMap<View, ViewResult>) -> CombinedResult {
    let feedback = received_views
        .iter()
        .map(|(view, result)| feedback_for_view(*view, result))
        .collect::<Vec<_>>()
        .join(" ");

    CombinedResult {
        model_name: model_name.to_string(),
        views: received_views.clone(),
        feedback,
    }
}

/// Qualitative phrase for one view's score
///
/// Thresholds operate on the overall score scaled to 0-100.
fn feedback_for_view(view: View, result: &ViewResult) -> String {
    let scaled = result.overall_score * 100.0;

    let phrase = if scaled >= 90.0 {
        "Excellent posture!"
    } else if scaled >= 80.0 {
        "Good posture with minor improvements needed."
    } else if scaled >= 70.0 {
        "Fair posture, consider adjustments."
    } else {
        "Poor posture, significant improvements needed."
    };

    format!("{} view: {}", view.title(), phrase)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(score: f64) -> ViewResult {
        ViewResult {
            overall_score: score,
            metrics: BTreeMap::from([("knee_angle".to_string(), score)]),
            keypoints: serde_json::Value::Null,
            frame_count: 15,
        }
    }

    #[test]
    fn single_view_produces_literal_phrase() {
        let views = BTreeMap::from([(View::Single, result(0.95))]);
        let combined = aggregate("cx", &views);

        assert_eq!(combined.feedback, "Single view: Excellent posture!");
        assert!(combined.views.contains_key(&View::Single));
        assert_eq!(combined.model_name, "cx");
    }

    #[test]
    fn feedback_follows_score_thresholds() {
        let cases = [
            (0.95, "Excellent posture!"),
            (0.90, "Excellent posture!"),
            (0.85, "Good posture with minor improvements needed."),
            (0.75, "Fair posture, consider adjustments."),
            (0.40, "Poor posture, significant improvements needed."),
        ];

        for (score, expected) in cases {
            let views = BTreeMap::from([(View::Front, result(score))]);
            let combined = aggregate("cx", &views);
            assert_eq!(combined.feedback, format!("Front view: {}", expected));
        }
    }

    #[test]
    fn views_concatenate_in_fixed_order_regardless_of_insertion() {
        // BTreeMap iteration fixes the order; insertion order is arbitrary
        let views = BTreeMap::from([
            (View::Back, result(0.95)),
            (View::Front, result(0.85)),
            (View::Right, result(0.75)),
            (View::Left, result(0.40)),
        ]);

        let combined = aggregate("cx", &views);
        assert_eq!(
            combined.feedback,
            "Front view: Good posture with minor improvements needed. \
             Left view: Poor posture, significant improvements needed. \
             Right view: Fair posture, consider adjustments. \
             Back view: Excellent posture!"
        );
    }

    #[test]
    fn combined_document_keeps_all_view_payloads() {
        let views = BTreeMap::from([
            (View::Front, result(0.9)),
            (View::Left, result(0.8)),
        ]);

        let combined = aggregate("gy", &views);
        assert_eq!(combined.views.len(), 2);
        assert_eq!(combined.views[&View::Front].frame_count, 15);
        assert_eq!(
            combined.views[&View::Left].metrics.get("knee_angle"),
            Some(&0.8)
        );
    }

    #[test]
    fn aggregation_is_deterministic() {
        let views = BTreeMap::from([
            (View::Front, result(0.9)),
            (View::Back, result(0.7)),
        ]);

        let a = aggregate("cx", &views);
        let b = aggregate("cx", &views);
        assert_eq!(a, b);
    }

    #[test]
    fn serialized_combined_result_uses_view_name_keys() {
        let views = BTreeMap::from([(View::Single, result(0.9))]);
        let combined = aggregate("cx", &views);

        let json = serde_json::to_value(&combined).unwrap();
        assert!(json["views"].get("single").is_some());
        assert!(json["feedback"].as_str().unwrap().starts_with("Single view:"));
    }
}
