//! Scoring fused objects against ground-truth labels.

use serde::Serialize;

use super::fusion::FusedObject;
use crate::core::labels::Label;

/// One label matched to one fused object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelMatch {
    pub label_index: usize,
    pub fused_index: usize,
    pub category: String,
    pub center_error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub label_count: usize,
    pub fused_count: usize,
    pub matched: usize,
    /// Mean center distance over matches, absent when nothing matched
    pub mean_center_error: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub matches: Vec<LabelMatch>,
}

fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

fn ratio(num: usize, den: usize) -> Option<f64> {
    (den > 0).then(|| num as f64 / den as f64)
}

/// Greedy nearest-center matching within `match_radius` meters.
///
/// Candidate pairs are taken shortest distance first; each label and each
/// fused object is used at most once.
pub fn evaluate(labels: &[Label], fused: &[FusedObject], match_radius: f64) -> EvaluationReport {
    let centers: Vec<[f64; 3]> = labels.iter().map(Label::center).collect();

    let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
    for (li, center) in centers.iter().enumerate() {
        for (fi, obj) in fused.iter().enumerate() {
            let d = distance(*center, obj.position);
            if d <= match_radius {
                candidates.push((d, li, fi));
            }
        }
    }
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut label_used = vec![false; labels.len()];
    let mut fused_used = vec![false; fused.len()];
    let mut matches = Vec::new();
    for (d, li, fi) in candidates {
        if label_used[li] || fused_used[fi] {
            continue;
        }
        label_used[li] = true;
        fused_used[fi] = true;
        matches.push(LabelMatch {
            label_index: li,
            fused_index: fi,
            category: labels[li].category.clone(),
            center_error: d,
        });
    }
    matches.sort_by_key(|m| m.label_index);

    let matched = matches.len();
    let mean_center_error =
        (matched > 0).then(|| matches.iter().map(|m| m.center_error).sum::<f64>() / matched as f64);

    EvaluationReport {
        label_count: labels.len(),
        fused_count: fused.len(),
        matched,
        mean_center_error,
        precision: ratio(matched, fused.len()),
        recall: ratio(matched, labels.len()),
        matches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::labels::parse_labels;
    use approx::assert_relative_eq;

    fn fused_at(position: [f64; 3]) -> FusedObject {
        FusedObject {
            bbox2d: [0.0; 4],
            bbox3d: [0.0; 6],
            category: "car".into(),
            confidence: 0.9,
            distance: 0.0,
            position,
            cluster_id: 0,
            num_points: 5,
        }
    }

    #[test]
    fn test_evaluate_greedy_matching() {
        // Centers at (0, 0, 10) and (3, 0, 10)
        let labels = parse_labels(
            "Car 0 0 0 0 0 1 1 2.0 1.6 4.0 0.0 1.0 10.0 0.0\n\
             Car 0 0 0 0 0 1 1 2.0 1.6 4.0 3.0 1.0 10.0 0.0\n",
        )
        .unwrap();
        let fused = vec![
            fused_at([0.5, 0.0, 10.0]),
            fused_at([1.2, 0.0, 10.0]),
            fused_at([30.0, 0.0, 10.0]),
        ];

        let report = evaluate(&labels, &fused, 2.0);
        assert_eq!(report.label_count, 2);
        assert_eq!(report.fused_count, 3);
        assert_eq!(report.matched, 2);
        assert_eq!(report.matches[0].fused_index, 0);
        assert_eq!(report.matches[1].fused_index, 1);
        assert_relative_eq!(report.mean_center_error.unwrap(), (0.5 + 1.8) / 2.0, epsilon = 1e-9);
        assert_relative_eq!(report.precision.unwrap(), 2.0 / 3.0);
        assert_eq!(report.recall, Some(1.0));
    }

    #[test]
    fn test_evaluate_nothing_to_match() {
        let report = evaluate(&[], &[], 2.0);
        assert_eq!(report.matched, 0);
        assert!(report.mean_center_error.is_none());
        assert!(report.precision.is_none());
        assert!(report.recall.is_none());
    }
}
