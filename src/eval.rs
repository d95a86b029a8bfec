use std::collections::HashSet;

/// Number of the first `predictions.len()` ground-truth ids that were predicted.
pub fn intersection(predictions: &[u32], ground_truth: &[u32]) -> usize {
    let predicted: HashSet<u32> = predictions.iter().copied().collect();
    ground_truth
        .iter()
        .take(predictions.len())
        .filter(|id| predicted.contains(id))
        .count()
}

/// Mean fraction of the true top-`k` found in the predicted top-`k` (R1@K).
///
/// Queries are paired by position; extra rows on either side are ignored.
pub fn recall_at_k(predictions: &[Vec<u32>], ground_truth: &[Vec<u32>], k: usize) -> f64 {
    let queries = predictions.len().min(ground_truth.len());
    if queries == 0 || k == 0 {
        return 0.0;
    }

    let hits: usize = predictions
        .iter()
        .zip(ground_truth.iter())
        .map(|(predicted, truth)| {
            let truth = &truth[..k.min(truth.len())];
            intersection(&predicted[..k.min(predicted.len())], truth)
        })
        .sum();
    hits as f64 / (queries * k) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_counts_shared_ids() {
        assert_eq!(intersection(&[1, 2, 3], &[3, 4, 1]), 2);
        assert_eq!(intersection(&[], &[1, 2]), 0);
    }

    #[test]
    fn intersection_only_looks_at_prediction_length() {
        // Only the first two ground-truth entries are compared.
        assert_eq!(intersection(&[5, 9], &[7, 8, 5, 9]), 0);
    }

    #[test]
    fn recall_is_averaged_over_queries() {
        let predictions = vec![vec![1, 2], vec![3, 9]];
        let truth = vec![vec![2, 1, 7], vec![3, 4, 5]];
        let recall = recall_at_k(&predictions, &truth, 2);
        assert!((recall - 0.75).abs() < 1e-12);
    }

    #[test]
    fn short_predictions_count_as_misses() {
        let recall = recall_at_k(&[vec![1]], &[vec![1, 2]], 2);
        assert!((recall - 0.5).abs() < 1e-12);
        assert_eq!(recall_at_k(&[], &[], 10), 0.0);
    }
}
