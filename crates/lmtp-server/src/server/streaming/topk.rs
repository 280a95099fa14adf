//! Partial top-k selection over a row's vocabulary log-probs, the one
//! hot-path algorithmic concern the original scheduler glosses over with
//! `numpy.topk`.

/// Returns up to `k` `(token_id, logprob)` pairs from `row`, sorted
/// descending by logprob. Uses `select_nth_unstable_by` to partition the
/// top-`k` in expected linear time instead of sorting the full vocabulary,
/// then sorts only that small slice.
pub fn top_k(row: &[f32], k: usize) -> Vec<(u32, f32)> {
    let k = k.min(row.len());
    if k == 0 {
        return Vec::new();
    }

    let mut indexed: Vec<(u32, f32)> = row
        .iter()
        .enumerate()
        .map(|(i, &v)| (i as u32, v))
        .collect();

    if k < indexed.len() {
        indexed.select_nth_unstable_by(k - 1, |a, b| b.1.total_cmp(&a.1));
        indexed.truncate(k);
    }

    indexed.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
    indexed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_highest_scoring_tokens_in_order() {
        let row = vec![0.1, 0.9, 0.5, 0.3];
        let top = top_k(&row, 2);
        assert_eq!(top, vec![(1, 0.9), (2, 0.5)]);
    }

    #[test]
    fn clamps_k_to_vocab_size() {
        let row = vec![0.2, 0.8];
        let top = top_k(&row, 10);
        assert_eq!(top.len(), 2);
    }

    #[test]
    fn zero_k_returns_empty() {
        assert!(top_k(&[0.1, 0.2], 0).is_empty());
    }
}
