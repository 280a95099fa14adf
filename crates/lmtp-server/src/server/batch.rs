//! Left-padded batch construction over a group of calls that share a
//! [`GenerateCall::generation_mode`], grounded in `GenerateBatch.from_calls`
//! in the original scheduler.

use crate::server::call::GenerateCall;
use lmtp_core::kwargs::Kwargs;
use std::collections::HashMap;

/// A padded, ready-to-dispatch group of calls. Constructed by
/// [`GenerateBatch::from_calls`]; never constructed directly since the
/// padding/offset bookkeeping must stay consistent with the call list.
pub struct GenerateBatch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u8>>,
    pub temperature: f64,
    pub max_tokens: i64,
    pub logit_biases: Vec<HashMap<u32, f32>>,
    pub calls: Vec<GenerateCall>,
    pub is_score: bool,
    /// Present iff `is_score`; `scoring_offsets[i]` is the column at which
    /// row `i`'s scored region begins, already adjusted for left padding.
    pub scoring_offsets: Option<Vec<i64>>,
    /// Residual kwargs, shared across the batch, with `max_tokens`,
    /// `top_logprobs`, and `temperature` stripped.
    pub extra: Kwargs,
}

impl GenerateBatch {
    /// Builds a batch from a non-empty group of same-`generation_mode`
    /// calls. Panics if `calls` is empty or mixes score and non-score
    /// calls — both are programming errors, unreachable through the
    /// scheduler's public API since batches are always grouped by
    /// `generation_mode()` first.
    pub fn from_calls(calls: Vec<GenerateCall>) -> Self {
        assert!(!calls.is_empty(), "cannot build a batch from zero calls");

        let max_len = calls.iter().map(|c| c.prompt().len()).max().unwrap_or(0);

        let mut input_ids = Vec::with_capacity(calls.len());
        let mut attention_mask = Vec::with_capacity(calls.len());
        for call in &calls {
            let pad = max_len - call.prompt().len();
            let mut ids = vec![0u32; pad];
            ids.extend_from_slice(call.prompt());
            let mut mask = vec![0u8; pad];
            mask.extend(std::iter::repeat_n(1u8, call.prompt().len()));
            input_ids.push(ids);
            attention_mask.push(mask);
        }

        let temperature = calls[0].kwargs().temperature();
        let max_tokens = calls.iter().map(|c| c.kwargs().max_tokens()).max().unwrap_or(32);
        let logit_biases = calls.iter().map(|c| c.logit_bias().clone()).collect();

        let is_score = calls.iter().any(|c| c.kwargs().score());
        assert!(
            !is_score || calls.iter().all(|c| c.kwargs().score()),
            "cannot mix score and non-score calls in a batch"
        );

        let scoring_offsets = if is_score {
            Some(
                calls
                    .iter()
                    .map(|c| {
                        let padding = (max_len - c.prompt().len()) as i64;
                        c.kwargs().scoring_offset() + padding
                    })
                    .collect(),
            )
        } else {
            None
        };

        let extra = calls[0].kwargs().without_normalized();

        Self {
            input_ids,
            attention_mask,
            temperature,
            max_tokens,
            logit_biases,
            calls,
            is_score,
            scoring_offsets,
            extra,
        }
    }

    /// True once every call in the batch has been cancelled.
    pub fn all_cancelled(&self) -> bool {
        self.calls.iter().all(|c| c.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn call(prompt: Vec<u32>, stream_id: u64) -> GenerateCall {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        GenerateCall::new(prompt, HashMap::new(), Kwargs::new(), stream_id, tx)
    }

    #[test]
    fn pads_to_longest_prompt_left_aligned() {
        let batch = GenerateBatch::from_calls(vec![call(vec![1, 2, 3], 1), call(vec![9], 2)]);
        assert_eq!(batch.input_ids[0], vec![1, 2, 3]);
        assert_eq!(batch.input_ids[1], vec![0, 0, 9]);
        assert_eq!(batch.attention_mask[0], vec![1, 1, 1]);
        assert_eq!(batch.attention_mask[1], vec![0, 0, 1]);
    }

    #[test]
    fn max_tokens_is_the_max_across_calls() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut kwargs_a = Kwargs::new();
        kwargs_a.insert("max_tokens", 5_i64);
        let mut kwargs_b = Kwargs::new();
        kwargs_b.insert("max_tokens", 50_i64);

        let call_a = GenerateCall::new(vec![1], HashMap::new(), kwargs_a, 1, tx.clone());
        let call_b = GenerateCall::new(vec![1], HashMap::new(), kwargs_b, 2, tx);
        let batch = GenerateBatch::from_calls(vec![call_a, call_b]);
        assert_eq!(batch.max_tokens, 50);
    }

    #[test]
    fn scoring_offsets_account_for_left_padding() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut kwargs = Kwargs::new();
        kwargs.insert("score", true).insert("scoring_offset", 2_i64);
        let call_a = GenerateCall::new(vec![1, 2, 3, 4, 5], HashMap::new(), kwargs.clone(), 1, tx.clone());
        let call_b = GenerateCall::new(vec![1, 2, 3], HashMap::new(), kwargs, 2, tx);

        let batch = GenerateBatch::from_calls(vec![call_a, call_b]);
        assert_eq!(batch.scoring_offsets, Some(vec![2, 4]));
    }

    #[test]
    #[should_panic(expected = "mix score and non-score")]
    fn rejects_mixed_score_batch() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut scored = Kwargs::new();
        scored.insert("score", true);

        let call_a = GenerateCall::new(vec![1], HashMap::new(), scored, 1, tx.clone());
        let call_b = GenerateCall::new(vec![1], HashMap::new(), Kwargs::new(), 2, tx);
        GenerateBatch::from_calls(vec![call_a, call_b]);
    }
}
