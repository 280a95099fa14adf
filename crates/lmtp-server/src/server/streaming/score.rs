//! Per-position score streaming, grounded in `ScoreStreamer` in the
//! original scheduler.

use crate::server::batch::GenerateBatch;
use lmtp_core::transport::{FinishReason, TokenPayload};

pub struct ScoreStreamer;

impl ScoreStreamer {
    /// Streams every scored position of every row in `batch`, given
    /// `all_scores[row][position]` log-probs over the batch's padded
    /// `input_ids`.
    pub fn log_token(batch: &GenerateBatch, all_scores: &[Vec<f32>]) {
        let offsets = batch
            .scoring_offsets
            .as_ref()
            .expect("ScoreStreamer requires a score batch");

        for (i, call) in batch.calls.iter().enumerate() {
            let offset = offsets[i] as usize;
            let scores = &all_scores[i][offset..];
            let scored_ids = &batch.input_ids[i][offset..];

            let last = scores.len().saturating_sub(1);
            for (j, (&score, &token)) in scores.iter().zip(scored_ids.iter()).enumerate() {
                call.put(TokenPayload {
                    token,
                    stream_id: call.stream_id(),
                    logprob: score,
                    finish_reason: if j == last { Some(FinishReason::Stop) } else { None },
                    top_logprobs: None,
                });
            }
        }
    }
}
