//! Per-step token streaming, grounded in `TokenStreamer` in the original
//! scheduler. Implements [`lmtp_core::backend::TokenSink`] so a backend can
//! drive it directly through `generate`.

use crate::server::batch::GenerateBatch;
use crate::server::streaming::topk::top_k;
use lmtp_core::backend::TokenSink;
use lmtp_core::transport::{FinishReason, TokenPayload};
use std::collections::BTreeMap;

/// Anything that wants to observe the instantaneous size of each step
/// streamed through a [`TokenStreamer`], to feed the scheduler's rolling
/// rate estimator. Kept as a trait (rather than a direct `&Scheduler`
/// reference) so this module doesn't need to depend on the scheduler
/// module.
pub trait RateMeter {
    fn measure_token(&self, batch_size: usize);
}

/// Streams one step of `generate` output back to every call in a batch.
///
/// `cancels` mirrors the backend's `supports_cancellation()`: when true,
/// [`TokenStreamer::log_token`] raises [`Cancelled`](crate::server::streaming::token::Cancelled)
/// once every row in the batch has been cancelled, so the backend can stop
/// generating early.
pub struct TokenStreamer<'a, M: RateMeter> {
    batch: &'a GenerateBatch,
    eos_token_id: u32,
    cancels: bool,
    meter: &'a M,
}

/// Raised by [`TokenStreamer::log_token`] when every row in the batch has
/// been cancelled and the backend supports stopping early.
#[derive(Debug)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "inference calls cancelled")
    }
}

impl std::error::Error for Cancelled {}

impl<'a, M: RateMeter> TokenStreamer<'a, M> {
    pub fn new(batch: &'a GenerateBatch, eos_token_id: u32, cancels: bool, meter: &'a M) -> Self {
        Self {
            batch,
            eos_token_id,
            cancels,
            meter,
        }
    }

    /// Streams one step. `last` marks the final, post-`generate` call made
    /// by the scheduler itself (not the backend), which annotates any
    /// still-open row with a `"length"` finish reason.
    pub fn log_token(
        &self,
        input_ids_so_far: &[Vec<u32>],
        scores_so_far: &[Vec<Vec<f32>>],
        last: bool,
    ) -> Result<(), Cancelled> {
        let batch_size = input_ids_so_far.len();
        let last_scores = scores_so_far.last().expect("generate must emit at least one step");

        if self.cancels && self.batch.all_cancelled() {
            return Err(Cancelled);
        }

        self.meter.measure_token(batch_size);

        let max_top_logprobs = self
            .batch
            .calls
            .iter()
            .map(|c| c.kwargs().top_logprobs())
            .max()
            .unwrap_or(1)
            .max(1) as usize;

        for (i, call) in self.batch.calls.iter().enumerate() {
            let last_token = *input_ids_so_far[i].last().expect("row must have at least the prompt");
            let row_scores = &last_scores[i];
            let token_score = row_scores.get(last_token as usize).copied().unwrap_or(f32::NEG_INFINITY);

            let top = top_k(row_scores, max_top_logprobs);
            let num_top_logprobs = call.kwargs().top_logprobs().max(0) as usize;

            let mut top_logprobs: BTreeMap<u32, f32> = BTreeMap::new();
            top_logprobs.insert(last_token, token_score);
            for (token, logprob) in top.into_iter().take(num_top_logprobs) {
                top_logprobs.insert(token, logprob);
            }

            let finish_reason = if last_token == self.eos_token_id {
                Some(FinishReason::Stop)
            } else if last {
                Some(FinishReason::Length)
            } else {
                None
            };

            call.put(TokenPayload {
                token: last_token,
                stream_id: call.stream_id(),
                logprob: token_score,
                finish_reason,
                top_logprobs: Some(top_logprobs),
            });
        }

        Ok(())
    }
}

/// Bridges a [`TokenStreamer`] into the dyn-safe [`TokenSink`] the backend
/// calls directly. Errors (cancellation) are swallowed here: the scheduler
/// inspects `self.batch.all_cancelled()` itself after `generate` returns,
/// the same way the original's `InterruptedError` is caught one level up in
/// `process_batch`.
pub struct TokenSinkAdapter<'a, M: RateMeter> {
    streamer: TokenStreamer<'a, M>,
}

impl<'a, M: RateMeter> TokenSinkAdapter<'a, M> {
    pub fn new(streamer: TokenStreamer<'a, M>) -> Self {
        Self { streamer }
    }

    pub fn into_inner(self) -> TokenStreamer<'a, M> {
        self.streamer
    }
}

impl<'a, M: RateMeter + Send + Sync> TokenSink for TokenSinkAdapter<'a, M> {
    fn log_token(&mut self, input_ids_so_far: &[Vec<u32>], scores_so_far: &[Vec<Vec<f32>>]) -> bool {
        self.streamer.log_token(input_ids_so_far, scores_so_far, false).is_err()
    }
}
