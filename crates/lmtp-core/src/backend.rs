//! The `ModelBackend` capability (spec.md §6).
//!
//! This crate never implements a real model backend — the tokenizer, weights,
//! and forward pass are explicitly external collaborators. What lives here is
//! the narrow capability the scheduler calls into: load a model, report a few
//! static facts about it, and run `generate`/`score` against padded batches.
//!
//! The engine is generic over `B: ModelBackend` rather than boxing a trait
//! object — there's exactly one concrete backend type per deployment, known
//! at compile time, the same way `ferroid-tonic-server` is generic over one
//! concrete `Generator` type rather than a `dyn` generator.

use crate::kwargs::Kwargs;
use std::collections::HashMap;

/// A backend-reported error from `load`, `generate`, or `score`.
pub type BackendError = anyhow::Error;

/// The padded, batch-shaped arguments passed to [`ModelBackend::generate`].
pub struct GenerateInput<'a> {
    /// `[N, Lmax]`, left-padded with zeros.
    pub input_ids: &'a [Vec<u32>],
    /// `[N, Lmax]`; `0` over padding, `1` over real tokens.
    pub attention_mask: &'a [Vec<u8>],
    pub temperature: f64,
    pub max_new_tokens: u32,
    /// Per-row logit bias maps, parallel to `input_ids`'s rows.
    pub logit_biases: &'a [HashMap<u32, f32>],
    /// Residual kwargs after stripping `max_tokens`/`top_logprobs`/`temperature`.
    pub extra: &'a Kwargs,
}

/// The result of a completed `generate` call.
pub struct GenerateOutput {
    /// `[N, L']`: the full generated sequence per row, including prompt.
    pub sequences: Vec<Vec<u32>>,
    /// One vocabulary-sized score row per row, per generated step:
    /// `scores[step][row]` is that row's vocabulary log-prob vector at
    /// `step`. `scores.last()` is the final step.
    pub scores: Vec<Vec<Vec<f32>>>,
}

/// Receives one step's output from the backend while `generate` runs.
///
/// The backend must call [`TokenSink::log_token`] once per generated step
/// (or once per step for parallel sampling) and stop early if it returns
/// `true`.
pub trait TokenSink: Send {
    /// `input_ids_so_far`'s last column is the newly generated token per row;
    /// `scores_so_far.last()` is the per-row vocabulary log-prob vector for
    /// that step. Returns `true` to request the backend stop generating.
    fn log_token(&mut self, input_ids_so_far: &[Vec<u32>], scores_so_far: &[Vec<Vec<f32>>]) -> bool;
}

/// A loaded model, abstracted down to what the scheduler needs to drive it.
pub trait ModelBackend: Send + Sync + Sized + 'static {
    /// Loads a model instance for `model_identifier` with `model_args`.
    fn load(
        model_identifier: &str,
        model_args: &Kwargs,
    ) -> impl Future<Output = Result<Self, BackendError>> + Send;

    /// An opaque, backend-provided descriptor (name, revision, device, ...).
    fn info(&self) -> String;

    /// The token id that marks end-of-sequence for this backend.
    fn eos_token_id(&self) -> u32;

    /// The largest number of rows this backend can process in one batch.
    fn max_batch_size(&self) -> usize;

    /// Whether this backend can stop generation early when every row in a
    /// batch is cancelled.
    fn supports_cancellation(&self) -> bool;

    /// Runs generation for a padded batch, streaming per-step output through
    /// `streamer`.
    fn generate(
        &self,
        input: GenerateInput<'_>,
        streamer: &mut dyn TokenSink,
    ) -> impl Future<Output = Result<GenerateOutput, BackendError>> + Send;

    /// Scores a padded batch: `scores[i][t]` is the log-prob of
    /// `input_ids[i][t]` under the model given the preceding context.
    fn score(
        &self,
        input_ids: &[Vec<u32>],
        attention_mask: &[Vec<u8>],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, BackendError>> + Send;
}
