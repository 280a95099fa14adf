//! The scheduler's batch-collection and dispatch loop, grounded in
//! `Scheduler.async_worker`/`process_batch` in the original scheduler.

use crate::server::batch::GenerateBatch;
use crate::server::call::GenerateCall;
use crate::server::scheduler::SchedulerConfig;
use crate::server::scheduler::handle::RateEstimator;
use crate::server::streaming::score::ScoreStreamer;
use crate::server::streaming::token::{TokenSinkAdapter, TokenStreamer};
use crate::server::telemetry;
use lmtp_core::backend::{GenerateInput, ModelBackend};
use lmtp_core::kwargs::Kwargs;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub struct WorkerArgs {
    pub model_identifier: String,
    pub model_args: Kwargs,
    pub call_rx: mpsc::UnboundedReceiver<GenerateCall>,
    pub kill: Arc<AtomicBool>,
    pub model_info: Arc<Mutex<String>>,
    pub rate: Arc<Mutex<RateEstimator>>,
    pub config: SchedulerConfig,
}

pub async fn run<B: ModelBackend>(args: WorkerArgs) {
    let WorkerArgs {
        model_identifier,
        model_args,
        mut call_rx,
        kill,
        model_info,
        rate,
        config,
    } = args;

    let backend = match B::load(&model_identifier, &model_args).await {
        Ok(backend) => backend,
        Err(err) => {
            cfg_if_tracing_error(&model_identifier, &err);
            return;
        }
    };
    *model_info.lock() = backend.info();

    let max_batch_size = config.max_batch_size.min(backend.max_batch_size()).max(1);
    let mut idle_since: Option<Instant> = None;

    loop {
        if kill.load(Ordering::Relaxed) {
            break;
        }

        match timeout(config.idle_sleep, call_rx.recv()).await {
            Ok(Some(first_call)) => {
                if let Some(since) = idle_since.take() {
                    log_idle_ended(since);
                }

                let mut calls = vec![first_call];
                let start = Instant::now();
                while start.elapsed() < config.collection_window {
                    match call_rx.try_recv() {
                        Ok(call) => calls.push(call),
                        Err(_) => break,
                    }
                }

                for group in group_by_mode(calls, max_batch_size) {
                    process_group(&backend, group, &rate).await;
                }
            }
            Ok(None) => break,
            Err(_) => {
                if idle_since.is_none() {
                    idle_since = Some(Instant::now());
                }
            }
        }
    }
}

fn cfg_if_tracing_error(model_identifier: &str, err: &lmtp_core::backend::BackendError) {
    #[cfg(feature = "tracing")]
    tracing::error!(model_identifier, %err, "failed to load model backend");
    #[cfg(not(feature = "tracing"))]
    let _ = (model_identifier, err);
}

fn log_idle_ended(since: Instant) {
    #[cfg(feature = "tracing")]
    tracing::debug!(idle_seconds = since.elapsed().as_secs_f64(), "scheduler worker resumed from idle");
    #[cfg(not(feature = "tracing"))]
    let _ = since;
}

/// Groups calls by `generation_mode()` and splits any oversized group into
/// chunks no larger than `max_batch_size`, matching `Scheduler.batches`.
fn group_by_mode(calls: Vec<GenerateCall>, max_batch_size: usize) -> Vec<Vec<GenerateCall>> {
    let mut by_mode: HashMap<String, Vec<GenerateCall>> = HashMap::new();
    for call in calls {
        by_mode.entry(call.generation_mode()).or_default().push(call);
    }

    let mut groups = Vec::new();
    for (_, mut bucket) in by_mode {
        if bucket.len() > max_batch_size {
            while !bucket.is_empty() {
                let chunk_len = max_batch_size.min(bucket.len());
                groups.push(bucket.drain(..chunk_len).collect());
            }
        } else {
            groups.push(bucket);
        }
    }
    groups
}

async fn process_group<B: ModelBackend>(backend: &B, calls: Vec<GenerateCall>, rate: &Arc<Mutex<RateEstimator>>) {
    let batch = GenerateBatch::from_calls(calls);

    if batch.is_score {
        match backend.score(&batch.input_ids, &batch.attention_mask).await {
            Ok(scores) => {
                ScoreStreamer::log_token(&batch, &scores);
                telemetry::increment_batches_processed();
                telemetry::record_batch_size(batch.calls.len() as f64);
            }
            Err(err) => {
                telemetry::increment_schedule_errors();
                for call in &batch.calls {
                    call.error(lmtp_core::Error::BackendFailure { reason: err.to_string() }.client_message());
                }
            }
        }
        return;
    }

    let eos_token_id = backend.eos_token_id();
    let cancels = backend.supports_cancellation();
    let streamer = TokenStreamer::new(&batch, eos_token_id, cancels, rate.as_ref());
    let mut sink = TokenSinkAdapter::new(streamer);

    let input = GenerateInput {
        input_ids: &batch.input_ids,
        attention_mask: &batch.attention_mask,
        temperature: batch.temperature,
        max_new_tokens: batch.max_tokens.max(0) as u32,
        logit_biases: &batch.logit_biases,
        extra: &batch.extra,
    };

    match backend.generate(input, &mut sink).await {
        Ok(output) => {
            let streamer = sink.into_inner();
            if cancels && batch.all_cancelled() {
                telemetry::increment_cancelled_batches();
                for call in &batch.calls {
                    call.error(lmtp_core::Error::Cancelled.client_message());
                }
            } else {
                let _ = streamer.log_token(&output.sequences, &output.scores, true);
                telemetry::increment_batches_processed();
                telemetry::record_batch_size(batch.calls.len() as f64);
                let tokens: usize = output.sequences.iter().map(|s| s.len()).sum();
                telemetry::increment_tokens_generated(tokens as u64);
            }
        }
        Err(err) => {
            telemetry::increment_schedule_errors();
            for call in &batch.calls {
                call.error(lmtp_core::Error::BackendFailure { reason: err.to_string() }.client_message());
            }
        }
    }
}
