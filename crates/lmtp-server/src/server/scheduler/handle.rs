//! The per-model scheduler handle, grounded in the `Scheduler` class in the
//! original scheduler and in the teacher's `pool::manager::WorkerPool`
//! (dedicated worker thread/task, graceful teardown via a kill flag joined
//! on `dealloc`).

use crate::server::call::GenerateCall;
use crate::server::scheduler::SchedulerConfig;
use crate::server::scheduler::worker;
use crate::server::streaming::token::RateMeter;
use lmtp_core::backend::ModelBackend;
use lmtp_core::kwargs::Kwargs;
use lmtp_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How a scheduler's worker loop is driven, mirroring the original's
/// `sync` constructor flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// A dedicated OS thread running its own single-threaded Tokio runtime.
    /// Tokens are streamed as soon as they're generated, without blocking
    /// whatever runtime created the scheduler.
    #[default]
    Threaded,
    /// A task spawned onto the caller's own Tokio runtime. Useful in
    /// embeddings that forbid spawning bare OS threads; blocks that runtime
    /// for the duration of each batch.
    Cooperative,
}

/// A rolling EMA-based estimate of tokens/sec and average batch size,
/// reproducing `Scheduler.measure_token`'s exact recurrence from the
/// original: `ema = ema * 0.9 + sample * 0.1`, sampled over a window of the
/// most recent `(timestamp, batch_size)` pairs observed within the last
/// second.
pub struct RateEstimator {
    window: usize,
    samples: VecDeque<(Instant, usize)>,
    pub tok_s: f64,
    pub avg_batch_size: f64,
}

impl RateEstimator {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            tok_s: 0.0,
            avg_batch_size: 0.0,
        }
    }

    pub fn record(&mut self, batch_size: usize) {
        let now = Instant::now();
        self.samples.push_back((now, batch_size));
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }

        let one_second_ago = now.checked_sub(Duration::from_secs(1)).unwrap_or(now);
        let recent: Vec<usize> = self
            .samples
            .iter()
            .filter(|(t, _)| *t > one_second_ago)
            .map(|(_, b)| *b)
            .collect();

        let tokens_in_last_second: usize = recent.iter().sum();
        self.tok_s = self.tok_s * 0.9 + tokens_in_last_second as f64 * 0.1;

        let avg = if recent.is_empty() {
            0.0
        } else {
            recent.iter().sum::<usize>() as f64 / recent.len() as f64
        };
        self.avg_batch_size = self.avg_batch_size * 0.9 + avg * 0.1;
        crate::server::telemetry::record_tok_s(self.tok_s);
    }
}

impl RateMeter for Mutex<RateEstimator> {
    fn measure_token(&self, batch_size: usize) {
        self.lock().record(batch_size);
    }
}

enum WorkerHandle {
    Threaded(std::thread::JoinHandle<()>),
    Cooperative(tokio::task::JoinHandle<()>),
}

/// A batching scheduler for one loaded model instance. Shared among every
/// session that requested the same `(model_identifier, model_args)` pair;
/// callers must pair every [`Scheduler::add_user`] with a
/// [`Scheduler::remove_user`] so the registry can reclaim it once idle.
pub struct Scheduler<B: ModelBackend> {
    model_identifier: String,
    model_args: Kwargs,
    call_tx: mpsc::UnboundedSender<GenerateCall>,
    kill: Arc<AtomicBool>,
    users: Mutex<HashSet<u64>>,
    last_use: Mutex<Instant>,
    model_info: Arc<Mutex<String>>,
    rate: Arc<Mutex<RateEstimator>>,
    worker: Mutex<Option<WorkerHandle>>,
    _marker: PhantomData<fn() -> B>,
}

impl<B: ModelBackend> Scheduler<B> {
    pub fn spawn(
        model_identifier: String,
        model_args: Kwargs,
        mode: ExecutionMode,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let kill = Arc::new(AtomicBool::new(false));
        let model_info = Arc::new(Mutex::new("<unavailable>".to_string()));
        let rate = Arc::new(Mutex::new(RateEstimator::new(config.rate_window_samples)));

        let worker_args = worker::WorkerArgs {
            model_identifier: model_identifier.clone(),
            model_args: model_args.clone(),
            call_rx,
            kill: kill.clone(),
            model_info: model_info.clone(),
            rate: rate.clone(),
            config,
        };

        let worker_handle = match mode {
            ExecutionMode::Threaded => {
                let handle = std::thread::Builder::new()
                    .name("scheduler-worker".to_string())
                    .spawn(move || {
                        let runtime = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .expect("failed to build scheduler worker runtime");
                        runtime.block_on(worker::run::<B>(worker_args));
                    })
                    .expect("failed to spawn scheduler worker thread");
                WorkerHandle::Threaded(handle)
            }
            ExecutionMode::Cooperative => {
                WorkerHandle::Cooperative(tokio::spawn(worker::run::<B>(worker_args)))
            }
        };

        Arc::new(Self {
            model_identifier,
            model_args,
            call_tx,
            kill,
            users: Mutex::new(HashSet::new()),
            last_use: Mutex::new(Instant::now()),
            model_info,
            rate,
            worker: Mutex::new(Some(worker_handle)),
            _marker: PhantomData,
        })
    }

    pub fn model_identifier(&self) -> &str {
        &self.model_identifier
    }

    pub fn model_args(&self) -> &Kwargs {
        &self.model_args
    }

    /// Queues `call` for the next batch. Never blocks.
    pub fn put(&self, call: GenerateCall) -> Result<()> {
        self.call_tx.send(call).map_err(|_| Error::ChannelError {
            context: "scheduler worker queue closed".to_string(),
        })
    }

    /// Advisory only: the actual stop signal lives on the call itself
    /// (`GenerateCall::cancel`). Kept on the scheduler for interface
    /// symmetry with the original, which also defines this as a no-op.
    pub fn cancel_stream(&self, _stream_id: u64) {}

    pub fn model_info(&self) -> String {
        self.model_info.lock().clone()
    }

    pub fn tok_s(&self) -> f64 {
        self.rate.lock().tok_s
    }

    pub fn avg_batch_size(&self) -> f64 {
        self.rate.lock().avg_batch_size
    }

    /// Unconditionally marks the scheduler as just-used, independent of
    /// whether a user is being registered. Called on every
    /// `SchedulerRegistry::instance` lookup, including `user = None`.
    pub fn touch_last_use(&self) {
        *self.last_use.lock() = Instant::now();
    }

    pub fn add_user(&self, user: u64) {
        self.users.lock().insert(user);
        self.touch_last_use();
    }

    pub fn remove_user(&self, user: u64) {
        if self.users.lock().remove(&user) {
            self.touch_last_use();
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().len()
    }

    pub fn last_use(&self) -> Instant {
        *self.last_use.lock()
    }

    /// Stops the worker loop and joins/aborts its handle. Idempotent.
    pub fn dealloc(&self) {
        self.kill.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().take() {
            match handle {
                WorkerHandle::Threaded(h) => {
                    let _ = h.join();
                }
                WorkerHandle::Cooperative(h) => h.abort(),
            }
        }
    }
}
