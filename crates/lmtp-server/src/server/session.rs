//! A single client's generate/score/model-info/cancel command dispatcher,
//! grounded in `TokenSession` in the original scheduler.

use crate::server::call::GenerateCall;
use crate::server::scheduler::{ExecutionMode, SchedulerConfig, SchedulerRegistry};
use crate::server::telemetry;
use lmtp_core::backend::ModelBackend;
use lmtp_core::kwargs::{KEY_SCORE, KEY_SCORING_OFFSET, Kwargs};
use lmtp_core::transport::{KIND_MSG, MsgEvent, OutputPayload, Transport};
use lmtp_core::Error;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const GC_TIMEOUT: Duration = Duration::from_secs(10);

/// A command dispatched to [`TokenSession::handle`]. The wire framing that
/// produces these is out of scope; this is the parsed shape a transport's
/// receive side is expected to build.
pub enum Command {
    Generate {
        model: String,
        stream_id: u64,
        prompt: Vec<u32>,
        logit_bias: HashMap<u32, f32>,
        kwargs: Kwargs,
    },
    Score {
        model: String,
        stream_id: u64,
        prompt: Vec<u32>,
        scored: Vec<u32>,
        kwargs: Kwargs,
    },
    ModelInfo {
        model: String,
        stream_id: u64,
    },
    Cancel {
        stream_id: u64,
        target_stream_id: u64,
    },
    /// Anything a transport couldn't parse into one of the above, per
    /// spec.md §4.6 ("Any other cmd: emit an error payload"). `cmd` is
    /// whatever name the transport could recover for logging/diagnostics.
    Unknown {
        stream_id: u64,
        cmd: String,
    },
}

/// One user generating tokens against a fixed set of model arguments across
/// several concurrent streams.
pub struct TokenSession<B: ModelBackend> {
    session_id: u64,
    registry: Arc<SchedulerRegistry<B>>,
    model_args: Kwargs,
    static_session: bool,
    longrunning_session: bool,
    mode: ExecutionMode,
    scheduler_config: SchedulerConfig,
    retention_min_loaded: usize,
    used_models: Mutex<HashSet<String>>,
    active_stream: Mutex<HashMap<u64, Weak<crate::server::call::GenerateCallInner>>>,
    output_tx: tokio::sync::mpsc::UnboundedSender<(&'static str, OutputPayload)>,
    output_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<B: ModelBackend> TokenSession<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new<T: Transport>(
        transport: Arc<T>,
        registry: Arc<SchedulerRegistry<B>>,
        model_args: Kwargs,
        static_session: bool,
        longrunning_session: bool,
        mode: ExecutionMode,
        scheduler_config: SchedulerConfig,
        retention_min_loaded: usize,
        output_poll: Duration,
    ) -> Self {
        let (output_tx, mut output_rx) =
            tokio::sync::mpsc::unbounded_channel::<(&'static str, OutputPayload)>();

        let output_task = tokio::spawn(async move {
            loop {
                match timeout(output_poll, output_rx.recv()).await {
                    Ok(Some((kind, payload))) => {
                        if let Err(_err) = transport.send(kind, payload).await {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %_err, "failed to deliver payload through transport");
                        }
                    }
                    Ok(None) => break,
                    Err(_) => continue,
                }
            }
        });

        telemetry::increment_active_sessions();

        Self {
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            registry,
            model_args,
            static_session,
            longrunning_session,
            mode,
            scheduler_config,
            retention_min_loaded,
            used_models: Mutex::new(HashSet::new()),
            active_stream: Mutex::new(HashMap::new()),
            output_tx,
            output_task: Mutex::new(Some(output_task)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn handle(&self, cmd: Command) {
        match cmd {
            Command::Generate {
                model,
                stream_id,
                prompt,
                logit_bias,
                kwargs,
            } => {
                self.used_models.lock().insert(model.clone());
                match self.scheduler_for(&model, Some(self.session_id)) {
                    Ok(scheduler) => {
                        let call = GenerateCall::new(prompt, logit_bias, kwargs, stream_id, self.output_tx.clone());
                        self.active_stream.lock().insert(stream_id, call.downgrade());
                        if let Err(err) = scheduler.put(call) {
                            self.report_error(stream_id, err);
                        }
                    }
                    Err(err) => self.report_error(stream_id, err),
                }
            }
            Command::Score {
                model,
                stream_id,
                prompt,
                scored,
                mut kwargs,
            } => {
                self.used_models.lock().insert(model.clone());
                let scoring_offset = prompt.len() as i64;
                kwargs.insert(KEY_SCORE, true);
                kwargs.insert(KEY_SCORING_OFFSET, scoring_offset);

                let mut full_ids = prompt;
                full_ids.extend(scored);

                match self.scheduler_for(&model, Some(self.session_id)) {
                    Ok(scheduler) => {
                        let call = GenerateCall::new(full_ids, HashMap::new(), kwargs, stream_id, self.output_tx.clone());
                        self.active_stream.lock().insert(stream_id, call.downgrade());
                        if let Err(err) = scheduler.put(call) {
                            self.report_error(stream_id, err);
                        }
                    }
                    Err(err) => self.report_error(stream_id, err),
                }
            }
            Command::ModelInfo { model, stream_id } => match self.scheduler_for(&model, Some(self.session_id)) {
                Ok(scheduler) => {
                    let _ = self.output_tx.send((
                        KIND_MSG,
                        OutputPayload::Msg(MsgEvent::ModelInfo {
                            stream_id,
                            model_info: scheduler.model_info(),
                        }),
                    ));
                }
                Err(err) => self.report_error(stream_id, err),
            },
            Command::Cancel {
                stream_id,
                target_stream_id,
            } => {
                let removed = self.active_stream.lock().remove(&target_stream_id);
                let message = match removed.and_then(|weak| weak.upgrade()) {
                    Some(inner) => {
                        inner.cancel();
                        "cancel requested".to_string()
                    }
                    None => format!("no active stream with id {target_stream_id}"),
                };
                let _ = self.output_tx.send((
                    KIND_MSG,
                    OutputPayload::Msg(MsgEvent::Message { stream_id, message }),
                ));
            }
            Command::Unknown { stream_id, cmd } => {
                self.report_error(stream_id, Error::UnknownCommand { cmd });
            }
        }
    }

    fn scheduler_for(
        &self,
        model: &str,
        user: Option<u64>,
    ) -> lmtp_core::Result<Arc<crate::server::scheduler::Scheduler<B>>> {
        self.registry.instance(
            model,
            &self.model_args,
            user,
            self.static_session,
            self.mode,
            self.scheduler_config,
            self.retention_min_loaded,
        )
    }

    fn report_error(&self, stream_id: u64, err: Error) {
        if matches!(err, Error::CannotLoadByPolicy { .. }) {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                stream_id,
                "client requested a model that is not loaded and the server is not configured to load it on demand"
            );
        }
        let _ = self.output_tx.send((
            KIND_MSG,
            OutputPayload::Msg(MsgEvent::Error {
                stream_id,
                error: err.client_message(),
            }),
        ));
    }

    /// Tears down the output loop, cancels every active stream, and
    /// unregisters this session from every scheduler it used. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.output_task.lock().take() {
            handle.abort();
        }

        for weak in self.active_stream.lock().values() {
            if let Some(inner) = weak.upgrade() {
                inner.cancel();
            }
        }

        for model in self.used_models.lock().iter() {
            match self.scheduler_for(model, None) {
                Ok(scheduler) => {
                    scheduler.remove_user(self.session_id);
                    if self.longrunning_session {
                        self.registry.gc(self.retention_min_loaded, GC_TIMEOUT);
                    } else {
                        self.registry.gc(0, GC_TIMEOUT);
                    }
                }
                Err(Error::CannotLoadByPolicy { .. }) => {}
                Err(_) => {}
            }
        }

        telemetry::decrement_active_sessions();
    }
}

impl<B: ModelBackend> Drop for TokenSession<B> {
    fn drop(&mut self) {
        self.close();
    }
}
