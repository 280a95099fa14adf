//! A single in-flight generate/score request, queued onto a [`Scheduler`]
//! and streamed back out through a session's output sink.
//!
//! [`Scheduler`]: crate::server::scheduler::handle::Scheduler

use lmtp_core::kwargs::Kwargs;
use lmtp_core::transport::{MsgEvent, OutputPayload, TokenErrorPayload, TokenEvent, TokenPayload};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::UnboundedSender;

/// The shared state behind a [`GenerateCall`], held by both the call itself
/// and by any session that wants a non-owning (`Weak`) handle to it for
/// cancellation.
pub struct GenerateCallInner {
    pub prompt: Vec<u32>,
    pub logit_bias: HashMap<u32, f32>,
    pub kwargs: Kwargs,
    pub stream_id: u64,
    output_sink: UnboundedSender<(&'static str, OutputPayload)>,
    cancelled: AtomicBool,
}

impl GenerateCallInner {
    /// Requests cancellation through a non-owning handle, used by a
    /// session's weak active-stream table.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl Drop for GenerateCallInner {
    fn drop(&mut self) {
        crate::server::telemetry::decrement_streams_inflight();
    }
}

/// An `Arc`-backed handle to a queued request. Cloning is cheap; the
/// session keeps a [`std::sync::Weak`] copy in its active-stream table so
/// cancellation never keeps a completed call alive.
#[derive(Clone)]
pub struct GenerateCall(Arc<GenerateCallInner>);

impl GenerateCall {
    pub fn new(
        prompt: Vec<u32>,
        logit_bias: HashMap<u32, f32>,
        kwargs: Kwargs,
        stream_id: u64,
        output_sink: UnboundedSender<(&'static str, OutputPayload)>,
    ) -> Self {
        crate::server::telemetry::increment_streams_inflight();
        Self(Arc::new(GenerateCallInner {
            prompt,
            logit_bias,
            kwargs,
            stream_id,
            output_sink,
            cancelled: AtomicBool::new(false),
        }))
    }

    pub fn inner(&self) -> &Arc<GenerateCallInner> {
        &self.0
    }

    pub fn downgrade(&self) -> std::sync::Weak<GenerateCallInner> {
        Arc::downgrade(&self.0)
    }

    pub fn stream_id(&self) -> u64 {
        self.0.stream_id
    }

    pub fn prompt(&self) -> &[u32] {
        &self.0.prompt
    }

    pub fn logit_bias(&self) -> &HashMap<u32, f32> {
        &self.0.logit_bias
    }

    pub fn kwargs(&self) -> &Kwargs {
        &self.0.kwargs
    }

    /// Enqueues a generated or scored token payload for the session's output
    /// loop to forward to the transport.
    pub fn put(&self, payload: TokenPayload) {
        let _ = self
            .0
            .output_sink
            .send((lmtp_core::transport::KIND_TOKEN, OutputPayload::Token(TokenEvent::Token(payload))));
    }

    /// Reports a terminal error for this call on the `"TOKEN"` channel.
    pub fn error(&self, message: impl Into<String>) {
        let _ = self.0.output_sink.send((
            lmtp_core::transport::KIND_TOKEN,
            OutputPayload::Token(TokenEvent::Error(TokenErrorPayload {
                stream_id: self.0.stream_id,
                error: message.into(),
            })),
        ));
    }

    /// Reports an error on the `"MSG"` channel, for failures that happen
    /// before a call is ever queued (e.g. policy rejection).
    pub fn error_msg(stream_id: u64, sink: &UnboundedSender<(&'static str, OutputPayload)>, message: impl Into<String>) {
        let _ = sink.send((
            lmtp_core::transport::KIND_MSG,
            OutputPayload::Msg(MsgEvent::Error {
                stream_id,
                error: message.into(),
            }),
        ));
    }

    /// Requests the backend stop generating this row as soon as possible.
    /// Advisory: the backend may finish the in-flight batch before honoring
    /// it.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Relaxed)
    }

    /// The compatibility key determining which calls can share a batch.
    /// `"score"` calls always get their own exclusive mode, matching
    /// `GenerateCall.generation_mode` in the original scheduler.
    pub fn generation_mode(&self) -> String {
        if self.0.kwargs.score() {
            return "score".to_string();
        }
        format!("generate-{}", self.0.kwargs.compatibility_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (
        UnboundedSender<(&'static str, OutputPayload)>,
        tokio::sync::mpsc::UnboundedReceiver<(&'static str, OutputPayload)>,
    ) {
        tokio::sync::mpsc::unbounded_channel()
    }

    #[test]
    fn generation_mode_is_score_for_score_calls() {
        let (tx, _rx) = sink();
        let mut kwargs = Kwargs::new();
        kwargs.insert("score", true);
        let call = GenerateCall::new(vec![1, 2, 3], HashMap::new(), kwargs, 1, tx);
        assert_eq!(call.generation_mode(), "score");
    }

    #[test]
    fn generation_mode_shares_key_across_max_tokens() {
        let (tx, _rx) = sink();
        let mut a = Kwargs::new();
        a.insert("max_tokens", 10_i64);
        let mut b = Kwargs::new();
        b.insert("max_tokens", 999_i64);

        let call_a = GenerateCall::new(vec![1], HashMap::new(), a, 1, tx.clone());
        let call_b = GenerateCall::new(vec![1], HashMap::new(), b, 2, tx);
        assert_eq!(call_a.generation_mode(), call_b.generation_mode());
    }

    #[test]
    fn cancel_is_observable_through_clone() {
        let (tx, _rx) = sink();
        let call = GenerateCall::new(vec![1], HashMap::new(), Kwargs::new(), 1, tx);
        let clone = call.clone();
        clone.cancel();
        assert!(call.is_cancelled());
    }
}
