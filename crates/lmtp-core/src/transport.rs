//! The `Transport` capability (spec.md §6): a narrow `send(kind, payload)`
//! sink the session forwards its output queue into. The actual socket,
//! WebSocket, or IPC channel is an external collaborator; this crate only
//! defines the shape of what crosses the boundary.

use std::collections::BTreeMap;

/// The `msg_type` tag of a client-bound payload.
pub const KIND_TOKEN: &str = "TOKEN";
pub const KIND_MSG: &str = "MSG";

/// Why a row stopped generating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The emitted token was the backend's EOS token.
    Stop,
    /// The batch reached its shared `max_tokens` without hitting EOS.
    Length,
}

/// A single generated or scored token for one stream.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TokenPayload {
    pub token: u32,
    pub stream_id: u64,
    pub logprob: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Always includes the emitted token, plus the row's top-k. Absent for
    /// score payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<BTreeMap<u32, f32>>,
}

/// A terminal error for one stream, carried on the `"TOKEN"` channel (the
/// session treats it as equivalent to a finish event).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TokenErrorPayload {
    pub stream_id: u64,
    pub error: String,
}

/// The payload carried by a `"TOKEN"`-kind message.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum TokenEvent {
    Token(TokenPayload),
    Error(TokenErrorPayload),
}

/// The payload carried by a `"MSG"`-kind message.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum MsgEvent {
    ModelInfo { stream_id: u64, model_info: String },
    Message { stream_id: u64, message: String },
    Error { stream_id: u64, error: String },
}

/// A fully-formed client-bound payload, already tagged with its `kind`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum OutputPayload {
    #[serde(rename = "TOKEN")]
    Token(TokenEvent),
    #[serde(rename = "MSG")]
    Msg(MsgEvent),
}

impl OutputPayload {
    /// The wire-level kind string, matching spec.md §6's `(kind, payload)`
    /// tuples.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => KIND_TOKEN,
            Self::Msg(_) => KIND_MSG,
        }
    }
}

/// A write-only capability for delivering payloads to a client.
pub trait Transport: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Delivers one payload. `kind` is redundant with
    /// [`OutputPayload::kind`] but kept explicit to mirror spec.md §6's
    /// `send(kind, payload)` signature.
    fn send(
        &self,
        kind: &'static str,
        payload: OutputPayload,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
