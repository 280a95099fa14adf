//! Error taxonomy for the LMTP scheduling engine.
//!
//! This module defines the central [`Error`] enum, which captures every
//! recoverable and reportable failure case in the scheduler/session pair. Each
//! variant also carries the exact client-facing message a [`TokenSession`]
//! should report through its output stream, via [`Error::client_message`].
//!
//! ## Error cases
//! - [`Error::CannotLoadByPolicy`]: a `static` session requested a model that
//!   is not already loaded.
//! - [`Error::Cancelled`]: every call in a batch was cancelled and the
//!   backend honored the stop request.
//! - [`Error::BackendFailure`]: `generate`/`score` raised an error.
//! - [`Error::UnknownCommand`]: the session received a command it doesn't
//!   recognize.
//! - [`Error::ChannelError`]: an internal queue was closed unexpectedly.
//! - [`Error::TransportFailure`]: the transport failed to deliver a payload.
//!
//! [`TokenSession`]: ../../lmtp_server/server/session/struct.TokenSession.html

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the scheduler and session.
#[derive(Clone, thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An internal channel was closed or full when it shouldn't have been.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// A `static` session asked for a model the registry refuses to load.
    #[error("Model '{model_identifier}' is not loaded and the server is not configured to load it on demand")]
    CannotLoadByPolicy { model_identifier: String },

    /// Every call in a batch was cancelled and the backend stopped early.
    #[error("Request cancelled by client")]
    Cancelled,

    /// The backend raised an error while generating or scoring a batch.
    #[error("Backend failure: {reason}")]
    BackendFailure { reason: String },

    /// The session received a command it doesn't understand.
    #[error("Unknown command: {cmd}")]
    UnknownCommand { cmd: String },

    /// Delivering a payload through the transport failed.
    #[error("Transport failure: {context}")]
    TransportFailure { context: String },
}

impl Error {
    /// The exact message a [`TokenSession`] surfaces to the client for this
    /// error, per the wire-level error-message contract.
    ///
    /// [`TokenSession`]: ../../lmtp_server/server/session/struct.TokenSession.html
    pub fn client_message(&self) -> String {
        match self {
            Self::CannotLoadByPolicy { .. } => {
                "The requested model is not loaded and the server is not configured to load it on demand.".to_string()
            }
            Self::Cancelled => "lmtp.cancelled".to_string(),
            Self::BackendFailure { reason } => format!("failed to generate tokens '{reason}'"),
            Self::UnknownCommand { cmd } => format!("Unknown command: {cmd}"),
            Self::ChannelError { context } => format!("Channel error: {context}"),
            Self::TransportFailure { context } => format!("Transport failure: {context}"),
        }
    }
}
