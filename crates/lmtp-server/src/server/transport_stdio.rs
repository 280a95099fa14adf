//! A minimal [`Transport`] that writes newline-delimited JSON envelopes to
//! stdout. The real wire protocol is out of scope for this crate; this
//! exists so the demonstrator binary has something concrete to drive.

use lmtp_core::transport::{OutputPayload, Transport};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StdioTransportError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write payload: {0}")]
    Io(String),
}

/// Writes one JSON object per line to an async writer (stdout by default).
/// Serialization happens under a lock since multiple sessions can share one
/// transport instance.
pub struct StdioTransport<W> {
    writer: Mutex<W>,
}

impl<W> StdioTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl StdioTransport<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> Transport for StdioTransport<W> {
    type Error = StdioTransportError;

    async fn send(&self, kind: &'static str, payload: OutputPayload) -> Result<(), Self::Error> {
        debug_assert_eq!(kind, payload.kind());

        let mut line = serde_json::to_vec(&payload)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| StdioTransportError::Io(e.to_string()))
    }
}

/// A transport that records every payload sent to it, for test assertions.
pub struct RecordingTransport {
    sent: std::sync::Mutex<Vec<(&'static str, OutputPayload)>>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<(&'static str, OutputPayload)> {
        self.sent.lock().expect("recording transport mutex poisoned").clone()
    }
}

impl Transport for RecordingTransport {
    type Error = std::convert::Infallible;

    async fn send(&self, kind: &'static str, payload: OutputPayload) -> Result<(), Self::Error> {
        self.sent.lock().expect("recording transport mutex poisoned").push((kind, payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmtp_core::transport::{MsgEvent, KIND_MSG};

    #[tokio::test]
    async fn recording_transport_records_in_order() {
        let transport = RecordingTransport::new();
        transport
            .send(
                KIND_MSG,
                OutputPayload::Msg(MsgEvent::Message {
                    stream_id: 1,
                    message: "hello".to_string(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(transport.sent().len(), 1);
    }
}
