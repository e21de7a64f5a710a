//! Write side of a streaming connection.
//!
//! [`Transport`] is the seam between a session and the wire; the SSE
//! implementation feeds an axum [`Sse`](axum::response::sse::Sse) body
//! through a bounded channel.

use std::convert::Infallible;

use async_trait::async_trait;
use axum::response::sse::Event;
use beacon_core::OutboundMessage;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Transport write failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The client end is gone.
    #[error("client disconnected")]
    Disconnected,
    /// The message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sink for one connection's outbound frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one message. May wait for the client to catch up.
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// Resolves once the client has gone away.
    async fn closed(&self);
}

/// Body stream handed to axum's `Sse` response.
pub type SseStream = ReceiverStream<Result<Event, Infallible>>;

/// SSE transport backed by an mpsc channel into the response body.
pub struct SseTransport {
    tx: mpsc::Sender<Result<Event, Infallible>>,
    next_id: u64,
}

impl SseTransport {
    /// Create a transport and the body stream it feeds.
    pub fn channel(buffer: usize) -> (Self, SseStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx, next_id: 0 }, ReceiverStream::new(rx))
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let data = message.to_json()?;
        self.next_id += 1;
        let event = Event::default()
            .id(self.next_id.to_string())
            .event(message.message_type().as_str())
            .data(data);
        self.tx
            .send(Ok(event))
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}
