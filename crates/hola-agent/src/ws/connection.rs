//! Outbound path of one WebSocket connection.

use hola_common::Envelope;
use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why an envelope was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Diagnostic)]
pub enum SendError {
    /// The sender's cancellation token fired first.
    #[error("send cancelled")]
    #[diagnostic(code(hola::ws::cancelled))]
    Cancelled,

    /// The socket writer has gone away.
    #[error("connection closed")]
    #[diagnostic(code(hola::ws::closed))]
    Closed,

    /// The outbound queue is full.
    #[error("outbound queue full")]
    #[diagnostic(code(hola::ws::full))]
    Full,
}

/// Handle to a connection's outbound queue.
///
/// Every producer (session replies, stream adapters, the event hub) writes
/// through a clone of this handle. A single writer task drains the queue into
/// the socket, so frames never interleave.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::Sender<Envelope>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end its writer drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    /// Connection ID, used in logs and for hub registration.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Queue an envelope, waiting for room unless `cancel` fires first.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Cancelled`] if `cancel` fired, or
    /// [`SendError::Closed`] if the writer is gone.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        envelope: Envelope,
    ) -> Result<(), SendError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SendError::Cancelled),
            sent = self.tx.send(envelope) => sent.map_err(|_| SendError::Closed),
        }
    }

    /// Queue an envelope without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Full`] or [`SendError::Closed`].
    pub fn try_send(&self, envelope: Envelope) -> Result<(), SendError> {
        self.tx.try_send(envelope).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}
