use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod session;
pub mod webrtc;

pub use session::{TransportSession, TransportState};

/// Which side of the offer/answer exchange a transport plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Locally produced negotiation payload that must reach the remote side.
    Signal(Value),
    Connected,
    Data(Bytes),
    Closed,
    Error(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("transport timed out")]
    Timeout,
    #[error("unexpected signal: {0}")]
    UnexpectedSignal(String),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// One direct peer link, driven by signals fed from the rendezvous layer.
///
/// Events flow out through the receiver handed back by
/// [`TransportFactory::create`]; trickle is disabled, so every `Signal`
/// carries a complete description.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn signal(&self, payload: Value) -> Result<(), TransportError>;

    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        role: Role,
    ) -> Result<(Box<dyn PeerTransport>, TransportEvents), TransportError>;
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}
