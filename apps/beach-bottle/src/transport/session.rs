use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::{PeerTransport, Role, TransportError, TransportEvent, TransportEvents, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Signaling,
    Connected,
    Closed,
}

/// One negotiation attempt over a [`PeerTransport`].
///
/// Filters the raw event stream so callers observe `Connected` and `Closed`
/// at most once each, and `Data` only while connected.
pub struct TransportSession {
    generation: u64,
    role: Role,
    state: TransportState,
    transport: Box<dyn PeerTransport>,
    events: TransportEvents,
    consumed: Option<Value>,
    last_signal: Option<Value>,
    poisoned: bool,
}

impl TransportSession {
    pub async fn create(
        factory: &dyn TransportFactory,
        role: Role,
        generation: u64,
    ) -> Result<Self, TransportError> {
        let (transport, events) = factory.create(role).await?;
        let mut session = Self {
            generation,
            role,
            state: TransportState::Created,
            transport,
            events,
            consumed: None,
            last_signal: None,
            poisoned: false,
        };
        session.transition(TransportState::Signaling);
        Ok(session)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Still negotiating and not marked unusable by a transport error.
    pub fn is_negotiating(&self) -> bool {
        self.state == TransportState::Signaling && !self.poisoned
    }

    /// Remote payload most recently fed into this session.
    pub fn consumed(&self) -> Option<&Value> {
        self.consumed.as_ref()
    }

    /// Local payload most recently produced by this session.
    pub fn last_signal(&self) -> Option<&Value> {
        self.last_signal.as_ref()
    }

    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    pub async fn feed_signal(&mut self, payload: Value) -> Result<(), TransportError> {
        if self.state == TransportState::Closed {
            debug!(
                target = "beach_bottle::transport",
                generation = self.generation,
                role = %self.role,
                "ignoring signal for closed transport session"
            );
            return Ok(());
        }
        self.consumed = Some(payload.clone());
        self.transport.signal(payload).await
    }

    pub async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.state != TransportState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.transport.send(data).await
    }

    /// Next event that is valid for the current state. Returns `None` once the
    /// session has reported `Closed`.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if self.state == TransportState::Closed {
                return None;
            }
            let Some(event) = self.events.recv().await else {
                self.transition(TransportState::Closed);
                return Some(TransportEvent::Closed);
            };
            match event {
                TransportEvent::Signal(payload) if self.state == TransportState::Signaling => {
                    self.last_signal = Some(payload.clone());
                    return Some(TransportEvent::Signal(payload));
                }
                TransportEvent::Connected if self.state == TransportState::Signaling => {
                    self.transition(TransportState::Connected);
                    return Some(TransportEvent::Connected);
                }
                TransportEvent::Data(bytes) if self.state == TransportState::Connected => {
                    return Some(TransportEvent::Data(bytes));
                }
                TransportEvent::Closed => {
                    self.transition(TransportState::Closed);
                    return Some(TransportEvent::Closed);
                }
                TransportEvent::Error(message) => {
                    warn!(
                        target = "beach_bottle::transport",
                        generation = self.generation,
                        role = %self.role,
                        error = %message,
                        "transport error"
                    );
                    self.poisoned = true;
                    return Some(TransportEvent::Error(message));
                }
                other => {
                    trace!(
                        target = "beach_bottle::transport",
                        generation = self.generation,
                        state = ?self.state,
                        event = ?other,
                        "dropping out-of-order transport event"
                    );
                }
            }
        }
    }

    /// Tears down the underlying transport. Safe to call in any state.
    pub async fn close(&mut self) {
        self.transport.close().await;
        if self.state != TransportState::Closed {
            self.transition(TransportState::Closed);
        }
    }

    fn transition(&mut self, next: TransportState) {
        debug!(
            target = "beach_bottle::transport",
            generation = self.generation,
            role = %self.role,
            from = ?self.state,
            to = ?next,
            "transport session state"
        );
        self.state = next;
    }
}
