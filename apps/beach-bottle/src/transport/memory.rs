//! In-process loopback transport.
//!
//! Offers and answers are small JSON tokens (`{"type":"offer","id":N}` and
//! `{"type":"answer","offer":N,"id":M}`), so negotiation can be exercised
//! through real storage round trips without ICE.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use super::{PeerTransport, Role, TransportError, TransportEvent, TransportEvents, TransportFactory};

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    endpoints: HashMap<u64, Endpoint>,
}

struct Endpoint {
    role: Role,
    events: mpsc::UnboundedSender<TransportEvent>,
    answered: Option<u64>,
    peer: Option<u64>,
    open: bool,
}

impl NetworkState {
    fn close(&mut self, id: u64) {
        let Some(endpoint) = self.endpoints.get_mut(&id) else {
            return;
        };
        if !endpoint.open {
            return;
        }
        endpoint.open = false;
        let _ = endpoint.events.send(TransportEvent::Closed);
        if let Some(peer) = endpoint.peer {
            self.close(peer);
        }
    }

    fn link(&mut self, initiator: u64, responder: u64) {
        for (id, peer) in [(initiator, responder), (responder, initiator)] {
            if let Some(endpoint) = self.endpoints.get_mut(&id) {
                endpoint.peer = Some(peer);
                let _ = endpoint.events.send(TransportEvent::Connected);
            }
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every connected link; both ends observe `Closed`.
    pub fn sever(&self) -> usize {
        let mut state = self.inner.lock();
        let linked: Vec<u64> = state
            .endpoints
            .iter()
            .filter(|(_, endpoint)| endpoint.open && endpoint.peer.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in &linked {
            state.close(*id);
        }
        debug!(target = "beach_bottle::transport::memory", endpoints = linked.len(), "severed links");
        linked.len() / 2
    }

    /// Number of open, connected links.
    pub fn open_links(&self) -> usize {
        let state = self.inner.lock();
        state
            .endpoints
            .values()
            .filter(|endpoint| endpoint.open && endpoint.peer.is_some())
            .count()
            / 2
    }
}

#[async_trait]
impl TransportFactory for MemoryNetwork {
    async fn create(
        &self,
        role: Role,
    ) -> Result<(Box<dyn PeerTransport>, TransportEvents), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        state.next_id += 1;
        let id = state.next_id;
        if role == Role::Initiator {
            let _ = tx.send(TransportEvent::Signal(json!({"type": "offer", "id": id})));
        }
        state.endpoints.insert(
            id,
            Endpoint {
                role,
                events: tx,
                answered: None,
                peer: None,
                open: true,
            },
        );
        Ok((
            Box::new(MemoryTransport {
                network: self.clone(),
                id,
            }),
            rx,
        ))
    }
}

struct MemoryTransport {
    network: MemoryNetwork,
    id: u64,
}

fn token(payload: &Value, field: &str) -> Result<u64, TransportError> {
    payload
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| TransportError::UnexpectedSignal(format!("missing {field} in {payload}")))
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn signal(&self, payload: Value) -> Result<(), TransportError> {
        let mut state = self.network.inner.lock();
        let (role, open, linked) = match state.endpoints.get(&self.id) {
            Some(endpoint) => (endpoint.role, endpoint.open, endpoint.peer.is_some()),
            None => return Err(TransportError::ChannelClosed),
        };
        if !open {
            return Err(TransportError::ChannelClosed);
        }
        let kind = payload.get("type").and_then(Value::as_str);
        match (role, kind) {
            (Role::Responder, Some("offer")) => {
                let offer = token(&payload, "id")?;
                let available = state.endpoints.get(&offer).is_some_and(|endpoint| {
                    endpoint.open && endpoint.role == Role::Initiator && endpoint.peer.is_none()
                });
                if !available {
                    return Err(TransportError::UnexpectedSignal(format!(
                        "offer {offer} is no longer available"
                    )));
                }
                if let Some(endpoint) = state.endpoints.get_mut(&self.id) {
                    endpoint.answered = Some(offer);
                    let _ = endpoint.events.send(TransportEvent::Signal(
                        json!({"type": "answer", "offer": offer, "id": self.id}),
                    ));
                }
                Ok(())
            }
            (Role::Initiator, Some("answer")) => {
                let offer = token(&payload, "offer")?;
                let responder = token(&payload, "id")?;
                if offer != self.id || linked {
                    return Err(TransportError::UnexpectedSignal(format!(
                        "answer for offer {offer} does not match offer {}",
                        self.id
                    )));
                }
                let ready = state.endpoints.get(&responder).is_some_and(|endpoint| {
                    endpoint.open && endpoint.answered == Some(self.id) && endpoint.peer.is_none()
                });
                if !ready {
                    return Err(TransportError::UnexpectedSignal(format!(
                        "answering endpoint {responder} is gone"
                    )));
                }
                state.link(self.id, responder);
                Ok(())
            }
            _ => Err(TransportError::UnexpectedSignal(format!(
                "{role} cannot accept {payload}"
            ))),
        }
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let state = self.network.inner.lock();
        let endpoint = state
            .endpoints
            .get(&self.id)
            .ok_or(TransportError::ChannelClosed)?;
        if !endpoint.open {
            return Err(TransportError::ChannelClosed);
        }
        let peer = endpoint.peer.ok_or(TransportError::NotConnected)?;
        match state.endpoints.get(&peer) {
            Some(remote) if remote.open => remote
                .events
                .send(TransportEvent::Data(data))
                .map_err(|_| TransportError::ChannelClosed),
            _ => Err(TransportError::ChannelClosed),
        }
    }

    async fn close(&self) {
        self.network.inner.lock().close(self.id);
    }
}
