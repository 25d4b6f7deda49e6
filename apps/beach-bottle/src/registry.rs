use std::collections::HashMap;

use bottle_storage::PeerAddress;
use tokio::sync::mpsc;
use tracing::info;

use crate::session::{PeerSession, SessionContext, SessionError, SessionEvent};

/// Live sessions keyed by remote address, all reporting into one event stream.
pub struct SessionRegistry {
    context: SessionContext,
    sessions: HashMap<PeerAddress, PeerSession>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new(context: SessionContext) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                context,
                sessions: HashMap::new(),
                events,
            },
            rx,
        )
    }

    pub async fn establish(&mut self, peer: PeerAddress) -> Result<&PeerSession, SessionError> {
        if self.sessions.contains_key(&peer) {
            return Err(SessionError::AlreadyEstablished(peer));
        }
        let session =
            PeerSession::establish(peer.clone(), self.context.clone(), self.events.clone()).await?;
        Ok(self.sessions.entry(peer).or_insert(session))
    }

    pub fn get(&self, peer: &PeerAddress) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerAddress> {
        self.sessions.keys()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Shuts down the session with `peer`. Returns whether one existed.
    pub async fn end(&mut self, peer: &PeerAddress) -> bool {
        match self.sessions.remove(peer) {
            Some(session) => {
                session.shutdown().await;
                info!(target = "beach_bottle::registry", peer = %peer, "session ended");
                true
            }
            None => false,
        }
    }

    pub async fn end_all(&mut self) {
        for (peer, session) in self.sessions.drain() {
            session.shutdown().await;
            info!(target = "beach_bottle::registry", peer = %peer, "session ended");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use bottle_storage::MemoryMedium;
    use std::sync::Arc;

    fn addr(value: &str) -> PeerAddress {
        PeerAddress::new(value).unwrap()
    }

    fn registry(medium: &MemoryMedium) -> (SessionRegistry, mpsc::UnboundedReceiver<SessionEvent>) {
        SessionRegistry::new(SessionContext::new(
            Arc::new(medium.client(addr("alice"))),
            Arc::new(MemoryNetwork::new()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_duplicate_sessions() {
        let medium = MemoryMedium::new();
        let (mut registry, _events) = registry(&medium);
        registry.establish(addr("bob")).await.unwrap();
        let err = registry.establish(addr("bob")).await.err().expect("duplicate");
        assert!(matches!(err, SessionError::AlreadyEstablished(_)));
        assert_eq!(registry.len(), 1);
        registry.end_all().await;
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn end_removes_and_allows_reestablishing() {
        let medium = MemoryMedium::new();
        let (mut registry, _events) = registry(&medium);
        registry.establish(addr("bob")).await.unwrap();
        registry.establish(addr("carol")).await.unwrap();
        assert!(registry.end(&addr("bob")).await);
        assert!(!registry.end(&addr("bob")).await);
        assert!(registry.get(&addr("bob")).is_none());
        assert_eq!(registry.peers().collect::<Vec<_>>(), vec![&addr("carol")]);

        registry.establish(addr("bob")).await.unwrap();
        assert_eq!(registry.len(), 2);
        registry.end_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_establishment_is_not_registered() {
        let medium = MemoryMedium::new();
        let (mut registry, _events) = registry(&medium);
        medium.set_available(false);
        assert!(registry.establish(addr("bob")).await.is_err());
        assert!(registry.is_empty());
    }
}
