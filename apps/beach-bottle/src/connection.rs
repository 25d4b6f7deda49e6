//! Storage-mediated rendezvous and reconnect loop for one remote peer.
//!
//! Each side publishes its newest transport signal at `<self>/signal.json`
//! and polls `<peer>/signal.json`. What it reads decides whether it keeps,
//! replaces or answers its current [`TransportSession`]. A periodic retry
//! timer re-runs the decision until the link is up, and a closed link starts
//! the whole cycle again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bottle_storage::{PeerAddress, StorageClient, StorageError, write_json};
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, info, trace, warn};

use crate::signal::{SignalCodec, SignalEnvelope, SignalError, signal_path};
use crate::transport::{Role, TransportError, TransportEvent, TransportFactory, TransportSession};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    AwaitingSignal,
    Connected,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("signal error: {0}")]
    Signal(#[from] SignalError),
}

#[derive(Debug)]
pub enum ConnectionEvent {
    StatusChanged { connected: bool },
    Data(Bytes),
    /// A background attempt (timer tick or reconnect) failed; retries continue.
    AttemptFailed(ConnectionError),
}

/// Something the manager must react to. Produced by
/// [`ConnectionManager::next_activity`], consumed by [`ConnectionManager::process`].
#[derive(Debug)]
pub enum Activity {
    RetryTick,
    Transport(Option<TransportEvent>),
}

pub struct ConnectionManager {
    local: PeerAddress,
    remote: PeerAddress,
    storage: Arc<dyn StorageClient>,
    factory: Arc<dyn TransportFactory>,
    codec: SignalCodec,
    retry_interval: Duration,
    state: ConnectionState,
    session: Option<TransportSession>,
    generation: u64,
    retry: Option<Interval>,
    pending: VecDeque<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(
        remote: PeerAddress,
        storage: Arc<dyn StorageClient>,
        factory: Arc<dyn TransportFactory>,
        codec: SignalCodec,
        retry_interval: Duration,
    ) -> Self {
        Self {
            local: storage.self_address().clone(),
            remote,
            storage,
            factory,
            codec,
            retry_interval,
            state: ConnectionState::Idle,
            session: None,
            generation: 0,
            retry: None,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote(&self) -> &PeerAddress {
        &self.remote
    }

    /// Role of the transport session currently owned, if any.
    pub fn session_role(&self) -> Option<Role> {
        self.session.as_ref().map(TransportSession::role)
    }

    pub fn retry_armed(&self) -> bool {
        self.retry.is_some()
    }

    /// Starts a fresh cycle: one immediate attempt, then one per retry tick
    /// until connected. The retry timer is armed even if the first attempt
    /// fails; that failure is returned to the caller.
    pub async fn establish_connection(&mut self) -> Result<(), ConnectionError> {
        self.reset().await;
        self.state = ConnectionState::AwaitingSignal;
        info!(
            target = "beach_bottle::connection",
            local = %self.local,
            remote = %self.remote,
            "establishing connection"
        );
        let attempt = self.make_connection().await;
        self.arm_retry();
        attempt
    }

    /// One rendezvous step: read the remote signal and keep, answer or
    /// replace the current transport session accordingly.
    pub async fn make_connection(&mut self) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        let remote = self.read_remote_signal().await?;
        match remote {
            None => {
                if self.negotiating_as(Role::Initiator) {
                    self.republish().await
                } else {
                    self.start_session(Role::Initiator).await
                }
            }
            Some((Role::Initiator, offer)) => {
                if self.negotiating_as(Role::Responder) && self.already_consumed(&offer) {
                    return self.republish().await;
                }
                if self.negotiating_as(Role::Initiator) && !self.yields_to_remote() {
                    debug!(
                        target = "beach_bottle::connection",
                        remote = %self.remote,
                        "both sides initiating; keeping local offer"
                    );
                    return self.republish().await;
                }
                self.start_session(Role::Responder).await?;
                self.feed(offer).await
            }
            Some((Role::Responder, answer)) => {
                if !self.negotiating_as(Role::Initiator) {
                    return self.start_session(Role::Initiator).await;
                }
                if self.already_consumed(&answer) {
                    self.republish().await
                } else {
                    self.feed(answer).await
                }
            }
        }
    }

    /// Waits for the next timer tick or transport event. Cancel safe.
    pub async fn next_activity(&mut self) -> Activity {
        tokio::select! {
            _ = next_retry_tick(&mut self.retry) => Activity::RetryTick,
            event = next_transport_event(&mut self.session) => Activity::Transport(event),
        }
    }

    /// Applies an activity; resulting events are queued for [`Self::take_event`].
    pub async fn process(&mut self, activity: Activity) {
        match activity {
            Activity::RetryTick => self.on_retry_tick().await,
            Activity::Transport(Some(event)) => self.on_transport_event(event).await,
            Activity::Transport(None) => self.on_closed().await,
        }
    }

    pub fn take_event(&mut self) -> Option<ConnectionEvent> {
        self.pending.pop_front()
    }

    /// Drives the manager until it has an event to report.
    pub async fn next_event(&mut self) -> ConnectionEvent {
        loop {
            if let Some(event) = self.take_event() {
                return event;
            }
            let activity = self.next_activity().await;
            self.process(activity).await;
        }
    }

    pub async fn send(&self, data: Bytes) -> Result<(), ConnectionError> {
        match &self.session {
            Some(session) if self.state == ConnectionState::Connected => {
                Ok(session.send(data).await?)
            }
            _ => Err(ConnectionError::Transport(TransportError::NotConnected)),
        }
    }

    pub async fn shutdown(&mut self) {
        self.reset().await;
        self.state = ConnectionState::Idle;
        info!(
            target = "beach_bottle::connection",
            remote = %self.remote,
            "connection shut down"
        );
    }

    async fn reset(&mut self) {
        self.retry = None;
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }

    fn arm_retry(&mut self) {
        let mut retry = interval_at(Instant::now() + self.retry_interval, self.retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.retry = Some(retry);
    }

    async fn on_retry_tick(&mut self) {
        if self.state == ConnectionState::Connected {
            trace!(target = "beach_bottle::connection", "connected; disarming retry timer");
            self.retry = None;
            return;
        }
        if let Err(err) = self.make_connection().await {
            warn!(
                target = "beach_bottle::connection",
                remote = %self.remote,
                error = %err,
                "connection attempt failed"
            );
            self.pending.push_back(ConnectionEvent::AttemptFailed(err));
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Signal(payload) => {
                let Some(role) = self.session_role() else {
                    return;
                };
                if let Err(err) = self.publish(role, &payload).await {
                    warn!(
                        target = "beach_bottle::connection",
                        error = %err,
                        "failed to publish local signal"
                    );
                    self.pending.push_back(ConnectionEvent::AttemptFailed(err));
                }
            }
            TransportEvent::Connected => {
                self.state = ConnectionState::Connected;
                self.retry = None;
                info!(
                    target = "beach_bottle::connection",
                    remote = %self.remote,
                    generation = self.generation,
                    role = ?self.session_role(),
                    "peer connected"
                );
                self.pending
                    .push_back(ConnectionEvent::StatusChanged { connected: true });
            }
            TransportEvent::Data(bytes) => {
                self.pending.push_back(ConnectionEvent::Data(bytes));
            }
            TransportEvent::Error(message) => {
                debug!(
                    target = "beach_bottle::connection",
                    generation = self.generation,
                    error = %message,
                    "transport session will be replaced on next attempt"
                );
            }
            TransportEvent::Closed => self.on_closed().await,
        }
    }

    async fn on_closed(&mut self) {
        let was_connected = self.state == ConnectionState::Connected;
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.state = ConnectionState::Disconnected;
        info!(
            target = "beach_bottle::connection",
            remote = %self.remote,
            was_connected,
            "transport closed; restarting rendezvous"
        );
        if was_connected {
            self.pending
                .push_back(ConnectionEvent::StatusChanged { connected: false });
        }
        if let Err(err) = self.establish_connection().await {
            warn!(
                target = "beach_bottle::connection",
                remote = %self.remote,
                error = %err,
                "reconnect attempt failed"
            );
            self.pending.push_back(ConnectionEvent::AttemptFailed(err));
        }
    }

    /// Remote signal, or `None` when absent, expired, unverifiable or malformed.
    async fn read_remote_signal(&self) -> Result<Option<(Role, Value)>, ConnectionError> {
        let path = signal_path(&self.remote);
        let raw = match self.storage.read(&path).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(StorageError::Decode { source, .. }) => {
                debug!(target = "beach_bottle::connection", error = %source, "remote signal unreadable");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let envelope: SignalEnvelope = match serde_json::from_value(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(target = "beach_bottle::connection", error = %err, "remote signal malformed");
                return Ok(None);
            }
        };
        match self.codec.decode(&envelope) {
            Ok(payload) => Ok(Some((envelope.role, payload))),
            Err(err) => {
                debug!(
                    target = "beach_bottle::connection",
                    remote = %self.remote,
                    error = %err,
                    "ignoring remote signal"
                );
                Ok(None)
            }
        }
    }

    fn negotiating_as(&self, role: Role) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.role() == role && session.is_negotiating())
    }

    fn already_consumed(&self, payload: &Value) -> bool {
        self.session
            .as_ref()
            .and_then(TransportSession::consumed)
            .is_some_and(|consumed| consumed == payload)
    }

    /// When both sides initiate, the lower address answers the other's offer.
    fn yields_to_remote(&self) -> bool {
        self.local < self.remote
    }

    async fn start_session(&mut self, role: Role) -> Result<(), ConnectionError> {
        if let Some(mut previous) = self.session.take() {
            previous.close().await;
        }
        self.generation += 1;
        debug!(
            target = "beach_bottle::connection",
            remote = %self.remote,
            generation = self.generation,
            role = %role,
            "starting transport session"
        );
        let session =
            TransportSession::create(self.factory.as_ref(), role, self.generation).await?;
        self.session = Some(session);
        Ok(())
    }

    async fn feed(&mut self, payload: Value) -> Result<(), ConnectionError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if let Err(err) = session.feed_signal(payload).await {
            session.poison();
            return Err(err.into());
        }
        Ok(())
    }

    async fn republish(&mut self) -> Result<(), ConnectionError> {
        let Some((role, payload)) = self
            .session
            .as_ref()
            .and_then(|session| Some((session.role(), session.last_signal()?.clone())))
        else {
            trace!(target = "beach_bottle::connection", "no local signal to republish yet");
            return Ok(());
        };
        self.publish(role, &payload).await
    }

    async fn publish(&self, role: Role, payload: &Value) -> Result<(), ConnectionError> {
        let envelope = self.codec.encode(role, payload)?;
        write_json(self.storage.as_ref(), &signal_path(&self.local), &envelope).await?;
        trace!(
            target = "beach_bottle::connection",
            local = %self.local,
            role = %role,
            expires_at = envelope.expires_at,
            "published signal"
        );
        Ok(())
    }
}

async fn next_retry_tick(retry: &mut Option<Interval>) {
    match retry {
        Some(retry) => {
            retry.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_transport_event(session: &mut Option<TransportSession>) -> Option<TransportEvent> {
    match session {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::DEFAULT_SIGNAL_TTL;
    use crate::transport::memory::MemoryNetwork;
    use bottle_storage::{MemoryMedium, read_json};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn addr(value: &str) -> PeerAddress {
        PeerAddress::new(value).unwrap()
    }

    fn manager(
        medium: &MemoryMedium,
        network: &MemoryNetwork,
        local: &str,
        remote: &str,
    ) -> ConnectionManager {
        ConnectionManager::new(
            addr(remote),
            Arc::new(medium.client(addr(local))),
            Arc::new(network.clone()),
            SignalCodec::default(),
            DEFAULT_RETRY_INTERVAL,
        )
    }

    async fn signal_doc(medium: &MemoryMedium, owner: &str) -> Option<SignalEnvelope> {
        let reader = medium.client(addr("reader"));
        read_json(&reader, &signal_path(&addr(owner))).await.unwrap()
    }

    fn spawn_driver(
        mut manager: ConnectionManager,
    ) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let _ = manager.establish_connection().await;
            loop {
                let event = manager.next_event().await;
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn wait_for_status(
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
        connected: bool,
    ) {
        loop {
            match events.recv().await {
                Some(ConnectionEvent::StatusChanged { connected: status }) if status == connected => {
                    return;
                }
                Some(_) => continue,
                None => panic!("driver stopped"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_remote_signal_creates_initiator() {
        let medium = MemoryMedium::new();
        let network = MemoryNetwork::new();
        let mut alice = manager(&medium, &network, "alice", "bob");

        alice.establish_connection().await.unwrap();
        assert_eq!(alice.state(), ConnectionState::AwaitingSignal);
        assert_eq!(alice.session_role(), Some(Role::Initiator));
        assert!(alice.retry_armed());

        // the offer is published once the session reports it
        let activity = alice.next_activity().await;
        alice.process(activity).await;
        let envelope = signal_doc(&medium, "alice").await.expect("signal published");
        assert_eq!(envelope.role, Role::Initiator);
        let payload = SignalCodec::default().decode(&envelope).unwrap();
        assert_eq!(payload["type"], "offer");
    }

    #[tokio::test(start_paused = true)]
    async fn remote_offer_is_answered() {
        let medium = MemoryMedium::new();
        let network = MemoryNetwork::new();
        let mut bob = manager(&medium, &network, "bob", "alice");
        let mut alice = manager(&medium, &network, "alice", "bob");

        bob.establish_connection().await.unwrap();
        let activity = bob.next_activity().await;
        bob.process(activity).await;

        alice.establish_connection().await.unwrap();
        assert_eq!(alice.session_role(), Some(Role::Responder));
        let activity = alice.next_activity().await;
        alice.process(activity).await;
        let envelope = signal_doc(&medium, "alice").await.expect("answer published");
        assert_eq!(envelope.role, Role::Responder);
    }

    #[tokio::test(start_paused = true)]
    async fn unusable_remote_documents_count_as_absent() {
        let medium = MemoryMedium::new();
        let network = MemoryNetwork::new();
        medium.insert(&signal_path(&addr("bob")), json!({"garbage": true}));
        let mut alice = manager(&medium, &network, "alice", "bob");
        alice.establish_connection().await.unwrap();
        assert_eq!(alice.session_role(), Some(Role::Initiator));

        let foreign = SignalCodec::new("someone-else", DEFAULT_SIGNAL_TTL)
            .encode(Role::Initiator, &json!({"type": "offer", "id": 77}))
            .unwrap();
        medium.insert(
            &signal_path(&addr("carol")),
            serde_json::to_value(&foreign).unwrap(),
        );
        let mut dave = manager(&medium, &network, "dave", "carol");
        dave.establish_connection().await.unwrap();
        assert_eq!(dave.session_role(), Some(Role::Initiator));
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failures_propagate_and_retries_continue() {
        let medium = MemoryMedium::new();
        let network = MemoryNetwork::new();
        let mut alice = manager(&medium, &network, "alice", "bob");
        medium.set_available(false);

        let err = alice.establish_connection().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Storage(StorageError::Unavailable(_))));
        assert!(alice.retry_armed());

        let event = alice.next_event().await;
        assert!(matches!(event, ConnectionEvent::AttemptFailed(_)));

        medium.set_available(true);
        let activity = alice.next_activity().await;
        assert!(matches!(activity, Activity::RetryTick));
        alice.process(activity).await;
        assert_eq!(alice.session_role(), Some(Role::Initiator));
    }

    #[tokio::test(start_paused = true)]
    async fn two_sides_converge_and_connect() {
        let medium = MemoryMedium::new();
        let network = MemoryNetwork::new();
        let mut alice = spawn_driver(manager(&medium, &network, "alice", "bob"));
        let mut bob = spawn_driver(manager(&medium, &network, "bob", "alice"));

        timeout(Duration::from_secs(120), async {
            wait_for_status(&mut alice, true).await;
            wait_for_status(&mut bob, true).await;
        })
        .await
        .expect("peers connect");
        assert_eq!(network.open_links(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_link_restarts_rendezvous() {
        let medium = MemoryMedium::new();
        let network = MemoryNetwork::new();
        let mut alice = spawn_driver(manager(&medium, &network, "alice", "bob"));
        let mut bob = spawn_driver(manager(&medium, &network, "bob", "alice"));

        timeout(Duration::from_secs(120), async {
            wait_for_status(&mut alice, true).await;
            wait_for_status(&mut bob, true).await;
        })
        .await
        .expect("peers connect");

        assert_eq!(network.sever(), 1);
        timeout(Duration::from_secs(5), async {
            wait_for_status(&mut alice, false).await;
            wait_for_status(&mut bob, false).await;
        })
        .await
        .expect("disconnect observed");

        timeout(Duration::from_secs(120), async {
            wait_for_status(&mut alice, true).await;
            wait_for_status(&mut bob, true).await;
        })
        .await
        .expect("peers reconnect");
        assert_eq!(network.open_links(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_connection() {
        let medium = MemoryMedium::new();
        let network = MemoryNetwork::new();
        let alice = manager(&medium, &network, "alice", "bob");
        let err = alice.send(Bytes::from_static(b"hi")).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Transport(TransportError::NotConnected)
        ));
    }
}
