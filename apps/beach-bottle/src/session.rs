use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use bottle_storage::{PeerAddress, StorageClient};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState, DEFAULT_RETRY_INTERVAL,
};
use crate::message_log::{DEFAULT_BLOCK_SIZE, LogError, Message, MessageLog, Sender};
use crate::signal::SignalCodec;
use crate::transport::{TransportError, TransportFactory};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub username: String,
    #[serde(default)]
    pub profile: Value,
}

/// Frames exchanged over an established transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireFrame {
    Identity { identity: PeerIdentity },
    Message { body: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SessionEvent {
    ConnectionStatusChanged {
        peer: PeerAddress,
        connected: bool,
    },
    PeerIdentified {
        peer: PeerAddress,
        identity: PeerIdentity,
    },
    SessionReady {
        peer: PeerAddress,
        history: Vec<Message>,
    },
    MessageReceived {
        peer: PeerAddress,
        message: Message,
    },
    MessageSent {
        peer: PeerAddress,
        message: Message,
    },
    Error {
        peer: PeerAddress,
        message: String,
    },
}

impl SessionEvent {
    pub fn peer(&self) -> &PeerAddress {
        match self {
            SessionEvent::ConnectionStatusChanged { peer, .. }
            | SessionEvent::PeerIdentified { peer, .. }
            | SessionEvent::SessionReady { peer, .. }
            | SessionEvent::MessageReceived { peer, .. }
            | SessionEvent::MessageSent { peer, .. }
            | SessionEvent::Error { peer, .. } => peer,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot open a session with {0}")]
    InvalidAddress(PeerAddress),
    #[error("message body must not be empty")]
    InvalidMessage,
    #[error("peer is not connected")]
    NotConnected,
    #[error("a session with {0} is already established")]
    AlreadyEstablished(PeerAddress),
    #[error("message log unavailable: {0}")]
    LogInitialization(#[source] LogError),
    #[error("message log error: {0}")]
    Log(#[from] LogError),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("message delivered but not recorded: {source}")]
    NotRecorded {
        body: Value,
        #[source]
        source: LogError,
    },
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("session closed")]
    Closed,
}

/// Everything a session needs that is shared across peers.
#[derive(Clone)]
pub struct SessionContext {
    pub storage: Arc<dyn StorageClient>,
    pub transports: Arc<dyn TransportFactory>,
    pub codec: SignalCodec,
    pub identity: PeerIdentity,
    pub retry_interval: Duration,
    pub block_size: usize,
}

impl SessionContext {
    pub fn new(storage: Arc<dyn StorageClient>, transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            storage,
            transports,
            codec: SignalCodec::default(),
            identity: PeerIdentity::default(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn with_identity(mut self, identity: PeerIdentity) -> Self {
        self.identity = identity;
        self
    }
}

enum SessionCommand {
    Send {
        body: Value,
        reply: oneshot::Sender<Result<Message, SessionError>>,
    },
    History {
        reply: oneshot::Sender<Result<Vec<Message>, SessionError>>,
    },
    Recent {
        reply: oneshot::Sender<Vec<Message>>,
    },
    State {
        reply: oneshot::Sender<ConnectionState>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the task driving one peer's connection and message log.
pub struct PeerSession {
    peer: PeerAddress,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

impl PeerSession {
    /// Initializes the peer's message log, then starts negotiating in the
    /// background. Fails without spawning anything if the log is unusable.
    pub async fn establish(
        peer: PeerAddress,
        context: SessionContext,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, SessionError> {
        if &peer == context.storage.self_address() {
            return Err(SessionError::InvalidAddress(peer));
        }
        let log = MessageLog::initialize(context.storage.clone(), &peer, context.block_size)
            .await
            .map_err(SessionError::LogInitialization)?;
        let connection = ConnectionManager::new(
            peer.clone(),
            context.storage.clone(),
            context.transports.clone(),
            context.codec.clone(),
            context.retry_interval,
        );
        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = SessionDriver {
            peer: peer.clone(),
            identity: context.identity,
            connection,
            log,
            events,
            commands: command_rx,
            ready: false,
        };
        let task = tokio::spawn(driver.run());
        info!(target = "beach_bottle::session", peer = %peer, "session established");
        Ok(Self {
            peer,
            commands,
            task,
        })
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    /// Sends `body` to the peer and records it locally.
    pub async fn send_message(&self, body: Value) -> Result<Message, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(SessionCommand::Send { body, reply })?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn history(&self) -> Result<Vec<Message>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(SessionCommand::History { reply })?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn recent(&self) -> Result<Vec<Message>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(SessionCommand::Recent { reply })?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn connection_state(&self) -> Result<ConnectionState, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(SessionCommand::State { reply })?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Closes the transport, stops the retry timer and waits for the driver.
    pub async fn shutdown(self) {
        let (reply, rx) = oneshot::channel();
        if self.request(SessionCommand::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        if let Err(err) = self.task.await {
            warn!(target = "beach_bottle::session", peer = %self.peer, error = %err, "session task failed");
        }
    }

    fn request(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }
}

struct SessionDriver {
    peer: PeerAddress,
    identity: PeerIdentity,
    connection: ConnectionManager,
    log: MessageLog,
    events: mpsc::UnboundedSender<SessionEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    ready: bool,
}

impl SessionDriver {
    async fn run(mut self) {
        if let Err(err) = self.connection.establish_connection().await {
            self.report(format!("connection attempt failed: {err}"));
        }
        self.drain_connection_events().await;
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.connection.shutdown().await;
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                activity = self.connection.next_activity() => {
                    self.connection.process(activity).await;
                    self.drain_connection_events().await;
                }
            }
        }
        debug!(target = "beach_bottle::session", peer = %self.peer, "session driver stopped");
    }

    async fn drain_connection_events(&mut self) {
        while let Some(event) = self.connection.take_event() {
            self.handle_connection_event(event).await;
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) -> ControlFlow<()> {
        match command {
            SessionCommand::Send { body, reply } => {
                let _ = reply.send(self.send_message(body).await);
            }
            SessionCommand::History { reply } => {
                let _ = reply.send(self.log.replay_all().await.map_err(SessionError::from));
            }
            SessionCommand::Recent { reply } => {
                let _ = reply.send(self.log.recent().to_vec());
            }
            SessionCommand::State { reply } => {
                let _ = reply.send(self.connection.state());
            }
            SessionCommand::Shutdown { reply } => {
                self.connection.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn send_message(&mut self, body: Value) -> Result<Message, SessionError> {
        if is_empty_body(&body) {
            return Err(SessionError::InvalidMessage);
        }
        if self.connection.state() != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let frame = serde_json::to_vec(&WireFrame::Message { body: body.clone() })?;
        match self.connection.send(Bytes::from(frame)).await {
            Ok(()) => {}
            Err(ConnectionError::Transport(TransportError::NotConnected)) => {
                return Err(SessionError::NotConnected);
            }
            Err(err) => return Err(err.into()),
        }
        let message = match self.log.append(Sender::Local, body.clone()).await {
            Ok(message) => message,
            Err(source) => {
                warn!(
                    target = "beach_bottle::session",
                    peer = %self.peer,
                    error = %source,
                    "delivered message could not be recorded"
                );
                return Err(SessionError::NotRecorded { body, source });
            }
        };
        self.emit(SessionEvent::MessageSent {
            peer: self.peer.clone(),
            message: message.clone(),
        });
        Ok(message)
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StatusChanged { connected } => {
                self.emit(SessionEvent::ConnectionStatusChanged {
                    peer: self.peer.clone(),
                    connected,
                });
                if connected {
                    self.on_connected().await;
                }
            }
            ConnectionEvent::Data(bytes) => self.on_frame(bytes).await,
            ConnectionEvent::AttemptFailed(err) => {
                self.report(format!("connection attempt failed: {err}"));
            }
        }
    }

    async fn on_connected(&mut self) {
        let frame = WireFrame::Identity {
            identity: self.identity.clone(),
        };
        match serde_json::to_vec(&frame) {
            Ok(bytes) => {
                if let Err(err) = self.connection.send(Bytes::from(bytes)).await {
                    self.report(format!("failed to send identity: {err}"));
                }
            }
            Err(err) => self.report(format!("failed to encode identity: {err}")),
        }
        if self.ready {
            return;
        }
        match self.log.replay_all().await {
            Ok(history) => {
                self.ready = true;
                info!(
                    target = "beach_bottle::session",
                    peer = %self.peer,
                    messages = history.len(),
                    "session ready"
                );
                self.emit(SessionEvent::SessionReady {
                    peer: self.peer.clone(),
                    history,
                });
            }
            Err(err) => self.report(format!("failed to replay history: {err}")),
        }
    }

    async fn on_frame(&mut self, bytes: Bytes) {
        let frame = match serde_json::from_slice::<WireFrame>(&bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    target = "beach_bottle::session",
                    peer = %self.peer,
                    error = %err,
                    len = bytes.len(),
                    "dropping undecodable frame"
                );
                trace!(
                    target = "beach_bottle::session",
                    preview = %frame_preview(&bytes),
                    "undecodable frame contents"
                );
                return;
            }
        };
        match frame {
            WireFrame::Identity { identity } => {
                debug!(
                    target = "beach_bottle::session",
                    peer = %self.peer,
                    username = %identity.username,
                    "peer identified"
                );
                self.emit(SessionEvent::PeerIdentified {
                    peer: self.peer.clone(),
                    identity,
                });
            }
            WireFrame::Message { body } => match self.log.append(Sender::Remote, body).await {
                Ok(message) => self.emit(SessionEvent::MessageReceived {
                    peer: self.peer.clone(),
                    message,
                }),
                Err(err) => self.report(format!("failed to record incoming message: {err}")),
            },
        }
    }

    fn report(&self, message: String) {
        warn!(target = "beach_bottle::session", peer = %self.peer, "{message}");
        self.emit(SessionEvent::Error {
            peer: self.peer.clone(),
            message,
        });
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!(target = "beach_bottle::session", peer = %self.peer, "event receiver dropped");
        }
    }
}

fn frame_preview(bytes: &[u8]) -> String {
    const LIMIT: usize = 64;
    let shown = &bytes[..bytes.len().min(LIMIT)];
    let mut preview = String::from_utf8_lossy(shown).escape_debug().to_string();
    if bytes.len() > LIMIT {
        preview.push_str(&format!("... ({} bytes)", bytes.len()));
    }
    preview
}

fn is_empty_body(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
