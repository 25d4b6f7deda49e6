use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    PeerTransport, Role, TransportError, TransportEvent, TransportEvents, TransportFactory,
    to_setup_error,
};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<String>,
    pub channel_label: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            channel_label: "beach-bottle".to_string(),
        }
    }
}

/// Creates data-channel transports. Local descriptions are published only
/// after ICE gathering completes, so each signal is self-contained.
#[derive(Debug, Clone, Default)]
pub struct WebRtcTransportFactory {
    config: WebRtcConfig,
}

impl WebRtcTransportFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WebRtcSdpPayload {
    sdp: String,
    #[serde(rename = "type")]
    typ: String,
}

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

struct Shared {
    role: Role,
    events: mpsc::UnboundedSender<TransportEvent>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    closed: AtomicBool,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(event);
    }

    fn finish(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed);
        }
    }
}

fn attach_channel(shared: &Arc<Shared>, dc: Arc<RTCDataChannel>) {
    *shared.channel.lock() = Some(dc.clone());

    let open = shared.clone();
    dc.on_open(Box::new(move || {
        let shared = open.clone();
        Box::pin(async move {
            tracing::debug!(
                target = "beach_bottle::transport::webrtc",
                role = %shared.role,
                "data channel opened"
            );
            shared.emit(TransportEvent::Connected);
        })
    }));

    let inbound = shared.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let shared = inbound.clone();
        Box::pin(async move {
            shared.emit(TransportEvent::Data(msg.data));
        })
    }));

    let closing = shared.clone();
    dc.on_close(Box::new(move || {
        let shared = closing.clone();
        Box::pin(async move {
            tracing::debug!(
                target = "beach_bottle::transport::webrtc",
                role = %shared.role,
                "data channel closed"
            );
            shared.finish();
        })
    }));
}

async fn publish_local_description(
    pc: Arc<RTCPeerConnection>,
    mut gather: mpsc::Receiver<()>,
    shared: Arc<Shared>,
) {
    tracing::trace!(
        target = "beach_bottle::transport::webrtc",
        role = %shared.role,
        await = "gather.recv",
        state = "start"
    );
    let _ = gather.recv().await;
    tracing::trace!(
        target = "beach_bottle::transport::webrtc",
        role = %shared.role,
        await = "gather.recv",
        state = "end"
    );
    let Some(desc) = pc.local_description().await else {
        shared.emit(TransportEvent::Error(
            "failed to obtain local description".into(),
        ));
        return;
    };
    let payload = WebRtcSdpPayload {
        sdp: desc.sdp.clone(),
        typ: desc.sdp_type.to_string(),
    };
    match serde_json::to_value(&payload) {
        Ok(value) => shared.emit(TransportEvent::Signal(value)),
        Err(err) => shared.emit(TransportEvent::Error(err.to_string())),
    }
}

fn session_description_from_payload(
    payload: &WebRtcSdpPayload,
) -> Result<RTCSessionDescription, TransportError> {
    let description = match RTCSdpType::from(payload.typ.as_str()) {
        RTCSdpType::Offer => RTCSessionDescription::offer(payload.sdp.clone()),
        RTCSdpType::Answer => RTCSessionDescription::answer(payload.sdp.clone()),
        _ => {
            return Err(TransportError::UnexpectedSignal(format!(
                "unsupported sdp type {}",
                payload.typ
            )));
        }
    };
    description.map_err(to_setup_error)
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        role: Role,
    ) -> Result<(Box<dyn PeerTransport>, TransportEvents), TransportError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        let api = build_api(setting)?;
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            role,
            events: tx,
            channel: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let watcher = shared.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let shared = watcher.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "beach_bottle::transport::webrtc",
                    role = %shared.role,
                    ?state,
                    "peer connection state changed"
                );
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                        | RTCPeerConnectionState::Disconnected
                ) {
                    shared.finish();
                }
            })
        }));

        match role {
            Role::Initiator => {
                let dc_init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(&self.config.channel_label, Some(dc_init))
                    .await
                    .map_err(to_setup_error)?;
                attach_channel(&shared, dc);

                let offer = pc.create_offer(None).await.map_err(to_setup_error)?;
                let gather = pc.gathering_complete_promise().await;
                pc.set_local_description(offer)
                    .await
                    .map_err(to_setup_error)?;
                tokio::spawn(publish_local_description(pc.clone(), gather, shared.clone()));
            }
            Role::Responder => {
                let incoming = shared.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let shared = incoming.clone();
                    Box::pin(async move {
                        tracing::debug!(
                            target = "beach_bottle::transport::webrtc",
                            label = %dc.label(),
                            "remote data channel announced"
                        );
                        attach_channel(&shared, dc);
                    })
                }));
            }
        }

        Ok((Box::new(WebRtcTransport { pc, shared }), rx))
    }
}

struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    shared: Arc<Shared>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn signal(&self, payload: Value) -> Result<(), TransportError> {
        let payload: WebRtcSdpPayload = serde_json::from_value(payload)
            .map_err(|err| TransportError::UnexpectedSignal(err.to_string()))?;
        let description = session_description_from_payload(&payload)?;
        match (self.shared.role, description.sdp_type) {
            (Role::Responder, RTCSdpType::Offer) => {
                self.pc
                    .set_remote_description(description)
                    .await
                    .map_err(to_setup_error)?;
                let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
                let gather = self.pc.gathering_complete_promise().await;
                self.pc
                    .set_local_description(answer)
                    .await
                    .map_err(to_setup_error)?;
                tokio::spawn(publish_local_description(
                    self.pc.clone(),
                    gather,
                    self.shared.clone(),
                ));
                Ok(())
            }
            (Role::Initiator, RTCSdpType::Answer) => self
                .pc
                .set_remote_description(description)
                .await
                .map_err(to_setup_error),
            (role, sdp_type) => Err(TransportError::UnexpectedSignal(format!(
                "{role} cannot accept {sdp_type}"
            ))),
        }
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let channel = self.shared.channel.lock().clone();
        let Some(dc) = channel else {
            return Err(TransportError::NotConnected);
        };
        dc.send(&data).await.map_err(to_setup_error)?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                target = "beach_bottle::transport::webrtc",
                error = %err,
                "peer connection close failed"
            );
        }
        self.shared.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdp_payload_uses_type_field() {
        let payload: WebRtcSdpPayload =
            serde_json::from_value(serde_json::json!({"sdp": "v=0", "type": "offer"})).unwrap();
        assert_eq!(payload.typ, "offer");
        let encoded = serde_json::to_value(&payload).unwrap();
        assert_eq!(encoded["type"], "offer");
    }

    #[test]
    fn rejects_unsupported_sdp_types() {
        let payload = WebRtcSdpPayload {
            sdp: "v=0".into(),
            typ: "rollback".into(),
        };
        assert!(matches!(
            session_description_from_payload(&payload),
            Err(TransportError::UnexpectedSignal(_))
        ));
    }
}
