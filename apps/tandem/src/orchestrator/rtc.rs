//! Peer connections on top of webrtc-rs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::link::{LinkError, LinkEvent, NegotiationRole, PeerConnector, PeerHandle, PeerLink};
use crate::media::{LocalMedia, MediaKind};
use crate::transport::{ChannelError, DataChannel};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const DATA_CHANNEL_LABEL: &str = "tandem-data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfig {
    pub ice_servers: Vec<String>,
    pub data_channel_label: String,
    /// Relay candidates as they are gathered instead of embedding them in
    /// the SDP once gathering completes.
    pub trickle: bool,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            data_channel_label: DATA_CHANNEL_LABEL.to_string(),
            trickle: false,
        }
    }
}

impl RtcConfig {
    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

pub struct WebRtcConnector {
    config: RtcConfig,
}

impl WebRtcConnector {
    pub fn new(config: RtcConfig) -> Self {
        Self { config }
    }
}

fn setup_error(err: webrtc::Error) -> LinkError {
    LinkError::Setup(err.to_string())
}

fn negotiation_error(err: webrtc::Error) -> LinkError {
    LinkError::Negotiation(err.to_string())
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        role: NegotiationRole,
        media: &LocalMedia,
    ) -> Result<PeerHandle, LinkError> {
        let peer_connection = self.new_peer_connection().await?;
        let (tx, events) = mpsc::unbounded_channel();
        let configured = self.configure(&peer_connection, role, media, tx).await;
        let senders = close_on_error(&peer_connection, configured).await?;

        Ok(PeerHandle {
            link: Box::new(WebRtcLink {
                peer_connection,
                senders: Mutex::new(senders),
                trickle: self.config.trickle,
            }),
            events,
        })
    }
}

impl WebRtcConnector {
    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, LinkError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(setup_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let peer_connection = api
            .new_peer_connection(self.config.rtc_configuration())
            .await
            .map_err(setup_error)?;
        Ok(Arc::new(peer_connection))
    }

    /// Attaches local tracks, event callbacks and the data channel. Returns
    /// the per-kind senders used for later track replacement.
    async fn configure(
        &self,
        peer_connection: &Arc<RTCPeerConnection>,
        role: NegotiationRole,
        media: &LocalMedia,
        tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<HashMap<MediaKind, Arc<RTCRtpSender>>, LinkError> {
        let mut senders = HashMap::new();
        for track in media.tracks() {
            let rtc_track: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
            let sender = peer_connection
                .add_track(rtc_track)
                .await
                .map_err(setup_error)?;
            senders.insert(track.kind(), sender);
        }

        let state_tx = tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                debug!(?state, "peer connection state changed");
                let event = match state {
                    RTCPeerConnectionState::Connected => Some(LinkEvent::Connected),
                    // May recover on its own; ICE reports Failed if it does not.
                    RTCPeerConnectionState::Disconnected => None,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        Some(LinkEvent::Closed)
                    }
                    _ => None,
                };
                if let Some(event) = event {
                    let _ = state_tx.send(event);
                }
                Box::pin(async {})
            },
        ));

        let track_tx = tx.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(MediaKind::Audio),
                    RTPCodecType::Video => Some(MediaKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    info!(%kind, "remote track received");
                    let _ = track_tx.send(LinkEvent::RemoteTrack(kind));
                }
                Box::pin(async {})
            },
        ));

        if self.config.trickle {
            let candidate_tx = tx.clone();
            peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    match candidate
                        .to_json()
                        .map_err(|err| err.to_string())
                        .and_then(|init| serde_json::to_value(init).map_err(|err| err.to_string()))
                    {
                        Ok(value) => {
                            let _ = candidate_tx.send(LinkEvent::LocalCandidate(value));
                        }
                        Err(err) => warn!(error = %err, "failed to encode local candidate"),
                    }
                }
                Box::pin(async {})
            }));
        }

        match role {
            NegotiationRole::Offerer => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let channel = peer_connection
                    .create_data_channel(&self.config.data_channel_label, Some(init))
                    .await
                    .map_err(setup_error)?;
                wire_data_channel(channel, tx.clone());
            }
            NegotiationRole::Answerer => {
                let channel_tx = tx.clone();
                peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                    debug!(label = channel.label(), "data channel announced by peer");
                    wire_data_channel(channel, channel_tx.clone());
                    Box::pin(async {})
                }));
            }
        }
        Ok(senders)
    }
}

/// Closes a connection whose setup failed partway, then hands back the error.
async fn close_on_error<T>(
    peer_connection: &RTCPeerConnection,
    result: Result<T, LinkError>,
) -> Result<T, LinkError> {
    if result.is_err() {
        if let Err(err) = peer_connection.close().await {
            debug!(error = %err, "closing half-built peer connection failed");
        }
    }
    result
}

fn wire_data_channel(channel: Arc<RTCDataChannel>, tx: mpsc::UnboundedSender<LinkEvent>) {
    let open_tx = tx.clone();
    let open_channel = Arc::clone(&channel);
    channel.on_open(Box::new(move || {
        info!(label = open_channel.label(), "data channel open");
        let _ = open_tx.send(LinkEvent::ChannelOpen(Arc::new(RtcDataChannel(open_channel))));
        Box::pin(async {})
    }));

    let close_tx = tx.clone();
    channel.on_close(Box::new(move || {
        debug!("data channel closed");
        let _ = close_tx.send(LinkEvent::Closed);
        Box::pin(async {})
    }));

    channel.on_message(Box::new(move |message: DataChannelMessage| {
        if !message.is_string {
            debug!(bytes = message.data.len(), "ignoring binary data channel frame");
        } else {
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(LinkEvent::Message(text));
                }
                Err(err) => warn!(error = %err, "data channel frame is not UTF-8"),
            }
        }
        Box::pin(async {})
    }));
}

struct RtcDataChannel(Arc<RTCDataChannel>);

#[async_trait]
impl DataChannel for RtcDataChannel {
    async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        self.0
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|err| ChannelError::Send(err.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.0.buffered_amount().await
    }
}

struct WebRtcLink {
    peer_connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<MediaKind, Arc<RTCRtpSender>>>,
    trickle: bool,
}

impl WebRtcLink {
    /// Sets `description` as local and returns what should be signaled. Without
    /// trickle this waits for ICE gathering so the SDP carries every candidate.
    async fn publish_local(&self, description: RTCSessionDescription) -> Result<Value, LinkError> {
        let mut gathered = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(negotiation_error)?;
        if !self.trickle {
            let _ = gathered.recv().await;
        }
        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| LinkError::Negotiation("no local description after gathering".into()))?;
        serde_json::to_value(local).map_err(|err| LinkError::Description(err.to_string()))
    }
}

fn parse_description(value: Value) -> Result<RTCSessionDescription, LinkError> {
    serde_json::from_value(value).map_err(|err| LinkError::Description(err.to_string()))
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<Value, LinkError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(negotiation_error)?;
        self.publish_local(offer).await
    }

    async fn accept_offer(&self, offer: Value) -> Result<Value, LinkError> {
        self.peer_connection
            .set_remote_description(parse_description(offer)?)
            .await
            .map_err(negotiation_error)?;
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(negotiation_error)?;
        self.publish_local(answer).await
    }

    async fn apply_answer(&self, answer: Value) -> Result<(), LinkError> {
        self.peer_connection
            .set_remote_description(parse_description(answer)?)
            .await
            .map_err(negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), LinkError> {
        let candidate: RTCIceCandidateInit = serde_json::from_value(candidate)
            .map_err(|err| LinkError::Description(err.to_string()))?;
        self.peer_connection
            .add_ice_candidate(candidate)
            .await
            .map_err(negotiation_error)
    }

    async fn replace_tracks(&self, media: &LocalMedia) -> Result<(), LinkError> {
        for track in media.tracks() {
            let sender = self.senders.lock().get(&track.kind()).cloned();
            let Some(sender) = sender else {
                debug!(kind = %track.kind(), "no sender for track kind; skipping");
                continue;
            };
            let rtc_track: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
            sender
                .replace_track(Some(rtc_track))
                .await
                .map_err(negotiation_error)?;
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            warn!(error = %err, "error closing peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::peer_connection::signaling_state::RTCSignalingState;

    #[test]
    fn default_config_uses_public_stun() {
        let config = RtcConfig::default();
        let rtc = config.rtc_configuration();
        assert_eq!(rtc.ice_servers.len(), 1);
        assert_eq!(rtc.ice_servers[0].urls, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert!(!config.trickle);
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_setup_closes_the_connection() {
        let connector = WebRtcConnector::new(RtcConfig {
            ice_servers: Vec::new(),
            ..RtcConfig::default()
        });
        let peer_connection = connector.new_peer_connection().await.unwrap();
        assert_ne!(peer_connection.signaling_state(), RTCSignalingState::Closed);

        let result: Result<(), LinkError> =
            close_on_error(&peer_connection, Err(LinkError::Setup("no tracks".into()))).await;
        assert_eq!(result, Err(LinkError::Setup("no tracks".into())));
        assert_eq!(peer_connection.signaling_state(), RTCSignalingState::Closed);

        let healthy = connector.new_peer_connection().await.unwrap();
        assert_eq!(close_on_error(&healthy, Ok(7)).await, Ok(7));
        assert_ne!(healthy.signaling_state(), RTCSignalingState::Closed);
        healthy.close().await.unwrap();
    }

    #[test]
    fn no_ice_servers_for_local_only() {
        let config = RtcConfig {
            ice_servers: Vec::new(),
            ..RtcConfig::default()
        };
        assert!(config.rtc_configuration().ice_servers.is_empty());
    }

    #[test]
    fn session_descriptions_parse_from_signaling_json() {
        let value = serde_json::json!({"type": "offer", "sdp": "v=0\r\n"});
        let description = parse_description(value).unwrap();
        assert_eq!(description.sdp, "v=0\r\n");
        assert!(parse_description(serde_json::json!({"sdp": 1})).is_err());
    }
}
