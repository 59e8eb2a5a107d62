//! Drives one client's side of a session: room admission, the asymmetric
//! offer/answer exchange, host tracking, media replacement and teardown.
//!
//! The orchestrator is a single task selecting over three inputs: events from
//! the signaling server, events from the live peer connection, and commands
//! from whoever drives the session (CLI, UI). Everything it wants to tell the
//! outside world goes out as a [`SessionEvent`].

pub mod link;
pub mod rtc;
pub mod state;

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tandem_proto::{ClientEvent, ServerEvent};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::media::{LocalMedia, MediaConstraints, MediaError, MediaKind, MediaSource};
use crate::transport::{
    DataChannel, Message, ReliableTransport, TransferConfig, TransferError, TransportEvent,
};

pub use link::{LinkError, LinkEvent, NegotiationRole, PeerConnector, PeerHandle, PeerLink};
pub use state::{Phase, SessionState};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("signaling channel closed")]
    SignalingClosed,
    #[error("no local media")]
    NoLocalMedia,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub transfer: TransferConfig,
    /// Relay local ICE candidates as they are gathered instead of waiting for
    /// gathering to finish and sending them inside the SDP.
    pub trickle: bool,
    pub constraints: MediaConstraints,
}

/// What the session reports to its driver.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Admitted { is_host: bool },
    RoomFull,
    HostChanged { is_host: bool },
    PeerConnected,
    PeerLeft,
    /// The peer connection dropped without the server announcing a leave. The
    /// guest signals `ready` again so the host builds a fresh connection.
    ConnectionLost,
    RemoteTrack(MediaKind),
    MediaReplaced,
    Message(Message),
    Control(Value),
    MediaSourceChange(Value),
    MediaSourceAnswer(Value),
    TransferProgress { file_name: String, percent: u8 },
    TransferFailed { file_name: String, reason: String },
    Error(String),
    /// Torn down because the signaling connection went away.
    Disconnected,
    Left,
}

#[derive(Debug, Clone)]
pub enum SessionCommand {
    SendChat(String),
    SendFile { file_name: String, bytes: Bytes },
    SendControl(Value),
    ReplaceMedia(MediaConstraints),
    SetAudioMuted(bool),
    SetVideoMuted(bool),
    MediaSourceChange(Value),
    MediaSourceAnswer(Value),
    Leave,
}

pub struct Orchestrator {
    room: String,
    settings: SessionSettings,
    is_host: bool,
    state: SessionState,
    media_source: Arc<dyn MediaSource>,
    connector: Arc<dyn PeerConnector>,
    signals: mpsc::UnboundedSender<ClientEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

impl Orchestrator {
    pub fn new(
        room: impl Into<String>,
        settings: SessionSettings,
        media_source: Arc<dyn MediaSource>,
        connector: Arc<dyn PeerConnector>,
        signals: mpsc::UnboundedSender<ClientEvent>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            room: room.into(),
            settings,
            is_host: false,
            state: SessionState::Idle,
            media_source,
            connector,
            signals,
            events,
            link_events: None,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn join(&mut self) -> Result<(), OrchestratorError> {
        info!(room = %self.room, "joining room");
        self.send_signal(ClientEvent::Join {
            room: self.room.clone(),
        })
    }

    /// Joins the room and processes events until the session is torn down.
    /// Dropping the command sender counts as leaving.
    pub async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<ServerEvent>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<(), OrchestratorError> {
        self.join()?;
        while self.phase() != Phase::TornDown {
            tokio::select! {
                event = signals.recv() => match event {
                    Some(event) => self.handle_signal(event).await,
                    None => self.signaling_lost().await,
                },
                event = next_link_event(&mut self.link_events) => self.handle_link_event(event).await,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.leave().await,
                },
            }
        }
        debug!(room = %self.room, "session loop finished");
        Ok(())
    }

    pub async fn handle_signal(&mut self, event: ServerEvent) {
        let result = match event {
            ServerEvent::Created { is_host } => self.on_admitted(is_host, false).await,
            ServerEvent::Joined { is_host } => self.on_admitted(is_host, true).await,
            ServerEvent::Full => {
                info!(room = %self.room, "room is full");
                self.teardown().await;
                self.emit(SessionEvent::RoomFull);
                Ok(())
            }
            ServerEvent::Ready => self.on_ready().await,
            ServerEvent::Offer { payload } => self.on_offer(payload).await,
            ServerEvent::Answer { payload } => self.on_answer(payload).await,
            ServerEvent::IceCandidate { payload } => self.on_remote_candidate(payload).await,
            ServerEvent::HostChanged { is_host } => {
                info!(room = %self.room, is_host, "host changed");
                self.is_host = is_host;
                self.emit(SessionEvent::HostChanged { is_host });
                Ok(())
            }
            ServerEvent::Leave => {
                self.on_peer_left().await;
                Ok(())
            }
            ServerEvent::MediaSourceChange { payload } => {
                self.emit(SessionEvent::MediaSourceChange(payload));
                Ok(())
            }
            ServerEvent::MediaSourceAnswer { payload } => {
                self.emit(SessionEvent::MediaSourceAnswer(payload));
                Ok(())
            }
            ServerEvent::Error { message } => {
                warn!(room = %self.room, %message, "signaling server reported an error");
                self.emit(SessionEvent::Error(format!("signaling server: {message}")));
                Ok(())
            }
        };
        if let Err(err) = result {
            self.report(err);
        }
    }

    pub async fn handle_link_event(&mut self, event: Option<LinkEvent>) {
        let Some(event) = event else {
            debug!(room = %self.room, "link event stream ended");
            self.link_events = None;
            return;
        };
        match event {
            LinkEvent::ChannelOpen(channel) => self.on_channel_open(channel),
            LinkEvent::Message(text) => self.on_channel_message(&text).await,
            LinkEvent::LocalCandidate(candidate) => {
                if !self.settings.trickle {
                    return;
                }
                let event = ClientEvent::IceCandidate {
                    room: self.room.clone(),
                    payload: candidate,
                };
                if let Err(err) = self.send_signal(event) {
                    self.report(err);
                }
            }
            LinkEvent::RemoteTrack(kind) => self.emit(SessionEvent::RemoteTrack(kind)),
            LinkEvent::Connected => debug!(room = %self.room, "peer connection established"),
            LinkEvent::Closed => self.on_link_closed().await,
        }
    }

    pub async fn handle_command(&mut self, command: SessionCommand) {
        let result = match command {
            SessionCommand::SendChat(content) => self.send_chat(content).await,
            SessionCommand::SendFile { file_name, bytes } => {
                self.send_file(file_name, bytes);
                Ok(())
            }
            SessionCommand::SendControl(value) => self.send_control(value).await,
            SessionCommand::ReplaceMedia(constraints) => self.replace_media(constraints).await,
            SessionCommand::SetAudioMuted(muted) => self.set_muted(MediaKind::Audio, muted),
            SessionCommand::SetVideoMuted(muted) => self.set_muted(MediaKind::Video, muted),
            SessionCommand::MediaSourceChange(payload) => {
                self.send_signal(ClientEvent::MediaSourceChange {
                    room: self.room.clone(),
                    payload,
                })
            }
            SessionCommand::MediaSourceAnswer(payload) => {
                self.send_signal(ClientEvent::MediaSourceAnswer {
                    room: self.room.clone(),
                    payload,
                })
            }
            SessionCommand::Leave => {
                self.leave().await;
                Ok(())
            }
        };
        if let Err(err) = result {
            self.report(err);
        }
    }

    /// Announces departure, releases every resource and ends the session.
    pub async fn leave(&mut self) {
        if self.phase() == Phase::TornDown {
            return;
        }
        info!(room = %self.room, "leaving room");
        if let Err(err) = self.send_signal(ClientEvent::Leave {
            room: self.room.clone(),
        }) {
            debug!(room = %self.room, error = %err, "leave not delivered");
        }
        self.teardown().await;
        self.emit(SessionEvent::Left);
    }

    async fn signaling_lost(&mut self) {
        warn!(room = %self.room, "signaling connection lost; tearing down");
        self.teardown().await;
        self.emit(SessionEvent::Disconnected);
    }

    async fn on_admitted(&mut self, is_host: bool, guest: bool) -> Result<(), OrchestratorError> {
        self.is_host = is_host;
        self.emit(SessionEvent::Admitted { is_host });
        if self.phase() != Phase::Idle {
            warn!(room = %self.room, phase = ?self.phase(), "admitted while not idle; ignoring");
            return Ok(());
        }

        let media = self.media_source.acquire(&self.settings.constraints).await?;
        if guest {
            self.state = SessionState::GuestWaiting { media };
            info!(room = %self.room, "joined as guest; signaling ready");
            self.send_signal(ClientEvent::Ready {
                room: self.room.clone(),
            })
        } else {
            self.state = SessionState::AwaitingPeer { media };
            info!(room = %self.room, "created room; waiting for a peer");
            Ok(())
        }
    }

    async fn on_ready(&mut self) -> Result<(), OrchestratorError> {
        if !self.is_host {
            debug!(room = %self.room, "ignoring ready: not host");
            return Ok(());
        }
        let Some(media) = self.dismantle().await else {
            warn!(room = %self.room, "ignoring ready: no local media");
            return Ok(());
        };
        self.negotiate(NegotiationRole::Offerer, media, None).await
    }

    async fn on_offer(&mut self, offer: Value) -> Result<(), OrchestratorError> {
        if self.is_host {
            warn!(room = %self.room, "ignoring offer: this side is host");
            return Ok(());
        }
        let Some(media) = self.dismantle().await else {
            warn!(room = %self.room, "ignoring offer: no local media");
            return Ok(());
        };
        self.negotiate(NegotiationRole::Answerer, media, Some(offer)).await
    }

    async fn on_answer(&mut self, answer: Value) -> Result<(), OrchestratorError> {
        match &self.state {
            SessionState::Negotiating {
                link,
                role: NegotiationRole::Offerer,
                ..
            } => link.apply_answer(answer).await?,
            other => debug!(room = %self.room, phase = ?other.phase(), "ignoring answer"),
        }
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: Value) -> Result<(), OrchestratorError> {
        match self.state.link() {
            Some(link) => link.add_ice_candidate(candidate).await?,
            None => debug!(room = %self.room, "no live connection; dropping remote candidate"),
        }
        Ok(())
    }

    async fn on_peer_left(&mut self) {
        info!(room = %self.room, "peer left; taking over as host");
        self.is_host = true;
        if let Some(media) = self.dismantle().await {
            self.state = SessionState::AwaitingPeer { media };
        }
        self.emit(SessionEvent::PeerLeft);
    }

    async fn negotiate(
        &mut self,
        role: NegotiationRole,
        media: LocalMedia,
        offer: Option<Value>,
    ) -> Result<(), OrchestratorError> {
        debug!(room = %self.room, ?role, "building peer connection");
        let PeerHandle { link, events } = match self.connector.connect(role, &media).await {
            Ok(handle) => handle,
            Err(err) => {
                self.state = self.waiting_state(media);
                return Err(err.into());
            }
        };

        let signal = match (role, offer) {
            (NegotiationRole::Offerer, _) => link.create_offer().await.map(|payload| {
                ClientEvent::Offer {
                    room: self.room.clone(),
                    payload,
                }
            }),
            (NegotiationRole::Answerer, Some(offer)) => {
                link.accept_offer(offer).await.map(|payload| ClientEvent::Answer {
                    room: self.room.clone(),
                    payload,
                })
            }
            (NegotiationRole::Answerer, None) => Err(LinkError::Negotiation(
                "answerer needs a remote offer".into(),
            )),
        };

        match signal {
            Ok(event) => {
                self.link_events = Some(events);
                self.state = SessionState::Negotiating { media, role, link };
                self.send_signal(event)
            }
            Err(err) => {
                link.close().await;
                self.state = self.waiting_state(media);
                Err(err.into())
            }
        }
    }

    fn on_channel_open(&mut self, channel: Arc<dyn DataChannel>) {
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Negotiating { media, role, link } => {
                let transport = ReliableTransport::new(channel, self.settings.transfer);
                self.state = SessionState::Connected {
                    media,
                    role,
                    link,
                    transport,
                };
                info!(room = %self.room, ?role, "data channel open");
                self.emit(SessionEvent::PeerConnected);
            }
            other => {
                debug!(room = %self.room, phase = ?other.phase(), "data channel opened outside negotiation");
                self.state = other;
            }
        }
    }

    async fn on_channel_message(&mut self, text: &str) {
        let Some(transport) = self.state.transport().cloned() else {
            debug!(room = %self.room, "data channel message without transport; dropping");
            return;
        };
        match transport.handle_incoming(text).await {
            Some(TransportEvent::Message(message)) => self.emit(SessionEvent::Message(message)),
            Some(TransportEvent::Control(value)) => self.emit(SessionEvent::Control(value)),
            None => {}
        }
    }

    async fn on_link_closed(&mut self) {
        if !matches!(self.phase(), Phase::Negotiating | Phase::Connected) {
            return;
        }
        warn!(room = %self.room, "peer connection closed");
        if let Some(media) = self.dismantle().await {
            self.state = self.waiting_state(media);
        }
        self.emit(SessionEvent::ConnectionLost);
        if !self.is_host && self.phase() == Phase::GuestWaiting {
            info!(room = %self.room, "asking host to renegotiate");
            if let Err(err) = self.send_signal(ClientEvent::Ready {
                room: self.room.clone(),
            }) {
                self.report(err);
            }
        }
    }

    async fn send_chat(&mut self, content: String) -> Result<(), OrchestratorError> {
        let transport = self.connected_transport()?;
        let message = transport.send_chat(content).await?;
        self.emit(SessionEvent::Message(message));
        Ok(())
    }

    async fn send_control(&mut self, value: Value) -> Result<(), OrchestratorError> {
        let transport = self.connected_transport()?;
        transport.send_control(value).await?;
        Ok(())
    }

    /// Runs the transfer on its own task so the session keeps processing
    /// events while chunks wait for acks.
    fn send_file(&self, file_name: String, bytes: Bytes) {
        let transport = match self.connected_transport() {
            Ok(transport) => transport,
            Err(err) => {
                self.emit(SessionEvent::TransferFailed {
                    file_name,
                    reason: format!("Failed to send file: {err}"),
                });
                return;
            }
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            let progress_events = events.clone();
            let progress_name = file_name.clone();
            let result = transport
                .send_file(&file_name, bytes, move |percent| {
                    let _ = progress_events.send(SessionEvent::TransferProgress {
                        file_name: progress_name.clone(),
                        percent,
                    });
                })
                .await;
            let event = match result {
                Ok(message) => SessionEvent::Message(message),
                Err(err) => SessionEvent::TransferFailed {
                    file_name,
                    reason: format!("Failed to send file: {err}"),
                },
            };
            let _ = events.send(event);
        });
    }

    async fn replace_media(&mut self, constraints: MediaConstraints) -> Result<(), OrchestratorError> {
        let current = self.state.media().ok_or(OrchestratorError::NoLocalMedia)?;
        let fresh = self.media_source.acquire(&constraints).await?;
        for kind in [MediaKind::Audio, MediaKind::Video] {
            fresh.set_muted(kind, current.is_muted(kind));
        }
        if let Some(link) = self.state.link() {
            if let Err(err) = link.replace_tracks(&fresh).await {
                fresh.stop();
                return Err(err.into());
            }
        }

        self.settings.constraints = constraints;
        if let Some(media) = self.state.media_mut() {
            let previous = std::mem::replace(media, fresh);
            previous.stop();
        }
        info!(room = %self.room, "local media replaced");
        self.emit(SessionEvent::MediaReplaced);
        Ok(())
    }

    fn set_muted(&self, kind: MediaKind, muted: bool) -> Result<(), OrchestratorError> {
        let media = self.state.media().ok_or(OrchestratorError::NoLocalMedia)?;
        media.set_muted(kind, muted);
        debug!(room = %self.room, %kind, muted, "mute toggled");
        Ok(())
    }

    fn connected_transport(&self) -> Result<ReliableTransport, OrchestratorError> {
        self.state
            .transport()
            .cloned()
            .ok_or(OrchestratorError::Transfer(TransferError::NotConnected))
    }

    fn waiting_state(&self, media: LocalMedia) -> SessionState {
        if self.is_host {
            SessionState::AwaitingPeer { media }
        } else {
            SessionState::GuestWaiting { media }
        }
    }

    /// Closes the live connection and transport, if any, and hands back the
    /// local media. Leaves the state `Idle`, or `TornDown` if it already was.
    async fn dismantle(&mut self) -> Option<LocalMedia> {
        self.link_events = None;
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Idle => None,
            SessionState::TornDown => {
                self.state = SessionState::TornDown;
                None
            }
            SessionState::AwaitingPeer { media } | SessionState::GuestWaiting { media } => {
                Some(media)
            }
            SessionState::Negotiating { media, link, .. } => {
                link.close().await;
                Some(media)
            }
            SessionState::Connected {
                media,
                link,
                transport,
                ..
            } => {
                transport.shutdown();
                link.close().await;
                Some(media)
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(media) = self.dismantle().await {
            media.stop();
        }
        self.state = SessionState::TornDown;
    }

    fn send_signal(&self, event: ClientEvent) -> Result<(), OrchestratorError> {
        self.signals
            .send(event)
            .map_err(|_| OrchestratorError::SignalingClosed)
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!(room = %self.room, "session event dropped: no consumer");
        }
    }

    fn report(&self, err: OrchestratorError) {
        warn!(room = %self.room, error = %err, "session error");
        self.emit(SessionEvent::Error(err.to_string()));
    }
}

async fn next_link_event(
    events: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>,
) -> Option<LinkEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticMediaSource;
    use crate::transport::{MemoryChannel, Sender};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct DeniedMedia;

    #[async_trait]
    impl MediaSource for DeniedMedia {
        async fn acquire(&self, _: &MediaConstraints) -> Result<LocalMedia, MediaError> {
            Err(MediaError::Denied("camera blocked".into()))
        }
    }

    #[derive(Default)]
    struct LinkLog {
        answers: Mutex<Vec<Value>>,
        candidates: Mutex<Vec<Value>>,
        replaced: Mutex<Vec<Vec<String>>>,
        closed: AtomicBool,
    }

    struct FakeLink(Arc<LinkLog>);

    #[async_trait]
    impl PeerLink for FakeLink {
        async fn create_offer(&self) -> Result<Value, LinkError> {
            Ok(json!({"type": "offer", "sdp": "fake-offer"}))
        }

        async fn accept_offer(&self, _offer: Value) -> Result<Value, LinkError> {
            Ok(json!({"type": "answer", "sdp": "fake-answer"}))
        }

        async fn apply_answer(&self, answer: Value) -> Result<(), LinkError> {
            self.0.answers.lock().push(answer);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: Value) -> Result<(), LinkError> {
            self.0.candidates.lock().push(candidate);
            Ok(())
        }

        async fn replace_tracks(&self, media: &LocalMedia) -> Result<(), LinkError> {
            let ids = media.tracks().iter().map(|t| t.id().to_owned()).collect();
            self.0.replaced.lock().push(ids);
            Ok(())
        }

        async fn close(&self) {
            self.0.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        roles: Mutex<Vec<NegotiationRole>>,
        links: Mutex<Vec<Arc<LinkLog>>>,
        fail: AtomicBool,
    }

    impl FakeConnector {
        fn last_link(&self) -> Arc<LinkLog> {
            Arc::clone(self.links.lock().last().expect("a link was built"))
        }
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn connect(
            &self,
            role: NegotiationRole,
            _media: &LocalMedia,
        ) -> Result<PeerHandle, LinkError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(LinkError::Setup("no ICE servers reachable".into()));
            }
            self.roles.lock().push(role);
            let log = Arc::new(LinkLog::default());
            self.links.lock().push(Arc::clone(&log));
            let (_tx, events) = mpsc::unbounded_channel();
            Ok(PeerHandle {
                link: Box::new(FakeLink(log)),
                events,
            })
        }
    }

    struct Harness {
        session: Orchestrator,
        connector: Arc<FakeConnector>,
        signals: mpsc::UnboundedReceiver<ClientEvent>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn harness_with(media: Arc<dyn MediaSource>, trickle: bool) -> Harness {
        let connector = Arc::new(FakeConnector::default());
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let settings = SessionSettings {
            trickle,
            ..SessionSettings::default()
        };
        let session = Orchestrator::new(
            "room-x",
            settings,
            media,
            connector.clone(),
            signal_tx,
            event_tx,
        );
        Harness {
            session,
            connector,
            signals,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(SyntheticMediaSource::new(true, true)), false)
    }

    fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    fn room() -> String {
        "room-x".to_string()
    }

    async fn connect_as_host(h: &mut Harness) -> mpsc::UnboundedReceiver<String> {
        h.session.handle_signal(ServerEvent::Created { is_host: true }).await;
        h.session.handle_signal(ServerEvent::Ready).await;
        let (channel, peer_rx) = MemoryChannel::new();
        h.session
            .handle_link_event(Some(LinkEvent::ChannelOpen(Arc::new(channel))))
            .await;
        assert_eq!(h.session.phase(), Phase::Connected);
        peer_rx
    }

    #[test_timeout::tokio_timeout_test]
    async fn host_offers_when_guest_is_ready() {
        let mut h = harness();
        h.session.handle_signal(ServerEvent::Created { is_host: true }).await;
        assert_eq!(h.session.phase(), Phase::AwaitingPeer);
        assert!(h.session.is_host());

        h.session.handle_signal(ServerEvent::Ready).await;
        assert_eq!(h.session.phase(), Phase::Negotiating);
        assert_eq!(*h.connector.roles.lock(), vec![NegotiationRole::Offerer]);
        assert_eq!(
            drain(&mut h.signals),
            vec![ClientEvent::Offer {
                room: room(),
                payload: json!({"type": "offer", "sdp": "fake-offer"}),
            }]
        );

        let answer = json!({"type": "answer", "sdp": "remote"});
        h.session
            .handle_signal(ServerEvent::Answer {
                payload: answer.clone(),
            })
            .await;
        assert_eq!(*h.connector.last_link().answers.lock(), vec![answer]);

        let (channel, _peer_rx) = MemoryChannel::new();
        h.session
            .handle_link_event(Some(LinkEvent::ChannelOpen(Arc::new(channel))))
            .await;
        assert_eq!(h.session.phase(), Phase::Connected);
        assert_eq!(
            drain(&mut h.events),
            vec![
                SessionEvent::Admitted { is_host: true },
                SessionEvent::PeerConnected
            ]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn guest_requests_renegotiation_after_connection_loss() {
        let mut h = harness();
        h.session.handle_signal(ServerEvent::Joined { is_host: false }).await;
        h.session
            .handle_signal(ServerEvent::Offer {
                payload: json!({"type": "offer", "sdp": "first"}),
            })
            .await;
        let (channel, _peer_rx) = MemoryChannel::new();
        h.session
            .handle_link_event(Some(LinkEvent::ChannelOpen(Arc::new(channel))))
            .await;
        assert_eq!(h.session.phase(), Phase::Connected);
        let first_link = h.connector.last_link();
        drain(&mut h.signals);
        drain(&mut h.events);

        h.session.handle_link_event(Some(LinkEvent::Closed)).await;
        assert!(first_link.closed.load(Ordering::SeqCst));
        assert_eq!(h.session.phase(), Phase::GuestWaiting);
        assert_eq!(drain(&mut h.events), vec![SessionEvent::ConnectionLost]);
        assert_eq!(drain(&mut h.signals), vec![ClientEvent::Ready { room: room() }]);

        h.session
            .handle_signal(ServerEvent::Offer {
                payload: json!({"type": "offer", "sdp": "second"}),
            })
            .await;
        assert_eq!(h.session.phase(), Phase::Negotiating);
        assert_eq!(
            *h.connector.roles.lock(),
            vec![NegotiationRole::Answerer, NegotiationRole::Answerer]
        );
        let (channel, _peer_rx) = MemoryChannel::new();
        h.session
            .handle_link_event(Some(LinkEvent::ChannelOpen(Arc::new(channel))))
            .await;
        assert_eq!(h.session.phase(), Phase::Connected);
        assert_eq!(drain(&mut h.events), vec![SessionEvent::PeerConnected]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn host_waits_for_ready_after_connection_loss() {
        let mut h = harness();
        let _peer_rx = connect_as_host(&mut h).await;
        drain(&mut h.signals);
        drain(&mut h.events);

        h.session.handle_link_event(Some(LinkEvent::Closed)).await;
        assert_eq!(h.session.phase(), Phase::AwaitingPeer);
        assert_eq!(drain(&mut h.events), vec![SessionEvent::ConnectionLost]);
        assert!(drain(&mut h.signals).is_empty());

        h.session.handle_signal(ServerEvent::Ready).await;
        assert_eq!(h.session.phase(), Phase::Negotiating);
        assert_eq!(
            *h.connector.roles.lock(),
            vec![NegotiationRole::Offerer, NegotiationRole::Offerer]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn guest_signals_ready_and_answers_offer() {
        let mut h = harness();
        h.session.handle_signal(ServerEvent::Joined { is_host: false }).await;
        assert_eq!(h.session.phase(), Phase::GuestWaiting);
        assert_eq!(drain(&mut h.signals), vec![ClientEvent::Ready { room: room() }]);

        h.session
            .handle_signal(ServerEvent::Offer {
                payload: json!({"type": "offer", "sdp": "remote"}),
            })
            .await;
        assert_eq!(h.session.phase(), Phase::Negotiating);
        assert_eq!(*h.connector.roles.lock(), vec![NegotiationRole::Answerer]);
        assert_eq!(
            drain(&mut h.signals),
            vec![ClientEvent::Answer {
                room: room(),
                payload: json!({"type": "answer", "sdp": "fake-answer"}),
            }]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn ready_is_ignored_by_guest_and_offer_by_host() {
        let mut guest = harness();
        guest.session.handle_signal(ServerEvent::Joined { is_host: false }).await;
        guest.session.handle_signal(ServerEvent::Ready).await;
        assert_eq!(guest.session.phase(), Phase::GuestWaiting);
        assert!(guest.connector.roles.lock().is_empty());

        let mut host = harness();
        host.session.handle_signal(ServerEvent::Created { is_host: true }).await;
        host.session
            .handle_signal(ServerEvent::Offer {
                payload: json!({"type": "offer", "sdp": "x"}),
            })
            .await;
        assert_eq!(host.session.phase(), Phase::AwaitingPeer);
        assert!(host.connector.roles.lock().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn peer_leave_promotes_guest_and_resets_connection() {
        let mut h = harness();
        h.session.handle_signal(ServerEvent::Joined { is_host: false }).await;
        h.session
            .handle_signal(ServerEvent::Offer {
                payload: json!({"type": "offer", "sdp": "remote"}),
            })
            .await;
        let (channel, _peer_rx) = MemoryChannel::new();
        h.session
            .handle_link_event(Some(LinkEvent::ChannelOpen(Arc::new(channel))))
            .await;
        let transport = h.session.state().transport().cloned().unwrap();
        drain(&mut h.events);

        h.session.handle_signal(ServerEvent::HostChanged { is_host: true }).await;
        h.session.handle_signal(ServerEvent::Leave).await;

        assert!(h.session.is_host());
        assert_eq!(h.session.phase(), Phase::AwaitingPeer);
        assert!(h.session.state().media().is_some());
        assert!(h.connector.last_link().closed.load(Ordering::SeqCst));
        assert!(transport.is_closed());
        assert_eq!(
            drain(&mut h.events),
            vec![
                SessionEvent::HostChanged { is_host: true },
                SessionEvent::PeerLeft
            ]
        );

        // A newcomer's ready now makes this side the offerer.
        h.session.handle_signal(ServerEvent::Ready).await;
        assert_eq!(
            *h.connector.roles.lock(),
            vec![NegotiationRole::Answerer, NegotiationRole::Offerer]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn full_room_tears_down() {
        let mut h = harness();
        h.session.handle_signal(ServerEvent::Full).await;
        assert_eq!(h.session.phase(), Phase::TornDown);
        assert_eq!(drain(&mut h.events), vec![SessionEvent::RoomFull]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn media_failure_keeps_session_idle() {
        let mut h = harness_with(Arc::new(DeniedMedia), false);
        h.session.handle_signal(ServerEvent::Joined { is_host: false }).await;
        assert_eq!(h.session.phase(), Phase::Idle);
        assert!(drain(&mut h.signals).is_empty());
        let events = drain(&mut h.events);
        assert_eq!(events[0], SessionEvent::Admitted { is_host: false });
        assert!(matches!(&events[1], SessionEvent::Error(msg) if msg.contains("camera blocked")));
    }

    #[test_timeout::tokio_timeout_test]
    async fn connector_failure_returns_to_waiting() {
        let mut h = harness();
        h.session.handle_signal(ServerEvent::Created { is_host: true }).await;
        h.connector.fail.store(true, Ordering::SeqCst);
        h.session.handle_signal(ServerEvent::Ready).await;
        assert_eq!(h.session.phase(), Phase::AwaitingPeer);
        assert!(drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, SessionEvent::Error(msg) if msg.contains("setup failed"))));
    }

    #[test_timeout::tokio_timeout_test]
    async fn media_replacement_keeps_mute_and_swaps_tracks() {
        let mut h = harness();
        let _peer_rx = connect_as_host(&mut h).await;
        let original = h.session.state().media().cloned().unwrap();

        h.session.handle_command(SessionCommand::SetAudioMuted(true)).await;
        h.session
            .handle_command(SessionCommand::ReplaceMedia(MediaConstraints {
                audio_device: Some("usb".into()),
                video_device: None,
            }))
            .await;

        let media = h.session.state().media().unwrap();
        assert!(media.is_muted(MediaKind::Audio));
        assert!(!media.is_muted(MediaKind::Video));
        assert!(original.is_stopped());
        assert_eq!(h.session.phase(), Phase::Connected);
        assert_eq!(
            *h.connector.last_link().replaced.lock(),
            vec![vec!["audio-usb-2".to_string(), "video-default-2".to_string()]]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn chat_flows_both_ways_over_transport() {
        let mut h = harness();
        let mut peer_rx = connect_as_host(&mut h).await;
        drain(&mut h.events);

        h.session.handle_command(SessionCommand::SendChat("hi".into())).await;
        let frame: Value = serde_json::from_str(&peer_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame, json!({"type": "chat", "content": "hi"}));

        h.session
            .handle_link_event(Some(LinkEvent::Message(
                json!({"type": "chat", "content": "hello back"}).to_string(),
            )))
            .await;
        h.session
            .handle_link_event(Some(LinkEvent::Message(
                json!({"type": "display-name", "name": "Ada"}).to_string(),
            )))
            .await;

        assert_eq!(
            drain(&mut h.events),
            vec![
                SessionEvent::Message(Message::Text {
                    sender: Sender::Me,
                    content: "hi".into()
                }),
                SessionEvent::Message(Message::Text {
                    sender: Sender::Peer,
                    content: "hello back".into()
                }),
                SessionEvent::Control(json!({"type": "display-name", "name": "Ada"})),
            ]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn file_without_connection_fails_fast() {
        let mut h = harness();
        h.session
            .handle_command(SessionCommand::SendFile {
                file_name: "a.txt".into(),
                bytes: Bytes::from_static(b"abc"),
            })
            .await;
        match drain(&mut h.events).pop() {
            Some(SessionEvent::TransferFailed { file_name, reason }) => {
                assert_eq!(file_name, "a.txt");
                assert!(reason.starts_with("Failed to send file:"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_follow_trickle_setting() {
        let mut h = harness_with(Arc::new(SyntheticMediaSource::new(true, false)), true);
        h.session.handle_signal(ServerEvent::Created { is_host: true }).await;
        h.session.handle_signal(ServerEvent::Ready).await;
        drain(&mut h.signals);

        let candidate = json!({"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host"});
        h.session
            .handle_link_event(Some(LinkEvent::LocalCandidate(candidate.clone())))
            .await;
        assert_eq!(
            drain(&mut h.signals),
            vec![ClientEvent::IceCandidate {
                room: room(),
                payload: candidate.clone(),
            }]
        );

        h.session
            .handle_signal(ServerEvent::IceCandidate {
                payload: candidate.clone(),
            })
            .await;
        assert_eq!(*h.connector.last_link().candidates.lock(), vec![candidate]);

        let mut quiet = harness();
        quiet
            .session
            .handle_signal(ServerEvent::IceCandidate {
                payload: json!({"candidate": "x"}),
            })
            .await;
        quiet
            .session
            .handle_link_event(Some(LinkEvent::LocalCandidate(json!({"candidate": "y"}))))
            .await;
        assert!(drain(&mut quiet.signals).is_empty());
        assert!(drain(&mut quiet.events).is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn leave_command_ends_the_run_loop() {
        let h = harness();
        let Harness {
            session,
            mut signals,
            mut events,
            ..
        } = h;
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(session.run(server_rx, command_rx));

        assert_eq!(signals.recv().await, Some(ClientEvent::Join { room: room() }));
        server_tx.send(ServerEvent::Created { is_host: true }).unwrap();
        assert_eq!(events.recv().await, Some(SessionEvent::Admitted { is_host: true }));

        command_tx.send(SessionCommand::Leave).unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(signals.recv().await, Some(ClientEvent::Leave { room: room() }));
        assert_eq!(events.recv().await, Some(SessionEvent::Left));
    }

    #[test_timeout::tokio_timeout_test]
    async fn signaling_loss_forces_teardown() {
        let Harness {
            session,
            signals: _signals,
            mut events,
            ..
        } = harness();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(session.run(server_rx, command_rx));

        server_tx.send(ServerEvent::Created { is_host: true }).unwrap();
        assert_eq!(events.recv().await, Some(SessionEvent::Admitted { is_host: true }));
        drop(server_tx);

        run.await.unwrap().unwrap();
        assert_eq!(events.recv().await, Some(SessionEvent::Disconnected));
    }
}
