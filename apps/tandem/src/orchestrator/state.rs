use super::link::{NegotiationRole, PeerLink};
use crate::media::LocalMedia;
use crate::transport::ReliableTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingPeer,
    GuestWaiting,
    Negotiating,
    Connected,
    TornDown,
}

/// Session lifecycle. Each variant owns exactly the resources that are live
/// in that phase.
pub enum SessionState {
    Idle,
    AwaitingPeer {
        media: LocalMedia,
    },
    GuestWaiting {
        media: LocalMedia,
    },
    Negotiating {
        media: LocalMedia,
        role: NegotiationRole,
        link: Box<dyn PeerLink>,
    },
    Connected {
        media: LocalMedia,
        role: NegotiationRole,
        link: Box<dyn PeerLink>,
        transport: ReliableTransport,
    },
    TornDown,
}

impl SessionState {
    pub fn phase(&self) -> Phase {
        match self {
            SessionState::Idle => Phase::Idle,
            SessionState::AwaitingPeer { .. } => Phase::AwaitingPeer,
            SessionState::GuestWaiting { .. } => Phase::GuestWaiting,
            SessionState::Negotiating { .. } => Phase::Negotiating,
            SessionState::Connected { .. } => Phase::Connected,
            SessionState::TornDown => Phase::TornDown,
        }
    }

    pub fn media(&self) -> Option<&LocalMedia> {
        match self {
            SessionState::AwaitingPeer { media }
            | SessionState::GuestWaiting { media }
            | SessionState::Negotiating { media, .. }
            | SessionState::Connected { media, .. } => Some(media),
            SessionState::Idle | SessionState::TornDown => None,
        }
    }

    pub fn media_mut(&mut self) -> Option<&mut LocalMedia> {
        match self {
            SessionState::AwaitingPeer { media }
            | SessionState::GuestWaiting { media }
            | SessionState::Negotiating { media, .. }
            | SessionState::Connected { media, .. } => Some(media),
            SessionState::Idle | SessionState::TornDown => None,
        }
    }

    pub fn link(&self) -> Option<&dyn PeerLink> {
        match self {
            SessionState::Negotiating { link, .. } | SessionState::Connected { link, .. } => {
                Some(link.as_ref())
            }
            _ => None,
        }
    }

    pub fn transport(&self) -> Option<&ReliableTransport> {
        match self {
            SessionState::Connected { transport, .. } => Some(transport),
            _ => None,
        }
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.phase())
    }
}
