use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sub-path the relay exposes its websocket on.
pub const SIGNALING_PATH: &str = "/api/socket";

/// Events sent from a client to the relay server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "join")]
    Join { room: String },
    #[serde(rename = "ready")]
    Ready { room: String },
    #[serde(rename = "offer")]
    Offer { room: String, payload: Value },
    #[serde(rename = "answer")]
    Answer { room: String, payload: Value },
    #[serde(rename = "ice-candidate")]
    IceCandidate { room: String, payload: Value },
    #[serde(rename = "media_source_change")]
    MediaSourceChange { room: String, payload: Value },
    #[serde(rename = "media_source_answer")]
    MediaSourceAnswer { room: String, payload: Value },
    #[serde(rename = "leave")]
    Leave { room: String },
}

impl ClientEvent {
    pub fn room(&self) -> &str {
        match self {
            ClientEvent::Join { room }
            | ClientEvent::Ready { room }
            | ClientEvent::Offer { room, .. }
            | ClientEvent::Answer { room, .. }
            | ClientEvent::IceCandidate { room, .. }
            | ClientEvent::MediaSourceChange { room, .. }
            | ClientEvent::MediaSourceAnswer { room, .. }
            | ClientEvent::Leave { room } => room,
        }
    }

    /// The event the other room member receives when this one is relayed
    /// verbatim. `None` for events the server interprets itself.
    pub fn relayed(&self) -> Option<ServerEvent> {
        match self {
            ClientEvent::Ready { .. } => Some(ServerEvent::Ready),
            ClientEvent::Offer { payload, .. } => Some(ServerEvent::Offer {
                payload: payload.clone(),
            }),
            ClientEvent::Answer { payload, .. } => Some(ServerEvent::Answer {
                payload: payload.clone(),
            }),
            ClientEvent::IceCandidate { payload, .. } => Some(ServerEvent::IceCandidate {
                payload: payload.clone(),
            }),
            ClientEvent::MediaSourceChange { payload, .. } => {
                Some(ServerEvent::MediaSourceChange {
                    payload: payload.clone(),
                })
            }
            ClientEvent::MediaSourceAnswer { payload, .. } => {
                Some(ServerEvent::MediaSourceAnswer {
                    payload: payload.clone(),
                })
            }
            ClientEvent::Join { .. } | ClientEvent::Leave { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::Join { .. } => "join",
            ClientEvent::Ready { .. } => "ready",
            ClientEvent::Offer { .. } => "offer",
            ClientEvent::Answer { .. } => "answer",
            ClientEvent::IceCandidate { .. } => "ice-candidate",
            ClientEvent::MediaSourceChange { .. } => "media_source_change",
            ClientEvent::MediaSourceAnswer { .. } => "media_source_answer",
            ClientEvent::Leave { .. } => "leave",
        }
    }
}

/// Events sent from the relay server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// First arrival in a room; always host.
    #[serde(rename = "created")]
    Created {
        #[serde(rename = "isHost")]
        is_host: bool,
    },
    /// Second arrival in a room.
    #[serde(rename = "joined")]
    Joined {
        #[serde(rename = "isHost")]
        is_host: bool,
    },
    /// Room already holds two participants; the join was refused.
    #[serde(rename = "full")]
    Full,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "offer")]
    Offer { payload: Value },
    #[serde(rename = "answer")]
    Answer { payload: Value },
    #[serde(rename = "ice-candidate")]
    IceCandidate { payload: Value },
    #[serde(rename = "host_changed")]
    HostChanged {
        #[serde(rename = "isHost")]
        is_host: bool,
    },
    #[serde(rename = "leave")]
    Leave,
    #[serde(rename = "media_source_change")]
    MediaSourceChange { payload: Value },
    #[serde(rename = "media_source_answer")]
    MediaSourceAnswer { payload: Value },
    #[serde(rename = "error")]
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_events_use_wire_names() {
        let join = serde_json::to_value(ClientEvent::Join {
            room: "room-x".into(),
        })
        .unwrap();
        assert_eq!(join, json!({"type": "join", "room": "room-x"}));

        let ice: ClientEvent = serde_json::from_value(json!({
            "type": "ice-candidate",
            "room": "room-x",
            "payload": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host"}
        }))
        .unwrap();
        assert_eq!(ice.room(), "room-x");
        assert_eq!(ice.kind(), "ice-candidate");
    }

    #[test]
    fn server_events_carry_camel_case_host_flag() {
        let created = serde_json::to_value(ServerEvent::Created { is_host: true }).unwrap();
        assert_eq!(created, json!({"type": "created", "isHost": true}));

        let changed: ServerEvent =
            serde_json::from_str(r#"{"type":"host_changed","isHost":true}"#).unwrap();
        assert_eq!(changed, ServerEvent::HostChanged { is_host: true });

        let full = serde_json::to_string(&ServerEvent::Full).unwrap();
        assert_eq!(full, r#"{"type":"full"}"#);
    }

    #[test]
    fn relayed_events_drop_the_room_and_keep_the_payload() {
        let payload = json!({"type": "offer", "sdp": "v=0"});
        let offer = ClientEvent::Offer {
            room: "room-x".into(),
            payload: payload.clone(),
        };
        assert_eq!(offer.relayed(), Some(ServerEvent::Offer { payload }));
        assert_eq!(
            ClientEvent::Ready {
                room: "room-x".into()
            }
            .relayed(),
            Some(ServerEvent::Ready)
        );
        assert!(ClientEvent::Join {
            room: "room-x".into()
        }
        .relayed()
        .is_none());
        assert!(ClientEvent::Leave {
            room: "room-x".into()
        }
        .relayed()
        .is_none());
    }
}
