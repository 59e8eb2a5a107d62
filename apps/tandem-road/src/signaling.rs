use std::collections::HashMap;

use serde::Serialize;
use tandem_proto::{ClientEvent, ServerEvent};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::registry::{JoinOutcome, ParticipantId, RoomRegistry};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("signaling hub stopped")]
    Closed,
}

/// Requests the websocket tasks queue for the hub reactor.
#[derive(Debug)]
pub enum HubCommand {
    Connect {
        participant: ParticipantId,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    },
    Event {
        participant: ParticipantId,
        event: ClientEvent,
    },
    Disconnect {
        participant: ParticipantId,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub rooms: usize,
    pub connections: usize,
}

/// Cloneable sender side of the hub's inbound queue.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub async fn connect(
        &self,
        participant: ParticipantId,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<(), HubError> {
        self.submit(HubCommand::Connect {
            participant,
            outbound,
        })
        .await
    }

    pub async fn dispatch(
        &self,
        participant: ParticipantId,
        event: ClientEvent,
    ) -> Result<(), HubError> {
        self.submit(HubCommand::Event { participant, event }).await
    }

    pub async fn disconnect(&self, participant: ParticipantId) -> Result<(), HubError> {
        self.submit(HubCommand::Disconnect { participant }).await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Stats { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    async fn submit(&self, command: HubCommand) -> Result<(), HubError> {
        self.tx.send(command).await.map_err(|_| HubError::Closed)
    }
}

/// Single-owner reactor over the room registry. Every mutation happens inside
/// one `handle` call, so room state needs no locking; events for a room go
/// out in the order they were handled.
#[derive(Debug, Default)]
pub struct SignalingHub {
    registry: RoomRegistry,
    connections: HashMap<ParticipantId, mpsc::UnboundedSender<ServerEvent>>,
}

impl SignalingHub {
    pub fn new(registry: RoomRegistry) -> Self {
        Self {
            registry,
            connections: HashMap::new(),
        }
    }

    /// Moves the hub onto its own task and returns the handle feeding it.
    pub fn spawn(self, queue_depth: usize) -> HubHandle {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        tokio::spawn(self.run(rx));
        HubHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        debug!("signaling hub inbound queue closed");
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect {
                participant,
                outbound,
            } => {
                debug!(participant = %participant, "participant connected");
                self.connections.insert(participant, outbound);
            }
            HubCommand::Event { participant, event } => self.on_event(participant, event),
            HubCommand::Disconnect { participant } => {
                for room in self.registry.rooms_of(participant) {
                    self.leave(&room, participant);
                }
                self.connections.remove(&participant);
                debug!(participant = %participant, "participant disconnected");
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(HubStats {
                    rooms: self.registry.room_count(),
                    connections: self.connections.len(),
                });
            }
        }
    }

    fn on_event(&mut self, participant: ParticipantId, event: ClientEvent) {
        match &event {
            ClientEvent::Join { room } => self.join(room, participant),
            ClientEvent::Leave { room } => {
                if !self.registry.is_member(room, participant) {
                    warn!(room = %room, participant = %participant, "leave from non-member ignored");
                    return;
                }
                self.leave(room, participant);
            }
            _ => {
                let room = event.room();
                if !self.registry.is_member(room, participant) {
                    warn!(
                        room = %room,
                        participant = %participant,
                        kind = event.kind(),
                        "relay from non-member dropped"
                    );
                    return;
                }
                if let Some(relayed) = event.relayed() {
                    debug!(room = %room, participant = %participant, kind = event.kind(), "relaying");
                    self.broadcast_except(room, participant, relayed);
                }
            }
        }
    }

    fn join(&mut self, room: &str, participant: ParticipantId) {
        let outcome = self.registry.join(room, participant);
        info!(room = %room, participant = %participant, ?outcome, "join");
        let reply = match outcome {
            JoinOutcome::Created => ServerEvent::Created { is_host: true },
            JoinOutcome::Joined => ServerEvent::Joined { is_host: false },
            JoinOutcome::Full => ServerEvent::Full,
        };
        self.send(participant, reply);
    }

    fn leave(&mut self, room: &str, participant: ParticipantId) {
        let outcome = self.registry.leave(room, participant);
        if !outcome.was_member {
            return;
        }
        if let Some(host) = outcome.promoted {
            info!(room = %room, participant = %host, "host handed over");
            self.send(host, ServerEvent::HostChanged { is_host: true });
        }
        for member in &outcome.remaining {
            self.send(*member, ServerEvent::Leave);
        }
        if outcome.room_removed {
            info!(room = %room, "room closed");
        }
    }

    fn broadcast_except(&self, room: &str, sender: ParticipantId, event: ServerEvent) {
        for member in self.registry.others(room, sender) {
            self.send(member, event.clone());
        }
    }

    fn send(&self, participant: ParticipantId, event: ServerEvent) {
        match self.connections.get(&participant) {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!(participant = %participant, "outbound queue closed");
                }
            }
            None => warn!(participant = %participant, "no connection for participant"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Peer {
        id: ParticipantId,
        rx: mpsc::UnboundedReceiver<ServerEvent>,
    }

    impl Peer {
        fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn connect(hub: &mut SignalingHub) -> Peer {
        let id = ParticipantId::new();
        let (outbound, rx) = mpsc::unbounded_channel();
        hub.handle(HubCommand::Connect {
            participant: id,
            outbound,
        });
        Peer { id, rx }
    }

    fn send(hub: &mut SignalingHub, peer: &Peer, event: ClientEvent) {
        hub.handle(HubCommand::Event {
            participant: peer.id,
            event,
        });
    }

    fn join(room: &str) -> ClientEvent {
        ClientEvent::Join { room: room.into() }
    }

    #[test_timeout::timeout]
    fn join_ready_and_full_scenario() {
        let mut hub = SignalingHub::default();
        let mut a = connect(&mut hub);
        let mut b = connect(&mut hub);
        let mut c = connect(&mut hub);

        send(&mut hub, &a, join("room-x"));
        assert_eq!(a.drain(), vec![ServerEvent::Created { is_host: true }]);

        send(&mut hub, &b, join("room-x"));
        assert_eq!(b.drain(), vec![ServerEvent::Joined { is_host: false }]);

        send(
            &mut hub,
            &b,
            ClientEvent::Ready {
                room: "room-x".into(),
            },
        );
        assert_eq!(a.drain(), vec![ServerEvent::Ready]);
        assert!(b.drain().is_empty(), "ready never echoes to the sender");

        send(&mut hub, &c, join("room-x"));
        assert_eq!(c.drain(), vec![ServerEvent::Full]);
        assert_eq!(hub.registry().members("room-x").map(<[_]>::len), Some(2));
    }

    #[test_timeout::timeout]
    fn relays_reach_only_the_other_member() {
        let mut hub = SignalingHub::default();
        let mut a = connect(&mut hub);
        let mut b = connect(&mut hub);
        let mut outsider = connect(&mut hub);
        send(&mut hub, &a, join("room-x"));
        send(&mut hub, &b, join("room-x"));
        send(&mut hub, &outsider, join("room-y"));
        a.drain();
        b.drain();
        outsider.drain();

        let offer = json!({"type": "offer", "sdp": "v=0"});
        send(
            &mut hub,
            &a,
            ClientEvent::Offer {
                room: "room-x".into(),
                payload: offer.clone(),
            },
        );
        send(
            &mut hub,
            &b,
            ClientEvent::MediaSourceChange {
                room: "room-x".into(),
                payload: json!({"room": "room-x", "source": "screen"}),
            },
        );

        assert_eq!(b.drain(), vec![ServerEvent::Offer { payload: offer }]);
        assert_eq!(
            a.drain(),
            vec![ServerEvent::MediaSourceChange {
                payload: json!({"room": "room-x", "source": "screen"})
            }]
        );
        assert!(outsider.drain().is_empty());
    }

    #[test_timeout::timeout]
    fn relay_from_non_member_is_dropped() {
        let mut hub = SignalingHub::default();
        let mut a = connect(&mut hub);
        let outsider = connect(&mut hub);
        send(&mut hub, &a, join("room-x"));
        a.drain();

        send(
            &mut hub,
            &outsider,
            ClientEvent::IceCandidate {
                room: "room-x".into(),
                payload: json!({"candidate": "x"}),
            },
        );
        assert!(a.drain().is_empty());
    }

    #[test_timeout::timeout]
    fn host_leave_promotes_guest_before_leave_event() {
        let mut hub = SignalingHub::default();
        let mut a = connect(&mut hub);
        let mut b = connect(&mut hub);
        send(&mut hub, &a, join("room-x"));
        send(&mut hub, &b, join("room-x"));
        a.drain();
        b.drain();

        send(
            &mut hub,
            &a,
            ClientEvent::Leave {
                room: "room-x".into(),
            },
        );
        assert_eq!(
            b.drain(),
            vec![ServerEvent::HostChanged { is_host: true }, ServerEvent::Leave]
        );
        assert!(a.drain().is_empty());
        assert_eq!(hub.registry().host("room-x"), Some(b.id));
    }

    #[test_timeout::timeout]
    fn guest_leave_sends_leave_without_host_change() {
        let mut hub = SignalingHub::default();
        let mut a = connect(&mut hub);
        let mut b = connect(&mut hub);
        send(&mut hub, &a, join("room-x"));
        send(&mut hub, &b, join("room-x"));
        a.drain();

        send(
            &mut hub,
            &b,
            ClientEvent::Leave {
                room: "room-x".into(),
            },
        );
        assert_eq!(a.drain(), vec![ServerEvent::Leave]);
        assert_eq!(hub.registry().members("room-x"), Some(&[a.id][..]));
    }

    #[test_timeout::timeout]
    fn disconnect_leaves_every_room() {
        let mut hub = SignalingHub::default();
        let mut a = connect(&mut hub);
        let mut b = connect(&mut hub);
        send(&mut hub, &a, join("room-x"));
        send(&mut hub, &b, join("room-x"));
        a.drain();
        b.drain();

        hub.handle(HubCommand::Disconnect { participant: a.id });
        assert_eq!(
            b.drain(),
            vec![ServerEvent::HostChanged { is_host: true }, ServerEvent::Leave]
        );

        hub.handle(HubCommand::Disconnect { participant: b.id });
        assert_eq!(hub.registry().room_count(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn spawned_hub_answers_stats() {
        let handle = SignalingHub::default().spawn(8);
        let (outbound, mut rx) = mpsc::unbounded_channel();
        let id = ParticipantId::new();
        handle.connect(id, outbound).await.unwrap();
        handle.dispatch(id, join("room-x")).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ServerEvent::Created { is_host: true })
        );
        assert_eq!(
            handle.stats().await.unwrap(),
            HubStats {
                rooms: 1,
                connections: 1
            }
        );
    }
}
