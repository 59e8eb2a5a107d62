use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

/// Rooms never hold more than two participant slots.
pub const ROOM_CAPACITY: usize = 2;

/// Opaque per-connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Room did not exist; the participant created it and is host.
    Created,
    /// Room had one slot taken; the participant is guest.
    Joined,
    /// Room already had two slots taken; membership unchanged.
    Full,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub was_member: bool,
    /// Member promoted to host because the leaver held the role.
    pub promoted: Option<ParticipantId>,
    pub remaining: Vec<ParticipantId>,
    pub room_removed: bool,
}

#[derive(Debug)]
struct Room {
    members: Vec<ParticipantId>,
    host: ParticipantId,
}

/// Room membership and host tracking. Owns no network state; the signaling
/// hub drives it and turns outcomes into events.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self, room: &str, participant: ParticipantId) -> JoinOutcome {
        match self.rooms.get_mut(room) {
            None => {
                self.rooms.insert(
                    room.to_string(),
                    Room {
                        members: vec![participant],
                        host: participant,
                    },
                );
                JoinOutcome::Created
            }
            // A participant already present still takes a fresh slot.
            Some(entry) if entry.members.len() < ROOM_CAPACITY => {
                entry.members.push(participant);
                JoinOutcome::Joined
            }
            Some(_) => JoinOutcome::Full,
        }
    }

    /// Removes every slot the participant holds in `room`, handing the host
    /// role to the remaining member when needed.
    pub fn leave(&mut self, room: &str, participant: ParticipantId) -> LeaveOutcome {
        let Some(entry) = self.rooms.get_mut(room) else {
            return LeaveOutcome::default();
        };
        if !entry.members.contains(&participant) {
            return LeaveOutcome::default();
        }

        entry.members.retain(|member| *member != participant);
        let remaining = entry.members.clone();

        let mut promoted = None;
        if entry.host == participant {
            if let Some(next) = remaining.first().copied() {
                entry.host = next;
                promoted = Some(next);
            }
        }

        let room_removed = remaining.is_empty();
        if room_removed {
            self.rooms.remove(room);
        }

        LeaveOutcome {
            was_member: true,
            promoted,
            remaining,
            room_removed,
        }
    }

    pub fn is_member(&self, room: &str, participant: ParticipantId) -> bool {
        self.rooms
            .get(room)
            .map(|entry| entry.members.contains(&participant))
            .unwrap_or(false)
    }

    /// Members of `room` other than `participant`, deduplicated.
    pub fn others(&self, room: &str, participant: ParticipantId) -> Vec<ParticipantId> {
        let mut others: Vec<ParticipantId> = Vec::new();
        if let Some(entry) = self.rooms.get(room) {
            for member in &entry.members {
                if *member != participant && !others.contains(member) {
                    others.push(*member);
                }
            }
        }
        others
    }

    pub fn members(&self, room: &str) -> Option<&[ParticipantId]> {
        self.rooms.get(room).map(|entry| entry.members.as_slice())
    }

    pub fn host(&self, room: &str) -> Option<ParticipantId> {
        self.rooms.get(room).map(|entry| entry.host)
    }

    pub fn role(&self, room: &str, participant: ParticipantId) -> Option<Role> {
        let entry = self.rooms.get(room)?;
        if !entry.members.contains(&participant) {
            return None;
        }
        Some(if entry.host == participant {
            Role::Host
        } else {
            Role::Guest
        })
    }

    /// Rooms in which `participant` holds at least one slot.
    pub fn rooms_of(&self, participant: ParticipantId) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|(_, entry)| entry.members.contains(&participant))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(registry: &RoomRegistry) {
        for entry in registry.rooms.values() {
            assert!(entry.members.len() <= ROOM_CAPACITY);
            assert!(!entry.members.is_empty(), "empty rooms must be removed");
            assert!(entry.members.contains(&entry.host));
        }
    }

    #[test_timeout::timeout]
    fn first_join_creates_and_second_joins() {
        let mut registry = RoomRegistry::new();
        let a = ParticipantId::new();
        let b = ParticipantId::new();

        assert_eq!(registry.join("room-x", a), JoinOutcome::Created);
        assert_eq!(registry.role("room-x", a), Some(Role::Host));
        assert_eq!(registry.join("room-x", b), JoinOutcome::Joined);
        assert_eq!(registry.role("room-x", b), Some(Role::Guest));
        assert_eq!(registry.host("room-x"), Some(a));
        assert_invariants(&registry);
    }

    #[test_timeout::timeout]
    fn third_join_is_full_and_membership_is_unchanged() {
        let mut registry = RoomRegistry::new();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        let c = ParticipantId::new();
        registry.join("room-x", a);
        registry.join("room-x", b);

        assert_eq!(registry.join("room-x", c), JoinOutcome::Full);
        assert_eq!(registry.members("room-x"), Some(&[a, b][..]));
        assert_eq!(registry.role("room-x", c), None);
        assert_invariants(&registry);
    }

    #[test_timeout::timeout]
    fn host_leaving_promotes_the_remaining_member() {
        let mut registry = RoomRegistry::new();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        registry.join("room-x", a);
        registry.join("room-x", b);

        let outcome = registry.leave("room-x", a);
        assert!(outcome.was_member);
        assert_eq!(outcome.promoted, Some(b));
        assert_eq!(outcome.remaining, vec![b]);
        assert!(!outcome.room_removed);
        assert_eq!(registry.host("room-x"), Some(b));
        assert_invariants(&registry);
    }

    #[test_timeout::timeout]
    fn guest_leaving_keeps_host_and_last_leave_removes_room() {
        let mut registry = RoomRegistry::new();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        registry.join("room-x", a);
        registry.join("room-x", b);

        let outcome = registry.leave("room-x", b);
        assert_eq!(outcome.promoted, None);
        assert_eq!(outcome.remaining, vec![a]);
        assert_eq!(registry.host("room-x"), Some(a));

        let outcome = registry.leave("room-x", a);
        assert!(outcome.room_removed);
        assert_eq!(registry.room_count(), 0);
        assert!(registry.members("room-x").is_none());
    }

    #[test_timeout::timeout]
    fn rejoin_takes_a_second_slot_and_leave_clears_both() {
        let mut registry = RoomRegistry::new();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        registry.join("room-x", a);

        assert_eq!(registry.join("room-x", a), JoinOutcome::Joined);
        assert_eq!(registry.join("room-x", b), JoinOutcome::Full);
        assert!(registry.others("room-x", a).is_empty());

        let outcome = registry.leave("room-x", a);
        assert!(outcome.room_removed);
        assert_invariants(&registry);
    }

    #[test_timeout::timeout]
    fn leave_by_non_member_is_a_no_op() {
        let mut registry = RoomRegistry::new();
        let a = ParticipantId::new();
        registry.join("room-x", a);

        let outcome = registry.leave("room-x", ParticipantId::new());
        assert_eq!(outcome, LeaveOutcome::default());
        assert_eq!(registry.leave("room-y", a), LeaveOutcome::default());
        assert_eq!(registry.members("room-x"), Some(&[a][..]));
    }

    #[test_timeout::timeout]
    fn registries_are_independent() {
        let mut first = RoomRegistry::new();
        let mut second = RoomRegistry::new();
        let a = ParticipantId::new();
        first.join("room-x", a);

        assert_eq!(second.join("room-x", a), JoinOutcome::Created);
        assert_eq!(first.rooms_of(a), vec!["room-x".to_string()]);
        assert_eq!(second.room_count(), 1);
    }

    #[test_timeout::timeout]
    fn churn_never_breaks_room_invariants() {
        let mut registry = RoomRegistry::new();
        let people: Vec<ParticipantId> = (0..5).map(|_| ParticipantId::new()).collect();
        let rooms = ["a", "b"];
        for step in 0..200usize {
            let who = people[step * 7 % people.len()];
            let room = rooms[step % rooms.len()];
            if step % 3 == 0 {
                registry.leave(room, who);
            } else {
                registry.join(room, who);
            }
            assert_invariants(&registry);
        }
    }
}
