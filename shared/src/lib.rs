//! Types shared by the lobby authority and its observers: the wire protocol,
//! lobby/participant snapshots, placement geometry and the replication
//! building blocks (`replicated`, `shadow`, `slots`, `listeners`).

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod listeners;
pub mod replicated;
pub mod shadow;
pub mod slots;

pub use listeners::{ListenerId, Listeners};
pub use replicated::ReplicatedField;
pub use shadow::Shadowed;
pub use slots::{Footprints, LivenessProbe, Locality, Occupant, SlotAllocator, SlotError, SlotId};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PACKET_SIZE: usize = 2048;

/// Most placement slots, and so participants, a lobby can hold.
pub const MAX_SLOT_POOL: usize = 16;
/// Longest participant payload the authority accepts. With `MAX_SLOT_POOL`
/// this keeps a full `Snapshot` inside one datagram.
pub const MAX_PAYLOAD_LEN: usize = 24;

pub const SLOT_SIZE: f32 = 32.0;
pub const SLOT_SPACING: f32 = SLOT_SIZE * 2.0;

/// Identity of one connection. Every participant is also an observer of the lobby.
pub type ParticipantId = u32;
pub type ObserverId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LobbyState {
    /// Lobby has not been initialized yet.
    #[default]
    Initializing,
    /// Waiting for enough participants to join.
    WaitingForPlayers,
    /// Countdown running, waiting for everyone to ready up.
    WaitingToStart,
    /// Final countdown running.
    StartingMatch,
    /// Countdown reached zero and the start was committed.
    MatchStarted,
}

impl LobbyState {
    pub fn is_counting_down(&self) -> bool {
        matches!(self, LobbyState::WaitingToStart | LobbyState::StartingMatch)
    }
}

impl fmt::Display for LobbyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LobbyState::Initializing => "Initializing",
            LobbyState::WaitingForPlayers => "WaitingForPlayers",
            LobbyState::WaitingToStart => "WaitingToStart",
            LobbyState::StartingMatch => "StartingMatch",
            LobbyState::MatchStarted => "MatchStarted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LobbySnapshot {
    pub state: LobbyState,
    pub countdown: u32,
}

/// Authoritative view of one participant as replicated to observers.
///
/// `ready_ack` and `payload_ack` carry the highest request sequence the
/// authority has processed for each field, so the owning observer can tell
/// whether the value already reflects its latest request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub id: ParticipantId,
    pub ready: bool,
    pub payload: Vec<i32>,
    pub ready_ack: u32,
    pub payload_ack: u32,
}

impl ParticipantSnapshot {
    pub fn new(id: ParticipantId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Join {
        client_version: u32,
    },
    SetReady {
        sequence: u32,
        ready: bool,
    },
    SetPayload {
        sequence: u32,
        payload: Vec<i32>,
    },
    Heartbeat,
    Leave,

    Welcome {
        participant_id: ParticipantId,
        slot_pool: u32,
    },
    Rejected {
        reason: String,
    },
    Lobby {
        revision: u64,
        state: LobbyState,
        countdown: u32,
    },
    Participant {
        revision: u64,
        snapshot: ParticipantSnapshot,
    },
    ParticipantLeft {
        revision: u64,
        participant_id: ParticipantId,
    },
    Snapshot {
        revision: u64,
        lobby: LobbySnapshot,
        participants: Vec<ParticipantSnapshot>,
    },
    Kicked {
        reason: String,
    },
}

/// Axis-aligned placement area of a slot or a placed participant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Bounds {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn square(x: f32, y: f32, size: f32) -> Self {
        Self::new(x, y, size, size)
    }

    pub fn corners(&self) -> (f32, f32, f32, f32) {
        (self.x, self.y, self.x + self.width, self.y + self.height)
    }
}

/// Strict overlap test; rectangles that only share an edge do not overlap.
pub fn check_overlap(a: &Bounds, b: &Bounds) -> bool {
    let (x1, y1, x2, y2) = a.corners();
    let (x3, y3, x4, y4) = b.corners();

    !(x2 <= x3 || x4 <= x1 || y2 <= y3 || y4 <= y1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_corners() {
        let bounds = Bounds::square(50.0, 75.0, SLOT_SIZE);
        let (x1, y1, x2, y2) = bounds.corners();
        assert_eq!(x1, 50.0);
        assert_eq!(y1, 75.0);
        assert_eq!(x2, 50.0 + SLOT_SIZE);
        assert_eq!(y2, 75.0 + SLOT_SIZE);
    }

    #[test]
    fn test_overlap_none() {
        let a = Bounds::square(0.0, 0.0, SLOT_SIZE);
        let b = Bounds::square(100.0, 100.0, SLOT_SIZE);
        assert!(!check_overlap(&a, &b));
    }

    #[test]
    fn test_overlap_partial() {
        let a = Bounds::square(0.0, 0.0, SLOT_SIZE);
        let b = Bounds::square(16.0, 16.0, SLOT_SIZE);
        assert!(check_overlap(&a, &b));
        assert!(check_overlap(&b, &a));
    }

    #[test]
    fn test_overlap_exact_touch() {
        let a = Bounds::square(0.0, 0.0, SLOT_SIZE);
        let b = Bounds::square(SLOT_SIZE, 0.0, SLOT_SIZE);
        assert!(!check_overlap(&a, &b));
    }

    #[test]
    fn test_lobby_state_countdown_states() {
        assert!(!LobbyState::Initializing.is_counting_down());
        assert!(!LobbyState::WaitingForPlayers.is_counting_down());
        assert!(LobbyState::WaitingToStart.is_counting_down());
        assert!(LobbyState::StartingMatch.is_counting_down());
        assert!(!LobbyState::MatchStarted.is_counting_down());
        assert_eq!(LobbyState::default(), LobbyState::Initializing);
        assert_eq!(LobbyState::StartingMatch.to_string(), "StartingMatch");
    }

    #[test]
    fn test_packet_serialization_set_ready() {
        let packet = Packet::SetReady {
            sequence: 7,
            ready: true,
        };
        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::SetReady { sequence, ready } => {
                assert_eq!(sequence, 7);
                assert!(ready);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_snapshot() {
        let mut first = ParticipantSnapshot::new(1);
        first.ready = true;
        first.payload = vec![3, -1, 42];
        first.ready_ack = 2;

        let packet = Packet::Snapshot {
            revision: 99,
            lobby: LobbySnapshot {
                state: LobbyState::WaitingToStart,
                countdown: 42,
            },
            participants: vec![first.clone(), ParticipantSnapshot::new(2)],
        };

        let serialized = bincode::serialize(&packet).unwrap();
        assert!(serialized.len() < MAX_PACKET_SIZE);
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Snapshot {
                revision,
                lobby,
                participants,
            } => {
                assert_eq!(revision, 99);
                assert_eq!(lobby.state, LobbyState::WaitingToStart);
                assert_eq!(lobby.countdown, 42);
                assert_eq!(participants.len(), 2);
                assert_eq!(participants[0], first);
                assert_eq!(participants[1].id, 2);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_largest_snapshot_fits_one_datagram() {
        let participants = (0..MAX_SLOT_POOL as u32)
            .map(|id| ParticipantSnapshot {
                id,
                ready: true,
                payload: vec![i32::MIN; MAX_PAYLOAD_LEN],
                ready_ack: u32::MAX,
                payload_ack: u32::MAX,
            })
            .collect();
        let packet = Packet::Snapshot {
            revision: u64::MAX,
            lobby: LobbySnapshot {
                state: LobbyState::StartingMatch,
                countdown: u32::MAX,
            },
            participants,
        };

        let serialized = bincode::serialize(&packet).unwrap();
        assert!(
            serialized.len() <= MAX_PACKET_SIZE,
            "snapshot is {} bytes",
            serialized.len()
        );
    }
}
