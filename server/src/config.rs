//! Lobby configuration and its self-correcting validation.

use log::warn;
use shared::{MAX_PAYLOAD_LEN, MAX_SLOT_POOL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyConfig {
    /// Participants needed before the lobby countdown begins.
    pub required_participants: usize,
    /// Session capacity.
    pub max_participants: usize,
    /// Placement slots available on each side of the connection.
    pub slot_pool: usize,
    /// Longest payload a participant may publish.
    pub max_payload_len: usize,
    /// Seconds to wait for everyone to ready before starting anyway.
    pub lobby_countdown_time: u32,
    /// Seconds of final countdown; reaching it forces everyone ready.
    pub final_countdown_threshold: u32,
    /// Only leave WaitingToStart once everyone is ready, without a countdown.
    pub countdown_only_if_everyone_ready: bool,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            required_participants: 2,
            max_participants: 8,
            slot_pool: 8,
            max_payload_len: MAX_PAYLOAD_LEN,
            lobby_countdown_time: 60,
            final_countdown_threshold: 5,
            countdown_only_if_everyone_ready: false,
        }
    }
}

impl LobbyConfig {
    /// Corrects values that cannot be satisfied together, logging each
    /// correction. Never fails.
    pub fn validate(mut self) -> Self {
        if self.slot_pool == 0 {
            warn!("Slot pool is empty. Using a single slot.");
            self.slot_pool = 1;
        }

        if self.slot_pool > MAX_SLOT_POOL {
            warn!(
                "slot_pool ({}) exceeds the protocol limit ({}). Clamping.",
                self.slot_pool, MAX_SLOT_POOL
            );
            self.slot_pool = MAX_SLOT_POOL;
        }

        if self.max_payload_len > MAX_PAYLOAD_LEN {
            warn!(
                "max_payload_len ({}) exceeds the protocol limit ({}). Clamping.",
                self.max_payload_len, MAX_PAYLOAD_LEN
            );
            self.max_payload_len = MAX_PAYLOAD_LEN;
        }

        if self.max_participants > self.slot_pool {
            warn!(
                "max_participants ({}) exceeds the slot pool ({}). Reducing max_participants to the slot pool size.",
                self.max_participants, self.slot_pool
            );
            self.max_participants = self.slot_pool;
        }

        if self.required_participants > self.max_participants {
            warn!(
                "required_participants ({}) is more than the max participant count ({}). Reducing required_participants to max_participants.",
                self.required_participants, self.max_participants
            );
            self.required_participants = self.max_participants;
        }

        if self.final_countdown_threshold > self.lobby_countdown_time {
            warn!(
                "final_countdown_threshold ({}) is longer than lobby_countdown_time ({}). Clamping.",
                self.final_countdown_threshold, self.lobby_countdown_time
            );
            self.final_countdown_threshold = self.lobby_countdown_time;
        }

        self
    }
}
