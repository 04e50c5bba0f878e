//! Narrow interfaces to systems outside the lobby: the match-start gate and
//! the session advertisement backend.

use log::info;
use shared::LobbyState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitDecision {
    Approve,
    Veto(String),
}

/// Gate consulted when the final countdown reaches zero.
pub trait MatchCommit: Send {
    fn request_start(&mut self) -> CommitDecision;
}

/// Approves every start request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysCommit;

impl MatchCommit for AlwaysCommit {
    fn request_start(&mut self) -> CommitDecision {
        CommitDecision::Approve
    }
}

/// Sink for lobby state transitions, used for session discovery.
pub trait SessionAdvertiser: Send {
    fn lobby_state_changed(&mut self, state: LobbyState, participants: usize);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogAdvertiser;

impl SessionAdvertiser for LogAdvertiser {
    fn lobby_state_changed(&mut self, state: LobbyState, participants: usize) {
        info!(
            "Advertising lobby as {} with {} participant(s)",
            state, participants
        );
    }
}
