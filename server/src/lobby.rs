//! Authoritative lobby state machine
//!
//! The lobby owns every participant record and the replicated lobby fields
//! (state and countdown). It is driven by two kinds of input, both on the
//! server's single-threaded loop:
//! - `tick`, once per lobby second, which evaluates the transition guards
//! - inbound participant requests (join, leave, ready, payload)
//!
//! Guards only ever read the authority shadow of each participant's ready
//! flag. Changes are recorded in `ReplicatedField`s and drained by the network
//! layer through `take_outbound`.

use crate::collaborators::{
    AlwaysCommit, CommitDecision, LogAdvertiser, MatchCommit, SessionAdvertiser,
};
use crate::config::LobbyConfig;
use log::{debug, error, info, warn};
use shared::{
    Footprints, ListenerId, Listeners, Locality, LobbySnapshot, LobbyState, ObserverId, Occupant,
    Packet, ParticipantId, ParticipantSnapshot, ReplicatedField, Shadowed, SlotAllocator, SlotId,
    MAX_SLOT_POOL,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    #[error("Lobby full")]
    LobbyFull,
    #[error("Participant {0} already joined")]
    AlreadyJoined(ParticipantId),
    #[error("Match already started")]
    MatchAlreadyStarted,
    #[error("Unknown participant {0}")]
    UnknownParticipant(ParticipantId),
    #[error("Payload of {len} values exceeds the limit of {max}")]
    PayloadTooLong { len: usize, max: usize },
}

/// Subscriber lists for everything the lobby announces.
#[derive(Debug, Default)]
pub struct LobbyNotifications {
    pub state_changed: Listeners<LobbyState>,
    /// Fires when the state, the countdown or both change.
    pub lobby_updated: Listeners<(LobbyState, u32)>,
    pub participant_joined: Listeners<ParticipantId>,
    pub participant_left: Listeners<ParticipantId>,
    pub ready_changed: Listeners<(ParticipantId, bool)>,
    pub payload_changed: Listeners<(ParticipantId, Vec<i32>)>,
    /// Fires once per entry into StartingMatch, with the final countdown.
    pub match_starting: Listeners<u32>,
    pub match_started: Listeners<()>,
    pub commit_vetoed: Listeners<String>,
    /// Fires after every applied tick.
    pub lobby_tick: Listeners<(LobbyState, u32)>,
}

/// One connected participant, as held by the authority.
#[derive(Debug)]
pub struct ParticipantRecord {
    id: ParticipantId,
    locality: Locality,
    ready: Shadowed<bool>,
    payload: Shadowed<Vec<i32>>,
    /// Highest request sequence processed per field.
    ready_ack: u32,
    payload_ack: u32,
    slot: Option<SlotId>,
    occupant: Arc<Occupant>,
    replication: ReplicatedField<ParticipantSnapshot>,
    leaving: Listeners<ParticipantId>,
}

impl ParticipantRecord {
    fn new(id: ParticipantId, locality: Locality) -> Self {
        Self {
            id,
            locality,
            ready: Shadowed::new(false),
            payload: Shadowed::new(Vec::new()),
            ready_ack: 0,
            payload_ack: 0,
            slot: None,
            occupant: Occupant::new(id, locality),
            replication: ReplicatedField::new(ParticipantSnapshot::new(id)),
            leaving: Listeners::new(),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn locality(&self) -> Locality {
        self.locality
    }

    /// Authoritative ready flag, the only one the lobby guards read.
    pub fn is_ready(&self) -> bool {
        *self.ready.authority()
    }

    pub fn payload(&self) -> &[i32] {
        self.payload.authority()
    }

    /// Placement slot, if one was free when the participant joined.
    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }

    /// Replicated view of this record, including the last processed request
    /// sequence of each field.
    pub fn snapshot(&self) -> ParticipantSnapshot {
        ParticipantSnapshot {
            id: self.id,
            ready: *self.ready.authority(),
            payload: self.payload.authority().clone(),
            ready_ack: self.ready_ack,
            payload_ack: self.payload_ack,
        }
    }

    fn republish(&mut self) {
        let snapshot = self.snapshot();
        self.replication.set(snapshot);
    }
}

/// A replication message owed to one observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Lobby {
        to: ObserverId,
        snapshot: LobbySnapshot,
    },
    Participant {
        to: ObserverId,
        snapshot: ParticipantSnapshot,
    },
    Left {
        to: ObserverId,
        participant_id: ParticipantId,
    },
}

impl Outbound {
    /// Observer the message is addressed to.
    pub fn recipient(&self) -> ObserverId {
        match self {
            Outbound::Lobby { to, .. }
            | Outbound::Participant { to, .. }
            | Outbound::Left { to, .. } => *to,
        }
    }

    /// Converts the message to its wire form under the given revision.
    pub fn into_packet(self, revision: u64) -> (ObserverId, Packet) {
        match self {
            Outbound::Lobby { to, snapshot } => (
                to,
                Packet::Lobby {
                    revision,
                    state: snapshot.state,
                    countdown: snapshot.countdown,
                },
            ),
            Outbound::Participant { to, snapshot } => (to, Packet::Participant { revision, snapshot }),
            Outbound::Left { to, participant_id } => (
                to,
                Packet::ParticipantLeft {
                    revision,
                    participant_id,
                },
            ),
        }
    }
}

pub struct LobbyStateMachine {
    config: LobbyConfig,
    state: ReplicatedField<LobbyState>,
    countdown: ReplicatedField<u32>,
    participants: BTreeMap<ParticipantId, ParticipantRecord>,
    slots: SlotAllocator,
    footprints: Footprints,
    commit: Box<dyn MatchCommit>,
    advertiser: Box<dyn SessionAdvertiser>,
    last_tick: Option<u64>,
    departures: Vec<(ObserverId, ParticipantId)>,
    pub notifications: LobbyNotifications,
}

impl LobbyStateMachine {
    /// Creates a lobby in Initializing around the given slot pool and
    /// collaborators. Nothing happens until `initialize` is called.
    pub fn new(
        config: LobbyConfig,
        slots: SlotAllocator,
        commit: Box<dyn MatchCommit>,
        advertiser: Box<dyn SessionAdvertiser>,
    ) -> Self {
        Self {
            config,
            state: ReplicatedField::new(LobbyState::Initializing),
            countdown: ReplicatedField::new(0),
            participants: BTreeMap::new(),
            slots,
            footprints: Footprints::new(),
            commit,
            advertiser,
            last_tick: None,
            departures: Vec::new(),
            notifications: LobbyNotifications::default(),
        }
    }

    /// Lobby with the stock collaborators and a remote-only slot pool sized
    /// from the configuration.
    pub fn from_config(config: LobbyConfig) -> Self {
        let slots = SlotAllocator::with_layout(0, config.slot_pool.min(MAX_SLOT_POOL));
        Self::new(
            config,
            slots,
            Box::new(AlwaysCommit),
            Box::new(LogAdvertiser),
        )
    }

    /// Validates the configuration against the slot pool and opens the lobby.
    /// Without any usable slot the lobby stays in Initializing.
    pub fn initialize(&mut self) {
        if self.state() != LobbyState::Initializing {
            debug!("Lobby already initialized");
            return;
        }

        let capacity = self.slots.capacity(Locality::Remote);
        if capacity == 0 {
            error!("Failed to initialize lobby. The slot pool has no remote slots.");
            return;
        }

        let mut config = self.config.clone().validate();
        if config.max_participants > capacity {
            warn!(
                "Slot pool holds {} participant(s) but max_participants is {}. Reducing max_participants.",
                capacity, config.max_participants
            );
            config.max_participants = capacity;
            config.required_participants = config.required_participants.min(capacity);
        }
        self.config = config;

        info!(
            "Lobby initialized: {} required, {} max, countdown {}s, final countdown {}s",
            self.config.required_participants,
            self.config.max_participants,
            self.config.lobby_countdown_time,
            self.config.final_countdown_threshold
        );
        self.apply_lobby(LobbyState::WaitingForPlayers, Some(0));
    }

    /// Runs one lobby second. `stamp` is the number of lobby seconds elapsed;
    /// a stamp that is not newer than the last applied one is ignored.
    pub fn tick(&mut self, stamp: u64) -> bool {
        if self.state() == LobbyState::Initializing {
            warn!("Lobby ticked before it was initialized. Ignoring tick.");
            return false;
        }

        if self.last_tick.map_or(false, |last| stamp <= last) {
            debug!("Ignoring repeated lobby tick {}", stamp);
            return false;
        }
        self.last_tick = Some(stamp);

        match self.state() {
            LobbyState::WaitingForPlayers => self.handle_waiting_for_players(),
            LobbyState::WaitingToStart => self.handle_waiting_to_start(),
            LobbyState::StartingMatch => self.handle_starting_match(),
            LobbyState::Initializing | LobbyState::MatchStarted => {}
        }

        let update = (self.state(), self.countdown());
        self.notifications.lobby_tick.emit(&update);
        true
    }

    fn handle_waiting_for_players(&mut self) {
        if self.participants.len() >= self.config.required_participants {
            let countdown = self.config.lobby_countdown_time;
            self.apply_lobby(LobbyState::WaitingToStart, Some(countdown));
        }
    }

    fn handle_waiting_to_start(&mut self) {
        if self.has_too_few_participants() {
            self.apply_lobby(LobbyState::WaitingForPlayers, None);
            return;
        }

        let threshold = self.config.final_countdown_threshold;

        if self.config.countdown_only_if_everyone_ready {
            if self.is_everyone_ready() {
                self.apply_lobby(LobbyState::StartingMatch, Some(threshold));
            }
            return;
        }

        let remaining = self.countdown().saturating_sub(1);
        self.set_countdown(remaining);

        if remaining > threshold {
            if self.is_everyone_ready() {
                self.apply_lobby(LobbyState::StartingMatch, Some(threshold));
            }
            return;
        }

        // Grace period is over.
        self.force_all_ready();
        self.apply_lobby(LobbyState::StartingMatch, Some(threshold));
    }

    fn handle_starting_match(&mut self) {
        if self.has_too_few_participants() {
            self.apply_lobby(LobbyState::WaitingForPlayers, None);
            return;
        }

        let remaining = self.countdown().saturating_sub(1);
        self.set_countdown(remaining);

        if remaining == 0 {
            self.start_match();
        }
    }

    /// Asks the commit gate to start the match. A veto leaves the lobby where
    /// it is; the next tick asks again.
    pub fn start_match(&mut self) -> bool {
        let state = self.state();
        if matches!(state, LobbyState::Initializing | LobbyState::MatchStarted) {
            warn!("Cannot start the match while {}", state);
            return false;
        }

        match self.commit.request_start() {
            CommitDecision::Veto(reason) => {
                warn!(
                    "Match start vetoed: {}. Holding lobby at {}.",
                    reason, state
                );
                self.notifications.commit_vetoed.emit(&reason);
                false
            }
            CommitDecision::Approve => {
                self.apply_lobby(LobbyState::MatchStarted, Some(0));
                info!(
                    "Match started with {} participant(s)",
                    self.participants.len()
                );
                self.notifications.match_started.emit(&());
                true
            }
        }
    }

    /// Admin override of the lobby state.
    pub fn set_state(&mut self, state: LobbyState, countdown: Option<u32>) {
        if state == LobbyState::Initializing {
            warn!("Lobby cannot return to Initializing");
            return;
        }
        self.apply_lobby(state, countdown);
    }

    /// Admin override of the countdown. Ignored once the match has started,
    /// where the countdown stays at zero.
    pub fn set_countdown(&mut self, countdown: u32) {
        let state = self.state();
        if state == LobbyState::MatchStarted {
            if countdown != 0 {
                warn!("Ignoring countdown {} after the match started", countdown);
            }
            return;
        }
        self.apply_lobby(state, Some(countdown));
    }

    fn apply_lobby(&mut self, state: LobbyState, countdown: Option<u32>) {
        let entering = *self.state.get() != state;
        let countdown = match state {
            LobbyState::MatchStarted => Some(0),
            LobbyState::WaitingForPlayers if entering => Some(countdown.unwrap_or(0)),
            _ => countdown,
        };

        let state_changed = self.state.set(state);
        let countdown_changed = countdown.map_or(false, |c| self.countdown.set(c));
        let countdown = *self.countdown.get();

        if state_changed {
            info!("Lobby state changed to {} (countdown {})", state, countdown);
            self.notifications.state_changed.emit(&state);
            if state == LobbyState::StartingMatch {
                self.notifications.match_starting.emit(&countdown);
            }
            self.advertiser
                .lobby_state_changed(state, self.participants.len());
        }

        if state_changed || countdown_changed {
            self.notifications.lobby_updated.emit(&(state, countdown));
        }
    }

    /// Sets every participant's authoritative ready flag. Returns how many
    /// flags actually changed.
    pub fn force_all_ready(&mut self) -> usize {
        let mut changed = Vec::new();
        for record in self.participants.values_mut() {
            if record.ready.confirm(true) {
                record.republish();
                changed.push(record.id);
            }
        }

        for id in &changed {
            info!("Participant {} forced ready", id);
            self.notifications.ready_changed.emit(&(*id, true));
        }
        changed.len()
    }

    /// Adds a participant record, places it in the first usable slot and
    /// registers it as an observer of the lobby and of every other record.
    ///
    /// Fails once the match has started, when the lobby is full, or when the
    /// id is already present. A missing slot is only logged.
    pub fn join(&mut self, id: ParticipantId, locality: Locality) -> Result<(), LobbyError> {
        if self.state() == LobbyState::MatchStarted {
            return Err(LobbyError::MatchAlreadyStarted);
        }
        if self.participants.contains_key(&id) {
            return Err(LobbyError::AlreadyJoined(id));
        }
        if self.participants.len() >= self.config.max_participants {
            return Err(LobbyError::LobbyFull);
        }

        let mut record = ParticipantRecord::new(id, locality);
        match self.slots.acquire(&record.occupant, &self.footprints) {
            Ok(slot) => {
                if let Some(area) = self.slots.slot(slot).map(|s| *s.footprint()) {
                    self.footprints.place(id, area);
                }
                record.slot = Some(slot);
            }
            Err(e) => warn!("Participant {} joined without a placement: {}", id, e),
        }

        self.state.add_observer(id);
        self.countdown.add_observer(id);
        for other in self.participants.values_mut() {
            other.replication.add_observer(id);
            record.replication.add_observer(other.id);
        }
        record.replication.add_observer(id);
        self.participants.insert(id, record);

        info!(
            "Participant {} joined the lobby ({}/{})",
            id,
            self.participants.len(),
            self.config.max_participants
        );
        self.notifications.participant_joined.emit(&id);
        Ok(())
    }

    /// Tears down a participant record. The record's own leaving listeners
    /// and the lobby-wide `participant_left` listeners fire before the record
    /// is removed. Returns false for an unknown id.
    pub fn leave(&mut self, id: ParticipantId) -> bool {
        let Some(record) = self.participants.get_mut(&id) else {
            debug!("Ignoring leave for unknown participant {}", id);
            return false;
        };
        record.leaving.emit(&id);
        self.notifications.participant_left.emit(&id);

        if let Some(record) = self.participants.remove(&id) {
            if let Some(slot) = record.slot {
                self.slots.release(slot);
            }
        }
        self.footprints.remove(id);

        self.state.remove_observer(id);
        self.countdown.remove_observer(id);
        for other in self.participants.values_mut() {
            other.replication.remove_observer(id);
            self.departures.push((other.id, id));
        }

        info!(
            "Participant {} left the lobby ({} remaining)",
            id,
            self.participants.len()
        );
        true
    }

    /// Applies a ready request. Requests at or below the last processed
    /// sequence for this participant are dropped.
    pub fn request_set_ready(
        &mut self,
        id: ParticipantId,
        ready: bool,
        sequence: u32,
    ) -> Result<bool, LobbyError> {
        let record = self
            .participants
            .get_mut(&id)
            .ok_or(LobbyError::UnknownParticipant(id))?;

        if sequence <= record.ready_ack {
            debug!(
                "Dropping stale ready request {} from participant {} (last processed {})",
                sequence, id, record.ready_ack
            );
            return Ok(false);
        }

        record.ready_ack = sequence;
        let changed = record.ready.confirm(ready);
        record.republish();

        if changed {
            info!(
                "Participant {} is {}",
                id,
                if ready { "ready" } else { "not ready" }
            );
            self.notifications.ready_changed.emit(&(id, ready));
        }
        Ok(changed)
    }

    /// Flips the authoritative ready flag. Sequenced like `request_set_ready`.
    pub fn request_toggle_ready(
        &mut self,
        id: ParticipantId,
        sequence: u32,
    ) -> Result<bool, LobbyError> {
        let ready = self
            .participants
            .get(&id)
            .map(ParticipantRecord::is_ready)
            .ok_or(LobbyError::UnknownParticipant(id))?;
        self.request_set_ready(id, !ready, sequence)
    }

    /// Applies a payload request. Stale sequences are dropped like ready
    /// requests.
    ///
    /// A payload longer than the configured limit is refused, but its
    /// sequence still counts as processed so the requester's observer falls
    /// back to the authoritative payload.
    pub fn request_set_payload(
        &mut self,
        id: ParticipantId,
        payload: Vec<i32>,
        sequence: u32,
    ) -> Result<bool, LobbyError> {
        let record = self
            .participants
            .get_mut(&id)
            .ok_or(LobbyError::UnknownParticipant(id))?;

        if sequence <= record.payload_ack {
            debug!(
                "Dropping stale payload request {} from participant {} (last processed {})",
                sequence, id, record.payload_ack
            );
            return Ok(false);
        }

        record.payload_ack = sequence;
        let max = self.config.max_payload_len;
        if payload.len() > max {
            warn!(
                "Refusing payload of {} values from participant {} (limit {})",
                payload.len(),
                id,
                max
            );
            record.republish();
            return Err(LobbyError::PayloadTooLong {
                len: payload.len(),
                max,
            });
        }

        let changed = record.payload.confirm(payload.clone());
        record.republish();

        if changed {
            debug!("Participant {} payload is now {:?}", id, payload);
            self.notifications.payload_changed.emit(&(id, payload));
        }
        Ok(changed)
    }

    /// Subscribes to one participant's departure. The callback runs before
    /// the record is torn down. None for an unknown id.
    pub fn subscribe_leaving<F>(&mut self, id: ParticipantId, callback: F) -> Option<ListenerId>
    where
        F: FnMut(&ParticipantId) + Send + 'static,
    {
        self.participants
            .get_mut(&id)
            .map(|record| record.leaving.subscribe(callback))
    }

    /// Drains every replication message owed to observers since the last call.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        let mut outbound = Vec::new();

        let lobby_targets: BTreeSet<ObserverId> = self
            .state
            .take_pending()
            .into_iter()
            .chain(self.countdown.take_pending())
            .collect();
        let snapshot = self.snapshot();
        outbound.extend(
            lobby_targets
                .into_iter()
                .map(|to| Outbound::Lobby { to, snapshot }),
        );

        for record in self.participants.values_mut() {
            for to in record.replication.take_pending() {
                outbound.push(Outbound::Participant {
                    to,
                    snapshot: record.replication.get().clone(),
                });
            }
        }

        outbound.extend(
            self.departures
                .drain(..)
                .map(|(to, participant_id)| Outbound::Left { to, participant_id }),
        );
        outbound
    }

    fn has_too_few_participants(&self) -> bool {
        self.participants.len() < self.config.required_participants
    }

    pub fn state(&self) -> LobbyState {
        *self.state.get()
    }

    /// Seconds left on whichever countdown is running; zero otherwise.
    pub fn countdown(&self) -> u32 {
        *self.countdown.get()
    }

    pub fn config(&self) -> &LobbyConfig {
        &self.config
    }

    pub fn snapshot(&self) -> LobbySnapshot {
        LobbySnapshot {
            state: self.state(),
            countdown: self.countdown(),
        }
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn ready_count(&self) -> usize {
        self.participants.values().filter(|r| r.is_ready()).count()
    }

    /// True for an empty lobby as well; callers check the participant count.
    pub fn is_everyone_ready(&self) -> bool {
        self.ready_count() == self.participant_count()
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&ParticipantRecord> {
        self.participants.get(&id)
    }

    /// Replicated view of every record, in id order. This is what the full
    /// snapshot carries.
    pub fn participants(&self) -> Vec<ParticipantSnapshot> {
        self.participants
            .values()
            .map(ParticipantRecord::snapshot)
            .collect()
    }
}
