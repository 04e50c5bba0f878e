//! Observer-side mirror of the lobby
//!
//! Applies replication packets from the authority, keeps the local
//! participant's optimistic requests visible until the authority acknowledges
//! them, and places every known participant into a local slot.
//!
//! Every replication packet carries a revision. Lobby updates older than the
//! newest applied one are dropped, and so are participant updates older than
//! the participant's last applied revision or its departure.

use log::{debug, info, warn};
use shared::{
    Footprints, Listeners, Locality, LobbySnapshot, LobbyState, Occupant, Packet, ParticipantId,
    ParticipantSnapshot, Shadowed, SlotAllocator, SlotId, MAX_PAYLOAD_LEN, MAX_SLOT_POOL,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Ticks a departed participant's occupant is kept alive after it leaves.
pub const FINALIZE_DELAY_TICKS: u32 = 2;

/// Subscriber lists for every change the observer sees, whether it came
/// from the authority or from a local request.
#[derive(Debug, Default)]
pub struct ReplicaNotifications {
    pub state_changed: Listeners<LobbyState>,
    pub lobby_updated: Listeners<(LobbyState, u32)>,
    pub participant_joined: Listeners<ParticipantId>,
    pub participant_left: Listeners<ParticipantId>,
    pub ready_changed: Listeners<(ParticipantId, bool)>,
    pub payload_changed: Listeners<(ParticipantId, Vec<i32>)>,
    /// Fires once the local participant's own record has arrived.
    pub synchronized: Listeners<ParticipantId>,
}

/// Mirror of one participant record.
#[derive(Debug)]
pub struct ReplicaParticipant {
    id: ParticipantId,
    locality: Locality,
    ready: Shadowed<bool>,
    payload: Shadowed<Vec<i32>>,
    revision: u64,
    slot: Option<SlotId>,
    occupant: Arc<Occupant>,
}

impl ReplicaParticipant {
    fn new(id: ParticipantId, locality: Locality) -> Self {
        Self {
            id,
            locality,
            ready: Shadowed::new(false),
            payload: Shadowed::new(Vec::new()),
            revision: 0,
            slot: None,
            occupant: Occupant::new(id, locality),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn locality(&self) -> Locality {
        self.locality
    }

    /// Ready flag as shown locally, including unacknowledged requests.
    pub fn is_ready(&self) -> bool {
        *self.ready.local()
    }

    /// Last ready flag confirmed by the authority.
    pub fn confirmed_ready(&self) -> bool {
        *self.ready.authority()
    }

    /// Payload as shown locally, including unacknowledged requests.
    pub fn payload(&self) -> &[i32] {
        self.payload.local()
    }

    pub fn confirmed_payload(&self) -> &[i32] {
        self.payload.authority()
    }

    /// Local placement slot, if one was free when the record arrived.
    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }

    /// True while a ready or payload request awaits acknowledgement.
    pub fn has_pending_requests(&self) -> bool {
        self.ready.is_dirty() || self.payload.is_dirty()
    }
}

#[derive(Debug)]
struct Parked {
    occupant: Arc<Occupant>,
    ticks_left: u32,
}

pub struct ReplicaLobby {
    own_id: Option<ParticipantId>,
    state: LobbyState,
    countdown: u32,
    lobby_revision: u64,
    participants: BTreeMap<ParticipantId, ReplicaParticipant>,
    /// Revision of each departure, so late updates cannot resurrect a record.
    /// Entries older than `snapshot_revision` are pruned.
    departed: BTreeMap<ParticipantId, u64>,
    /// Newest full snapshot applied. Unknown participants in older updates
    /// were absent from it and are not resurrected.
    snapshot_revision: u64,
    parked: Vec<Parked>,
    slots: SlotAllocator,
    footprints: Footprints,
    ready_sequence: u32,
    payload_sequence: u32,
    initial_payload: Option<Vec<i32>>,
    synchronized: bool,
    sync_tx: Option<oneshot::Sender<ParticipantId>>,
    pub notifications: ReplicaNotifications,
}

impl ReplicaLobby {
    /// An observer that has not been welcomed yet. Replication is ignored
    /// until a `Welcome` names the local participant.
    pub fn new() -> Self {
        Self {
            own_id: None,
            state: LobbyState::Initializing,
            countdown: 0,
            lobby_revision: 0,
            participants: BTreeMap::new(),
            departed: BTreeMap::new(),
            snapshot_revision: 0,
            parked: Vec::new(),
            slots: SlotAllocator::new(Vec::new()),
            footprints: Footprints::new(),
            ready_sequence: 0,
            payload_sequence: 0,
            initial_payload: None,
            synchronized: false,
            sync_tx: None,
            notifications: ReplicaNotifications::default(),
        }
    }

    /// Payload requested automatically once the local record arrives.
    pub fn with_initial_payload(mut self, payload: Vec<i32>) -> Self {
        self.initial_payload = Some(payload);
        self
    }

    /// Resolves with the local participant id once its record has arrived.
    pub fn synchronized(&mut self) -> oneshot::Receiver<ParticipantId> {
        let (tx, rx) = oneshot::channel();
        match (self.synchronized, self.own_id) {
            (true, Some(id)) => {
                let _ = tx.send(id);
            }
            _ => self.sync_tx = Some(tx),
        }
        rx
    }

    /// Applies one packet from the authority. Returns packets that must be
    /// sent back in response.
    pub fn apply_packet(&mut self, packet: Packet) -> Vec<Packet> {
        let mut outgoing = Vec::new();

        match packet {
            Packet::Welcome {
                participant_id,
                slot_pool,
            } => self.welcome(participant_id, slot_pool),

            Packet::Lobby { .. } | Packet::Participant { .. } | Packet::ParticipantLeft { .. } | Packet::Snapshot { .. }
                if self.own_id.is_none() =>
            {
                debug!("Ignoring lobby replication before welcome");
            }

            Packet::Lobby {
                revision,
                state,
                countdown,
            } => self.apply_lobby(revision, LobbySnapshot { state, countdown }),

            Packet::Participant { revision, snapshot } => {
                self.apply_participant(revision, snapshot, &mut outgoing)
            }

            Packet::ParticipantLeft {
                revision,
                participant_id,
            } => self.apply_departure(revision, participant_id),

            Packet::Snapshot {
                revision,
                lobby,
                participants,
            } => {
                self.apply_lobby(revision, lobby);

                let present: BTreeSet<ParticipantId> = participants.iter().map(|p| p.id).collect();
                for snapshot in participants {
                    self.apply_participant(revision, snapshot, &mut outgoing);
                }

                // Departures whose ParticipantLeft was lost.
                let missing: Vec<ParticipantId> = self
                    .participants
                    .values()
                    .filter(|r| !present.contains(&r.id) && r.revision < revision)
                    .map(|r| r.id)
                    .collect();
                for id in missing {
                    self.apply_departure(revision, id);
                }

                if revision > self.snapshot_revision {
                    self.snapshot_revision = revision;
                    self.departed.retain(|_, departed_at| *departed_at >= revision);
                }
            }

            Packet::Rejected { reason } | Packet::Kicked { reason } => {
                warn!("Removed from lobby: {}", reason);
                self.reset();
            }

            other => debug!("Ignoring unexpected packet {:?}", other),
        }

        outgoing
    }

    fn welcome(&mut self, id: ParticipantId, slot_pool: u32) {
        if let Some(current) = self.own_id {
            if current == id {
                debug!("Duplicate welcome for participant {}", id);
                return;
            }
            info!("Rejoined as participant {} (was {})", id, current);
            self.reset();
        }

        let slot_pool = match usize::try_from(slot_pool) {
            Ok(pool) if pool <= MAX_SLOT_POOL => pool,
            _ => {
                warn!(
                    "Server announced {} placement slots, using {}",
                    slot_pool, MAX_SLOT_POOL
                );
                MAX_SLOT_POOL
            }
        };

        self.own_id = Some(id);
        self.slots = SlotAllocator::with_layout(1, slot_pool.saturating_sub(1));
        info!(
            "Welcomed as participant {} ({} placement slots)",
            id, slot_pool
        );
    }

    fn apply_lobby(&mut self, revision: u64, snapshot: LobbySnapshot) {
        if revision <= self.lobby_revision {
            debug!(
                "Ignoring stale lobby update {} (have {})",
                revision, self.lobby_revision
            );
            return;
        }
        self.lobby_revision = revision;

        let state_changed = self.state != snapshot.state;
        let countdown_changed = self.countdown != snapshot.countdown;
        self.state = snapshot.state;
        self.countdown = snapshot.countdown;

        if state_changed {
            info!("Lobby is now {}", snapshot.state);
            self.notifications.state_changed.emit(&snapshot.state);
        }
        if state_changed || countdown_changed {
            self.notifications
                .lobby_updated
                .emit(&(snapshot.state, snapshot.countdown));
        }
    }

    fn apply_participant(
        &mut self,
        revision: u64,
        snapshot: ParticipantSnapshot,
        outgoing: &mut Vec<Packet>,
    ) {
        let id = snapshot.id;

        if let Some(&departed_at) = self.departed.get(&id) {
            if revision <= departed_at {
                debug!(
                    "Ignoring update {} for departed participant {}",
                    revision, id
                );
                return;
            }
            self.departed.remove(&id);
        }

        let joined = !self.participants.contains_key(&id);
        if joined && revision < self.snapshot_revision {
            debug!(
                "Ignoring update {} for participant {}, absent from snapshot {}",
                revision, id, self.snapshot_revision
            );
            return;
        }
        if joined {
            let locality = if Some(id) == self.own_id {
                Locality::Local
            } else {
                Locality::Remote
            };
            let mut record = ReplicaParticipant::new(id, locality);
            match self.slots.acquire(&record.occupant, &self.footprints) {
                Ok(slot) => {
                    if let Some(area) = self.slots.slot(slot).map(|s| *s.footprint()) {
                        self.footprints.place(id, area);
                    }
                    record.slot = Some(slot);
                }
                Err(e) => warn!("Participant {} has no placement: {}", id, e),
            }
            self.participants.insert(id, record);

            info!("Participant {} joined the lobby", id);
            self.notifications.participant_joined.emit(&id);
        }

        let Some(record) = self.participants.get_mut(&id) else {
            return;
        };
        if revision <= record.revision {
            debug!(
                "Ignoring stale update {} for participant {} (have {})",
                revision, id, record.revision
            );
            return;
        }
        record.revision = revision;

        let ready = record.ready.reconcile(snapshot.ready, snapshot.ready_ack);
        let payload = record
            .payload
            .reconcile(snapshot.payload, snapshot.payload_ack);

        if let Some(ready) = ready {
            self.notifications.ready_changed.emit(&(id, ready));
        }
        if let Some(payload) = payload {
            self.notifications.payload_changed.emit(&(id, payload));
        }

        if joined && Some(id) == self.own_id {
            self.on_synchronized(id, outgoing);
        }
    }

    fn on_synchronized(&mut self, id: ParticipantId, outgoing: &mut Vec<Packet>) {
        if self.synchronized {
            return;
        }
        self.synchronized = true;
        info!("Synchronized with the lobby as participant {}", id);

        if let Some(tx) = self.sync_tx.take() {
            let _ = tx.send(id);
        }
        self.notifications.synchronized.emit(&id);

        if let Some(payload) = self.initial_payload.clone() {
            outgoing.extend(self.request_set_payload(payload));
        }
    }

    fn apply_departure(&mut self, revision: u64, id: ParticipantId) {
        if let Some(record) = self.participants.get(&id) {
            if record.revision >= revision {
                debug!(
                    "Ignoring stale departure {} for participant {} (have {})",
                    revision, id, record.revision
                );
                return;
            }
        }

        let departed_at = self.departed.entry(id).or_insert(revision);
        *departed_at = (*departed_at).max(revision);

        let Some(record) = self.participants.remove(&id) else {
            return;
        };
        self.footprints.remove(id);
        self.parked.push(Parked {
            occupant: record.occupant,
            ticks_left: FINALIZE_DELAY_TICKS,
        });

        info!("Participant {} left the lobby", id);
        self.notifications.participant_left.emit(&id);
    }

    /// Advances local time by one tick and lets go of departed occupants whose
    /// delay has run out. Returns how many were finalized.
    pub fn tick(&mut self) -> usize {
        for parked in &mut self.parked {
            parked.ticks_left = parked.ticks_left.saturating_sub(1);
        }

        let before = self.parked.len();
        self.parked.retain(|parked| {
            if parked.ticks_left == 0 {
                debug!("Finalized departed participant {}", parked.occupant.id);
                false
            } else {
                true
            }
        });
        before - self.parked.len()
    }

    /// Forgets everything learned from the current session.
    pub fn reset(&mut self) {
        let known: Vec<ParticipantId> = self.participants.keys().copied().collect();
        self.participants.clear();
        for id in known {
            self.notifications.participant_left.emit(&id);
        }

        self.own_id = None;
        self.state = LobbyState::Initializing;
        self.countdown = 0;
        self.lobby_revision = 0;
        self.departed.clear();
        self.snapshot_revision = 0;
        self.parked.clear();
        self.slots = SlotAllocator::new(Vec::new());
        self.footprints = Footprints::new();
        self.ready_sequence = 0;
        self.payload_sequence = 0;
        self.synchronized = false;
    }

    /// Optimistically changes the local ready flag and returns the request to
    /// send. None until the local record has arrived.
    pub fn request_set_ready(&mut self, ready: bool) -> Option<Packet> {
        let id = self.own_id?;
        let Some(record) = self.participants.get_mut(&id) else {
            warn!("Cannot change ready state before synchronizing with the lobby");
            return None;
        };

        self.ready_sequence += 1;
        let sequence = self.ready_sequence;
        if record.ready.request(ready, sequence) {
            self.notifications.ready_changed.emit(&(id, ready));
        }
        Some(Packet::SetReady { sequence, ready })
    }

    /// Requests the opposite of the locally shown ready flag.
    pub fn request_toggle_ready(&mut self) -> Option<Packet> {
        let id = self.own_id?;
        let ready = match self.participants.get(&id) {
            Some(record) => !record.is_ready(),
            None => {
                warn!("Cannot change ready state before synchronizing with the lobby");
                return None;
            }
        };
        self.request_set_ready(ready)
    }

    /// Optimistically changes the local payload and returns the request to
    /// send. Payloads the authority would refuse are not requested at all.
    pub fn request_set_payload(&mut self, payload: Vec<i32>) -> Option<Packet> {
        let id = self.own_id?;
        if payload.len() > MAX_PAYLOAD_LEN {
            warn!(
                "Payload of {} values exceeds the limit of {}",
                payload.len(),
                MAX_PAYLOAD_LEN
            );
            return None;
        }
        let Some(record) = self.participants.get_mut(&id) else {
            warn!("Cannot change payload before synchronizing with the lobby");
            return None;
        };

        self.payload_sequence += 1;
        let sequence = self.payload_sequence;
        if record.payload.request(payload.clone(), sequence) {
            self.notifications
                .payload_changed
                .emit(&(id, payload.clone()));
        }
        Some(Packet::SetPayload { sequence, payload })
    }

    /// Requests the authority has not acknowledged yet, for resending.
    pub fn pending_requests(&self) -> Vec<Packet> {
        let Some(record) = self.own_id.and_then(|id| self.participants.get(&id)) else {
            return Vec::new();
        };

        let mut packets = Vec::new();
        if let Some(sequence) = record.ready.pending() {
            packets.push(Packet::SetReady {
                sequence,
                ready: *record.ready.local(),
            });
        }
        if let Some(sequence) = record.payload.pending() {
            packets.push(Packet::SetPayload {
                sequence,
                payload: record.payload.local().clone(),
            });
        }
        packets
    }

    /// Id assigned by the latest `Welcome`.
    pub fn own_id(&self) -> Option<ParticipantId> {
        self.own_id
    }

    /// True once the local participant's own record has arrived.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn state(&self) -> LobbyState {
        self.state
    }

    /// Countdown as last replicated; zero outside the counting states.
    pub fn countdown(&self) -> u32 {
        self.countdown
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&ReplicaParticipant> {
        self.participants.get(&id)
    }

    /// Ids of every mirrored participant, in ascending order.
    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.participants.keys().copied().collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Participants shown as ready, counting the local optimistic flag.
    pub fn ready_count(&self) -> usize {
        self.participants.values().filter(|r| r.is_ready()).count()
    }

    pub fn is_everyone_ready(&self) -> bool {
        self.ready_count() == self.participant_count()
    }

    pub fn slot_of(&self, id: ParticipantId) -> Option<SlotId> {
        self.participants.get(&id).and_then(|r| r.slot)
    }

    /// The local placement pool laid out from the `Welcome`.
    pub fn slots(&self) -> &SlotAllocator {
        &self.slots
    }

    /// Departed occupants still waiting to be finalized.
    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }
}

impl Default for ReplicaLobby {
    fn default() -> Self {
        Self::new()
    }
}
