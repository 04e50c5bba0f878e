//! Connection bookkeeping for lobby participants
//!
//! Maps network addresses to participant ids, tracks when each participant
//! was last heard from and enforces the connection limit. Lobby semantics
//! (readiness, payloads, slots) live in `lobby`; this module only knows who is
//! connected and from where.

use log::info;
use shared::ParticipantId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A connected participant's transport state
#[derive(Debug)]
pub struct Connection {
    pub id: ParticipantId,
    pub addr: SocketAddr,
    /// Last time any packet arrived from this participant
    pub last_seen: Instant,
}

impl Connection {
    pub fn new(id: ParticipantId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

pub struct ParticipantManager {
    connections: HashMap<ParticipantId, Connection>,
    /// Ids are never reused within one server run
    next_id: ParticipantId,
    max_connections: usize,
    timeout: Duration,
}

impl ParticipantManager {
    pub fn new(max_connections: usize, timeout: Duration) -> Self {
        Self {
            connections: HashMap::new(),
            next_id: 1,
            max_connections,
            timeout,
        }
    }

    /// Registers a new connection. Returns None when the server is full.
    pub fn add_participant(&mut self, addr: SocketAddr) -> Option<ParticipantId> {
        if self.connections.len() >= self.max_connections {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;

        info!("Participant {} connected from {}", id, addr);
        self.connections.insert(id, Connection::new(id, addr));
        Some(id)
    }

    pub fn remove_participant(&mut self, id: ParticipantId) -> bool {
        if let Some(connection) = self.connections.remove(&id) {
            info!("Participant {} disconnected ({})", connection.id, connection.addr);
            true
        } else {
            false
        }
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<ParticipantId> {
        self.connections
            .values()
            .find(|connection| connection.addr == addr)
            .map(|connection| connection.id)
    }

    pub fn addr_of(&self, id: ParticipantId) -> Option<SocketAddr> {
        self.connections.get(&id).map(|connection| connection.addr)
    }

    /// Records activity from `addr`, returning the participant it belongs to.
    pub fn touch(&mut self, addr: SocketAddr) -> Option<ParticipantId> {
        let connection = self
            .connections
            .values_mut()
            .find(|connection| connection.addr == addr)?;
        connection.touch();
        Some(connection.id)
    }

    /// Removes and returns every participant silent for longer than the
    /// configured timeout.
    pub fn check_timeouts(&mut self) -> Vec<ParticipantId> {
        let timeout = self.timeout;
        let timed_out: Vec<ParticipantId> = self
            .connections
            .values()
            .filter(|connection| connection.is_timed_out(timeout))
            .map(|connection| connection.id)
            .collect();

        for id in &timed_out {
            info!("Participant {} timed out", id);
            self.remove_participant(*id);
        }

        timed_out
    }

    pub fn addrs(&self) -> Vec<(ParticipantId, SocketAddr)> {
        self.connections
            .values()
            .map(|connection| (connection.id, connection.addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn manager(max: usize) -> ParticipantManager {
        ParticipantManager::new(max, Duration::from_secs(5))
    }

    #[test]
    fn test_connection_timeout() {
        let mut connection = Connection::new(1, test_addr());
        assert!(!connection.is_timed_out(Duration::from_secs(1)));

        connection.last_seen = Instant::now() - Duration::from_secs(2);
        assert!(connection.is_timed_out(Duration::from_secs(1)));

        connection.touch();
        assert!(!connection.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_add_participants() {
        let mut manager = manager(3);
        assert!(manager.is_empty());

        assert_eq!(manager.add_participant(test_addr()), Some(1));
        assert_eq!(manager.add_participant(test_addr2()), Some(2));
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.addr_of(2), Some(test_addr2()));
    }

    #[test]
    fn test_capacity() {
        let mut manager = manager(1);
        assert!(manager.add_participant(test_addr()).is_some());
        assert!(manager.add_participant(test_addr2()).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_ids_not_reused() {
        let mut manager = manager(2);
        let first = manager.add_participant(test_addr()).unwrap();
        assert!(manager.remove_participant(first));
        assert!(!manager.remove_participant(first));

        let second = manager.add_participant(test_addr()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_find_by_addr() {
        let mut manager = manager(2);
        let first = manager.add_participant(test_addr()).unwrap();
        manager.add_participant(test_addr2()).unwrap();

        assert_eq!(manager.find_by_addr(test_addr()), Some(first));
        let unknown: SocketAddr = "192.168.1.1:9999".parse().unwrap();
        assert_eq!(manager.find_by_addr(unknown), None);
        assert_eq!(manager.touch(unknown), None);
    }

    #[test]
    fn test_check_timeouts() {
        let mut manager = ParticipantManager::new(2, Duration::from_secs(1));
        let stale = manager.add_participant(test_addr()).unwrap();
        let fresh = manager.add_participant(test_addr2()).unwrap();

        if let Some(connection) = manager.connections.get_mut(&stale) {
            connection.last_seen = Instant::now() - Duration::from_secs(3);
        }

        assert_eq!(manager.check_timeouts(), vec![stale]);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.find_by_addr(test_addr2()), Some(fresh));
        assert!(manager.check_timeouts().is_empty());
    }
}
