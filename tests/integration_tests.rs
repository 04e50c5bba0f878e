//! Integration tests for the lobby authority and its observers
//!
//! The in-process tests wire a `LobbyStateMachine` to several `ReplicaLobby`
//! observers through an explicit queue of in-flight packets, so delivery order
//! and loss can be controlled exactly. The network tests run a real server on
//! loopback.

use bincode::{deserialize, serialize};
use client::replica::ReplicaLobby;
use server::config::LobbyConfig;
use server::lobby::LobbyStateMachine;
use server::network::Server;
use shared::{Locality, LobbyState, Packet, ParticipantId, PROTOCOL_VERSION};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Authority plus observers, connected by queues the test drives by hand.
struct Harness {
    lobby: LobbyStateMachine,
    replicas: BTreeMap<ParticipantId, ReplicaLobby>,
    revision: u64,
    /// Authority to observer
    downstream: Vec<(ParticipantId, Packet)>,
    /// Observer to authority
    upstream: Vec<(ParticipantId, Packet)>,
}

impl Harness {
    fn new(config: LobbyConfig) -> Self {
        let mut lobby = LobbyStateMachine::from_config(config);
        lobby.initialize();
        Self {
            lobby,
            replicas: BTreeMap::new(),
            revision: 0,
            downstream: Vec::new(),
            upstream: Vec::new(),
        }
    }

    fn join(&mut self, id: ParticipantId) {
        self.lobby.join(id, Locality::Remote).unwrap();
        let mut replica = ReplicaLobby::new();
        replica.apply_packet(Packet::Welcome {
            participant_id: id,
            slot_pool: self.lobby.config().slot_pool as u32,
        });
        self.replicas.insert(id, replica);
    }

    fn leave(&mut self, id: ParticipantId) {
        self.lobby.leave(id);
        self.replicas.remove(&id);
    }

    fn replica(&mut self, id: ParticipantId) -> &mut ReplicaLobby {
        self.replicas.get_mut(&id).unwrap()
    }

    fn request(&mut self, id: ParticipantId, packet: Option<Packet>) {
        if let Some(packet) = packet {
            self.upstream.push((id, packet));
        }
    }

    fn flush(&mut self) {
        for outbound in self.lobby.take_outbound() {
            self.revision += 1;
            self.downstream.push(outbound.into_packet(self.revision));
        }
    }

    fn snapshot(&mut self) {
        self.revision += 1;
        for id in self.replicas.keys() {
            self.downstream.push((
                *id,
                Packet::Snapshot {
                    revision: self.revision,
                    lobby: self.lobby.snapshot(),
                    participants: self.lobby.participants(),
                },
            ));
        }
    }

    fn tick(&mut self, stamp: u64) {
        self.lobby.tick(stamp);
        self.flush();
    }

    fn deliver_upstream(&mut self, reversed: bool) {
        let mut packets = std::mem::take(&mut self.upstream);
        if reversed {
            packets.reverse();
        }
        for (id, packet) in packets {
            match packet {
                Packet::SetReady { sequence, ready } => {
                    self.lobby.request_set_ready(id, ready, sequence).unwrap();
                }
                Packet::SetPayload { sequence, payload } => {
                    self.lobby.request_set_payload(id, payload, sequence).unwrap();
                }
                other => panic!("Unexpected request {:?}", other),
            }
        }
        self.flush();
    }

    fn deliver_downstream(&mut self, reversed: bool) {
        let mut packets = std::mem::take(&mut self.downstream);
        if reversed {
            packets.reverse();
        }
        for (id, packet) in packets {
            if let Some(replica) = self.replicas.get_mut(&id) {
                let responses = replica.apply_packet(packet);
                self.upstream.extend(responses.into_iter().map(|p| (id, p)));
            }
        }
    }

    fn drop_downstream(&mut self) {
        self.downstream.clear();
    }

    /// Every observer agrees with the authority.
    fn assert_converged(&self) {
        let authority = self.lobby.participants();
        for (observer, replica) in &self.replicas {
            assert_eq!(replica.state(), self.lobby.state(), "observer {}", observer);
            assert_eq!(replica.countdown(), self.lobby.countdown(), "observer {}", observer);
            assert_eq!(
                replica.participant_ids(),
                authority.iter().map(|p| p.id).collect::<Vec<_>>(),
                "observer {}",
                observer
            );
            for expected in &authority {
                let seen = replica.participant(expected.id).unwrap();
                assert_eq!(seen.is_ready(), expected.ready, "observer {}", observer);
                assert_eq!(seen.payload(), expected.payload.as_slice(), "observer {}", observer);
            }
            assert!(replica.pending_requests().is_empty(), "observer {}", observer);
        }
    }
}

/// IN-PROCESS REPLICATION TESTS
mod replication_tests {
    use super::*;

    fn synced_pair(config: LobbyConfig) -> Harness {
        let mut harness = Harness::new(config);
        harness.join(1);
        harness.join(2);
        harness.flush();
        harness.deliver_downstream(false);
        assert!(harness.replica(1).is_synchronized());
        assert!(harness.replica(2).is_synchronized());
        harness
    }

    #[test]
    fn new_observers_receive_full_state() {
        let harness = synced_pair(LobbyConfig::default());
        harness.assert_converged();
    }

    #[test]
    fn interleaved_ready_requests_converge() {
        let mut harness = synced_pair(LobbyConfig::default());

        let request = harness.replica(2).request_set_ready(true);
        harness.request(2, request);
        let request = harness.replica(1).request_set_ready(true);
        harness.request(1, request);

        harness.deliver_upstream(true);
        harness.deliver_downstream(true);

        assert!(harness.lobby.is_everyone_ready());
        harness.assert_converged();
        assert_eq!(harness.replica(1).ready_count(), 2);
    }

    #[test]
    fn reordered_requests_from_one_observer() {
        let mut harness = synced_pair(LobbyConfig::default());

        let first = harness.replica(1).request_set_ready(true);
        harness.request(1, first);
        let second = harness.replica(1).request_set_ready(false);
        harness.request(1, second);

        // The later request arrives first; the earlier one is then stale.
        harness.deliver_upstream(true);
        assert!(!harness.lobby.participant(1).unwrap().is_ready());

        harness.deliver_downstream(false);
        harness.assert_converged();
    }

    #[test]
    fn stale_update_does_not_undo_local_request() {
        let mut harness = synced_pair(LobbyConfig::default());

        let request = harness.replica(1).request_set_payload(vec![1, 2]);
        harness.request(1, request);

        // A snapshot taken before the request is processed.
        harness.snapshot();
        harness.deliver_downstream(false);
        assert_eq!(harness.replica(1).participant(1).unwrap().payload(), &[1, 2]);

        harness.deliver_upstream(false);
        harness.deliver_downstream(false);
        harness.assert_converged();
    }

    #[test]
    fn lost_updates_heal_with_snapshot() {
        let mut harness = synced_pair(LobbyConfig::default());

        let request = harness.replica(2).request_set_ready(true);
        harness.request(2, request);
        harness.deliver_upstream(false);
        harness.drop_downstream();

        harness.join(3);
        harness.leave(1);
        harness.flush();
        harness.drop_downstream();

        harness.snapshot();
        harness.deliver_downstream(false);
        harness.assert_converged();
        assert!(harness.replica(3).is_synchronized());
    }

    #[test]
    fn lost_request_is_resent() {
        let mut harness = synced_pair(LobbyConfig::default());

        let _lost = harness.replica(1).request_set_ready(true);
        assert!(!harness.lobby.participant(1).unwrap().is_ready());

        let resend = harness.replica(1).pending_requests();
        for packet in resend {
            harness.request(1, Some(packet));
        }
        harness.deliver_upstream(false);
        harness.deliver_downstream(false);

        assert!(harness.lobby.participant(1).unwrap().is_ready());
        harness.assert_converged();
    }

    #[test]
    fn initial_payload_published_after_sync() {
        let mut harness = Harness::new(LobbyConfig::default());
        harness.lobby.join(4, Locality::Remote).unwrap();
        let mut replica = ReplicaLobby::new().with_initial_payload(vec![7, 7, 7]);
        replica.apply_packet(Packet::Welcome {
            participant_id: 4,
            slot_pool: 8,
        });
        harness.replicas.insert(4, replica);

        harness.flush();
        harness.deliver_downstream(false);
        harness.deliver_upstream(false);
        harness.deliver_downstream(false);

        assert_eq!(harness.lobby.participant(4).unwrap().payload(), &[7, 7, 7]);
        harness.assert_converged();
    }

    #[test]
    fn departure_reaches_remaining_observers() {
        let mut harness = synced_pair(LobbyConfig::default());
        harness.join(3);
        harness.flush();
        harness.deliver_downstream(false);

        harness.leave(2);
        harness.flush();
        harness.deliver_downstream(true);

        assert!(harness.replica(1).participant(2).is_none());
        assert!(harness.replica(3).participant(2).is_none());
        harness.assert_converged();
    }

    #[test]
    fn observers_follow_lobby_to_match_start() {
        let mut harness = synced_pair(LobbyConfig {
            lobby_countdown_time: 4,
            final_countdown_threshold: 2,
            ..Default::default()
        });

        let mut stamp = 0;
        while harness.lobby.state() != LobbyState::MatchStarted {
            stamp += 1;
            harness.tick(stamp);
            harness.deliver_downstream(stamp % 2 == 0);
            harness.assert_converged();
            assert!(stamp < 20, "lobby never started");
        }

        for replica in harness.replicas.values() {
            assert_eq!(replica.state(), LobbyState::MatchStarted);
            assert_eq!(replica.countdown(), 0);
            assert!(replica.is_everyone_ready());
        }
    }

    #[test]
    fn disconnect_during_final_countdown_resets_observers() {
        let mut harness = synced_pair(LobbyConfig::default());
        harness.tick(1);
        harness.lobby.force_all_ready();
        harness.tick(2);
        harness.deliver_downstream(false);
        assert_eq!(harness.replica(1).state(), LobbyState::StartingMatch);

        harness.leave(2);
        harness.tick(3);
        harness.deliver_downstream(false);

        assert_eq!(harness.replica(1).state(), LobbyState::WaitingForPlayers);
        assert_eq!(harness.replica(1).countdown(), 0);
        harness.assert_converged();
    }
}

/// NETWORK TESTS
mod network_tests {
    use super::*;

    async fn recv_packet(socket: &UdpSocket) -> Packet {
        let mut buf = [0u8; 2048];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for server")
            .unwrap();
        deserialize(&buf[..len]).unwrap()
    }

    async fn spawn_server(config: LobbyConfig) -> std::net::SocketAddr {
        let lobby = LobbyStateMachine::from_config(config);
        let mut server = Server::new("127.0.0.1:0", Duration::from_millis(50), lobby)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.run().await });
        addr
    }

    async fn join(server: std::net::SocketAddr) -> (UdpSocket, ReplicaLobby) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server).await.unwrap();
        let join = serialize(&Packet::Join {
            client_version: PROTOCOL_VERSION,
        })
        .unwrap();
        socket.send(&join).await.unwrap();

        let mut replica = ReplicaLobby::new();
        loop {
            let packet = recv_packet(&socket).await;
            let welcomed = matches!(packet, Packet::Welcome { .. });
            replica.apply_packet(packet);
            if welcomed {
                break;
            }
        }
        (socket, replica)
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let server = spawn_server(LobbyConfig::default()).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server).await.unwrap();
        socket
            .send(&serialize(&Packet::Join { client_version: 0 }).unwrap())
            .await
            .unwrap();

        match recv_packet(&socket).await {
            Packet::Rejected { reason } => assert!(reason.contains("version")),
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn lobby_runs_to_match_start_over_udp() {
        let server = spawn_server(LobbyConfig {
            lobby_countdown_time: 3,
            final_countdown_threshold: 1,
            ..Default::default()
        })
        .await;

        let (first, mut first_replica) = join(server).await;
        let (_second, _) = join(server).await;
        assert_eq!(first_replica.own_id(), Some(1));

        let ready = serialize(&Packet::SetReady {
            sequence: 1,
            ready: true,
        })
        .unwrap();
        first.send(&ready).await.unwrap();

        let mut saw_ready_ack = false;
        while first_replica.state() != LobbyState::MatchStarted {
            let packet = recv_packet(&first).await;
            first_replica.apply_packet(packet);
            if let Some(own) = first_replica.participant(1) {
                saw_ready_ack |= own.confirmed_ready();
            }
        }

        assert!(saw_ready_ack);
        assert_eq!(first_replica.countdown(), 0);
        assert_eq!(first_replica.participant_count(), 2);
    }
}
