//! Server network layer handling UDP communications and lobby loop coordination

use crate::lobby::LobbyStateMachine;
use crate::participant_manager::ParticipantManager;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Locality, Packet, ParticipantId, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

pub type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    ParticipantTimeout {
        participant_id: ParticipantId,
    },
    Shutdown,
}

/// Messages sent from the lobby loop to the sender task
#[derive(Debug)]
pub enum LobbyMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    SendTo {
        packet: Packet,
        participant_id: ParticipantId,
    },
    BroadcastPacket {
        packet: Packet,
    },
}

/// Lobby authority: owns the lobby state machine and drives it from one loop
pub struct Server {
    socket: Arc<UdpSocket>,
    participants: Arc<RwLock<ParticipantManager>>,
    lobby: LobbyStateMachine,
    tick_duration: Duration,
    /// Incremented for every replication packet sent
    revision: u64,
    lobby_seconds: u64,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    lobby_tx: mpsc::UnboundedSender<LobbyMessage>,
    lobby_rx: mpsc::UnboundedReceiver<LobbyMessage>,
}

impl Server {
    pub async fn new(
        addr: &str,
        tick_duration: Duration,
        mut lobby: LobbyStateMachine,
    ) -> ServerResult<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        lobby.initialize();
        let max_connections = lobby.config().max_participants;

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (lobby_tx, lobby_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            participants: Arc::new(RwLock::new(ParticipantManager::new(
                max_connections,
                DEFAULT_TIMEOUT,
            ))),
            lobby,
            tick_duration,
            revision: 0,
            lobby_seconds: 0,
            server_tx,
            server_rx,
            lobby_tx,
            lobby_rx,
        })
    }

    /// Replaces the participant timeout. Only meaningful before `run`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let max_connections = self.lobby.config().max_participants;
        self.participants = Arc::new(RwLock::new(ParticipantManager::new(
            max_connections,
            timeout,
        )));
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn lobby(&self) -> &LobbyStateMachine {
        &self.lobby
    }

    pub fn lobby_mut(&mut self) -> &mut LobbyStateMachine {
        &mut self.lobby
    }

    /// Handle for stopping the server loop from outside.
    pub fn shutdown_sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_PACKET_SIZE + 1];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) if len > MAX_PACKET_SIZE => {
                        warn!("Dropping oversized packet ({} bytes) from {}", len, addr);
                    }
                    Ok((len, addr)) => match deserialize::<Packet>(&buffer[..len]) {
                        Ok(packet) => {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to deserialize packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let participants = Arc::clone(&self.participants);
        let mut lobby_rx = std::mem::replace(&mut self.lobby_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = lobby_rx.recv().await {
                match message {
                    LobbyMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    LobbyMessage::SendTo {
                        packet,
                        participant_id,
                    } => {
                        let addr = participants.read().await.addr_of(participant_id);
                        match addr {
                            Some(addr) => {
                                if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await
                                {
                                    error!(
                                        "Failed to send to participant {}: {}",
                                        participant_id, e
                                    );
                                }
                            }
                            None => debug!(
                                "Participant {} is gone, dropping packet",
                                participant_id
                            ),
                        }
                    }
                    LobbyMessage::BroadcastPacket { packet } => {
                        let addrs = participants.read().await.addrs();

                        for (participant_id, addr) in addrs {
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to participant {}: {}", participant_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors participant timeouts
    fn spawn_timeout_checker(&self) {
        let participants = Arc::clone(&self.participants);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));

            loop {
                interval.tick().await;

                let timed_out = participants.write().await.check_timeouts();

                for participant_id in timed_out {
                    if let Err(e) =
                        server_tx.send(ServerMessage::ParticipantTimeout { participant_id })
                    {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(socket: &UdpSocket, packet: &Packet, addr: SocketAddr) -> ServerResult<()> {
        let data = serialize(packet)?;
        if data.len() > MAX_PACKET_SIZE {
            return Err(format!(
                "packet of {} bytes exceeds the {} byte limit",
                data.len(),
                MAX_PACKET_SIZE
            )
            .into());
        }
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn queue(&self, message: LobbyMessage) {
        if let Err(e) = self.lobby_tx.send(message) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        self.queue(LobbyMessage::SendPacket { packet, addr });
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Sends every pending replication message, each with a fresh revision.
    fn flush_outbound(&mut self) {
        for outbound in self.lobby.take_outbound() {
            let revision = self.next_revision();
            let (participant_id, packet) = outbound.into_packet(revision);
            self.queue(LobbyMessage::SendTo {
                packet,
                participant_id,
            });
        }
    }

    /// Full lobby view sent every tick so lost updates heal.
    fn broadcast_snapshot(&mut self) {
        if self.lobby.participant_count() == 0 {
            return;
        }

        let revision = self.next_revision();
        let packet = Packet::Snapshot {
            revision,
            lobby: self.lobby.snapshot(),
            participants: self.lobby.participants(),
        };
        self.queue(LobbyMessage::BroadcastPacket { packet });
    }

    async fn disconnect(&mut self, participant_id: ParticipantId) {
        self.participants
            .write()
            .await
            .remove_participant(participant_id);
        self.lobby.leave(participant_id);
    }

    /// Processes an incoming packet and applies it to the lobby
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Join { client_version } => {
                info!(
                    "Participant joining from {} (version: {})",
                    addr, client_version
                );

                if client_version != PROTOCOL_VERSION {
                    warn!(
                        "Rejecting {}: protocol version {} != {}",
                        addr, client_version, PROTOCOL_VERSION
                    );
                    self.send_packet(
                        Packet::Rejected {
                            reason: "Incompatible protocol version".to_string(),
                        },
                        addr,
                    );
                    return;
                }

                let existing = self.participants.read().await.find_by_addr(addr);
                if let Some(existing) = existing {
                    info!("Replacing participant {} from {}", existing, addr);
                    self.disconnect(existing).await;
                }

                let participant_id = self.participants.write().await.add_participant(addr);
                let Some(participant_id) = participant_id else {
                    self.send_packet(
                        Packet::Rejected {
                            reason: "Server full".to_string(),
                        },
                        addr,
                    );
                    return;
                };

                if let Err(e) = self.lobby.join(participant_id, Locality::Remote) {
                    warn!("Participant {} could not join: {}", participant_id, e);
                    self.participants
                        .write()
                        .await
                        .remove_participant(participant_id);
                    self.send_packet(
                        Packet::Rejected {
                            reason: e.to_string(),
                        },
                        addr,
                    );
                    return;
                }

                let slot_pool = u32::try_from(self.lobby.config().slot_pool).unwrap_or(u32::MAX);
                self.send_packet(
                    Packet::Welcome {
                        participant_id,
                        slot_pool,
                    },
                    addr,
                );
            }

            Packet::SetReady { sequence, ready } => {
                let Some(participant_id) = self.participants.write().await.touch(addr) else {
                    debug!("SetReady from unknown address {}", addr);
                    return;
                };
                if let Err(e) = self.lobby.request_set_ready(participant_id, ready, sequence) {
                    warn!("Ready request from {} failed: {}", participant_id, e);
                }
            }

            Packet::SetPayload { sequence, payload } => {
                let Some(participant_id) = self.participants.write().await.touch(addr) else {
                    debug!("SetPayload from unknown address {}", addr);
                    return;
                };
                if let Err(e) = self
                    .lobby
                    .request_set_payload(participant_id, payload, sequence)
                {
                    warn!("Payload request from {} failed: {}", participant_id, e);
                }
            }

            Packet::Heartbeat => {
                if self.participants.write().await.touch(addr).is_none() {
                    debug!("Heartbeat from unknown address {}", addr);
                }
            }

            Packet::Leave => {
                let participant_id = self.participants.read().await.find_by_addr(addr);
                if let Some(participant_id) = participant_id {
                    self.disconnect(participant_id).await;
                }
            }

            _ => {
                warn!("Unexpected packet type from {}", addr);
            }
        }
    }

    /// Main server loop coordinating network events and lobby ticks
    pub async fn run(&mut self) -> ServerResult<()> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let mut tick_interval = interval(self.tick_duration);
        // The first tick completes immediately.
        tick_interval.tick().await;

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                            self.flush_outbound();
                        },
                        Some(ServerMessage::ParticipantTimeout { participant_id }) => {
                            self.lobby.leave(participant_id);
                            self.flush_outbound();
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    self.lobby_seconds += 1;
                    self.lobby.tick(self.lobby_seconds);
                    self.flush_outbound();
                    self.broadcast_snapshot();

                    debug!(
                        "Lobby second {}: {} ({}s), {} participant(s), {} ready",
                        self.lobby_seconds,
                        self.lobby.state(),
                        self.lobby.countdown(),
                        self.lobby.participant_count(),
                        self.lobby.ready_count()
                    );
                },
            }
        }

        for (participant_id, addr) in self.participants.read().await.addrs() {
            debug!("Notifying participant {} of shutdown", participant_id);
            let packet = Packet::Kicked {
                reason: "Server shutting down".to_string(),
            };
            if let Err(e) = Self::send_packet_impl(&self.socket, &packet, addr).await {
                warn!("Failed to notify {}: {}", addr, e);
            }
        }

        Ok(())
    }
}
