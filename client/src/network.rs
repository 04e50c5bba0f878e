use crate::input::Command;
use crate::replica::ReplicaLobby;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use std::error::Error;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep};

pub type ClientResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    connected: bool,
    replica: ReplicaLobby,
    fake_ping_ms: u64,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        fake_ping_ms: u64,
        initial_payload: Option<Vec<i32>>,
    ) -> ClientResult<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        let mut replica = ReplicaLobby::new();
        if let Some(payload) = initial_payload {
            replica = replica.with_initial_payload(payload);
        }
        Self::log_lobby_events(&mut replica);

        Ok(Client {
            socket,
            server_addr,
            connected: false,
            replica,
            fake_ping_ms,
        })
    }

    fn log_lobby_events(replica: &mut ReplicaLobby) {
        let n = &mut replica.notifications;
        n.lobby_updated.subscribe(|(state, countdown)| {
            if state.is_counting_down() {
                info!("Lobby: {} ({}s)", state, countdown);
            } else {
                info!("Lobby: {}", state);
            }
        });
        n.participant_joined
            .subscribe(|id| info!("Participant {} joined", id));
        n.participant_left
            .subscribe(|id| info!("Participant {} left", id));
        n.ready_changed.subscribe(|(id, ready)| {
            info!(
                "Participant {} is {}",
                id,
                if *ready { "ready" } else { "not ready" }
            )
        });
        n.payload_changed
            .subscribe(|(id, payload)| info!("Participant {} payload: {:?}", id, payload));
    }

    pub fn replica(&self) -> &ReplicaLobby {
        &self.replica
    }

    async fn connect(&mut self) -> ClientResult<()> {
        info!("Joining lobby at {}...", self.server_addr);
        self.send_packet(&Packet::Join {
            client_version: PROTOCOL_VERSION,
        })
        .await
    }

    async fn send_packet(&self, packet: &Packet) -> ClientResult<()> {
        if self.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
        }

        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    async fn send_all(&self, packets: Vec<Packet>) {
        for packet in packets {
            if let Err(e) = self.send_packet(&packet).await {
                error!("Error sending packet: {}", e);
            }
        }
    }

    /// Applies a packet from the server. Returns false once the server has
    /// turned us away.
    async fn handle_packet(&mut self, packet: Packet) -> bool {
        let keep_running = match &packet {
            Packet::Welcome { participant_id, .. } => {
                info!("Joined! Participant ID: {}", participant_id);
                self.connected = true;
                true
            }
            Packet::Rejected { .. } | Packet::Kicked { .. } => {
                self.connected = false;
                false
            }
            _ => true,
        };

        let responses = self.replica.apply_packet(packet);
        self.send_all(responses).await;
        keep_running
    }

    /// Applies a console command. Returns false when the client should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        let request = match command {
            Command::Ready => self.replica.request_set_ready(true),
            Command::Unready => self.replica.request_set_ready(false),
            Command::Toggle => self.replica.request_toggle_ready(),
            Command::Payload(payload) => self.replica.request_set_payload(payload),
            Command::Status => {
                self.print_status();
                None
            }
            Command::Help => {
                println!("{}", Command::usage());
                None
            }
            Command::Quit => return false,
        };

        if let Some(packet) = request {
            self.send_all(vec![packet]).await;
        }
        true
    }

    fn print_status(&self) {
        let replica = &self.replica;
        println!(
            "{} ({}s), {}/{} ready",
            replica.state(),
            replica.countdown(),
            replica.ready_count(),
            replica.participant_count()
        );
        for id in replica.participant_ids() {
            if let Some(participant) = replica.participant(id) {
                println!(
                    "  {}{} ready={} payload={:?} slot={:?}",
                    id,
                    if Some(id) == replica.own_id() { " (you)" } else { "" },
                    participant.is_ready(),
                    participant.payload(),
                    participant.slot()
                );
            }
        }
    }

    pub async fn run(&mut self) -> ClientResult<()> {
        self.connect().await?;

        let mut synchronized = self.replica.synchronized();
        let mut awaiting_sync = true;
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        let mut buffer = [0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) if addr == self.server_addr => {
                            if self.fake_ping_ms > 0 {
                                sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
                            }

                            match deserialize::<Packet>(&buffer[..len]) {
                                Ok(packet) => {
                                    if !self.handle_packet(packet).await {
                                        break;
                                    }
                                }
                                Err(e) => warn!("Failed to deserialize packet: {}", e),
                            }
                        },
                        Ok((_, addr)) => debug!("Ignoring packet from {}", addr),
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = heartbeat.tick() => {
                    self.replica.tick();
                    if self.connected {
                        let mut packets = vec![Packet::Heartbeat];
                        packets.extend(self.replica.pending_requests());
                        self.send_all(packets).await;
                    } else {
                        // Welcome lost or never sent.
                        self.connect().await?;
                    }
                },

                result = &mut synchronized, if awaiting_sync => {
                    awaiting_sync = false;
                    if let Ok(id) = result {
                        info!("Synchronized as participant {}. {}", id, Command::usage());
                    }
                },

                line = lines.next_line(), if stdin_open => {
                    match line {
                        Ok(Some(line)) => match Command::parse(&line) {
                            Ok(command) => {
                                if !self.handle_command(command).await {
                                    break;
                                }
                            }
                            Err(e) => warn!("{}", e),
                        },
                        Ok(None) => stdin_open = false,
                        Err(e) => {
                            error!("Error reading input: {}", e);
                            stdin_open = false;
                        }
                    }
                },
            }
        }

        if self.connected {
            let _ = self.send_packet(&Packet::Leave).await;
        }

        Ok(())
    }
}
