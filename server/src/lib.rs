//! # Lobby Server Library
//!
//! Authoritative side of the lobby. The server owns the canonical lobby state
//! and every participant record, evaluates the lobby state machine once per
//! lobby second and replicates changes to every connected participant.
//!
//! ## Architecture
//!
//! ### Single-Threaded Event Loop
//! All lobby mutations happen on one loop: inbound requests, timeouts and
//! ticks are serialized through `tokio::select!`, so the state machine needs
//! no locking. Network receive, send and timeout checks run as separate tasks
//! that talk to the loop over channels.
//!
//! ### Replication
//! Lobby state, countdown and participant records are `ReplicatedField`s.
//! After each event the loop drains the pending deliveries and stamps each
//! packet with a monotonically increasing revision so observers can discard
//! stale updates that UDP delivered out of order. A full snapshot goes out
//! every tick to heal losses.
//!
//! ## Module Organization
//!
//! - `config`: lobby tuning and its self-correcting validation
//! - `collaborators`: match-start gate and session advertisement seams
//! - `lobby`: the state machine and participant records
//! - `participant_manager`: address bookkeeping and timeouts
//! - `network`: UDP transport and the main loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::LobbyConfig;
//! use server::lobby::LobbyStateMachine;
//! use server::network::Server;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let lobby = LobbyStateMachine::from_config(LobbyConfig::default());
//!     let mut server = Server::new("127.0.0.1:8080", Duration::from_secs(1), lobby).await?;
//!     server.run().await
//! }
//! ```

pub mod collaborators;
pub mod config;
pub mod lobby;
pub mod network;
pub mod participant_manager;
