//! # Lobby Client Library
//!
//! Observer side of the lobby. The client mirrors the authority's lobby state
//! and participant records, and lets the local participant change its own
//! ready flag and payload.
//!
//! ## Optimistic Requests
//! Local changes are applied to the local copy at once and sent to the
//! authority as sequenced requests. Authority updates carry the highest
//! sequence processed per field; until that catches up with the latest
//! request, the local copy is kept. Unacknowledged requests are resent with
//! every heartbeat.
//!
//! ## Module Organization
//!
//! - `replica`: the mirrored lobby, reconciliation and local slot placement
//! - `input`: console command parsing
//! - `network`: UDP transport, heartbeat and the console loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut client = Client::new("127.0.0.1:8080", 0, Some(vec![1, 2, 3])).await?;
//!     client.run().await
//! }
//! ```

pub mod input;
pub mod network;
pub mod replica;
