use clap::Parser;
use log::info;
use server::config::LobbyConfig;
use server::lobby::LobbyStateMachine;
use server::network::Server;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Participants needed before the countdown begins
    #[arg(short = 'r', long, default_value = "2")]
    required: usize,

    /// Maximum participants in the lobby
    #[arg(short = 'm', long, default_value = "8")]
    max_participants: usize,

    /// Placement slots per side
    #[arg(long, default_value = "8")]
    slot_pool: usize,

    /// Longest payload a participant may publish
    #[arg(long, default_value_t = shared::MAX_PAYLOAD_LEN)]
    max_payload: usize,

    /// Seconds to wait for everyone to ready up
    #[arg(short = 'c', long, default_value = "60")]
    countdown: u32,

    /// Final countdown length; reaching it forces everyone ready
    #[arg(short = 'f', long, default_value = "5")]
    final_countdown: u32,

    /// Only start the final countdown once everyone is ready
    #[arg(long)]
    wait_for_ready: bool,

    /// Length of one lobby second in milliseconds
    #[arg(long, default_value = "1000")]
    tick_ms: u64,

    /// Drop participants silent for this many seconds
    #[arg(long, default_value = "5")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = LobbyConfig {
        required_participants: args.required,
        max_participants: args.max_participants,
        slot_pool: args.slot_pool,
        max_payload_len: args.max_payload,
        lobby_countdown_time: args.countdown,
        final_countdown_threshold: args.final_countdown,
        countdown_only_if_everyone_ready: args.wait_for_ready,
    }
    .validate();

    info!("Starting lobby server...");
    info!("{:?}", config);

    let address = format!("{}:{}", args.host, args.port);
    let lobby = LobbyStateMachine::from_config(config);
    let mut server = Server::new(&address, Duration::from_millis(args.tick_ms), lobby)
        .await?
        .with_timeout(Duration::from_secs(args.timeout));

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
