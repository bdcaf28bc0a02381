//! Weave signaling server: peer discovery rooms for `weave-collab` nodes.
//!
//! Relays `Join`/`PeerOffer`/`PeerAnswer`/`Leave` between the nodes
//! editing the same document. Document content never passes through it.

use clap::Parser;
use log::info;
use weave_collab::{SignalingConfig, SignalingServer};

#[derive(Parser)]
#[command(name = "weave-signal")]
#[command(about = "Signaling server for weave-collab peer discovery", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Maximum peers per document room
    #[arg(long, default_value_t = 100)]
    max_peers: usize,

    /// Signals buffered per room before slow peers lag
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,
}

impl From<Cli> for SignalingConfig {
    fn from(cli: Cli) -> Self {
        Self {
            bind_addr: cli.bind,
            max_peers_per_room: cli.max_peers,
            broadcast_capacity: cli.broadcast_capacity,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = SignalingConfig::from(Cli::parse());
    info!("Starting weave-signal on {}...", config.bind_addr);

    SignalingServer::new(config).run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_library_config() {
        let config = SignalingConfig::from(Cli::parse_from(["weave-signal"]));
        assert_eq!(config, SignalingConfig::default());
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "weave-signal",
            "--bind",
            "0.0.0.0:7000",
            "--max-peers",
            "8",
            "--broadcast-capacity",
            "32",
        ]);
        let config = SignalingConfig::from(cli);
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_peers_per_room, 8);
        assert_eq!(config.broadcast_capacity, 32);
    }
}
