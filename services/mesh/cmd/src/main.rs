//! bitmesh node binary.
//!
//! Runs one mesh node. Links are in-process: with `--simulate N` the node is
//! joined by N simulated neighbours wired as a chain, so the far end of the
//! chain is only reachable through relays. Lines typed on stdin are sent as
//! chat messages.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mesh_delivery::TransportEvent;
use mesh_network::{MeshNetwork, NetworkConfig, StaticDiscovery};
use mesh_session::memory::MemoryHub;
use mesh_session::PeerDescriptor;
use mesh_storage::MemoryStore;
use mesh_wire::{ChatMessage, PeerId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
#[macro_use]
mod logging;

use config::NodeConfig;
use logging::MeshLogFormatter;

const LOCAL_ADDRESS: &str = "local";
const HUB_CAPACITY: usize = 256;

/// Mesh chat node
#[derive(Parser, Debug)]
#[command(name = "bitmesh", version, about = "Mesh chat node")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "bitmesh.yaml")]
    config: PathBuf,

    /// Nickname shown to other peers
    #[arg(long)]
    nickname: Option<String>,

    /// Local peer id (hex, right-padded to 16 characters)
    #[arg(long)]
    peer_id: Option<PeerId>,

    /// Hop limit for outgoing packets
    #[arg(long)]
    ttl: Option<u8>,

    /// Discovery scan interval, e.g. 5s
    #[arg(long)]
    scan_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Number of simulated neighbours chained behind this node
    #[arg(long, default_value_t = 0)]
    simulate: usize,
}

impl Args {
    /// Flags take precedence over file and environment
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(nickname) = &self.nickname {
            config.network.nickname = nickname.clone();
        }
        if let Some(peer_id) = self.peer_id {
            config.network.local_peer_id = Some(peer_id);
        }
        if let Some(ttl) = self.ttl {
            config.network.ttl = ttl;
        }
        if let Some(interval) = self.scan_interval {
            config.network.scan_interval_secs = interval.as_secs().max(1);
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

/// A line typed by the user
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Broadcast(String),
    Private(PeerId, String),
    Channel(String, String),
    Peers,
    Stats,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(Command::Broadcast(line.to_string())));
    }

    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let command = match verb {
        "/w" | "/msg" => {
            let (peer, text) = rest
                .split_once(' ')
                .ok_or_else(|| "usage: /w <peer> <text>".to_string())?;
            let peer = peer.parse::<PeerId>().map_err(|e| e.to_string())?;
            Command::Private(peer, text.trim().to_string())
        }
        "/c" | "/j" => {
            let (channel, text) = rest
                .split_once(' ')
                .ok_or_else(|| "usage: /c #channel <text>".to_string())?;
            if !channel.starts_with('#') {
                return Err(format!("channel names start with '#': {}", channel));
            }
            Command::Channel(channel.to_string(), text.trim().to_string())
        }
        "/peers" => Command::Peers,
        "/stats" => Command::Stats,
        "/quit" | "/q" => Command::Quit,
        other => return Err(format!("unknown command {}", other)),
    };
    Ok(Some(command))
}

fn sim_address(n: usize) -> String {
    format!("sim-{}", n)
}

/// Build a node registered on `hub` at `address` that discovers `neighbours`
fn build_node(
    hub: &MemoryHub,
    address: &str,
    config: NetworkConfig,
    neighbours: Vec<PeerDescriptor>,
) -> anyhow::Result<MeshNetwork> {
    let id = config.local_peer_id.unwrap_or_else(PeerId::random);
    let config = NetworkConfig {
        local_peer_id: Some(id),
        ..config
    };
    let inbound = hub.register(address, id, HUB_CAPACITY);
    let network = MeshNetwork::builder(config)
        .connector(Arc::new(hub.connector(id)))
        .inbound(inbound)
        .discovery(Arc::new(StaticDiscovery::new(neighbours)))
        .store(Arc::new(MemoryStore::new()))
        .build()
        .with_context(|| format!("failed to build node {}", address))?;
    Ok(network)
}

/// Start `count` simulated neighbours chained as local <-> sim-1 <-> ... <-> sim-N.
///
/// The first simulated node is at `sim_address(1)`.
async fn spawn_simulation(
    hub: &MemoryHub,
    base: &NetworkConfig,
    local: PeerDescriptor,
    count: usize,
) -> anyhow::Result<Vec<Arc<MeshNetwork>>> {
    let ids: Vec<PeerId> = (0..count).map(|_| PeerId::random()).collect();
    let mut nodes = Vec::with_capacity(count);

    for (i, id) in ids.iter().enumerate() {
        let mut neighbours = Vec::new();
        if i == 0 {
            neighbours.push(local.clone());
        } else {
            neighbours.push(PeerDescriptor::new(ids[i - 1], sim_address(i)));
        }
        if let Some(next) = ids.get(i + 1) {
            neighbours.push(PeerDescriptor::new(*next, sim_address(i + 2)));
        }

        let config = NetworkConfig {
            nickname: sim_address(i + 1),
            local_peer_id: Some(*id),
            metrics_enabled: false,
            ..base.clone()
        };
        let node = Arc::new(build_node(hub, &sim_address(i + 1), config, neighbours)?);

        let nickname = node.config().nickname.clone();
        let events = node.subscribe();
        tokio::spawn(echo_private(node.clone(), nickname, events));

        node.scan_now().await;
        node.start().await?;
        info!("simulated neighbour {} is {}", sim_address(i + 1), id);
        nodes.push(node);
    }
    Ok(nodes)
}

/// Answer private messages so the local user sees a round trip
async fn echo_private(
    node: Arc<MeshNetwork>,
    nickname: String,
    mut events: tokio::sync::broadcast::Receiver<TransportEvent>,
) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match events.recv().await {
            Ok(TransportEvent::MessageReceived { message, sender_id }) => {
                if message.recipient_id.is_none() {
                    continue;
                }
                let reply = format!(
                    "{} got your message: {}",
                    nickname,
                    message.text().unwrap_or("<binary>")
                );
                if let Err(e) = node.send_text(reply, Some(sender_id), None).await {
                    warn!("{} could not reply: {}", nickname, e);
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!("{} skipped {} events", nickname, skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_message(message: &ChatMessage, sender: PeerId) {
    let scope = match (&message.recipient_id, &message.channel) {
        (Some(_), _) => "private".to_string(),
        (None, Some(channel)) => channel.clone(),
        (None, None) => "all".to_string(),
    };
    println!(
        "[{}] <{}@{}> {}",
        scope,
        message.sender_nickname,
        sender.short(),
        message.text().unwrap_or("<binary>")
    );
}

async fn run_command(network: &MeshNetwork, command: Command) -> anyhow::Result<bool> {
    let sent = match command {
        Command::Broadcast(text) => network.send_text(text, None, None).await,
        Command::Private(peer, text) => network.send_text(text, Some(peer), None).await,
        Command::Channel(channel, text) => network.send_text(text, None, Some(channel)).await,
        Command::Peers => {
            for peer in network.peers() {
                println!("  {} at {}", peer.peer_id, peer.address);
            }
            return Ok(true);
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&network.get_stats().await)?);
            return Ok(true);
        }
        Command::Quit => return Ok(false),
    };
    match sent {
        Ok(id) => info!("queued message {}", id),
        Err(e) => warn!("message not queued: {}", e),
    }
    Ok(true)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = NodeConfig::load_from_file(&args.config)?;
    args.apply(&mut config);
    config.network.validate()?;

    let level = &config.logging.level;
    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("bitmesh={}", level).parse()?)
        .add_directive(format!("mesh_network={}", level).parse()?)
        .add_directive(format!("mesh_session={}", level).parse()?)
        .add_directive(format!("mesh_delivery={}", level).parse()?)
        .add_directive(format!("mesh_storage={}", level).parse()?)
        .add_directive(format!("mesh_wire={}", level).parse()?);
    let formatter = MeshLogFormatter::new("bitmesh", config.logging.color);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(formatter)
        .init();

    info!("Starting bitmesh node v{}", env!("CARGO_PKG_VERSION"));

    let hub = MemoryHub::new();
    let local_id = config.network.local_peer_id.unwrap_or_else(PeerId::random);
    config.network.local_peer_id = Some(local_id);

    let simulated = if args.simulate > 0 {
        let local = PeerDescriptor::new(local_id, LOCAL_ADDRESS);
        spawn_simulation(&hub, &config.network, local, args.simulate).await?
    } else {
        Vec::new()
    };

    let neighbours = simulated
        .first()
        .map(|first| vec![PeerDescriptor::new(first.local_peer_id(), sim_address(1))])
        .unwrap_or_default();
    let network = build_node(&hub, LOCAL_ADDRESS, config.network.clone(), neighbours)?;
    network.on_message_received(print_message).await;

    let mut events = network.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TransportEvent::MessageFailed { message_id, attempts, reason } => {
                    component_warn!("delivery", "message {} failed after {} attempts: {}", message_id, attempts, reason)
                }
                TransportEvent::PeerDiscovered { peer_id } => {
                    component_info!("discovery", "peer {} discovered", peer_id)
                }
                TransportEvent::PeerLost { peer_id } => {
                    component_info!("discovery", "peer {} lost", peer_id)
                }
                _ => {}
            }
        }
    });

    network.scan_now().await;
    network.start().await?;
    info!(
        "node {} ({}) ready; type a message, /w <peer> <text>, /c #channel <text>, /peers, /stats or /quit",
        config.network.nickname, local_id
    );
    for node in &simulated {
        println!("  {} -> {}", node.config().nickname, node.local_peer_id());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Ok(Some(command)) => {
                        if !run_command(&network, command).await? {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            }
        }
    }

    network.stop().await?;
    for node in &simulated {
        node.stop().await?;
    }
    println!("{}", serde_json::to_string_pretty(&network.get_stats().await)?);
    info!("bitmesh node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broadcast_and_blank() {
        assert_eq!(parse_command("   "), Ok(None));
        assert_eq!(
            parse_command("hello mesh"),
            Ok(Some(Command::Broadcast("hello mesh".to_string())))
        );
    }

    #[test]
    fn test_parse_private_and_channel() {
        assert_eq!(
            parse_command("/w 0a0b hi there"),
            Ok(Some(Command::Private(
                "0a0b000000000000".parse().unwrap(),
                "hi there".to_string()
            )))
        );
        assert_eq!(
            parse_command("/c #general good morning"),
            Ok(Some(Command::Channel(
                "#general".to_string(),
                "good morning".to_string()
            )))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("/w").is_err());
        assert!(parse_command("/w not-hex hi").is_err());
        assert!(parse_command("/c general hi").is_err());
        assert!(parse_command("/dance").is_err());
        assert_eq!(parse_command("/quit"), Ok(Some(Command::Quit)));
        assert_eq!(parse_command("/stats"), Ok(Some(Command::Stats)));
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "bitmesh",
            "--nickname",
            "carol",
            "--ttl",
            "3",
            "--scan-interval",
            "2s",
            "--log-level",
            "debug",
        ]);
        let mut config = NodeConfig::default();
        args.apply(&mut config);
        assert_eq!(config.network.nickname, "carol");
        assert_eq!(config.network.ttl, 3);
        assert_eq!(config.network.scan_interval_secs, 2);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(args.simulate, 0);
    }
}
