//! Entry point for `mesh-overlay`.
//!
//! Parses CLI arguments and dispatches into either **peer** or **route** mode.
//! All protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, argument parsing, stdin/stdout plumbing).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use mesh_overlay::{
    ConnError, ConnectionConfig, ConnectionGraph, ConnectionSession, LossyChannel,
    ReliableConnection, SimulatorConfig, UdpChannel,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Reliable peer channels and next-hop routing for an overlay mesh.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Talk to one peer over UDP: stdin lines out, delivered messages to stdout.
    Peer {
        /// Local address to bind (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        bind: SocketAddr,
        /// Peer address (e.g. 127.0.0.1:9001).
        #[arg(short, long)]
        peer: SocketAddr,
        /// Node id stamped on outgoing messages; defaults to the bind address.
        #[arg(long)]
        id: Option<String>,
        #[command(flatten)]
        tuning: Tuning,
        #[command(flatten)]
        faults: Faults,
    },
    /// Print the routing table for a graph given as `a-b` edges.
    Route {
        /// Address the tree is rooted at.
        #[arg(short, long)]
        root: String,
        /// Undirected edges, e.g. `a-b b-c`.
        edges: Vec<String>,
    },
}

#[derive(Args)]
struct Tuning {
    /// Sliding window size.
    #[arg(long, default_value_t = mesh_overlay::config::DEFAULT_WINDOW_SIZE)]
    window_size: usize,
    /// Largest message index before the sequence wraps to 0.
    #[arg(long, default_value_t = mesh_overlay::config::DEFAULT_MAX_MESSAGE_INDEX)]
    max_message_index: u64,
    /// Retransmission interval in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    retransmit_ms: u64,
}

/// Optional fault injection on the outbound path.
#[derive(Args)]
struct Faults {
    #[arg(long, default_value_t = 0.0)]
    loss: f64,
    #[arg(long, default_value_t = 0.0)]
    duplicate: f64,
    #[arg(long, default_value_t = 0.0)]
    reorder: f64,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Peer {
            bind,
            peer,
            id,
            tuning,
            faults,
        } => run_peer(bind, peer, id, tuning, faults).await,
        Mode::Route { root, edges } => print_routes(root, &edges),
    }
}

async fn run_peer(
    bind: SocketAddr,
    peer: SocketAddr,
    id: Option<String>,
    tuning: Tuning,
    faults: Faults,
) -> Result<()> {
    let config = ConnectionConfig::default()
        .with_window_size(tuning.window_size)
        .with_max_message_index(tuning.max_message_index)
        .with_retransmit_interval(Duration::from_millis(tuning.retransmit_ms));
    config.validate().context("invalid connection settings")?;

    let (udp, events) = UdpChannel::bind(bind, peer)
        .await
        .with_context(|| format!("binding {bind}"))?;
    let local = id.unwrap_or_else(|| bind.to_string());
    log::info!("Peer {local} on {} talking to {peer}", udp.local_addr()?);

    let channel = LossyChannel::new(
        udp,
        SimulatorConfig {
            loss_rate: faults.loss,
            duplicate_rate: faults.duplicate,
            reorder_rate: faults.reorder,
            seed: faults.seed,
        },
    );
    let mut session = ReliableConnection::new(local, peer.to_string(), channel, config)?.run(events);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line.context("reading stdin")? {
                    Some(line) => send_line(&session, line).await?,
                    None => {
                        log::info!("stdin closed; still receiving (Ctrl-C to quit)");
                        stdin_open = false;
                    }
                }
            }
            delivered = session.recv() => match delivered {
                Ok(message) => println!("{}: {}", message.uid.source_node_uuid, display(&message.body)),
                Err(ConnError::Channel(e)) => log::warn!("channel error: {e}"),
                Err(e) => {
                    log::info!("session ended: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close().await;
    Ok(())
}

/// Send one line, retrying while the window is full.
async fn send_line(session: &ConnectionSession, line: String) -> Result<()> {
    let body = Value::String(line);
    while !session.send_data(body.clone()).await? {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

fn display(body: &Value) -> String {
    match body {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_routes(root: String, edges: &[String]) -> Result<()> {
    let mut graph = ConnectionGraph::new(root);
    for edge in edges {
        let Some((a, b)) = edge.split_once('-') else {
            bail!("edge {edge:?} is not of the form a-b");
        };
        if a.is_empty() || b.is_empty() {
            bail!("edge {edge:?} has an empty endpoint");
        }
        graph.add_connection(a, b);
    }

    let table = graph.make_routing_table();
    if table.is_empty() {
        println!("{}: no reachable destinations", graph.address());
    }
    for (destination, next_hop) in &table {
        println!("{destination} -> {next_hop}");
    }
    Ok(())
}
