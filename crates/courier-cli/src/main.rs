//! Courier command-line client.
//!
//! - `send` — submit a file to a remote endpoint and optionally wait for
//!   DELIVERED.
//! - `recv` — bind a local endpoint and write arriving bundles to a
//!   destination directory, relaying custody if configured.
//! - `status` — report counts of in-flight bundles and held custody records
//!   for a running node (best-effort; reads the local store directly).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use courier_core::config::CourierConfig;
use courier_core::ids::Endpoint;
use courier_transport::node::Node;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "courier", about = "Reliable disruption-tolerant file transfer")]
struct Cli {
    /// Path to a YAML config file. Defaults to ./courier.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a file to a remote endpoint.
    Send {
        /// host:port of the destination node.
        #[arg(long)]
        to: String,
        /// File to transfer.
        path: PathBuf,
        /// Enable block-XOR forward error correction.
        #[arg(long, default_value_t = false)]
        fec: bool,
        /// Block until the bundle is DELIVERED (or its TTL expires).
        #[arg(long, default_value_t = false)]
        wait: bool,
        /// Bundle TTL in seconds.
        #[arg(long)]
        ttl: Option<u64>,
        /// Chunk size in bytes.
        #[arg(long)]
        chunk: Option<usize>,
        /// Send window size in chunks.
        #[arg(long)]
        window: Option<usize>,
        /// Local port to bind (0 picks an ephemeral port).
        #[arg(long, default_value_t = 0)]
        port: u16,
    },
    /// Run as a receiver (and, if configured, a relay).
    Recv {
        /// Local port to bind.
        #[arg(long)]
        port: u16,
        /// Directory delivered files are written to, keyed by bundle_id.
        #[arg(long, default_value = "./received")]
        out_dir: PathBuf,
    },
    /// Report in-flight bundle and custody counts for a local node.
    Status {
        /// Local port the node is bound to.
        #[arg(long)]
        port: u16,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Send { to, path, fec, wait, ttl, chunk, window, port } => {
            run_send(config, to, path, fec, wait, ttl, chunk, window, port)
        }
        Command::Recv { port, out_dir } => run_recv(config, port, out_dir),
        Command::Status { port } => run_status(config, port),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CourierConfig> {
    let candidate = path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./courier.yaml"));
    if candidate.exists() {
        CourierConfig::load(&candidate).with_context(|| format!("loading config from {}", candidate.display()))
    } else {
        Ok(CourierConfig::default())
    }
}

#[allow(clippy::too_many_arguments)]
fn run_send(
    mut config: CourierConfig,
    to: String,
    path: PathBuf,
    fec: bool,
    wait: bool,
    ttl: Option<u64>,
    chunk: Option<usize>,
    window: Option<usize>,
    port: u16,
) -> anyhow::Result<()> {
    config.node.port = port;
    config.fec.enabled = fec || config.fec.enabled;
    if let Some(ttl_sec) = ttl {
        config.transfer.ttl_sec = ttl_sec;
    }
    if let Some(chunk_size) = chunk {
        config.transfer.chunk_size = chunk_size;
    }
    if let Some(window_size) = window {
        config.transfer.window_size = window_size;
    }

    let data = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    let store_path = store_path_for(&config);
    let mut node = Node::start(&config, &store_path).context("starting node")?;

    let bundle_id = node.submit(Endpoint(to.clone()), Bytes::from(data))?;
    tracing::info!(bundle_id = %bundle_id, to = %to, "submitted bundle");

    if wait {
        let deadline = Duration::from_secs(config.transfer.ttl_sec);
        let started = std::time::Instant::now();
        loop {
            node.tick()?;
            if node.is_bundle_delivered(&bundle_id) {
                tracing::info!(bundle_id = %bundle_id, "bundle delivered");
                break;
            }
            if started.elapsed() > deadline {
                anyhow::bail!("bundle {bundle_id} did not reach DELIVERED before its TTL elapsed");
            }
        }
    }
    Ok(())
}

fn run_recv(mut config: CourierConfig, port: u16, out_dir: PathBuf) -> anyhow::Result<()> {
    config.node.port = port;
    std::fs::create_dir_all(&out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let store_path = store_path_for(&config);
    let mut node = Node::start(&config, &store_path).context("starting node")?;
    node.set_out_dir(out_dir.clone());
    tracing::info!(port, out_dir = %out_dir.display(), "listening for inbound bundles");

    node.run();
}

fn run_status(mut config: CourierConfig, port: u16) -> anyhow::Result<()> {
    config.node.port = port;
    let store_path = store_path_for(&config);
    let node = Node::start(&config, &store_path).context("opening node store")?;

    println!("in_flight_bundles: {}", node.in_flight_bundle_count());
    println!("held_custody_records: {}", node.custody_record_count());
    let stats = serde_json::to_string_pretty(&node.stats())?;
    println!("{stats}");
    Ok(())
}

fn store_path_for(config: &CourierConfig) -> PathBuf {
    PathBuf::from(format!("./courier-{}.sqlite3", config.node.port))
}
