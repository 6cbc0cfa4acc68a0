//! Run one raft node over tcp with file-backed state.
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin raft-node -- \
//!   --id 1 --listen 127.0.0.1:7101 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! # Terminals 2 and 3: same peers, --id 2 / --id 3 and their own --listen
//! ```
//!
//! Every line typed on stdin is proposed as a command. `status` prints the
//! node's view of the cluster instead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use raft_core::{LogIndex, NodeId, RaftConfig, RaftError};
use raft_runtime::{serve, spawn_node, Applier, NodeHandle, TcpTransport};
use raft_storage::FileStorage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a raft consensus node")]
struct Args {
    /// Numeric node ID (must match one entry in --peer)
    #[arg(long)]
    id: NodeId,

    /// Address to accept peer connections on, e.g. 127.0.0.1:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    listen: SocketAddr,

    /// Comma-separated peer map: id=addr,id=addr,... (must include self)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,

    /// Directory holding this node's persisted state
    #[arg(long, default_value = "raft-data", value_hint = ValueHint::DirPath)]
    data_dir: PathBuf,

    /// Optional JSON file with timing overrides
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
}

/// Logs every committed command and echoes it back to the proposer
struct EchoApplier {
    node: NodeId,
}

impl Applier for EchoApplier {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Vec<u8> {
        info!(node = self.node, index, command = %String::from_utf8_lossy(command), "applied");
        command.to_vec()
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = load_config(args.config.as_ref())?;
    let peers = parse_peers(&args.peer)?;
    let mut members: Vec<NodeId> = peers.keys().copied().collect();
    members.sort_unstable();

    let storage = FileStorage::new(args.data_dir.join(format!("node-{}", args.id)))
        .context("failed to open data directory")?;
    let transport = TcpTransport::new(peers.into_iter().filter(|(id, _)| *id != args.id));
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;

    let node = spawn_node(
        args.id,
        members,
        config,
        storage,
        Arc::new(transport),
        EchoApplier { node: args.id },
    )
    .context("failed to start node")?;

    let server = tokio::spawn(serve(listener, node.clone()));

    tokio::select! {
        result = read_proposals(&node) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    node.shutdown();
    server.await.context("server task panicked")??;
    Ok(())
}

async fn read_proposals(node: &NodeHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "status" {
            println!("{:?}", node.status());
            continue;
        }
        match node.propose(line.as_bytes().to_vec()).await {
            Ok(proposal) => {
                println!("committed at index {} term {}", proposal.index, proposal.term)
            }
            Err(RaftError::NotLeader { leader_id: Some(leader) }) => {
                println!("not the leader, try node {leader}")
            }
            Err(err) => println!("proposal failed: {err}"),
        }
    }
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<RaftConfig> {
    let Some(path) = path else {
        return Ok(RaftConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: RaftConfig = serde_json::from_str(&raw)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

fn parse_peers(entries: &[String]) -> Result<HashMap<NodeId, SocketAddr>> {
    let mut peers = HashMap::new();
    for entry in entries {
        let Some((id_str, addr)) = entry.split_once('=') else {
            return Err(anyhow::anyhow!(
                "invalid peer entry '{entry}', expected id=addr"
            ));
        };
        let id: NodeId = id_str
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid peer address in '{entry}'"))?;
        peers.insert(id, addr);
    }
    if peers.is_empty() {
        return Err(anyhow::anyhow!(
            "at least one --peer entry is required (include self)"
        ));
    }
    Ok(peers)
}
