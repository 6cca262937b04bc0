use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use tessera_consensus::{RaftNode, RaftSettings, ReplicaNode};
use tessera_server::{leader_locator, serve_cluster, ClusterClient, SequenceGrantor, Store};
use tessera_storage::{KvStore, StableStore};
use tessera_types::NodeId;
use tessera_wire::{Mux, MuxConfig, MuxListener, Protocol};

#[derive(clap::Parser, Debug)]
#[command(name = "tessera-node", about = "Tessera replicated catalog store node")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    node_id: Option<u64>,
    #[arg(long)]
    listen_addr: Option<String>,
    /// Address other members use to reach this node
    #[arg(long)]
    advertise_addr: Option<String>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Form a new single-voter cluster
    #[arg(long)]
    bootstrap: bool,
    /// Any existing member to join through
    #[arg(long)]
    join: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeConfig {
    id: Option<u64>,
    listen_addr: String,
    advertise_addr: String,
    data_dir: PathBuf,
    bootstrap: bool,
    join: String,
}

#[derive(Debug, Deserialize)]
struct RaftConfig {
    heartbeat_interval_ms: u64,
    election_timeout_min_ms: u64,
    election_timeout_max_ms: u64,
    snapshot_threshold: u64,
    logs_to_keep: u64,
}

#[derive(Debug, Deserialize)]
struct ClusterConfig {
    request_timeout_ms: u64,
    sequence_partitions: u64,
}

#[derive(Debug, Deserialize)]
struct WireConfig {
    max_frame_bytes: usize,
    startup_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    node: NodeConfig,
    raft: RaftConfig,
    cluster: ClusterConfig,
    wire: WireConfig,
    observability: ObservabilityConfig,
}

impl Config {
    fn load(cli: &Cli) -> anyhow::Result<Config> {
        let mut figment = Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));

        if let Some(ref config_path) = cli.config {
            figment = figment.merge(Toml::file_exact(config_path));
        }

        let mut config: Config = figment
            .merge(Env::prefixed("TESSERA_").split("__"))
            .extract()
            .context("failed to load configuration")?;

        // Flags win over files and environment.
        if cli.node_id.is_some() {
            config.node.id = cli.node_id;
        }
        if let Some(ref addr) = cli.listen_addr {
            config.node.listen_addr = addr.clone();
        }
        if let Some(ref addr) = cli.advertise_addr {
            config.node.advertise_addr = addr.clone();
        }
        if let Some(ref dir) = cli.data_dir {
            config.node.data_dir = dir.clone();
        }
        if cli.bootstrap {
            config.node.bootstrap = true;
        }
        if let Some(ref join) = cli.join {
            config.node.join = join.clone();
        }
        Ok(config)
    }

    fn raft_settings(&self) -> RaftSettings {
        RaftSettings {
            heartbeat_interval: Duration::from_millis(self.raft.heartbeat_interval_ms),
            election_timeout_min: Duration::from_millis(self.raft.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.raft.election_timeout_max_ms),
            snapshot_threshold: self.raft.snapshot_threshold,
            logs_to_keep: self.raft.logs_to_keep,
            request_timeout: self.request_timeout(),
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.request_timeout_ms)
    }

    fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            max_frame_bytes: self.wire.max_frame_bytes,
            startup_timeout: Duration::from_millis(self.wire.startup_timeout_ms),
        }
    }

    fn join_seed(&self) -> Option<String> {
        (!self.node.join.is_empty()).then(|| self.node.join.clone())
    }
}

/// Reconcile the configured id with the one persisted by an earlier run.
/// `None` means the cluster has to assign one.
fn pick_node_id(configured: Option<NodeId>, persisted: Option<NodeId>) -> anyhow::Result<Option<NodeId>> {
    match (configured, persisted) {
        (Some(0), _) => anyhow::bail!("node.id must be non-zero"),
        (Some(id), Some(stored)) if id != stored => {
            anyhow::bail!("node.id {id} does not match id {stored} stored in the data directory")
        }
        (Some(id), _) => Ok(Some(id)),
        (None, stored) => Ok(stored),
    }
}

async fn resolve_node_id(config: &Config, stable: &StableStore) -> anyhow::Result<NodeId> {
    let persisted = stable.node_id().await.context("reading stored node id")?;
    let id = match pick_node_id(config.node.id, persisted)? {
        Some(id) => id,
        None => {
            let seed = config
                .join_seed()
                .context("node.id is unset and there is no node.join address to request one from")?;
            tracing::info!(%seed, "requesting node id from cluster");
            ClusterClient::new(Some(seed), config.mux_config(), config.request_timeout())
                .get_node_id()
                .await
                .context("requesting node id")?
        }
    };
    if persisted != Some(id) {
        stable.set_node_id(id).await.context("persisting node id")?;
    }
    Ok(id)
}

/// Without a query layer attached, client-protocol connections are turned
/// away with an error frame.
async fn reject_clients(mut listener: MuxListener) {
    while let Ok(accepted) = listener.accept().await {
        let peer_addr = accepted.peer_addr;
        if let Err(e) = accepted.conn.reject("no query layer is attached to this node").await {
            tracing::debug!(%peer_addr, error = %e, "client rejection failed");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    let log_format = config.observability.log_format.as_str();
    match log_format {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    std::fs::create_dir_all(&config.node.data_dir)
        .with_context(|| format!("creating data dir {}", config.node.data_dir.display()))?;
    let kv = KvStore::open(&config.node.data_dir)
        .with_context(|| format!("opening store in {}", config.node.data_dir.display()))?;
    let node_id = resolve_node_id(&config, &StableStore::new(kv.clone())).await?;

    tracing::info!(
        node_id,
        listen_addr = %config.node.listen_addr,
        advertise_addr = %config.node.advertise_addr,
        "node starting"
    );

    let mux_config = config.mux_config();
    let mut mux = Mux::bind(&config.node.listen_addr, mux_config.clone())
        .await
        .with_context(|| format!("binding {}", config.node.listen_addr))?;
    let peers = mux.listener(Protocol::Peer);
    let internal = mux.listener(Protocol::InternalRpc);
    let clients = mux.listener(Protocol::Client);
    let mux_task = tokio::spawn(mux.serve());

    let node = Arc::new(
        ReplicaNode::start(node_id, config.raft_settings(), kv, peers, mux_config.clone())
            .await
            .context("starting raft node")?,
    );
    let grantor = Arc::new(
        SequenceGrantor::new(node.clone(), config.cluster.sequence_partitions)
            .context("invalid cluster.sequence_partitions")?,
    );
    tokio::spawn(serve_cluster(internal, node.clone(), grantor.clone()));
    tokio::spawn(reject_clients(clients));

    let client = ClusterClient::new(config.join_seed(), mux_config, config.request_timeout())
        .with_locator(leader_locator(node.clone()));
    let store = Store::new(node.clone(), grantor, Arc::new(client));

    if config.node.bootstrap {
        node.initialize(&config.node.advertise_addr).await.context("bootstrapping cluster")?;
    } else if config.join_seed().is_some() {
        store
            .join(node_id, &config.node.advertise_addr)
            .await
            .context("joining cluster")?;
    }

    match node.wait_for_leader(config.request_timeout()).await {
        Ok(leader) => tracing::info!(node_id, leader, is_leader = node.is_leader(), "node ready"),
        Err(e) => tracing::warn!(node_id, error = %e, "no leader yet"),
    }

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!(node_id, "shutting down");
    node.shutdown().await.context("stopping raft node")?;
    mux_task.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn configured_id_must_match_stored_one() {
        assert_eq!(pick_node_id(Some(3), None).unwrap(), Some(3));
        assert_eq!(pick_node_id(Some(3), Some(3)).unwrap(), Some(3));
        assert_eq!(pick_node_id(None, Some(9)).unwrap(), Some(9));
        assert_eq!(pick_node_id(None, None).unwrap(), None);
        assert!(pick_node_id(Some(3), Some(4)).is_err());
        assert!(pick_node_id(Some(0), None).is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "tessera-node",
            "--node-id",
            "7",
            "--listen-addr",
            "127.0.0.1:6000",
            "--join",
            "10.0.0.1:5432",
        ]);
        let config = Config::load(&cli).unwrap();
        assert_eq!(config.node.id, Some(7));
        assert_eq!(config.node.listen_addr, "127.0.0.1:6000");
        assert_eq!(config.join_seed().as_deref(), Some("10.0.0.1:5432"));
        assert!(!config.node.bootstrap);
        assert_eq!(config.raft_settings().snapshot_threshold, 10_000);
        assert_eq!(config.mux_config().startup_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stored_id_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path()).unwrap();
        let stable = StableStore::new(kv);
        let cli = Cli::parse_from(["tessera-node", "--node-id", "5"]);
        let config = Config::load(&cli).unwrap();
        assert_eq!(resolve_node_id(&config, &stable).await.unwrap(), 5);

        let cli = Cli::parse_from(["tessera-node"]);
        let config = Config::load(&cli).unwrap();
        assert_eq!(resolve_node_id(&config, &stable).await.unwrap(), 5);
    }
}
