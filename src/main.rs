use clap::Parser;
use shardis::sync::StreamErrorPolicy;
use shardis::{Config, ReplicationCluster, ShardedStore, SyncServer, SyncSlave};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardis")]
#[command(about = "Shardis - a sharded key-value proxy with binlog replication", long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "shardis.toml")]
    config: String,

    /// Data directory path (overrides the config file)
    #[arg(long)]
    work_dir: Option<String>,

    /// Sync listener port (overrides the config file)
    #[arg(long)]
    sync_port: Option<u16>,

    /// Replicate from this master, e.g. --master 10.0.0.5:6380
    /// (overrides the config file)
    #[arg(long)]
    master: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardis=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut cfg = Config::load_or_default(&args.config)?;
    if let Some(work_dir) = args.work_dir {
        cfg.work_dir = work_dir;
    }
    if let Some(port) = args.sync_port {
        cfg.sync_port = port;
    }
    if let Some(master) = args.master {
        let (host, port) = master
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("--master expects host:port, got '{}'", master))?;
        let mut section = cfg.master.take().unwrap_or_default();
        section.host = host.to_string();
        section.port = port.parse()?;
        cfg.master = Some(section);
    }
    cfg.validate()?;

    let work_dir = Path::new(&cfg.work_dir);
    let store = Arc::new(ShardedStore::open(
        work_dir.join("store"),
        cfg.shard_count,
        cfg.sync_writes,
    )?);
    tracing::info!(
        "Store open: {} shards under {}",
        cfg.shard_count,
        work_dir.display()
    );

    let cluster = Arc::new(ReplicationCluster::start(
        store.clone(),
        work_dir,
        &cfg.binlog,
    ));
    if !cluster.binlog_enabled() {
        tracing::warn!("running without a binlog; slaves cannot catch up from this node");
    }

    let server = SyncServer::start(cluster.clone(), ("0.0.0.0", cfg.sync_port))?;

    let _slave = match &cfg.master {
        Some(master) => {
            let slave = SyncSlave::new(
                store.clone(),
                format!("{}:{}", master.host, master.port),
                work_dir,
            )
            .with_intervals(
                Duration::from_millis(master.sync_interval_ms),
                Duration::from_millis(master.reconnect_interval_ms),
            )
            .with_policy(StreamErrorPolicy::Halt);
            Some(slave.start()?)
        }
        None => None,
    };

    server.join();
    Ok(())
}
