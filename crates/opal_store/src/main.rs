// Opal node binary: wires the storage engine, slot router, migration
// worker, and the Redis-protocol frontend together.

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use opal_store::cluster::ClusterRouter;
use opal_store::config::{MigrateConfig, MigrationType};
use opal_store::engine::SlotEngine;
use opal_store::redis_server::{self, NodeContext};
use opal_store::slot_migrate::SlotMigrator;

#[derive(Parser, Debug)]
#[command(name = "opal-store", about = "Redis-compatible clustered KV node")]
struct NodeArgs {
    /// Identifier announced for this node in the cluster.
    #[arg(long, default_value = "opal-node-1")]
    node_id: String,

    /// Redis protocol listen address.
    #[arg(long, default_value = "127.0.0.1:6666")]
    listen_redis: SocketAddr,

    /// Storage directory for the fjall keyspace.
    #[arg(long)]
    data_dir: PathBuf,

    /// Slot migration wire mode.
    #[arg(long, value_enum, default_value = "redis-command")]
    migrate_type: MigrationType,

    /// Command-mode migration rate limit in commands/s (0 disables).
    #[arg(long, default_value_t = 4096)]
    migrate_speed: u64,

    /// Commands pipelined between reply checks.
    #[arg(long, default_value_t = 16)]
    pipeline_size: u64,

    /// WAL catch-up stops once the gap is at most this many sequences.
    #[arg(long, default_value_t = 10_000)]
    sequence_gap: u64,

    /// Raw-KV batch flush threshold in KiB.
    #[arg(long, default_value_t = 16)]
    migrate_batch_size_kb: u64,

    /// Raw-KV rate limit in MiB/s (0 disables).
    #[arg(long, default_value_t = 16)]
    migrate_batch_rate_limit_mb: u64,

    /// Password sent as AUTH to migration destinations.
    #[arg(long)]
    requirepass: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = NodeArgs::parse();

    let config = MigrateConfig {
        migration_type: args.migrate_type,
        max_migration_speed: args.migrate_speed,
        max_pipeline_size: args.pipeline_size,
        sequence_gap_limit: args.sequence_gap,
        migrate_batch_size_kb: args.migrate_batch_size_kb,
        migrate_batch_rate_limit_mb: args.migrate_batch_rate_limit_mb,
        dst_password: args.requirepass.clone(),
    }
    .with_env_overrides();

    let engine = Arc::new(SlotEngine::open(&args.data_dir)?);
    let cluster = Arc::new(ClusterRouter::new(
        args.node_id.clone(),
        args.listen_redis.to_string(),
    ));
    let migrator = Arc::new(SlotMigrator::start(
        Arc::clone(&engine),
        Arc::clone(&cluster),
        config,
    )?);

    tracing::info!(
        node_id = %args.node_id,
        data_dir = %args.data_dir.display(),
        "opal node starting"
    );

    let ctx = Arc::new(NodeContext {
        engine: Arc::clone(&engine),
        cluster,
        migrator,
    });
    let serve = redis_server::run(args.listen_redis, ctx);
    tokio::select! {
        result = serve => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            engine.persist()?;
        }
    }
    Ok(())
}
