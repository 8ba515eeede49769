//! Runtime configuration for the migration core.

use std::env;
use std::str::FromStr;

/// Wire mode used to move a slot's contents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum MigrationType {
    /// Replay the slot as high-level redis commands.
    #[default]
    #[value(name = "redis-command")]
    RedisCommand,
    /// Ship raw key/value batches into the destination engine.
    #[value(name = "raw-key-value")]
    RawKeyValue,
}

impl FromStr for MigrationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis-command" => Ok(Self::RedisCommand),
            "raw-key-value" => Ok(Self::RawKeyValue),
            other => anyhow::bail!("unsupported migration type {other:?}"),
        }
    }
}

/// Tunables consumed by the slot migrator. The batch knobs are re-read at
/// every raw-KV flush so they can change while a job is running.
#[derive(Clone, Debug)]
pub struct MigrateConfig {
    pub migration_type: MigrationType,
    /// Command-mode rate limit in commands per second; 0 disables.
    pub max_migration_speed: u64,
    /// Commands sent between two rounds of reply counting.
    pub max_pipeline_size: u64,
    /// WAL catch-up exits once the remaining gap is at most this.
    pub sequence_gap_limit: u64,
    /// Raw-KV batch flush threshold in kilobytes.
    pub migrate_batch_size_kb: u64,
    /// Raw-KV rate limit in megabytes per second; 0 disables.
    pub migrate_batch_rate_limit_mb: u64,
    /// Password sent as AUTH to the destination, when set.
    pub dst_password: Option<String>,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            migration_type: MigrationType::RedisCommand,
            max_migration_speed: 4096,
            max_pipeline_size: 16,
            sequence_gap_limit: 10_000,
            migrate_batch_size_kb: 16,
            migrate_batch_rate_limit_mb: 16,
            dst_password: None,
        }
    }
}

impl MigrateConfig {
    /// Applies `OPAL_MIGRATE_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        self.max_migration_speed = read_env_u64("OPAL_MIGRATE_SPEED", self.max_migration_speed);
        self.max_pipeline_size =
            read_env_u64("OPAL_MIGRATE_PIPELINE_SIZE", self.max_pipeline_size);
        self.sequence_gap_limit =
            read_env_u64("OPAL_MIGRATE_SEQUENCE_GAP", self.sequence_gap_limit);
        self.migrate_batch_size_kb =
            read_env_u64("OPAL_MIGRATE_BATCH_SIZE_KB", self.migrate_batch_size_kb);
        self.migrate_batch_rate_limit_mb = read_env_u64(
            "OPAL_MIGRATE_BATCH_RATE_LIMIT_MB",
            self.migrate_batch_rate_limit_mb,
        );
        if let Ok(ty) = env::var("OPAL_MIGRATE_TYPE") {
            if let Ok(parsed) = ty.parse() {
                self.migration_type = parsed;
            }
        }
        self
    }

    /// Pipeline size with the zero/negative-config fallback applied.
    pub fn effective_pipeline_size(&self) -> u64 {
        if self.max_pipeline_size == 0 {
            MigrateConfig::default().max_pipeline_size
        } else {
            self.max_pipeline_size
        }
    }

    /// Sequence gap limit with the zero-config fallback applied.
    pub fn effective_sequence_gap(&self) -> u64 {
        if self.sequence_gap_limit == 0 {
            MigrateConfig::default().sequence_gap_limit
        } else {
            self.sequence_gap_limit
        }
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}
