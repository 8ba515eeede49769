//! Slot migration coordinator and state machine.
//!
//! One dedicated worker thread owns the whole lifecycle of a migration:
//! Start (pin snapshot, connect, import START) → Snapshot (stream the slot's
//! contents) → WAL (bounded catch-up, cutover under the write-exclusivity
//! guard, final drain) → Success or Failed → Clean. The rest of the server
//! observes it only through three atomic slot-id fields and the migration
//! state; a synchronous caller parks on a [`SyncMigrateContext`] until the
//! job terminates. Raising `stop_migration` aborts cleanly at the next
//! iterator step, pipeline flush, or WAL batch boundary.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;

use crate::batch_extractor::extract_commands;
use crate::batch_sender::BatchSender;
use crate::cluster::ClusterRouter;
use crate::command_encoder::{encode_key, resp_command, CommandSink, KeyMigrationResult};
use crate::config::{MigrateConfig, MigrationType};
use crate::dst_client::{DstClient, IMPORT_FAILED, IMPORT_START, IMPORT_SUCCESS};
use crate::engine::{
    encode_log_data, ColumnFamilyId, EngineSnapshot, ListDirection, SlotEngine,
};
use crate::metadata::{subkey_prefix, Metadata, RedisType};
use crate::slot::{slot_prefix, split_metadata_key, SlotId, MAX_SLOT};
use crate::wal::SlotWalEntry;

/// Upper bound on WAL catch-up rounds before cutover.
pub const MAX_LOOP_TIMES: u32 = 10;

const NO_SLOT: i32 = -1;

const ERR_TASK_CANCELED: &str = "migration task canceled";
const ERR_SEND_COMMANDS: &str = "failed to send commands to restore a key";
const ERR_SET_IMPORT_STATUS: &str = "failed to set import status on destination node";

/// Externally observable migration state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationState {
    None = 0,
    Started = 1,
    Success = 2,
    Failed = 3,
}

impl MigrationState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Started,
            2 => Self::Success,
            3 => Self::Failed,
            _ => Self::None,
        }
    }
}

/// Internal stage driving the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MigrationStage {
    Start,
    Snapshot,
    Wal,
    Success,
    Failed,
    Clean,
}

/// Immutable description of one accepted migration job.
#[derive(Clone, Debug)]
pub struct SlotMigrationJob {
    pub slot: SlotId,
    pub dst_host: String,
    pub dst_port: u16,
    pub dst_node: String,
    pub max_speed: u64,
    pub max_pipeline_size: u64,
    pub seq_gap_limit: u64,
    pub migration_type: MigrationType,
    pub dst_password: Option<String>,
}

/// Parks a synchronous caller until the state machine resumes it with the
/// final job status. The caller owns it; the migrator holds a detachable
/// reference under a mutex.
pub struct SyncMigrateContext {
    state: Mutex<SyncState>,
    cv: Condvar,
}

struct SyncState {
    finished: bool,
    result: Option<Result<(), String>>,
}

impl SyncMigrateContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SyncState {
                finished: false,
                result: None,
            }),
            cv: Condvar::new(),
        })
    }

    /// Wakes the waiter with the final status. Idempotent.
    pub fn resume(&self, result: Result<(), String>) {
        let mut state = self.state.lock().expect("sync ctx lock poisoned");
        if !state.finished {
            state.finished = true;
            state.result = Some(result);
            self.cv.notify_all();
        }
    }

    /// Blocks until the job terminates and returns its final status.
    pub fn wait(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().expect("sync ctx lock poisoned");
        while !state.finished {
            state = self.cv.wait(state).expect("sync ctx wait poisoned");
        }
        match state.result.clone() {
            Some(Ok(())) => Ok(()),
            Some(Err(msg)) => anyhow::bail!(msg),
            None => anyhow::bail!("migration finished without a status"),
        }
    }

    /// Bounded wait for tests and cautious callers.
    pub fn wait_timeout(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("sync ctx lock poisoned");
        while !state.finished {
            let remaining = deadline.saturating_duration_since(Instant::now());
            anyhow::ensure!(!remaining.is_zero(), "timed out waiting for migration");
            let (guard, _) = self
                .cv
                .wait_timeout(state, remaining)
                .expect("sync ctx wait poisoned");
            state = guard;
        }
        match state.result.clone() {
            Some(Ok(())) => Ok(()),
            Some(Err(msg)) => anyhow::bail!(msg),
            None => anyhow::bail!("migration finished without a status"),
        }
    }
}

/// Status snapshot answered to `CLUSTERX MIGRATE status`.
#[derive(Clone, Debug)]
pub struct MigrationInfo {
    pub slot: i32,
    pub dst_node: String,
    pub state: &'static str,
}

impl std::fmt::Display for MigrationInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "migrating_slot: {}\r\ndestination_node: {}\r\nmigrating_state: {}\r\n",
            self.slot, self.dst_node, self.state
        )
    }
}

/// State shared between the coordinator surface and the worker thread.
struct MigratorShared {
    engine: Arc<SlotEngine>,
    cluster: Arc<ClusterRouter>,
    config: RwLock<MigrateConfig>,

    migrating_slot: AtomicI32,
    forbidden_slot: AtomicI32,
    migrate_failed_slot: AtomicI32,
    migration_state: AtomicU8,
    stop_migration: AtomicBool,
    terminated: AtomicBool,

    job: Mutex<Option<SlotMigrationJob>>,
    job_cv: Condvar,
    blocking_ctx: Mutex<Option<Arc<SyncMigrateContext>>>,
    dst_node: Mutex<String>,
    dst_endpoint: Mutex<Option<(String, u16)>>,
}

impl MigratorShared {
    fn resume_sync_ctx(&self, result: &anyhow::Result<()>) {
        let mut ctx = self.blocking_ctx.lock().expect("blocking ctx poisoned");
        if let Some(ctx) = ctx.take() {
            ctx.resume(match result {
                Ok(()) => Ok(()),
                Err(err) => Err(format!("{err:#}")),
            });
        }
    }
}

/// The coordinator: accepts one job at a time and owns the worker thread.
pub struct SlotMigrator {
    shared: Arc<MigratorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SlotMigrator {
    /// Spawns the migration worker thread.
    pub fn start(
        engine: Arc<SlotEngine>,
        cluster: Arc<ClusterRouter>,
        config: MigrateConfig,
    ) -> anyhow::Result<Self> {
        let shared = Arc::new(MigratorShared {
            engine,
            cluster,
            config: RwLock::new(config),
            migrating_slot: AtomicI32::new(NO_SLOT),
            forbidden_slot: AtomicI32::new(NO_SLOT),
            migrate_failed_slot: AtomicI32::new(NO_SLOT),
            migration_state: AtomicU8::new(MigrationState::None as u8),
            stop_migration: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            job: Mutex::new(None),
            job_cv: Condvar::new(),
            blocking_ctx: Mutex::new(None),
            dst_node: Mutex::new(String::new()),
            dst_endpoint: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("slot-migrate".to_string())
            .spawn(move || migration_loop(worker_shared))
            .context("spawn slot migration thread")?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Accepts a migration job for `slot` toward the destination node.
    ///
    /// Rejects immediately when a job is already running or the slot was
    /// already migrated away. With `blocking_ctx`, the caller can `wait()`
    /// for the final status; otherwise completion is observable via
    /// [`SlotMigrator::get_migration_info`].
    pub fn perform_slot_migration(
        &self,
        node_id: &str,
        dst_host: &str,
        dst_port: u16,
        slot: SlotId,
        blocking_ctx: Option<Arc<SyncMigrateContext>>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(slot <= MAX_SLOT, "slot {slot} out of range");
        let shared = &self.shared;

        // Only one slot migration job at the same time.
        if shared
            .migrating_slot
            .compare_exchange(NO_SLOT, i32::from(slot), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            anyhow::bail!("there is already a migrating slot");
        }

        if shared.forbidden_slot.load(Ordering::Acquire) == i32::from(slot) {
            // Release the migrating slot claimed above.
            shared.migrating_slot.store(NO_SLOT, Ordering::Release);
            anyhow::bail!("can't migrate a slot that has already been migrated");
        }

        shared
            .migration_state
            .store(MigrationState::Started as u8, Ordering::Release);

        let config = shared.config.read().expect("config lock poisoned").clone();
        let job = SlotMigrationJob {
            slot,
            dst_host: dst_host.to_string(),
            dst_port,
            dst_node: node_id.to_string(),
            max_speed: config.max_migration_speed,
            max_pipeline_size: config.effective_pipeline_size(),
            seq_gap_limit: config.effective_sequence_gap(),
            migration_type: config.migration_type,
            dst_password: config.dst_password.clone(),
        };

        if let Some(ctx) = blocking_ctx {
            *shared.blocking_ctx.lock().expect("blocking ctx poisoned") = Some(ctx);
        }
        *shared.dst_node.lock().expect("dst node poisoned") = node_id.to_string();
        *shared.dst_endpoint.lock().expect("dst endpoint poisoned") =
            Some((dst_host.to_string(), dst_port));

        {
            let mut pending = shared.job.lock().expect("job lock poisoned");
            *pending = Some(job);
            shared.job_cv.notify_one();
        }

        tracing::info!(slot, dst = %format!("{dst_host}:{dst_port}"), "start migrating slot");
        Ok(())
    }

    pub fn get_migration_info(&self) -> MigrationInfo {
        let shared = &self.shared;
        let state =
            MigrationState::from_u8(shared.migration_state.load(Ordering::Acquire));
        let (slot, label) = match state {
            MigrationState::None => (NO_SLOT, "none"),
            MigrationState::Started => {
                (shared.migrating_slot.load(Ordering::Acquire), "start")
            }
            MigrationState::Success => {
                (shared.forbidden_slot.load(Ordering::Acquire), "success")
            }
            MigrationState::Failed => {
                (shared.migrate_failed_slot.load(Ordering::Acquire), "fail")
            }
        };
        MigrationInfo {
            slot,
            dst_node: shared.dst_node.lock().expect("dst node poisoned").clone(),
            state: label,
        }
    }

    pub fn migrating_slot(&self) -> Option<SlotId> {
        slot_from_atomic(&self.shared.migrating_slot)
    }

    pub fn forbidden_slot(&self) -> Option<SlotId> {
        slot_from_atomic(&self.shared.forbidden_slot)
    }

    pub fn migrate_failed_slot(&self) -> Option<SlotId> {
        slot_from_atomic(&self.shared.migrate_failed_slot)
    }

    pub fn migration_state(&self) -> MigrationState {
        MigrationState::from_u8(self.shared.migration_state.load(Ordering::Acquire))
    }

    /// Destination endpoint of the current or last job, for MOVED redirects
    /// while the slot is forbidden.
    pub fn dst_endpoint(&self) -> Option<(String, u16)> {
        self.shared
            .dst_endpoint
            .lock()
            .expect("dst endpoint poisoned")
            .clone()
    }

    /// Raises or clears the cancellation flag. Demotion to a replica raises
    /// it so an in-flight job aborts at its next boundary.
    pub fn set_stop_migration_flag(&self, stop: bool) {
        self.shared.stop_migration.store(stop, Ordering::Release);
    }

    /// Detaches a parked synchronous waiter without resuming it.
    pub fn cancel_sync_ctx(&self) {
        *self
            .shared
            .blocking_ctx
            .lock()
            .expect("blocking ctx poisoned") = None;
    }

    pub fn config(&self) -> &RwLock<MigrateConfig> {
        &self.shared.config
    }
}

impl Drop for SlotMigrator {
    fn drop(&mut self) {
        self.shared.stop_migration.store(true, Ordering::Release);
        self.shared.terminated.store(true, Ordering::Release);
        self.shared.job_cv.notify_all();
        if let Some(worker) = self.worker.lock().expect("worker lock poisoned").take() {
            if worker.join().is_err() {
                tracing::warn!("slot migration thread panicked during shutdown");
            }
        }
    }
}

fn slot_from_atomic(value: &AtomicI32) -> Option<SlotId> {
    let raw = value.load(Ordering::Acquire);
    u16::try_from(raw).ok()
}

/// Worker thread: waits for jobs and runs the state machine per job.
fn migration_loop(shared: Arc<MigratorShared>) {
    loop {
        let job = {
            let mut pending = shared.job.lock().expect("job lock poisoned");
            while pending.is_none() && !shared.terminated.load(Ordering::Acquire) {
                pending = shared
                    .job_cv
                    .wait(pending)
                    .expect("job condvar poisoned");
            }
            if shared.terminated.load(Ordering::Acquire) {
                break;
            }
            match pending.clone() {
                Some(job) => job,
                None => continue,
            }
        };

        tracing::info!(
            slot = job.slot,
            dst = %format!("{}:{}", job.dst_host, job.dst_port),
            max_speed = job.max_speed,
            max_pipeline_size = job.max_pipeline_size,
            seq_gap_limit = job.seq_gap_limit,
            ty = ?job.migration_type,
            "migrating slot"
        );
        MigrationRun::new(Arc::clone(&shared), job).run();
    }

    // Never leave a synchronous caller parked across shutdown.
    let shutdown: anyhow::Result<()> = Err(anyhow::anyhow!("node is shutting down"));
    shared.resume_sync_ctx(&shutdown);
}

/// Per-job session state owned by the worker for the duration of one run.
struct MigrationRun {
    shared: Arc<MigratorShared>,
    job: SlotMigrationJob,
    dst: Option<DstClient>,
    snapshot: Option<Arc<EngineSnapshot>>,
    wal_begin_seq: u64,
    pipeline_buf: Vec<u8>,
    pipeline_size: u64,
    last_send_us: u64,
}

impl CommandSink for MigrationRun {
    fn push_command(&mut self, args: Vec<Vec<u8>>) -> anyhow::Result<()> {
        self.pipeline_buf.extend_from_slice(&resp_command(&args));
        self.pipeline_size += 1;
        self.send_pipeline_if_needed(false)
    }
}

impl MigrationRun {
    fn new(shared: Arc<MigratorShared>, job: SlotMigrationJob) -> Self {
        Self {
            shared,
            job,
            dst: None,
            snapshot: None,
            wal_begin_seq: 0,
            pipeline_buf: Vec::new(),
            pipeline_size: 0,
            last_send_us: 0,
        }
    }

    fn run(&mut self) {
        let slot = self.job.slot;
        let mut stage = MigrationStage::Start;
        loop {
            if self.shared.terminated.load(Ordering::Acquire) {
                tracing::warn!(slot, "stopping migration state machine, worker terminated");
                self.clean();
                return;
            }
            match stage {
                MigrationStage::Start => match self.start_migration() {
                    Ok(()) => {
                        tracing::info!(slot, "migration started");
                        stage = MigrationStage::Snapshot;
                    }
                    Err(err) => {
                        tracing::error!(slot, error = %format!("{err:#}"), "failed to start migration");
                        self.shared.resume_sync_ctx(&Err(err));
                        stage = MigrationStage::Failed;
                    }
                },
                MigrationStage::Snapshot => match self.send_snapshot() {
                    Ok(()) => stage = MigrationStage::Wal,
                    Err(err) => {
                        tracing::error!(slot, error = %format!("{err:#}"), "failed to send slot snapshot");
                        self.shared.resume_sync_ctx(&Err(err));
                        stage = MigrationStage::Failed;
                    }
                },
                MigrationStage::Wal => match self.sync_wal() {
                    Ok(()) => {
                        tracing::info!(slot, "WAL synced for slot");
                        stage = MigrationStage::Success;
                    }
                    Err(err) => {
                        tracing::error!(slot, error = %format!("{err:#}"), "failed to sync WAL for slot");
                        self.shared.resume_sync_ctx(&Err(err));
                        stage = MigrationStage::Failed;
                    }
                },
                MigrationStage::Success => match self.finish_successful_migration() {
                    Ok(()) => {
                        tracing::info!(slot, "slot migrated");
                        self.shared
                            .migration_state
                            .store(MigrationState::Success as u8, Ordering::Release);
                        self.shared.resume_sync_ctx(&Ok(()));
                        stage = MigrationStage::Clean;
                    }
                    Err(err) => {
                        tracing::error!(slot, error = %format!("{err:#}"), "failed to finish successful migration");
                        self.shared.resume_sync_ctx(&Err(err));
                        stage = MigrationStage::Failed;
                    }
                },
                MigrationStage::Failed => {
                    if let Err(err) = self.finish_failed_migration() {
                        tracing::error!(slot, error = %format!("{err:#}"), "failed to finish failed migration");
                    }
                    self.shared
                        .migration_state
                        .store(MigrationState::Failed as u8, Ordering::Release);
                    stage = MigrationStage::Clean;
                }
                MigrationStage::Clean => {
                    self.clean();
                    return;
                }
            }
        }
    }

    fn stop_requested(&self) -> bool {
        self.shared.stop_migration.load(Ordering::Acquire)
    }

    fn start_migration(&mut self) -> anyhow::Result<()> {
        let snapshot = self
            .shared
            .engine
            .pin_snapshot()
            .context("pin storage snapshot")?;
        self.wal_begin_seq = snapshot.wal_seq();
        self.snapshot = Some(Arc::new(snapshot));
        self.last_send_us = 0;

        let mut dst = DstClient::connect(&self.job.dst_host, self.job.dst_port)?;
        let shared = Arc::clone(&self.shared);
        if let Some(password) = self.job.dst_password.clone() {
            dst.auth(&password, &shared.stop_migration)
                .context("authenticate on destination node")?;
        }
        dst.set_import_status(self.job.slot, IMPORT_START, &shared.stop_migration)
            .context(ERR_SET_IMPORT_STATUS)?;
        self.dst = Some(dst);

        tracing::info!(
            slot = self.job.slot,
            wal_begin_seq = self.wal_begin_seq,
            "pinned snapshot and connected to destination"
        );
        Ok(())
    }

    fn send_snapshot(&mut self) -> anyhow::Result<()> {
        match self.job.migration_type {
            MigrationType::RedisCommand => self.send_snapshot_by_cmd(),
            MigrationType::RawKeyValue => self.send_snapshot_by_raw_kv(),
        }
    }

    fn sync_wal(&mut self) -> anyhow::Result<()> {
        match self.job.migration_type {
            MigrationType::RedisCommand => self.sync_wal_by_cmd(),
            MigrationType::RawKeyValue => self.sync_wal_by_raw_kv(),
        }
    }

    fn send_snapshot_by_cmd(&mut self) -> anyhow::Result<()> {
        let slot = self.job.slot;
        tracing::info!(slot, "migrating slot snapshot");

        let shared = Arc::clone(&self.shared);
        let snapshot = self.snapshot.clone().context("snapshot not pinned")?;
        let mut migrated_keys = 0u64;
        let mut expired_keys = 0u64;
        let mut empty_keys = 0u64;

        for item in snapshot.iter_prefix(ColumnFamilyId::Metadata, slot_prefix(slot).to_vec()) {
            if self.stop_requested() {
                anyhow::bail!(ERR_TASK_CANCELED);
            }
            let (encoded_key, raw_meta) = item?;
            let Some((_, user_key)) = split_metadata_key(&encoded_key) else {
                continue;
            };
            let user_key = user_key.to_vec();
            let result = encode_key(
                &snapshot,
                &user_key,
                &raw_meta,
                self,
                &shared.stop_migration,
            )
            .with_context(|| {
                format!("migrate key {}", String::from_utf8_lossy(&user_key))
            })?;
            match result {
                KeyMigrationResult::Migrated => migrated_keys += 1,
                KeyMigrationResult::Expired => expired_keys += 1,
                KeyMigrationResult::UnderlyingStructEmpty => empty_keys += 1,
            }
        }

        // The tail of the pipeline may be smaller than max_pipeline_size.
        self.send_pipeline_if_needed(true)
            .context(ERR_SEND_COMMANDS)?;

        tracing::info!(
            slot,
            migrated_keys,
            expired_keys,
            empty_keys,
            "slot snapshot migrated"
        );
        Ok(())
    }

    fn sync_wal_by_cmd(&mut self) -> anyhow::Result<()> {
        self.sync_wal_before_forbidding_slot()
            .context("sync WAL before forbidding slot")?;

        self.set_forbidden_slot();

        self.sync_wal_after_forbidding_slot()
            .context("sync WAL after forbidding slot")?;
        Ok(())
    }

    fn sync_wal_before_forbidding_slot(&mut self) -> anyhow::Result<()> {
        let mut count = 0u32;
        while count < MAX_LOOP_TIMES {
            let latest_seq = self.shared.engine.latest_seq();
            let gap = latest_seq.saturating_sub(self.wal_begin_seq);
            if gap <= self.job.seq_gap_limit {
                tracing::info!(
                    gap,
                    limit = self.job.seq_gap_limit,
                    "incremental gap within limit, proceeding to forbid slot"
                );
                break;
            }
            self.migrate_incremental_by_cmd(latest_seq)?;
            self.wal_begin_seq = latest_seq;
            count += 1;
        }
        tracing::info!(epochs = count, "incremental data migrated before forbidding slot");
        Ok(())
    }

    fn sync_wal_after_forbidding_slot(&mut self) -> anyhow::Result<()> {
        let latest_seq = self.shared.engine.latest_seq();
        if latest_seq <= self.wal_begin_seq {
            return Ok(());
        }
        self.migrate_incremental_by_cmd(latest_seq)?;
        self.wal_begin_seq = latest_seq;
        Ok(())
    }

    /// Replays WAL batches in `(wal_begin_seq, end_seq]` as commands.
    fn migrate_incremental_by_cmd(&mut self, end_seq: u64) -> anyhow::Result<()> {
        if end_seq <= self.wal_begin_seq {
            return Ok(());
        }
        let batches = self
            .shared
            .engine
            .wal_batches_from(self.wal_begin_seq + 1)
            .context("open WAL iterator")?;

        let mut next_seq = self.wal_begin_seq + 1;
        for batch in batches {
            if batch.begin_seq > end_seq {
                break;
            }
            if self.stop_requested() {
                anyhow::bail!(ERR_TASK_CANCELED);
            }
            anyhow::ensure!(
                batch.begin_seq == next_seq,
                "WAL is discontinuous: expected sequence {next_seq}, got {}",
                batch.begin_seq
            );
            for args in extract_commands(&batch, self.job.slot)? {
                self.push_command(args)?;
            }
            next_seq = batch.begin_seq + batch.seq_count();
        }
        anyhow::ensure!(
            next_seq > end_seq,
            "WAL iterator ended before reaching sequence {end_seq}"
        );

        self.send_pipeline_if_needed(true)?;
        tracing::info!(
            from = self.wal_begin_seq,
            to = end_seq,
            "migrated one epoch of incremental data"
        );
        Ok(())
    }

    /// Cutover: forbids local writes to the slot under the process-wide
    /// write-exclusivity guard and logs how long writers were paused.
    fn set_forbidden_slot(&mut self) {
        let slot = i32::from(self.job.slot);
        tracing::info!(slot, "setting forbidden slot");
        let shared = Arc::clone(&self.shared);
        let start = Instant::now();
        self.shared.engine.with_write_exclusivity(|| {
            shared.forbidden_slot.store(slot, Ordering::Release);
        });
        tracing::info!(
            slot,
            blocked_us = start.elapsed().as_micros() as u64,
            "paused writes to set forbidden slot"
        );
    }

    fn send_snapshot_by_raw_kv(&mut self) -> anyhow::Result<()> {
        let slot = self.job.slot;
        let start = Instant::now();
        tracing::info!(slot, "migrating slot snapshot by raw key value");

        let snapshot = self.snapshot.clone().context("snapshot not pinned")?;
        let (max_bytes, bytes_per_sec) = self.batch_limits();
        let mut sender = BatchSender::new(max_bytes, bytes_per_sec);

        for item in snapshot.iter_prefix(ColumnFamilyId::Metadata, slot_prefix(slot).to_vec()) {
            if self.stop_requested() {
                anyhow::bail!(ERR_TASK_CANCELED);
            }
            let (encoded_key, raw_meta) = item?;
            let (meta, _) = Metadata::decode(&raw_meta)?;

            // Lists replay with an RPUSH hint; the raw layout cannot tell
            // which side an element entered from.
            let hint = (meta.ty == RedisType::List).then_some(ListDirection::Right);
            sender.set_prefix_log_data(encode_log_data(meta.ty, hint));
            sender.put(ColumnFamilyId::Metadata, encoded_key.clone(), raw_meta.clone());

            let Some((_, user_key)) = split_metadata_key(&encoded_key) else {
                continue;
            };
            let prefix = subkey_prefix(slot, user_key, meta.version);
            for cf in element_families(meta.ty) {
                for sub in snapshot.iter_prefix(*cf, prefix.clone()) {
                    if self.stop_requested() {
                        anyhow::bail!(ERR_TASK_CANCELED);
                    }
                    let (sub_key, sub_value) = sub?;
                    sender.put(*cf, sub_key, sub_value);
                    if sender.is_full() {
                        self.send_migration_batch(&mut sender)?;
                    }
                }
            }
            if sender.is_full() {
                self.send_migration_batch(&mut sender)?;
            }
        }

        self.send_migration_batch(&mut sender)?;

        tracing::info!(
            slot,
            elapsed_ms = start.elapsed().as_millis() as u64,
            sent_bytes = sender.sent_bytes(),
            rate_kib_s = sender.rate_kib_per_sec(start),
            batches = sender.sent_batches(),
            entries = sender.entries(),
            "slot snapshot migrated by raw key value"
        );
        Ok(())
    }

    fn sync_wal_by_raw_kv(&mut self) -> anyhow::Result<()> {
        let slot = self.job.slot;
        let start = Instant::now();
        tracing::info!(slot, "syncing WAL by raw key value");
        let (max_bytes, bytes_per_sec) = self.batch_limits();
        let mut sender = BatchSender::new(max_bytes, bytes_per_sec);

        let mut epoch = 1u32;
        while epoch <= MAX_LOOP_TIMES {
            if self.caught_up_incremental_wal() {
                break;
            }
            let end_seq = self.shared.engine.latest_seq();
            self.migrate_incremental_by_raw_kv(end_seq, &mut sender)
                .context("migrate incremental data")?;
            tracing::info!(
                epoch,
                from = self.wal_begin_seq,
                to = end_seq,
                "migrated incremental data"
            );
            self.wal_begin_seq = end_seq;
            epoch += 1;
        }

        self.set_forbidden_slot();

        let end_seq = self.shared.engine.latest_seq();
        if end_seq > self.wal_begin_seq {
            self.migrate_incremental_by_raw_kv(end_seq, &mut sender)
                .context("migrate last incremental data")?;
            tracing::info!(
                from = self.wal_begin_seq,
                to = end_seq,
                "migrated last incremental data after forbidding slot"
            );
            self.wal_begin_seq = end_seq;
        }

        tracing::info!(
            slot,
            elapsed_ms = start.elapsed().as_millis() as u64,
            sent_bytes = sender.sent_bytes(),
            rate_kib_s = sender.rate_kib_per_sec(start),
            batches = sender.sent_batches(),
            entries = sender.entries(),
            "incremental data migrated by raw key value"
        );
        Ok(())
    }

    fn caught_up_incremental_wal(&self) -> bool {
        let gap = self
            .shared
            .engine
            .latest_seq()
            .saturating_sub(self.wal_begin_seq);
        if gap <= self.job.seq_gap_limit {
            tracing::info!(
                gap,
                limit = self.job.seq_gap_limit,
                slot = self.job.slot,
                "incremental gap within limit, forbidding slot"
            );
            return true;
        }
        false
    }

    fn migrate_incremental_by_raw_kv(
        &mut self,
        end_seq: u64,
        sender: &mut BatchSender,
    ) -> anyhow::Result<()> {
        let mut iter = self
            .shared
            .engine
            .slot_wal_iter(self.job.slot, self.wal_begin_seq + 1)
            .context("open slot WAL iterator")?;

        while iter.next_sequence_number() <= end_seq {
            if self.stop_requested() {
                anyhow::bail!(ERR_TASK_CANCELED);
            }
            let Some((_, entries)) = iter.next_batch() else {
                break;
            };
            for entry in entries {
                match entry {
                    SlotWalEntry::LogData(data) => sender.put_log_data(data),
                    SlotWalEntry::Put { cf, key, value } => sender.put(cf, key, value),
                    SlotWalEntry::Delete { cf, key } => sender.delete(cf, key),
                    // Range deletions are only used by whole-DB flushes and
                    // may cross slots, so they are not replicated.
                    SlotWalEntry::DeleteRange { .. } => {}
                }
                if sender.is_full() {
                    self.send_migration_batch(sender)?;
                }
            }
        }

        self.send_migration_batch(sender)
    }

    /// Flushes one raw batch, honoring live config changes to the limits.
    fn send_migration_batch(&mut self, sender: &mut BatchSender) -> anyhow::Result<()> {
        let (max_bytes, bytes_per_sec) = self.batch_limits();
        sender.set_max_bytes(max_bytes);
        sender.set_bytes_per_second(bytes_per_sec);
        let shared = Arc::clone(&self.shared);
        let dst = self.dst.as_mut().context("destination session not connected")?;
        sender.send(dst, &shared.stop_migration)
    }

    fn batch_limits(&self) -> (usize, u64) {
        let config = self.shared.config.read().expect("config lock poisoned");
        (
            (config.migrate_batch_size_kb as usize) * 1024,
            config.migrate_batch_rate_limit_mb * 1024 * 1024,
        )
    }

    fn finish_successful_migration(&mut self) -> anyhow::Result<()> {
        if self.stop_requested() {
            anyhow::bail!(ERR_TASK_CANCELED);
        }
        let shared = Arc::clone(&self.shared);
        let dst = self.dst.as_mut().context("destination session not connected")?;
        dst.set_import_status(self.job.slot, IMPORT_SUCCESS, &shared.stop_migration)
            .context(ERR_SET_IMPORT_STATUS)?;

        let endpoint = format!("{}:{}", self.job.dst_host, self.job.dst_port);
        self.shared
            .cluster
            .set_slot_migrated(self.job.slot, &self.job.dst_node, &endpoint)
            .with_context(|| {
                format!("set slot {} as migrated to {endpoint}", self.job.slot)
            })?;

        self.shared
            .migrate_failed_slot
            .store(NO_SLOT, Ordering::Release);
        Ok(())
    }

    fn finish_failed_migration(&mut self) -> anyhow::Result<()> {
        // Report the local failure first: writes to the slot resume here
        // because the destination never assumed ownership.
        self.shared
            .migrate_failed_slot
            .store(i32::from(self.job.slot), Ordering::Release);
        self.shared.forbidden_slot.store(NO_SLOT, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        if let Some(dst) = self.dst.as_mut() {
            dst.set_import_status(self.job.slot, IMPORT_FAILED, &shared.stop_migration)
                .context(ERR_SET_IMPORT_STATUS)?;
        }
        Ok(())
    }

    /// Releases every job resource on both success and failure paths.
    fn clean(&mut self) {
        tracing::info!(slot = self.job.slot, "cleaning up migration job");
        self.snapshot = None;
        self.dst = None;
        self.pipeline_buf.clear();
        self.pipeline_size = 0;
        self.wal_begin_seq = 0;
        {
            let mut pending = self.shared.job.lock().expect("job lock poisoned");
            *pending = None;
        }
        self.shared.migrating_slot.store(NO_SLOT, Ordering::Release);
        self.shared.stop_migration.store(false, Ordering::Release);
    }

    /// Sends the buffered pipeline when forced or full, then reads exactly
    /// as many replies as commands were sent.
    fn send_pipeline_if_needed(&mut self, force: bool) -> anyhow::Result<()> {
        if self.stop_requested() {
            anyhow::bail!(ERR_TASK_CANCELED);
        }
        if !force && self.pipeline_size < self.job.max_pipeline_size {
            return Ok(());
        }
        if self.pipeline_size == 0 {
            return Ok(());
        }

        self.apply_migration_speed_limit();

        let shared = Arc::clone(&self.shared);
        let dst = self.dst.as_mut().context("destination session not connected")?;
        dst.send(&self.pipeline_buf)
            .context("write pipeline to destination socket")?;
        self.last_send_us = now_micros();
        dst.check_multiple_responses(self.pipeline_size, &shared.stop_migration)
            .context("wrong response from the destination node")?;

        self.pipeline_buf.clear();
        self.pipeline_size = 0;
        Ok(())
    }

    fn apply_migration_speed_limit(&self) {
        if self.job.max_speed == 0 {
            return;
        }
        let per_request_us =
            (1_000_000 * self.job.max_pipeline_size / self.job.max_speed).max(1);
        let now = now_micros();
        if self.last_send_us + per_request_us > now {
            let wait_us = self.last_send_us + per_request_us - now;
            tracing::debug!(wait_us, "sleeping to limit migration speed");
            std::thread::sleep(Duration::from_micros(wait_us));
        }
    }
}

/// Column families holding element rows for a value type.
fn element_families(ty: RedisType) -> &'static [ColumnFamilyId] {
    match ty {
        RedisType::String | RedisType::None => &[],
        RedisType::Stream => &[ColumnFamilyId::Stream],
        RedisType::Zset => &[ColumnFamilyId::Subkey, ColumnFamilyId::ZsetScore],
        _ => &[ColumnFamilyId::Subkey],
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}
