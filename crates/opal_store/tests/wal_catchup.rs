//! WAL catch-up behavior: bounded convergence, discontinuity handling, and
//! command-mode rate limiting.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{test_engine, wait_until, MockDestination, TEST_TIMEOUT};
use opal_store::cluster::ClusterRouter;
use opal_store::config::MigrateConfig;
use opal_store::engine::SlotEngine;
use opal_store::slot::key_slot;
use opal_store::slot_migrate::{MigrationState, SlotMigrator, SyncMigrateContext};

fn start_migrator(
    engine: &Arc<SlotEngine>,
    config: MigrateConfig,
) -> (Arc<ClusterRouter>, SlotMigrator) {
    let cluster = Arc::new(ClusterRouter::new("src-node", "127.0.0.1:7000"));
    let migrator = SlotMigrator::start(Arc::clone(engine), Arc::clone(&cluster), config)
        .expect("start migrator");
    (cluster, migrator)
}

/// The catch-up loop is bounded: with a tiny gap limit and a writer that
/// never goes idle, the loop must still terminate and cut over.
#[test]
fn catch_up_loop_terminates_under_constant_writes() {
    let (_dir, engine) = test_engine();
    let slot = key_slot(b"{foo}");
    for i in 0..20 {
        engine
            .put_string(format!("{{foo}}k{i}").as_bytes(), b"v", 0)
            .unwrap();
    }
    assert_ne!(key_slot(b"{noise}k0"), slot);

    let config = MigrateConfig {
        sequence_gap_limit: 1,
        ..MigrateConfig::default()
    };
    let (_cluster, migrator) = start_migrator(&engine, config);

    // Keep the WAL moving with writes to a different slot for the whole run.
    let writer_stop = Arc::new(AtomicBool::new(false));
    let writer_engine = Arc::clone(&engine);
    let writer_flag = Arc::clone(&writer_stop);
    let writer = std::thread::spawn(move || {
        let mut i = 0u64;
        while !writer_flag.load(Ordering::Acquire) {
            writer_engine
                .put_string(format!("{{noise}}k{i}").as_bytes(), b"x", 0)
                .unwrap();
            i += 1;
            std::thread::sleep(Duration::from_millis(1));
        }
    });

    let dest = MockDestination::start();
    let result = {
        let (host, port) = dest.host_port();
        let waiter = SyncMigrateContext::new();
        migrator
            .perform_slot_migration(
                &format!("{host}:{port}"),
                &host,
                port,
                slot,
                Some(Arc::clone(&waiter)),
            )
            .expect("job accepted");
        waiter.wait_timeout(TEST_TIMEOUT)
    };
    writer_stop.store(true, Ordering::Release);
    writer.join().unwrap();
    result.expect("bounded catch-up must still succeed");

    assert_eq!(migrator.migration_state(), MigrationState::Success);
    assert_eq!(migrator.forbidden_slot(), Some(slot));

    // Nothing from the noise slot leaked into the destination.
    let state = dest.join();
    assert!(state
        .commands
        .iter()
        .all(|args| args.len() < 2 || !args[1].starts_with("{noise}")));
    assert_eq!(state.import_events.last(), Some(&(slot, 1)));
}

/// A WAL tail that fell below the retention floor fails the job instead of
/// silently skipping updates.
#[test]
fn wal_retention_gap_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(SlotEngine::open_with_retention(dir.path(), 4).unwrap());
    let slot = key_slot(b"{foo}");
    for i in 0..30 {
        engine
            .put_string(format!("{{foo}}k{i}").as_bytes(), b"v", 0)
            .unwrap();
    }

    let (cluster, migrator) = start_migrator(&engine, MigrateConfig::default());
    let dest = MockDestination::builder()
        .delay_per_command(Duration::from_millis(5))
        .start();
    let (host, port) = dest.host_port();
    let waiter = SyncMigrateContext::new();
    migrator
        .perform_slot_migration(
            &format!("{host}:{port}"),
            &host,
            port,
            slot,
            Some(Arc::clone(&waiter)),
        )
        .expect("job accepted");

    // Push the retention window past the pinned sequence while the snapshot
    // is still streaming.
    wait_until("snapshot to be pinned", || engine.open_snapshot_count() == 1);
    for i in 0..10 {
        engine
            .put_string(format!("evict{i}").as_bytes(), b"x", 0)
            .unwrap();
    }

    let err = waiter
        .wait_timeout(TEST_TIMEOUT)
        .expect_err("job must fail on a WAL discontinuity");
    assert!(
        format!("{err:#}").contains("retention floor"),
        "unexpected failure reason: {err:#}"
    );

    assert_eq!(migrator.migrate_failed_slot(), Some(slot));
    assert_eq!(migrator.forbidden_slot(), None);
    assert!(cluster.owns_slot(slot));
    assert_eq!(engine.open_snapshot_count(), 0);
}

/// Command-mode speed limiting spaces pipeline flushes apart.
#[test]
fn migration_speed_limit_paces_pipelines() {
    let (_dir, engine) = test_engine();
    let slot = key_slot(b"{foo}");
    for i in 0..40 {
        engine
            .put_string(format!("{{foo}}k{i:02}").as_bytes(), b"v", 0)
            .unwrap();
    }

    // 8 commands per pipeline at 40 commands/s: 200 ms between flushes.
    let config = MigrateConfig {
        max_migration_speed: 40,
        max_pipeline_size: 8,
        ..MigrateConfig::default()
    };
    let (_cluster, migrator) = start_migrator(&engine, config);
    let dest = MockDestination::start();

    let start = Instant::now();
    let (host, port) = dest.host_port();
    let waiter = SyncMigrateContext::new();
    migrator
        .perform_slot_migration(
            &format!("{host}:{port}"),
            &host,
            port,
            slot,
            Some(Arc::clone(&waiter)),
        )
        .expect("job accepted");
    waiter.wait_timeout(TEST_TIMEOUT).expect("migration succeeds");
    let elapsed = start.elapsed();

    // Five pipeline flushes, four of them paced: at least ~800 ms total.
    assert!(
        elapsed >= Duration::from_millis(750),
        "migration finished too fast for the speed limit: {elapsed:?}"
    );

    let state = dest.join();
    let sets = state.commands.iter().filter(|args| args[0] == "SET").count();
    assert_eq!(sets, 40);
}
