//! Opal: a Redis-protocol-compatible clustered key/value node on an LSM
//! engine, centered on its slot migration core.
//!
//! The crate is organized bottom-up:
//! - `slot`, `metadata`: key hashing and on-disk key/value layout
//! - `wal`, `engine`: the fjall-backed storage engine with a tailable
//!   write-ahead log, pinned snapshots, and a write-exclusivity guard
//! - `dst_client`, `command_encoder`, `batch_extractor`, `batch_sender`:
//!   the migration wire path (command replay and raw-KV batch replication)
//! - `slot_migrate`: the migration coordinator and state machine
//! - `cluster`, `redis_server`, `config`: slot ownership, the RESP frontend,
//!   and runtime configuration

pub mod batch_extractor;
pub mod batch_sender;
pub mod cluster;
pub mod command_encoder;
pub mod config;
pub mod dst_client;
pub mod engine;
pub mod metadata;
pub mod redis_server;
pub mod slot;
pub mod slot_migrate;
pub mod wal;
