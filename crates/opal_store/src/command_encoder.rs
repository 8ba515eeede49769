//! Restore-command generation for one user key under a pinned snapshot.
//!
//! Given the decoded metadata of a key, the encoder emits a canonical,
//! idempotent sequence of redis commands that reproduces the key on a fresh
//! destination: `SET` for strings, chunked `RPUSH`/`HMSET`/`SADD`/`ZADD`/
//! `SIADD` for composite types, `SETBIT` per set bit for bitmaps, and
//! `XADD` + `XSETID` for streams. Every emitted command goes through a
//! [`CommandSink`] so the caller can flush its pipeline as soon as it fills.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;

use crate::engine::{decode_score, ColumnFamilyId, EngineSnapshot};
use crate::metadata::{
    decode_stream_fields, now_ms, subkey_prefix, Metadata, ParsedSubkey, RedisType,
    StreamEntryId, StreamMetadata,
};
use crate::slot::key_slot;

/// Upper bound on elements carried by one chunked restore command.
pub const MAX_ITEMS_IN_COMMAND: usize = 16;

const ERR_TASK_CANCELED: &str = "migration task canceled";

/// Receives encoded commands; implementors own pipeline accounting.
pub trait CommandSink {
    fn push_command(&mut self, args: Vec<Vec<u8>>) -> anyhow::Result<()>;
}

/// Every `Vec<Vec<u8>>` pushed into the sink is collected verbatim.
impl CommandSink for Vec<Vec<Vec<u8>>> {
    fn push_command(&mut self, args: Vec<Vec<u8>>) -> anyhow::Result<()> {
        self.push(args);
        Ok(())
    }
}

/// Encodes an args list as a RESP array of bulk strings.
pub fn resp_command(args: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Classification of one key visited by the snapshot sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyMigrationResult {
    Migrated,
    Expired,
    UnderlyingStructEmpty,
}

/// Emits the restore commands for one key, reading elements under `snapshot`.
pub fn encode_key(
    snapshot: &EngineSnapshot,
    user_key: &[u8],
    raw_metadata: &[u8],
    sink: &mut dyn CommandSink,
    stop: &AtomicBool,
) -> anyhow::Result<KeyMigrationResult> {
    let (meta, rest) = Metadata::decode(raw_metadata)?;

    if !meta.ty.is_emptyable() && meta.size == 0 {
        return Ok(KeyMigrationResult::UnderlyingStructEmpty);
    }
    if meta.expired_at(now_ms()) {
        return Ok(KeyMigrationResult::Expired);
    }

    match meta.ty {
        RedisType::String => encode_string(user_key, &meta, rest, sink)?,
        RedisType::Hash
        | RedisType::List
        | RedisType::Set
        | RedisType::Zset
        | RedisType::Sortedint
        | RedisType::Bitmap => encode_complex(snapshot, user_key, &meta, sink, stop)?,
        RedisType::Stream => {
            let stream = StreamMetadata::decode(raw_metadata)?;
            encode_stream(snapshot, user_key, &stream, sink, stop)?;
        }
        RedisType::None => {}
    }

    Ok(KeyMigrationResult::Migrated)
}

fn encode_string(
    user_key: &[u8],
    meta: &Metadata,
    value: &[u8],
    sink: &mut dyn CommandSink,
) -> anyhow::Result<()> {
    let mut args = vec![b"SET".to_vec(), user_key.to_vec(), value.to_vec()];
    if meta.expire_ms > 0 {
        args.push(b"PXAT".to_vec());
        args.push(meta.expire_ms.to_string().into_bytes());
    }
    sink.push_command(args)
}

/// Restore command verb for a chunked composite type.
fn restore_verb(ty: RedisType) -> &'static [u8] {
    match ty {
        RedisType::Hash => b"HMSET",
        RedisType::List => b"RPUSH",
        RedisType::Set => b"SADD",
        RedisType::Zset => b"ZADD",
        RedisType::Sortedint => b"SIADD",
        RedisType::Bitmap => b"SETBIT",
        _ => b"",
    }
}

fn encode_complex(
    snapshot: &EngineSnapshot,
    user_key: &[u8],
    meta: &Metadata,
    sink: &mut dyn CommandSink,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    let slot = key_slot(user_key);
    let prefix = subkey_prefix(slot, user_key, meta.version);
    let mut args: Vec<Vec<u8>> = vec![restore_verb(meta.ty).to_vec(), user_key.to_vec()];
    let mut item_count = 0usize;

    for item in snapshot.iter_prefix(ColumnFamilyId::Subkey, prefix) {
        if stop.load(Ordering::Acquire) {
            anyhow::bail!(ERR_TASK_CANCELED);
        }
        let (encoded_key, value) = item?;
        let parsed = ParsedSubkey::parse(&encoded_key)?;

        match meta.ty {
            RedisType::Set => args.push(parsed.subkey),
            RedisType::Sortedint => {
                anyhow::ensure!(parsed.subkey.len() == 8, "short sortedint id");
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&parsed.subkey);
                args.push(u64::from_be_bytes(buf).to_string().into_bytes());
            }
            RedisType::Zset => {
                let score = decode_score(&value)?;
                args.push(format_score(score).into_bytes());
                args.push(parsed.subkey);
            }
            RedisType::Hash => {
                args.push(parsed.subkey);
                args.push(value.clone());
            }
            RedisType::List => args.push(value.clone()),
            RedisType::Bitmap => {
                encode_bitmap_fragment(user_key, &parsed.subkey, &value, sink)?;
            }
            _ => {}
        }

        // Bitmaps emit one SETBIT per bit above and never chunk.
        if meta.ty != RedisType::Bitmap {
            item_count += 1;
            if item_count >= MAX_ITEMS_IN_COMMAND {
                sink.push_command(args.clone())?;
                item_count = 0;
                args.truncate(2);
            }
        }
    }

    if item_count > 0 {
        sink.push_command(args)?;
    }

    if meta.expire_ms > 0 {
        sink.push_command(pexpireat(user_key, meta.expire_ms))?;
    }

    Ok(())
}

fn encode_bitmap_fragment(
    user_key: &[u8],
    fragment_subkey: &[u8],
    fragment: &[u8],
    sink: &mut dyn CommandSink,
) -> anyhow::Result<()> {
    let index: u64 = std::str::from_utf8(fragment_subkey)
        .ok()
        .and_then(|s| s.parse().ok())
        .context("bitmap fragment index is not a valid integer")?;

    for (byte_idx, &byte) in fragment.iter().enumerate() {
        if byte == 0 {
            continue;
        }
        for bit_idx in 0..8 {
            if byte & (1 << bit_idx) != 0 {
                let offset = index * 8 + (byte_idx as u64) * 8 + bit_idx;
                sink.push_command(vec![
                    b"SETBIT".to_vec(),
                    user_key.to_vec(),
                    offset.to_string().into_bytes(),
                    b"1".to_vec(),
                ])?;
            }
        }
    }
    Ok(())
}

fn encode_stream(
    snapshot: &EngineSnapshot,
    user_key: &[u8],
    stream: &StreamMetadata,
    sink: &mut dyn CommandSink,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    let slot = key_slot(user_key);
    let prefix = subkey_prefix(slot, user_key, stream.meta.version);

    for item in snapshot.iter_prefix(ColumnFamilyId::Stream, prefix) {
        if stop.load(Ordering::Acquire) {
            anyhow::bail!(ERR_TASK_CANCELED);
        }
        let (encoded_key, value) = item?;
        let parsed = ParsedSubkey::parse(&encoded_key)?;
        let id = StreamEntryId::decode(&parsed.subkey)?;

        let mut args = vec![
            b"XADD".to_vec(),
            user_key.to_vec(),
            id.to_string().into_bytes(),
        ];
        for (field, field_value) in decode_stream_fields(&value)? {
            args.push(field);
            args.push(field_value);
        }
        sink.push_command(args)?;
    }

    // XTRIM/XDEL history is not replayed; XSETID restores the counters the
    // destination cannot derive from XADDs alone.
    sink.push_command(vec![
        b"XSETID".to_vec(),
        user_key.to_vec(),
        stream.last_generated_id.to_string().into_bytes(),
        b"ENTRIESADDED".to_vec(),
        stream.entries_added.to_string().into_bytes(),
        b"MAXDELETEDID".to_vec(),
        stream.max_deleted_entry_id.to_string().into_bytes(),
    ])?;

    if stream.meta.expire_ms > 0 {
        sink.push_command(pexpireat(user_key, stream.meta.expire_ms))?;
    }

    Ok(())
}

/// Trailing TTL restore for composite types.
pub fn pexpireat(user_key: &[u8], expire_ms: u64) -> Vec<Vec<u8>> {
    vec![
        b"PEXPIREAT".to_vec(),
        user_key.to_vec(),
        expire_ms.to_string().into_bytes(),
    ]
}

/// Stringifies a zset score in a form Redis re-parses exactly.
pub fn format_score(score: f64) -> String {
    // Shortest round-trip formatting; integral scores drop the fraction.
    format!("{score}")
}
