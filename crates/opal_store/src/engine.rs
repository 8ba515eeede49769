//! Fjall-backed storage engine with a tailable write-ahead log.
//!
//! Four partitions mirror the column families of the key layout: `metadata`
//! rows per user key, `subkey` elements for composite types, the `zset_score`
//! ordering index, and `stream` entries. Every mutation is appended to the
//! in-process [`WalLog`] first (assigning sequence numbers), then applied to
//! the partitions in one fjall batch while the writer lock is held. Snapshots
//! pin all partitions at one instant together with the WAL sequence, so a
//! reader sees a single point in time across column families.

use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::metadata::{
    encode_score_index, encode_stream_fields, encode_subkey, subkey_prefix, ListMetadata,
    Metadata, RedisType, StreamEntryId, StreamMetadata, BITMAP_FRAGMENT_BYTES,
};
use crate::slot::{encode_metadata_key, key_slot, SlotId};
use crate::wal::{SlotWalIter, WalBatch, WalLog, WalOp, DEFAULT_RETAIN_BATCHES};

/// Column family identifier, stable across the wire formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ColumnFamilyId {
    Metadata = 0,
    Subkey = 1,
    ZsetScore = 2,
    Stream = 3,
}

impl ColumnFamilyId {
    pub fn from_u8(id: u8) -> anyhow::Result<Self> {
        Ok(match id {
            0 => Self::Metadata,
            1 => Self::Subkey,
            2 => Self::ZsetScore,
            3 => Self::Stream,
            other => anyhow::bail!("unknown column family id {other}"),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Subkey => "subkey",
            Self::ZsetScore => "zset_score",
            Self::Stream => "stream",
        }
    }
}

/// Side of a list push, carried in the batch log marker because the stored
/// subkey layout does not preserve the original operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListDirection {
    Left,
    Right,
}

/// Encodes the per-batch log marker: value type plus optional list hint.
pub fn encode_log_data(ty: RedisType, hint: Option<ListDirection>) -> Vec<u8> {
    let hint_byte = match hint {
        None => 0u8,
        Some(ListDirection::Right) => 1,
        Some(ListDirection::Left) => 2,
    };
    vec![ty as u8, hint_byte]
}

/// Decodes a batch log marker.
pub fn decode_log_data(raw: &[u8]) -> anyhow::Result<(RedisType, Option<ListDirection>)> {
    anyhow::ensure!(raw.len() >= 2, "short log marker");
    let ty = RedisType::from_u8(raw[0])?;
    let hint = match raw[1] {
        0 => None,
        1 => Some(ListDirection::Right),
        2 => Some(ListDirection::Left),
        other => anyhow::bail!("unknown list hint {other}"),
    };
    Ok((ty, hint))
}

/// Consistent point-in-time view across all column families.
///
/// Releases its pin on drop; `SlotEngine::open_snapshot_count` observes the
/// number of live pins so tests can assert against leaks.
pub struct EngineSnapshot {
    wal_seq: u64,
    metadata: fjall::Snapshot,
    subkey: fjall::Snapshot,
    zset_score: fjall::Snapshot,
    stream: fjall::Snapshot,
    open_counter: Arc<AtomicI64>,
}

impl EngineSnapshot {
    /// WAL sequence number at which this snapshot was pinned.
    pub fn wal_seq(&self) -> u64 {
        self.wal_seq
    }

    fn view(&self, cf: ColumnFamilyId) -> &fjall::Snapshot {
        match cf {
            ColumnFamilyId::Metadata => &self.metadata,
            ColumnFamilyId::Subkey => &self.subkey,
            ColumnFamilyId::ZsetScore => &self.zset_score,
            ColumnFamilyId::Stream => &self.stream,
        }
    }

    pub fn get(&self, cf: ColumnFamilyId, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .view(cf)
            .get(key)
            .with_context(|| format!("snapshot read from {}", cf.name()))?
            .map(|v| v.to_vec()))
    }

    /// Iterates `(key, value)` pairs of one column family under the snapshot.
    pub fn iter_prefix<'a>(
        &'a self,
        cf: ColumnFamilyId,
        prefix: Vec<u8>,
    ) -> impl Iterator<Item = anyhow::Result<(Vec<u8>, Vec<u8>)>> + 'a {
        self.view(cf).prefix(prefix).map(move |item| {
            let (key, value) =
                item.with_context(|| format!("snapshot scan of {}", cf.name()))?;
            Ok((key.to_vec(), value.to_vec()))
        })
    }
}

impl Drop for EngineSnapshot {
    fn drop(&mut self) {
        self.open_counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The slot-aware storage engine.
pub struct SlotEngine {
    keyspace: Keyspace,
    metadata: PartitionHandle,
    subkey: PartitionHandle,
    zset_score: PartitionHandle,
    stream: PartitionHandle,
    wal: WalLog,
    write_lock: Mutex<()>,
    version_counter: AtomicU64,
    open_snapshots: Arc<AtomicI64>,
}

impl SlotEngine {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::open_with_retention(path, DEFAULT_RETAIN_BATCHES)
    }

    pub fn open_with_retention(
        path: impl AsRef<Path>,
        wal_retain_batches: usize,
    ) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open keyspace")?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;
        let subkey = keyspace.open_partition("subkey", PartitionCreateOptions::default())?;
        let zset_score =
            keyspace.open_partition("zset_score", PartitionCreateOptions::default())?;
        let stream = keyspace.open_partition("stream", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            metadata,
            subkey,
            zset_score,
            stream,
            wal: WalLog::new(wal_retain_batches),
            write_lock: Mutex::new(()),
            // Versions only need to outrun any previous run of this process.
            version_counter: AtomicU64::new(epoch_micros()),
            open_snapshots: Arc::new(AtomicI64::new(0)),
        })
    }

    fn partition(&self, cf: ColumnFamilyId) -> &PartitionHandle {
        match cf {
            ColumnFamilyId::Metadata => &self.metadata,
            ColumnFamilyId::Subkey => &self.subkey,
            ColumnFamilyId::ZsetScore => &self.zset_score,
            ColumnFamilyId::Stream => &self.stream,
        }
    }

    fn next_version(&self) -> u64 {
        self.version_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Pins a snapshot of all column families plus the WAL sequence.
    ///
    /// Blocks writers only for the capture instant.
    pub fn pin_snapshot(&self) -> anyhow::Result<EngineSnapshot> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let instant = self.keyspace.instant();
        let snapshot = EngineSnapshot {
            wal_seq: self.wal.latest_seq(),
            metadata: self.metadata.snapshot_at(instant),
            subkey: self.subkey.snapshot_at(instant),
            zset_score: self.zset_score.snapshot_at(instant),
            stream: self.stream.snapshot_at(instant),
            open_counter: Arc::clone(&self.open_snapshots),
        };
        self.open_snapshots.fetch_add(1, Ordering::AcqRel);
        Ok(snapshot)
    }

    /// Number of currently pinned snapshots.
    pub fn open_snapshot_count(&self) -> i64 {
        self.open_snapshots.load(Ordering::Acquire)
    }

    /// Last applied WAL sequence number.
    pub fn latest_seq(&self) -> u64 {
        self.wal.latest_seq()
    }

    /// Tail of retained WAL batches reaching `from_seq` or later.
    pub fn wal_batches_from(&self, from_seq: u64) -> anyhow::Result<Vec<WalBatch>> {
        self.wal.batches_from(from_seq)
    }

    /// Slot-filtered WAL tail starting at `from_seq`.
    pub fn slot_wal_iter(&self, slot: SlotId, from_seq: u64) -> anyhow::Result<SlotWalIter> {
        Ok(SlotWalIter::new(self.wal.batches_from(from_seq)?, slot))
    }

    /// Runs `f` while every client write is blocked. Used only for the brief
    /// cutover window of a slot migration.
    pub fn with_write_exclusivity<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        f()
    }

    /// Flushes the keyspace journal to disk.
    pub fn persist(&self) -> anyhow::Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Appends `ops` to the WAL and applies them to the partitions.
    fn commit(&self, ops: Vec<WalOp>) -> anyhow::Result<u64> {
        let mut batch = self.keyspace.batch();
        for op in &ops {
            match op {
                WalOp::LogData(_) => {}
                WalOp::Put { cf, key, value } => {
                    batch.insert(self.partition(*cf), key.clone(), value.clone());
                }
                WalOp::Delete { cf, key } => {
                    batch.remove(self.partition(*cf), key.clone());
                }
                WalOp::DeleteRange { cf, begin, end } => {
                    let part = self.partition(*cf);
                    for item in part.range(begin.clone()..end.clone()) {
                        let (key, _) = item.context("delete-range scan")?;
                        batch.remove(part, key.to_vec());
                    }
                }
            }
        }
        let begin_seq = self.wal.append(ops);
        batch.commit().context("apply write batch")?;
        Ok(begin_seq)
    }

    /// Reads the latest metadata row bytes for a user key.
    pub fn get_metadata_raw(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let mkey = encode_metadata_key(key_slot(key), key);
        Ok(self.metadata.get(mkey)?.map(|v| v.to_vec()))
    }

    /// Stores a string value, replacing any previous key generation.
    pub fn put_string(&self, key: &[u8], value: &[u8], expire_ms: u64) -> anyhow::Result<()> {
        let slot = key_slot(key);
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut meta = Metadata::new(RedisType::String, self.next_version());
        meta.expire_ms = expire_ms;
        let mut row = meta.encode();
        row.extend_from_slice(value);
        self.commit(vec![
            WalOp::LogData(encode_log_data(RedisType::String, None)),
            WalOp::Put {
                cf: ColumnFamilyId::Metadata,
                key: encode_metadata_key(slot, key),
                value: row,
            },
        ])?;
        Ok(())
    }

    /// Reads a string value, treating an elapsed TTL as absent.
    pub fn get_string(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(raw) = self.get_metadata_raw(key)? else {
            return Ok(None);
        };
        let (meta, rest) = Metadata::decode(&raw)?;
        anyhow::ensure!(meta.ty == RedisType::String, "value has wrong type");
        if meta.expired() {
            return Ok(None);
        }
        Ok(Some(rest.to_vec()))
    }

    /// Deletes a key and every element row of its current generation.
    pub fn delete_key(&self, key: &[u8]) -> anyhow::Result<bool> {
        let slot = key_slot(key);
        let mkey = encode_metadata_key(slot, key);
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let Some(raw) = self.metadata.get(&mkey)? else {
            return Ok(false);
        };
        let (meta, _) = Metadata::decode(&raw)?;

        let mut ops = vec![WalOp::LogData(encode_log_data(meta.ty, None))];
        let prefix = subkey_prefix(slot, key, meta.version);
        for cf in [
            ColumnFamilyId::Subkey,
            ColumnFamilyId::ZsetScore,
            ColumnFamilyId::Stream,
        ] {
            for item in self.partition(cf).prefix(prefix.clone()) {
                let (subkey, _) = item.context("subkey scan for delete")?;
                ops.push(WalOp::Delete {
                    cf,
                    key: subkey.to_vec(),
                });
            }
        }
        ops.push(WalOp::Delete {
            cf: ColumnFamilyId::Metadata,
            key: mkey,
        });
        self.commit(ops)?;
        Ok(true)
    }

    /// Sets an absolute expiration on an existing key.
    pub fn set_expire(&self, key: &[u8], expire_ms: u64) -> anyhow::Result<bool> {
        let slot = key_slot(key);
        let mkey = encode_metadata_key(slot, key);
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let Some(raw) = self.metadata.get(&mkey)? else {
            return Ok(false);
        };
        let (meta, rest) = Metadata::decode(&raw)?;
        let mut updated = meta;
        updated.expire_ms = expire_ms;
        let mut row = updated.encode();
        row.extend_from_slice(rest);
        self.commit(vec![
            WalOp::LogData(encode_log_data(meta.ty, None)),
            WalOp::Put {
                cf: ColumnFamilyId::Metadata,
                key: mkey,
                value: row,
            },
        ])?;
        Ok(true)
    }

    /// Reads the current metadata generation for a composite write, or starts
    /// a fresh one of the expected type.
    fn load_or_create_meta(
        &self,
        mkey: &[u8],
        expected: RedisType,
    ) -> anyhow::Result<Metadata> {
        match self.metadata.get(mkey)? {
            Some(raw) => {
                let (meta, _) = Metadata::decode(&raw)?;
                anyhow::ensure!(meta.ty == expected, "value has wrong type");
                Ok(meta)
            }
            None => Ok(Metadata::new(expected, self.next_version())),
        }
    }

    /// Sets hash fields; returns the number of newly created fields.
    pub fn hash_set(&self, key: &[u8], pairs: &[(Vec<u8>, Vec<u8>)]) -> anyhow::Result<u64> {
        let slot = key_slot(key);
        let mkey = encode_metadata_key(slot, key);
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut meta = self.load_or_create_meta(&mkey, RedisType::Hash)?;

        let mut ops = vec![WalOp::LogData(encode_log_data(RedisType::Hash, None))];
        let mut added = 0u64;
        for (field, value) in pairs {
            let subkey = encode_subkey(slot, key, meta.version, field);
            if self.subkey.get(&subkey)?.is_none() {
                added += 1;
            }
            ops.push(WalOp::Put {
                cf: ColumnFamilyId::Subkey,
                key: subkey,
                value: value.clone(),
            });
        }
        meta.size += added;
        ops.push(WalOp::Put {
            cf: ColumnFamilyId::Metadata,
            key: mkey,
            value: meta.encode(),
        });
        self.commit(ops)?;
        Ok(added)
    }

    /// Pushes values onto a list; index growth direction follows the side.
    pub fn list_push(
        &self,
        key: &[u8],
        values: &[Vec<u8>],
        side: ListDirection,
    ) -> anyhow::Result<u64> {
        let slot = key_slot(key);
        let mkey = encode_metadata_key(slot, key);
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut list = match self.metadata.get(&mkey)? {
            Some(raw) => ListMetadata::decode(&raw)?,
            None => ListMetadata::new(self.next_version()),
        };

        let mut ops = vec![WalOp::LogData(encode_log_data(
            RedisType::List,
            Some(side),
        ))];
        for value in values {
            let index = match side {
                ListDirection::Right => {
                    let idx = list.tail;
                    list.tail += 1;
                    idx
                }
                ListDirection::Left => {
                    list.head -= 1;
                    list.head
                }
            };
            ops.push(WalOp::Put {
                cf: ColumnFamilyId::Subkey,
                key: encode_subkey(slot, key, list.meta.version, &index.to_be_bytes()),
                value: value.clone(),
            });
        }
        list.meta.size = list.tail - list.head;
        let len = list.meta.size;
        ops.push(WalOp::Put {
            cf: ColumnFamilyId::Metadata,
            key: mkey,
            value: list.encode(),
        });
        self.commit(ops)?;
        Ok(len)
    }

    /// Adds set members; returns the number of new members.
    pub fn set_add(&self, key: &[u8], members: &[Vec<u8>]) -> anyhow::Result<u64> {
        let slot = key_slot(key);
        let mkey = encode_metadata_key(slot, key);
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut meta = self.load_or_create_meta(&mkey, RedisType::Set)?;

        let mut ops = vec![WalOp::LogData(encode_log_data(RedisType::Set, None))];
        let mut added = 0u64;
        for member in members {
            let subkey = encode_subkey(slot, key, meta.version, member);
            if self.subkey.get(&subkey)?.is_none() {
                added += 1;
            }
            ops.push(WalOp::Put {
                cf: ColumnFamilyId::Subkey,
                key: subkey,
                value: Vec::new(),
            });
        }
        meta.size += added;
        ops.push(WalOp::Put {
            cf: ColumnFamilyId::Metadata,
            key: mkey,
            value: meta.encode(),
        });
        self.commit(ops)?;
        Ok(added)
    }

    /// Adds scored members; keeps the ordering index in step.
    pub fn zset_add(&self, key: &[u8], items: &[(f64, Vec<u8>)]) -> anyhow::Result<u64> {
        let slot = key_slot(key);
        let mkey = encode_metadata_key(slot, key);
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut meta = self.load_or_create_meta(&mkey, RedisType::Zset)?;

        let mut ops = vec![WalOp::LogData(encode_log_data(RedisType::Zset, None))];
        let mut added = 0u64;
        for (score, member) in items {
            let member_key = encode_subkey(slot, key, meta.version, member);
            if let Some(old) = self.subkey.get(&member_key)? {
                // Drop the stale ordering row when the score changes.
                let old_score = decode_score(&old)?;
                if old_score != *score {
                    let mut stale = encode_score_index(old_score).to_vec();
                    stale.extend_from_slice(member);
                    ops.push(WalOp::Delete {
                        cf: ColumnFamilyId::ZsetScore,
                        key: encode_subkey(slot, key, meta.version, &stale),
                    });
                }
            } else {
                added += 1;
            }
            ops.push(WalOp::Put {
                cf: ColumnFamilyId::Subkey,
                key: member_key,
                value: score.to_be_bytes().to_vec(),
            });
            let mut index = encode_score_index(*score).to_vec();
            index.extend_from_slice(member);
            ops.push(WalOp::Put {
                cf: ColumnFamilyId::ZsetScore,
                key: encode_subkey(slot, key, meta.version, &index),
                value: Vec::new(),
            });
        }
        meta.size += added;
        ops.push(WalOp::Put {
            cf: ColumnFamilyId::Metadata,
            key: mkey,
            value: meta.encode(),
        });
        self.commit(ops)?;
        Ok(added)
    }

    /// Adds 64-bit integers to a sortedint key.
    pub fn sortedint_add(&self, key: &[u8], ids: &[u64]) -> anyhow::Result<u64> {
        let slot = key_slot(key);
        let mkey = encode_metadata_key(slot, key);
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut meta = self.load_or_create_meta(&mkey, RedisType::Sortedint)?;

        let mut ops = vec![WalOp::LogData(encode_log_data(RedisType::Sortedint, None))];
        let mut added = 0u64;
        for id in ids {
            let subkey = encode_subkey(slot, key, meta.version, &id.to_be_bytes());
            if self.subkey.get(&subkey)?.is_none() {
                added += 1;
            }
            ops.push(WalOp::Put {
                cf: ColumnFamilyId::Subkey,
                key: subkey,
                value: Vec::new(),
            });
        }
        meta.size += added;
        ops.push(WalOp::Put {
            cf: ColumnFamilyId::Metadata,
            key: mkey,
            value: meta.encode(),
        });
        self.commit(ops)?;
        Ok(added)
    }

    /// Sets or clears one bit; fragments are 1024-byte rows keyed by the
    /// decimal byte offset of the fragment start.
    pub fn bitmap_set_bit(&self, key: &[u8], offset: u64, bit: bool) -> anyhow::Result<bool> {
        let slot = key_slot(key);
        let mkey = encode_metadata_key(slot, key);
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut meta = self.load_or_create_meta(&mkey, RedisType::Bitmap)?;

        let byte_offset = offset / 8;
        let fragment_start = byte_offset - (byte_offset % BITMAP_FRAGMENT_BYTES);
        let subkey = encode_subkey(
            slot,
            key,
            meta.version,
            fragment_start.to_string().as_bytes(),
        );
        let mut fragment = self
            .subkey
            .get(&subkey)?
            .map(|v| v.to_vec())
            .unwrap_or_default();
        let byte_index = (byte_offset - fragment_start) as usize;
        if fragment.len() <= byte_index {
            fragment.resize(byte_index + 1, 0);
        }
        let mask = 1u8 << (offset % 8);
        let old = fragment[byte_index] & mask != 0;
        if bit {
            fragment[byte_index] |= mask;
        } else {
            fragment[byte_index] &= !mask;
        }
        meta.size = meta.size.max(byte_offset + 1);

        self.commit(vec![
            WalOp::LogData(encode_log_data(RedisType::Bitmap, None)),
            WalOp::Put {
                cf: ColumnFamilyId::Subkey,
                key: subkey,
                value: fragment,
            },
            WalOp::Put {
                cf: ColumnFamilyId::Metadata,
                key: mkey,
                value: meta.encode(),
            },
        ])?;
        Ok(old)
    }

    /// Appends a stream entry; ids must be strictly increasing.
    pub fn stream_add(
        &self,
        key: &[u8],
        id: StreamEntryId,
        fields: &[(Vec<u8>, Vec<u8>)],
    ) -> anyhow::Result<()> {
        let slot = key_slot(key);
        let mkey = encode_metadata_key(slot, key);
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut stream = match self.metadata.get(&mkey)? {
            Some(raw) => StreamMetadata::decode(&raw)?,
            None => StreamMetadata::new(self.next_version()),
        };
        anyhow::ensure!(
            stream.meta.size == 0 || id > stream.last_generated_id,
            "stream entry id {id} not greater than {}",
            stream.last_generated_id
        );

        stream.last_generated_id = id;
        stream.entries_added += 1;
        stream.meta.size += 1;
        self.commit(vec![
            WalOp::LogData(encode_log_data(RedisType::Stream, None)),
            WalOp::Put {
                cf: ColumnFamilyId::Stream,
                key: encode_subkey(slot, key, stream.meta.version, &id.encode()),
                value: encode_stream_fields(fields),
            },
            WalOp::Put {
                cf: ColumnFamilyId::Metadata,
                key: mkey,
                value: stream.encode(),
            },
        ])?;
        Ok(())
    }

    /// Deletes one stream entry and advances the max-deleted counter.
    pub fn stream_delete(&self, key: &[u8], id: StreamEntryId) -> anyhow::Result<bool> {
        let slot = key_slot(key);
        let mkey = encode_metadata_key(slot, key);
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let Some(raw) = self.metadata.get(&mkey)? else {
            return Ok(false);
        };
        let mut stream = StreamMetadata::decode(&raw)?;
        let entry_key = encode_subkey(slot, key, stream.meta.version, &id.encode());
        if self.stream.get(&entry_key)?.is_none() {
            return Ok(false);
        }

        stream.max_deleted_entry_id = stream.max_deleted_entry_id.max(id);
        stream.meta.size = stream.meta.size.saturating_sub(1);
        self.commit(vec![
            WalOp::LogData(encode_log_data(RedisType::Stream, None)),
            WalOp::Delete {
                cf: ColumnFamilyId::Stream,
                key: entry_key,
            },
            WalOp::Put {
                cf: ColumnFamilyId::Metadata,
                key: mkey,
                value: stream.encode(),
            },
        ])?;
        Ok(true)
    }

    /// Deletes every key in `[begin, end)` of one column family. Used by
    /// whole-DB flush maintenance; deliberately not slot-scoped.
    pub fn delete_range(
        &self,
        cf: ColumnFamilyId,
        begin: Vec<u8>,
        end: Vec<u8>,
    ) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        self.commit(vec![WalOp::DeleteRange { cf, begin, end }])?;
        Ok(())
    }
}

/// Decodes a zset member value back into its score.
pub fn decode_score(raw: &[u8]) -> anyhow::Result<f64> {
    anyhow::ensure!(raw.len() >= 8, "short zset score");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&raw[..8]);
    Ok(f64::from_be_bytes(buf))
}

fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}
