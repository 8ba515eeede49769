//! In-process write-ahead log with sequence-ordered tailing.
//!
//! Every engine write batch is appended here before it lands in the LSM
//! partitions. Each put/delete/delete-range consumes one sequence number;
//! log-data markers consume none, mirroring the underlying engine contract.
//! Retention is a bounded ring: tailing from a sequence older than the floor
//! reports a discontinuity instead of silently skipping data.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::engine::ColumnFamilyId;
use crate::slot::{slot_of_encoded_key, SlotId};

/// Default number of retained batches.
pub const DEFAULT_RETAIN_BATCHES: usize = 1 << 16;

/// One operation inside a write batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalOp {
    /// Type/command marker describing the batch; carries no key.
    LogData(Vec<u8>),
    Put {
        cf: ColumnFamilyId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: ColumnFamilyId,
        key: Vec<u8>,
    },
    /// Range deletion; may cross slot boundaries.
    DeleteRange {
        cf: ColumnFamilyId,
        begin: Vec<u8>,
        end: Vec<u8>,
    },
}

impl WalOp {
    /// Whether this op consumes a sequence number.
    fn consumes_seq(&self) -> bool {
        !matches!(self, WalOp::LogData(_))
    }
}

/// An ordered group of operations applied atomically at `begin_seq`.
#[derive(Clone, Debug)]
pub struct WalBatch {
    pub begin_seq: u64,
    pub ops: Vec<WalOp>,
}

impl WalBatch {
    /// Number of sequence numbers this batch consumes.
    pub fn seq_count(&self) -> u64 {
        self.ops.iter().filter(|op| op.consumes_seq()).count() as u64
    }

    /// Last sequence number covered by this batch.
    pub fn end_seq(&self) -> u64 {
        self.begin_seq + self.seq_count().saturating_sub(1)
    }
}

struct WalInner {
    batches: VecDeque<WalBatch>,
    /// Smallest sequence still retained; tails below this are discontinuous.
    floor_seq: u64,
    next_seq: u64,
}

/// Sequence-ordered log of write batches with bounded retention.
pub struct WalLog {
    inner: Mutex<WalInner>,
    retain_batches: usize,
}

impl WalLog {
    pub fn new(retain_batches: usize) -> Self {
        Self {
            inner: Mutex::new(WalInner {
                batches: VecDeque::new(),
                floor_seq: 1,
                next_seq: 1,
            }),
            retain_batches: retain_batches.max(1),
        }
    }

    /// Appends a batch, assigning its sequence range. Returns `begin_seq`.
    pub fn append(&self, ops: Vec<WalOp>) -> u64 {
        let mut inner = self.inner.lock().expect("wal lock poisoned");
        let begin_seq = inner.next_seq;
        let batch = WalBatch { begin_seq, ops };
        inner.next_seq = begin_seq + batch.seq_count().max(1);
        inner.batches.push_back(batch);
        while inner.batches.len() > self.retain_batches {
            if let Some(evicted) = inner.batches.pop_front() {
                inner.floor_seq = evicted.end_seq() + 1;
            }
        }
        begin_seq
    }

    /// Last applied sequence number (0 when the log is empty).
    pub fn latest_seq(&self) -> u64 {
        let inner = self.inner.lock().expect("wal lock poisoned");
        inner.next_seq - 1
    }

    /// All retained batches whose range reaches `from_seq` or later.
    ///
    /// Fails with a discontinuity error if `from_seq` predates retention, so
    /// a caller can never silently miss evicted updates.
    pub fn batches_from(&self, from_seq: u64) -> anyhow::Result<Vec<WalBatch>> {
        let inner = self.inner.lock().expect("wal lock poisoned");
        anyhow::ensure!(
            from_seq >= inner.floor_seq,
            "wal tail from {} is below retention floor {}",
            from_seq,
            inner.floor_seq
        );
        Ok(inner
            .batches
            .iter()
            .filter(|batch| batch.end_seq() >= from_seq)
            .cloned()
            .collect())
    }
}

/// A WAL item restricted to one slot, tagged like the raw batch ops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotWalEntry {
    LogData(Vec<u8>),
    Put {
        cf: ColumnFamilyId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: ColumnFamilyId,
        key: Vec<u8>,
    },
    /// Kept tagged so the consumer can decide to drop it; range deletions
    /// cannot be attributed to a single slot.
    DeleteRange {
        cf: ColumnFamilyId,
        begin: Vec<u8>,
        end: Vec<u8>,
    },
}

/// Batch-granular iterator over the WAL entries touching one slot.
pub struct SlotWalIter {
    batches: VecDeque<WalBatch>,
    slot: SlotId,
}

impl SlotWalIter {
    pub fn new(batches: Vec<WalBatch>, slot: SlotId) -> Self {
        Self {
            batches: batches.into(),
            slot,
        }
    }

    /// Begin sequence of the next unconsumed batch, or `u64::MAX` at the end.
    pub fn next_sequence_number(&self) -> u64 {
        self.batches.front().map_or(u64::MAX, |b| b.begin_seq)
    }

    /// Next batch's slot-relevant entries, preceded by the batch log marker
    /// when any put/delete matched. Batches with nothing for the slot yield
    /// an empty entry list so the caller still observes sequence progress.
    pub fn next_batch(&mut self) -> Option<(u64, Vec<SlotWalEntry>)> {
        let batch = self.batches.pop_front()?;
        let mut marker: Option<Vec<u8>> = None;
        let mut matched = Vec::new();
        for op in &batch.ops {
            match op {
                WalOp::LogData(data) => marker = Some(data.clone()),
                WalOp::Put { cf, key, value } => {
                    if slot_of_encoded_key(key) == Some(self.slot) {
                        matched.push(SlotWalEntry::Put {
                            cf: *cf,
                            key: key.clone(),
                            value: value.clone(),
                        });
                    }
                }
                WalOp::Delete { cf, key } => {
                    if slot_of_encoded_key(key) == Some(self.slot) {
                        matched.push(SlotWalEntry::Delete {
                            cf: *cf,
                            key: key.clone(),
                        });
                    }
                }
                WalOp::DeleteRange { cf, begin, end } => {
                    matched.push(SlotWalEntry::DeleteRange {
                        cf: *cf,
                        begin: begin.clone(),
                        end: end.clone(),
                    });
                }
            }
        }

        let only_ranges = matched
            .iter()
            .all(|entry| matches!(entry, SlotWalEntry::DeleteRange { .. }));
        let mut entries = Vec::with_capacity(matched.len() + 1);
        if !matched.is_empty() && !only_ranges {
            if let Some(data) = marker {
                entries.push(SlotWalEntry::LogData(data));
            }
        }
        entries.extend(matched);
        Some((batch.begin_seq, entries))
    }
}
