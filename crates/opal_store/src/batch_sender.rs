//! Rate-limited raw key/value batch replication.
//!
//! Raw mode ships storage-layout records instead of replayed commands: the
//! sender accumulates put/delete records (plus per-batch log markers), and
//! flushes them as one `APPLYBATCH` command whose payload is a crc32-framed
//! record list the destination applies atomically. A byte/s budget is
//! enforced by sleeping off the remainder of the window the previous batch
//! earned. Both the flush threshold and the budget may change between
//! flushes to honor live configuration updates.

use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::command_encoder::resp_command;
use crate::dst_client::DstClient;
use crate::engine::ColumnFamilyId;

/// Operation count bound per batch, alongside the byte threshold.
pub const MAX_OPS_IN_BATCH: usize = 1024;

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;
const OP_LOG_DATA: u8 = 2;

/// One record of the raw replication stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawRecord {
    Put {
        cf: ColumnFamilyId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: ColumnFamilyId,
        key: Vec<u8>,
    },
    LogData(Vec<u8>),
}

impl RawRecord {
    fn wire_len(&self) -> usize {
        match self {
            RawRecord::Put { key, value, .. } => 2 + 4 + key.len() + 4 + value.len(),
            RawRecord::Delete { key, .. } => 2 + 4 + key.len() + 4,
            RawRecord::LogData(data) => 2 + 4 + data.len() + 4,
        }
    }
}

pub struct BatchSender {
    pending: Vec<RawRecord>,
    pending_bytes: usize,
    /// Log marker prepended to every sent batch until replaced.
    prefix_log_data: Option<Vec<u8>>,
    max_bytes: usize,
    bytes_per_sec: u64,
    last_send: Option<(Instant, usize)>,
    sent_bytes: u64,
    sent_batches: u64,
    entries: u64,
}

impl BatchSender {
    pub fn new(max_bytes: usize, bytes_per_sec: u64) -> Self {
        Self {
            pending: Vec::new(),
            pending_bytes: 0,
            prefix_log_data: None,
            max_bytes: max_bytes.max(1),
            bytes_per_sec,
            last_send: None,
            sent_bytes: 0,
            sent_batches: 0,
            entries: 0,
        }
    }

    pub fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes.max(1);
    }

    pub fn set_bytes_per_second(&mut self, bytes_per_sec: u64) {
        self.bytes_per_sec = bytes_per_sec;
    }

    pub fn set_prefix_log_data(&mut self, data: Vec<u8>) {
        self.prefix_log_data = Some(data);
    }

    pub fn put(&mut self, cf: ColumnFamilyId, key: Vec<u8>, value: Vec<u8>) {
        let record = RawRecord::Put { cf, key, value };
        self.pending_bytes += record.wire_len();
        self.pending.push(record);
    }

    pub fn delete(&mut self, cf: ColumnFamilyId, key: Vec<u8>) {
        let record = RawRecord::Delete { cf, key };
        self.pending_bytes += record.wire_len();
        self.pending.push(record);
    }

    pub fn put_log_data(&mut self, data: Vec<u8>) {
        let record = RawRecord::LogData(data);
        self.pending_bytes += record.wire_len();
        self.pending.push(record);
    }

    pub fn is_full(&self) -> bool {
        self.pending_bytes >= self.max_bytes || self.pending.len() >= MAX_OPS_IN_BATCH
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    pub fn sent_batches(&self) -> u64 {
        self.sent_batches
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Effective send rate in KiB/s since `start`.
    pub fn rate_kib_per_sec(&self, start: Instant) -> f64 {
        let secs = start.elapsed().as_secs_f64().max(f64::EPSILON);
        self.sent_bytes as f64 / 1024.0 / secs
    }

    /// Flushes pending records as one batch and checks the single reply.
    /// A no-op when nothing is pending.
    pub fn send(&mut self, dst: &mut DstClient, stop: &AtomicBool) -> anyhow::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut records = Vec::with_capacity(self.pending.len() + 1);
        if let Some(prefix) = &self.prefix_log_data {
            records.push(RawRecord::LogData(prefix.clone()));
        }
        let batch_entries = self.pending.len() as u64;
        records.append(&mut self.pending);
        self.pending_bytes = 0;

        let payload = encode_apply_batch(&records);
        self.apply_rate_limit();

        let command = resp_command(&[b"APPLYBATCH".to_vec(), payload.clone()]);
        dst.send(&command).context("send raw batch")?;
        dst.check_single_response(stop)
            .context("check raw batch response")?;

        self.last_send = Some((Instant::now(), payload.len()));
        self.sent_bytes += payload.len() as u64;
        self.sent_batches += 1;
        self.entries += batch_entries;
        Ok(())
    }

    fn apply_rate_limit(&self) {
        if self.bytes_per_sec == 0 {
            return;
        }
        let Some((at, bytes)) = self.last_send else {
            return;
        };
        let earned = Duration::from_secs_f64(bytes as f64 / self.bytes_per_sec as f64);
        let elapsed = at.elapsed();
        if elapsed < earned {
            std::thread::sleep(earned - elapsed);
        }
    }
}

/// Encodes records into the framed batch payload:
/// `[payload_len u32][crc32 u32][count u32][records...]`, all big-endian.
pub fn encode_apply_batch(records: &[RawRecord]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(records.len() as u32).to_be_bytes());
    for record in records {
        match record {
            RawRecord::Put { cf, key, value } => {
                body.push(OP_PUT);
                body.push(*cf as u8);
                body.extend_from_slice(&(key.len() as u32).to_be_bytes());
                body.extend_from_slice(key);
                body.extend_from_slice(&(value.len() as u32).to_be_bytes());
                body.extend_from_slice(value);
            }
            RawRecord::Delete { cf, key } => {
                body.push(OP_DELETE);
                body.push(*cf as u8);
                body.extend_from_slice(&(key.len() as u32).to_be_bytes());
                body.extend_from_slice(key);
                body.extend_from_slice(&0u32.to_be_bytes());
            }
            RawRecord::LogData(data) => {
                body.push(OP_LOG_DATA);
                body.push(0);
                body.extend_from_slice(&(data.len() as u32).to_be_bytes());
                body.extend_from_slice(data);
                body.extend_from_slice(&0u32.to_be_bytes());
            }
        }
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    let checksum = hasher.finalize();

    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&checksum.to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Decodes and checksum-verifies a framed batch payload.
pub fn decode_apply_batch(payload: &[u8]) -> anyhow::Result<Vec<RawRecord>> {
    anyhow::ensure!(payload.len() >= 8, "short batch frame");
    let body_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let expected_crc = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    anyhow::ensure!(payload.len() == 8 + body_len, "batch frame length mismatch");
    let body = &payload[8..];

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    anyhow::ensure!(hasher.finalize() == expected_crc, "batch checksum mismatch");

    let mut offset = 0usize;
    let count = read_u32(body, &mut offset)? as usize;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        anyhow::ensure!(offset + 2 <= body.len(), "short batch record header");
        let op = body[offset];
        let cf_id = body[offset + 1];
        offset += 2;
        let key_len = read_u32(body, &mut offset)? as usize;
        anyhow::ensure!(offset + key_len <= body.len(), "short batch record key");
        let key = body[offset..offset + key_len].to_vec();
        offset += key_len;
        let value_len = read_u32(body, &mut offset)? as usize;
        anyhow::ensure!(offset + value_len <= body.len(), "short batch record value");
        let value = body[offset..offset + value_len].to_vec();
        offset += value_len;

        records.push(match op {
            OP_PUT => RawRecord::Put {
                cf: ColumnFamilyId::from_u8(cf_id)?,
                key,
                value,
            },
            OP_DELETE => RawRecord::Delete {
                cf: ColumnFamilyId::from_u8(cf_id)?,
                key,
            },
            OP_LOG_DATA => RawRecord::LogData(key),
            other => anyhow::bail!("unknown batch record op {other}"),
        });
    }
    Ok(records)
}

fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn frame_round_trip() {
        let records = vec![
            RawRecord::LogData(vec![3, 1]),
            RawRecord::Put {
                cf: ColumnFamilyId::Metadata,
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
            RawRecord::Delete {
                cf: ColumnFamilyId::Subkey,
                key: b"gone".to_vec(),
            },
        ];
        let payload = encode_apply_batch(&records);
        assert_eq!(decode_apply_batch(&payload).unwrap(), records);
    }

    #[test]
    fn corrupted_frame_is_rejected() {
        let records = vec![RawRecord::Put {
            cf: ColumnFamilyId::Metadata,
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        }];
        let mut payload = encode_apply_batch(&records);
        let last = payload.len() - 1;
        payload[last] ^= 0xff;
        assert!(decode_apply_batch(&payload).is_err());
    }

    #[test]
    fn fills_on_bytes_or_op_count() {
        let mut sender = BatchSender::new(64, 0);
        assert!(!sender.is_full());
        sender.put(
            ColumnFamilyId::Metadata,
            vec![0u8; 40],
            vec![0u8; 40],
        );
        assert!(sender.is_full());

        let mut sender = BatchSender::new(usize::MAX, 0);
        for i in 0..MAX_OPS_IN_BATCH {
            sender.put(ColumnFamilyId::Metadata, vec![i as u8], Vec::new());
        }
        assert!(sender.is_full());
    }

    #[test]
    fn send_flushes_counters_and_prefix_marker() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            // One +OK per expected batch; the client reads them as needed.
            socket.write_all(b"+OK\r\n+OK\r\n").unwrap();
            thread::sleep(std::time::Duration::from_millis(200));
        });

        let stop = AtomicBool::new(false);
        let mut dst = DstClient::connect("127.0.0.1", port).unwrap();
        let mut sender = BatchSender::new(1 << 20, 0);
        sender.set_prefix_log_data(vec![7, 0]);

        sender.put(ColumnFamilyId::Metadata, b"a".to_vec(), b"1".to_vec());
        sender.put(ColumnFamilyId::Subkey, b"b".to_vec(), b"2".to_vec());
        sender.send(&mut dst, &stop).unwrap();
        assert_eq!(sender.sent_batches(), 1);
        assert_eq!(sender.entries(), 2);
        assert!(sender.sent_bytes() > 0);

        // Empty flush is a no-op.
        sender.send(&mut dst, &stop).unwrap();
        assert_eq!(sender.sent_batches(), 1);

        sender.delete(ColumnFamilyId::Metadata, b"a".to_vec());
        sender.send(&mut dst, &stop).unwrap();
        assert_eq!(sender.sent_batches(), 2);
        assert_eq!(sender.entries(), 3);
        server.join().unwrap();
    }

    #[test]
    fn byte_budget_paces_consecutive_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket.write_all(b"+OK\r\n+OK\r\n").unwrap();
            thread::sleep(std::time::Duration::from_millis(500));
        });

        let stop = AtomicBool::new(false);
        let mut dst = DstClient::connect("127.0.0.1", port).unwrap();
        // Budget low enough that the second send must wait.
        let mut sender = BatchSender::new(1 << 20, 2_000);
        sender.put(ColumnFamilyId::Metadata, vec![0u8; 100], vec![0u8; 100]);
        sender.send(&mut dst, &stop).unwrap();
        let first_payload = sender.sent_bytes();

        let start = Instant::now();
        sender.put(ColumnFamilyId::Metadata, b"k".to_vec(), b"v".to_vec());
        sender.send(&mut dst, &stop).unwrap();
        let waited = start.elapsed();
        let earned = Duration::from_secs_f64(first_payload as f64 / 2_000.0);
        assert!(
            waited + Duration::from_millis(20) >= earned,
            "second send did not respect the byte budget: waited {waited:?}, earned {earned:?}"
        );
        server.join().unwrap();
    }
}
