//! Key metadata and the composite subkey layout.
//!
//! Every user key has one row in the metadata column family carrying its
//! type tag, expiration, version, and element count; strings append their
//! value to that row, lists append head/tail indexes, and streams append
//! their id counters. Elements of composite types live in per-type column
//! families under a composite key `[slot][key_len][key][version][subkey]`,
//! so one prefix scan walks a key's elements in element order.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;

/// Fixed-size portion of every metadata row.
pub const METADATA_HEADER_LEN: usize = 1 + 8 + 8 + 8;

/// First list index assigned to a fresh list; pushes grow in both directions.
pub const LIST_INDEX_BASE: u64 = 1 << 63;

/// Bytes covered by one bitmap fragment row.
pub const BITMAP_FRAGMENT_BYTES: u64 = 1024;

/// Value type of a user key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RedisType {
    None = 0,
    String = 1,
    Hash = 2,
    List = 3,
    Set = 4,
    Zset = 5,
    Bitmap = 6,
    Sortedint = 7,
    Stream = 8,
}

impl RedisType {
    pub fn from_u8(tag: u8) -> anyhow::Result<Self> {
        Ok(match tag {
            0 => Self::None,
            1 => Self::String,
            2 => Self::Hash,
            3 => Self::List,
            4 => Self::Set,
            5 => Self::Zset,
            6 => Self::Bitmap,
            7 => Self::Sortedint,
            8 => Self::Stream,
            other => anyhow::bail!("unknown value type tag {other}"),
        })
    }

    /// Types that may legitimately exist with zero stored elements.
    pub fn is_emptyable(self) -> bool {
        matches!(self, Self::String | Self::Stream)
    }
}

/// Decoded metadata row header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub ty: RedisType,
    /// Absolute expiration in unix milliseconds; 0 means no TTL.
    pub expire_ms: u64,
    /// Version separating element generations of the same user key.
    pub version: u64,
    /// Stored element count (bytes for bitmaps, 0 for strings).
    pub size: u64,
}

impl Metadata {
    pub fn new(ty: RedisType, version: u64) -> Self {
        Self {
            ty,
            expire_ms: 0,
            version,
            size: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_HEADER_LEN);
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.ty as u8);
        out.extend_from_slice(&self.expire_ms.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.size.to_be_bytes());
    }

    /// Decodes the header and returns it with the trailing payload
    /// (string value, list indexes, or stream counters).
    pub fn decode(raw: &[u8]) -> anyhow::Result<(Self, &[u8])> {
        anyhow::ensure!(raw.len() >= METADATA_HEADER_LEN, "short metadata row");
        let ty = RedisType::from_u8(raw[0])?;
        let mut offset = 1usize;
        let expire_ms = read_u64(raw, &mut offset)?;
        let version = read_u64(raw, &mut offset)?;
        let size = read_u64(raw, &mut offset)?;
        Ok((
            Self {
                ty,
                expire_ms,
                version,
                size,
            },
            &raw[offset..],
        ))
    }

    pub fn expired_at(&self, now_ms: u64) -> bool {
        self.expire_ms > 0 && self.expire_ms <= now_ms
    }

    pub fn expired(&self) -> bool {
        self.expired_at(now_ms())
    }
}

/// List metadata: header plus the open index interval `[head, tail)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListMetadata {
    pub meta: Metadata,
    pub head: u64,
    pub tail: u64,
}

impl ListMetadata {
    pub fn new(version: u64) -> Self {
        Self {
            meta: Metadata::new(RedisType::List, version),
            head: LIST_INDEX_BASE,
            tail: LIST_INDEX_BASE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_HEADER_LEN + 16);
        self.meta.encode_into(&mut out);
        out.extend_from_slice(&self.head.to_be_bytes());
        out.extend_from_slice(&self.tail.to_be_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> anyhow::Result<Self> {
        let (meta, rest) = Metadata::decode(raw)?;
        anyhow::ensure!(meta.ty == RedisType::List, "not a list metadata row");
        let mut offset = 0usize;
        let head = read_u64(rest, &mut offset).context("list head index")?;
        let tail = read_u64(rest, &mut offset).context("list tail index")?;
        Ok(Self { meta, head, tail })
    }
}

/// Stream entry id, ordered by `(ms, seq)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamEntryId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamEntryId {
    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.ms.to_be_bytes());
        out[8..].copy_from_slice(&self.seq.to_be_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(raw.len() >= 16, "short stream entry id");
        let mut offset = 0usize;
        let ms = read_u64(raw, &mut offset)?;
        let seq = read_u64(raw, &mut offset)?;
        Ok(Self { ms, seq })
    }
}

impl std::fmt::Display for StreamEntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// Stream metadata: header plus id counters restored by XSETID on migration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamMetadata {
    pub meta: Metadata,
    pub last_generated_id: StreamEntryId,
    pub max_deleted_entry_id: StreamEntryId,
    pub entries_added: u64,
}

impl StreamMetadata {
    pub fn new(version: u64) -> Self {
        Self {
            meta: Metadata::new(RedisType::Stream, version),
            last_generated_id: StreamEntryId::default(),
            max_deleted_entry_id: StreamEntryId::default(),
            entries_added: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_HEADER_LEN + 40);
        self.meta.encode_into(&mut out);
        out.extend_from_slice(&self.last_generated_id.encode());
        out.extend_from_slice(&self.max_deleted_entry_id.encode());
        out.extend_from_slice(&self.entries_added.to_be_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> anyhow::Result<Self> {
        let (meta, rest) = Metadata::decode(raw)?;
        anyhow::ensure!(meta.ty == RedisType::Stream, "not a stream metadata row");
        anyhow::ensure!(rest.len() >= 40, "short stream metadata row");
        let last_generated_id = StreamEntryId::decode(&rest[..16])?;
        let max_deleted_entry_id = StreamEntryId::decode(&rest[16..32])?;
        let mut offset = 32usize;
        let entries_added = read_u64(rest, &mut offset)?;
        Ok(Self {
            meta,
            last_generated_id,
            max_deleted_entry_id,
            entries_added,
        })
    }
}

/// Composes a subkey column-family key: `[slot][key_len][key][version][subkey]`.
pub fn encode_subkey(slot: u16, user_key: &[u8], version: u64, subkey: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 4 + user_key.len() + 8 + subkey.len());
    out.extend_from_slice(&slot.to_be_bytes());
    out.extend_from_slice(&(user_key.len() as u32).to_be_bytes());
    out.extend_from_slice(user_key);
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(subkey);
    out
}

/// Prefix covering every subkey of one `(user_key, version)` generation.
pub fn subkey_prefix(slot: u16, user_key: &[u8], version: u64) -> Vec<u8> {
    encode_subkey(slot, user_key, version, b"")
}

/// Parsed composite subkey.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedSubkey {
    pub slot: u16,
    pub user_key: Vec<u8>,
    pub version: u64,
    pub subkey: Vec<u8>,
}

impl ParsedSubkey {
    pub fn parse(encoded: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(encoded.len() >= 2 + 4 + 8, "short composite key");
        let slot = u16::from_be_bytes([encoded[0], encoded[1]]);
        let mut offset = 2usize;
        let key_len = read_u32(encoded, &mut offset)? as usize;
        anyhow::ensure!(
            offset + key_len + 8 <= encoded.len(),
            "composite key shorter than its declared key length"
        );
        let user_key = encoded[offset..offset + key_len].to_vec();
        offset += key_len;
        let version = read_u64(encoded, &mut offset)?;
        let subkey = encoded[offset..].to_vec();
        Ok(Self {
            slot,
            user_key,
            version,
            subkey,
        })
    }
}

/// Order-preserving big-endian encoding of an f64 score.
pub fn encode_score_index(score: f64) -> [u8; 8] {
    let bits = score.to_bits();
    let flipped = if bits & (1 << 63) != 0 {
        // Negative: flip all bits so larger magnitudes sort first.
        !bits
    } else {
        bits | (1 << 63)
    };
    flipped.to_be_bytes()
}

/// Encodes a stream entry's field/value list.
pub fn encode_stream_fields(fields: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(fields.len() as u32).to_be_bytes());
    for (field, value) in fields {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field);
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value);
    }
    out
}

/// Decodes a stream entry's field/value list.
pub fn decode_stream_fields(raw: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut offset = 0usize;
    let count = read_u32(raw, &mut offset)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let field_len = read_u32(raw, &mut offset)? as usize;
        anyhow::ensure!(offset + field_len <= raw.len(), "short stream field");
        let field = raw[offset..offset + field_len].to_vec();
        offset += field_len;
        let value_len = read_u32(raw, &mut offset)? as usize;
        anyhow::ensure!(offset + value_len <= raw.len(), "short stream value");
        let value = raw[offset..offset + value_len].to_vec();
        offset += value_len;
        out.push((field, value));
    }
    Ok(out)
}

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}

fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}
