//! Hash-slot mapping and the slot-prefixed key layout.
//!
//! Keys map to one of 16384 slots by CRC16 over the user key, honoring
//! `{hash tag}` braces so related keys can be pinned to one slot. Every
//! column family stores keys with a 2-byte big-endian slot prefix so that a
//! slot's contents form one contiguous range per partition.

/// Total number of hash slots in the cluster keyspace.
pub const HASH_SLOTS: u16 = 16384;
/// Largest valid slot id.
pub const MAX_SLOT: u16 = HASH_SLOTS - 1;

/// Slot identifier in `[0, 16383]`.
pub type SlotId = u16;

/// CRC16 (CCITT/XMODEM, poly 0x1021, init 0) as used by Redis cluster.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Maps a user key to its hash slot, honoring `{hash tag}` braces.
pub fn key_slot(key: &[u8]) -> SlotId {
    let hashed = hash_tag(key);
    crc16(hashed) % HASH_SLOTS
}

/// Returns the hash-tag substring if the key carries a non-empty `{...}`
/// section, otherwise the whole key.
fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let Some(close_rel) = key[open + 1..].iter().position(|&b| b == b'}') else {
        return key;
    };
    // An empty tag `{}` hashes the whole key, as Redis does.
    if close_rel == 0 {
        return key;
    }
    &key[open + 1..open + 1 + close_rel]
}

/// 2-byte big-endian slot prefix shared by all column families.
pub fn slot_prefix(slot: SlotId) -> [u8; 2] {
    slot.to_be_bytes()
}

/// Composes the metadata column-family key for a user key.
pub fn encode_metadata_key(slot: SlotId, user_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + user_key.len());
    out.extend_from_slice(&slot.to_be_bytes());
    out.extend_from_slice(user_key);
    out
}

/// Splits a metadata column-family key back into `(slot, user_key)`.
pub fn split_metadata_key(encoded: &[u8]) -> Option<(SlotId, &[u8])> {
    if encoded.len() < 2 {
        return None;
    }
    let slot = u16::from_be_bytes([encoded[0], encoded[1]]);
    Some((slot, &encoded[2..]))
}

/// Reads the slot prefix off any encoded key, regardless of column family.
pub fn slot_of_encoded_key(encoded: &[u8]) -> Option<SlotId> {
    if encoded.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([encoded[0], encoded[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_known_vector() {
        // Classic XMODEM check value.
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn key_slot_matches_redis_cluster_assignments() {
        // Well-known Redis cluster slot assignments.
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"bar"), 5061);
        assert_eq!(key_slot(b"hello"), 866);
    }

    #[test]
    fn hash_tag_pins_keys_to_one_slot() {
        assert_eq!(key_slot(b"{user1000}.following"), key_slot(b"{user1000}.followers"));
        assert_eq!(key_slot(b"{user1000}.following"), key_slot(b"user1000"));
    }

    #[test]
    fn empty_or_unclosed_tag_hashes_whole_key() {
        assert_eq!(key_slot(b"foo{}bar"), crc16(b"foo{}bar") % HASH_SLOTS);
        assert_eq!(key_slot(b"foo{bar"), crc16(b"foo{bar") % HASH_SLOTS);
    }

    #[test]
    fn metadata_key_round_trip() {
        let encoded = encode_metadata_key(1234, b"somekey");
        let (slot, key) = split_metadata_key(&encoded).unwrap();
        assert_eq!(slot, 1234);
        assert_eq!(key, b"somekey");
        assert_eq!(slot_of_encoded_key(&encoded), Some(1234));
    }
}
