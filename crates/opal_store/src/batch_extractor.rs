//! Reconstructs redis commands from WAL write batches for one slot.
//!
//! Command-mode incremental migration replays the WAL as high-level
//! commands. Each batch carries a log marker naming the value type (and the
//! push side for lists, which the stored subkey layout cannot preserve);
//! puts and deletes against the slot's keys become the equivalent commands,
//! everything touching other slots is skipped, and `DeleteRange` is dropped
//! entirely because it may cross slot boundaries (it only backs whole-DB
//! flush commands).

use crate::command_encoder::{format_score, pexpireat};
use crate::engine::{decode_log_data, decode_score, ColumnFamilyId, ListDirection};
use crate::metadata::{
    decode_stream_fields, Metadata, ParsedSubkey, RedisType, StreamEntryId,
};
use crate::slot::{split_metadata_key, SlotId};
use crate::wal::{WalBatch, WalOp};

/// Commands replaying `batch`'s effect on `slot`, in batch order.
pub fn extract_commands(batch: &WalBatch, slot: SlotId) -> anyhow::Result<Vec<Vec<Vec<u8>>>> {
    let mut out: Vec<Vec<Vec<u8>>> = Vec::new();
    let mut marker: Option<(RedisType, Option<ListDirection>)> = None;

    for op in &batch.ops {
        match op {
            WalOp::LogData(data) => marker = Some(decode_log_data(data)?),
            WalOp::Put { cf, key, value } => {
                extract_put(*cf, key, value, slot, marker, &mut out)?;
            }
            WalOp::Delete { cf, key } => {
                extract_delete(*cf, key, slot, marker, &mut out)?;
            }
            // Range deletions may cross slots; only whole-DB flushes emit
            // them, so they are not replayed into the destination.
            WalOp::DeleteRange { .. } => {}
        }
    }
    Ok(out)
}

fn extract_put(
    cf: ColumnFamilyId,
    key: &[u8],
    value: &[u8],
    slot: SlotId,
    marker: Option<(RedisType, Option<ListDirection>)>,
    out: &mut Vec<Vec<Vec<u8>>>,
) -> anyhow::Result<()> {
    match cf {
        ColumnFamilyId::Metadata => {
            let Some((key_slot, user_key)) = split_metadata_key(key) else {
                return Ok(());
            };
            if key_slot != slot {
                return Ok(());
            }
            let (meta, rest) = Metadata::decode(value)?;
            if meta.ty == RedisType::String {
                let mut args = vec![b"SET".to_vec(), user_key.to_vec(), rest.to_vec()];
                if meta.expire_ms > 0 {
                    args.push(b"PXAT".to_vec());
                    args.push(meta.expire_ms.to_string().into_bytes());
                }
                out.push(args);
            } else if meta.expire_ms > 0 {
                // Composite metadata rewrites only matter here for the TTL;
                // element changes travel as subkey ops.
                out.push(pexpireat(user_key, meta.expire_ms));
            }
        }
        ColumnFamilyId::Subkey => {
            let parsed = ParsedSubkey::parse(key)?;
            if parsed.slot != slot {
                return Ok(());
            }
            let Some((ty, hint)) = marker else {
                tracing::warn!(
                    key = %String::from_utf8_lossy(&parsed.user_key),
                    "subkey write without a batch log marker, skipping"
                );
                return Ok(());
            };
            match ty {
                RedisType::Hash => out.push(vec![
                    b"HSET".to_vec(),
                    parsed.user_key,
                    parsed.subkey,
                    value.to_vec(),
                ]),
                RedisType::Set => {
                    out.push(vec![b"SADD".to_vec(), parsed.user_key, parsed.subkey])
                }
                RedisType::Zset => {
                    let score = decode_score(value)?;
                    out.push(vec![
                        b"ZADD".to_vec(),
                        parsed.user_key,
                        format_score(score).into_bytes(),
                        parsed.subkey,
                    ]);
                }
                RedisType::Sortedint => {
                    anyhow::ensure!(parsed.subkey.len() == 8, "short sortedint id");
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&parsed.subkey);
                    out.push(vec![
                        b"SIADD".to_vec(),
                        parsed.user_key,
                        u64::from_be_bytes(buf).to_string().into_bytes(),
                    ]);
                }
                RedisType::List => {
                    let verb: &[u8] = match hint.unwrap_or(ListDirection::Right) {
                        ListDirection::Right => b"RPUSH",
                        ListDirection::Left => b"LPUSH",
                    };
                    out.push(vec![verb.to_vec(), parsed.user_key, value.to_vec()]);
                }
                RedisType::Bitmap => {
                    extract_bitmap_fragment(&parsed.user_key, &parsed.subkey, value, out)?;
                }
                _ => {}
            }
        }
        // The ordering index duplicates the member rows.
        ColumnFamilyId::ZsetScore => {}
        ColumnFamilyId::Stream => {
            let parsed = ParsedSubkey::parse(key)?;
            if parsed.slot != slot {
                return Ok(());
            }
            let id = StreamEntryId::decode(&parsed.subkey)?;
            let mut args = vec![
                b"XADD".to_vec(),
                parsed.user_key,
                id.to_string().into_bytes(),
            ];
            for (field, field_value) in decode_stream_fields(value)? {
                args.push(field);
                args.push(field_value);
            }
            out.push(args);
        }
    }
    Ok(())
}

fn extract_delete(
    cf: ColumnFamilyId,
    key: &[u8],
    slot: SlotId,
    marker: Option<(RedisType, Option<ListDirection>)>,
    out: &mut Vec<Vec<Vec<u8>>>,
) -> anyhow::Result<()> {
    match cf {
        ColumnFamilyId::Metadata => {
            let Some((key_slot, user_key)) = split_metadata_key(key) else {
                return Ok(());
            };
            if key_slot == slot {
                out.push(vec![b"DEL".to_vec(), user_key.to_vec()]);
            }
        }
        ColumnFamilyId::Subkey => {
            let parsed = ParsedSubkey::parse(key)?;
            if parsed.slot != slot {
                return Ok(());
            }
            let Some((ty, _)) = marker else {
                return Ok(());
            };
            match ty {
                RedisType::Hash => {
                    out.push(vec![b"HDEL".to_vec(), parsed.user_key, parsed.subkey])
                }
                RedisType::Set => {
                    out.push(vec![b"SREM".to_vec(), parsed.user_key, parsed.subkey])
                }
                RedisType::Zset => {
                    out.push(vec![b"ZREM".to_vec(), parsed.user_key, parsed.subkey])
                }
                RedisType::Sortedint => {
                    anyhow::ensure!(parsed.subkey.len() == 8, "short sortedint id");
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&parsed.subkey);
                    out.push(vec![
                        b"SIREM".to_vec(),
                        parsed.user_key,
                        u64::from_be_bytes(buf).to_string().into_bytes(),
                    ]);
                }
                // List index pops and bitmap fragment rewrites are covered
                // by the key-level DEL when the whole key goes away.
                _ => {}
            }
        }
        ColumnFamilyId::ZsetScore => {}
        ColumnFamilyId::Stream => {
            let parsed = ParsedSubkey::parse(key)?;
            if parsed.slot != slot {
                return Ok(());
            }
            let id = StreamEntryId::decode(&parsed.subkey)?;
            out.push(vec![
                b"XDEL".to_vec(),
                parsed.user_key,
                id.to_string().into_bytes(),
            ]);
        }
    }
    Ok(())
}

fn extract_bitmap_fragment(
    user_key: &[u8],
    fragment_subkey: &[u8],
    fragment: &[u8],
    out: &mut Vec<Vec<Vec<u8>>>,
) -> anyhow::Result<()> {
    let index: u64 = std::str::from_utf8(fragment_subkey)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("bitmap fragment index is not a valid integer"))?;
    for (byte_idx, &byte) in fragment.iter().enumerate() {
        if byte == 0 {
            continue;
        }
        for bit_idx in 0..8 {
            if byte & (1 << bit_idx) != 0 {
                let offset = index * 8 + (byte_idx as u64) * 8 + bit_idx;
                out.push(vec![
                    b"SETBIT".to_vec(),
                    user_key.to_vec(),
                    offset.to_string().into_bytes(),
                    b"1".to_vec(),
                ]);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ListDirection, SlotEngine};
    use crate::slot::key_slot;

    fn strings(commands: &[Vec<Vec<u8>>]) -> Vec<Vec<String>> {
        commands
            .iter()
            .map(|args| {
                args.iter()
                    .map(|a| String::from_utf8_lossy(a).to_string())
                    .collect()
            })
            .collect()
    }

    fn extract_all(engine: &SlotEngine, from_seq: u64, slot: SlotId) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        for batch in engine.wal_batches_from(from_seq).unwrap() {
            out.extend(strings(&extract_commands(&batch, slot).unwrap()));
        }
        out
    }

    #[test]
    fn string_put_becomes_set_only_for_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SlotEngine::open(dir.path()).unwrap();
        let mark = engine.latest_seq();
        engine.put_string(b"foo", b"bar", 0).unwrap();
        engine.put_string(b"other", b"x", 0).unwrap();

        let commands = extract_all(&engine, mark + 1, key_slot(b"foo"));
        assert_eq!(commands, vec![vec!["SET", "foo", "bar"]]);
    }

    #[test]
    fn hash_update_becomes_hset_with_marker_type() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SlotEngine::open(dir.path()).unwrap();
        let mark = engine.latest_seq();
        engine
            .hash_set(b"h", &[(b"f".to_vec(), b"v".to_vec())])
            .unwrap();

        let commands = extract_all(&engine, mark + 1, key_slot(b"h"));
        assert_eq!(commands, vec![vec!["HSET", "h", "f", "v"]]);
    }

    #[test]
    fn left_push_honors_the_command_hint() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SlotEngine::open(dir.path()).unwrap();
        let mark = engine.latest_seq();
        engine
            .list_push(b"l", &[b"a".to_vec()], ListDirection::Left)
            .unwrap();
        engine
            .list_push(b"l", &[b"b".to_vec()], ListDirection::Right)
            .unwrap();

        let commands = extract_all(&engine, mark + 1, key_slot(b"l"));
        assert_eq!(
            commands,
            vec![vec!["LPUSH", "l", "a"], vec!["RPUSH", "l", "b"]]
        );
    }

    #[test]
    fn delete_key_ends_with_del() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SlotEngine::open(dir.path()).unwrap();
        engine
            .set_add(b"s", &[b"m1".to_vec(), b"m2".to_vec()])
            .unwrap();
        let mark = engine.latest_seq();
        engine.delete_key(b"s").unwrap();

        let commands = extract_all(&engine, mark + 1, key_slot(b"s"));
        assert_eq!(commands.last().unwrap(), &vec!["DEL", "s"]);
        assert!(commands.iter().any(|c| c[0] == "SREM"));
    }

    #[test]
    fn delete_range_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SlotEngine::open(dir.path()).unwrap();
        let mark = engine.latest_seq();
        engine
            .delete_range(ColumnFamilyId::Metadata, vec![0, 0], vec![0xff, 0xff])
            .unwrap();

        for slot in [0u16, 1234, 16383] {
            assert!(extract_all(&engine, mark + 1, slot).is_empty());
        }
    }

    #[test]
    fn zset_put_becomes_zadd_and_index_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SlotEngine::open(dir.path()).unwrap();
        let mark = engine.latest_seq();
        engine.zset_add(b"z", &[(2.5, b"m".to_vec())]).unwrap();

        let commands = extract_all(&engine, mark + 1, key_slot(b"z"));
        assert_eq!(commands, vec![vec!["ZADD", "z", "2.5", "m"]]);
    }

    #[test]
    fn complex_expire_travels_as_pexpireat() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SlotEngine::open(dir.path()).unwrap();
        engine
            .hash_set(b"h", &[(b"f".to_vec(), b"v".to_vec())])
            .unwrap();
        let mark = engine.latest_seq();
        engine.set_expire(b"h", 9_999_999_999_999).unwrap();

        let commands = extract_all(&engine, mark + 1, key_slot(b"h"));
        assert_eq!(commands, vec![vec!["PEXPIREAT", "h", "9999999999999"]]);
    }
}
