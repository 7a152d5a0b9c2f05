//! # Column Codec
//!
//! Per-column-kind validation and fixed-width slot encoding. Every column
//! of a table occupies a fixed slot inside the record, sized once at
//! definition time:
//!
//! | Kind          | Slot layout                                      |
//! |---------------|--------------------------------------------------|
//! | `Int`         | i64 LE (8 bytes)                                 |
//! | `Str(len)`    | u32 LE byte length + `len` data bytes, zero pad  |
//! | `Pickle(len)` | u32 LE count + `len` data bytes, zero pad        |
//! | `StrBlob`     | presence flag (u8) + row-id token (u64 LE)       |
//! | `PickleBlob`  | presence flag (u8) + row-id token (u64 LE)       |
//! | `Foreign`     | referenced row id (u64 LE), 0 = null             |
//!
//! Blob slots carry only a reference; the payload lives in a per-row file
//! managed by [`crate::store`]. A `Pickle` slot's count is the payload
//! byte length plus one, with zero meaning `Null` (the blank value); an
//! empty payload is count 1 and stays distinct from null.
//!
//! [`validate`] is the eager gate: it runs at `set` time and reports
//! [`StoreError::LengthExceeded`] or [`StoreError::KindMismatch`] before
//! any state changes, so save never encounters an invalid value.
//!
//! This module also provides the self-describing variable-length value
//! encoding ([`encode_value`]/[`decode_value`]) used by index files.

use eyre::{bail, ensure, Result};

use crate::config::{BLOB_SLOT_SIZE, FOREIGN_NULL};
use crate::error::StoreError;
use crate::schema::ColumnKind;
use crate::types::Value;

/// Fixed byte width of a column's inline slot.
pub fn slot_size(kind: &ColumnKind) -> usize {
    match kind {
        ColumnKind::Int => 8,
        ColumnKind::Str { len } | ColumnKind::Pickle { len } => 4 + *len as usize,
        ColumnKind::StrBlob | ColumnKind::PickleBlob => BLOB_SLOT_SIZE,
        ColumnKind::Foreign { .. } => 8,
    }
}

/// Checks `value` against a column before any mutation is applied.
///
/// `Null` is accepted wherever the blank value is representable: strings
/// encode as empty, payloads and foreign references as absent. `Int`
/// columns have no null form and reject it.
pub fn validate(column: &str, kind: &ColumnKind, value: &Value) -> Result<(), StoreError> {
    let mismatch = |expected: &'static str| StoreError::KindMismatch {
        column: column.to_string(),
        expected,
        got: value.kind_name(),
    };

    match kind {
        ColumnKind::Int => match value {
            Value::Int(_) => Ok(()),
            _ => Err(mismatch("int")),
        },
        ColumnKind::Str { len } => match value {
            Value::Null => Ok(()),
            Value::Str(s) => check_len(column, s.len(), *len),
            _ => Err(mismatch("str")),
        },
        ColumnKind::Pickle { len } => match value {
            Value::Null => Ok(()),
            Value::Bytes(b) => check_len(column, b.len(), *len),
            _ => Err(mismatch("bytes")),
        },
        ColumnKind::StrBlob => match value {
            Value::Null | Value::Str(_) => Ok(()),
            _ => Err(mismatch("str")),
        },
        ColumnKind::PickleBlob => match value {
            Value::Null | Value::Bytes(_) => Ok(()),
            _ => Err(mismatch("bytes")),
        },
        ColumnKind::Foreign { .. } => match value {
            Value::Null | Value::Id(_) => Ok(()),
            _ => Err(mismatch("id")),
        },
    }
}

fn check_len(column: &str, attempted: usize, max: u32) -> Result<(), StoreError> {
    if attempted > max as usize {
        return Err(StoreError::LengthExceeded {
            column: column.to_string(),
            attempted,
            max: max as usize,
        });
    }
    Ok(())
}

/// Encodes a validated inline value into its slot. Blob kinds are
/// encoded with [`encode_blob_ref`] instead.
pub fn encode_inline(kind: &ColumnKind, value: &Value, slot: &mut [u8]) -> Result<()> {
    debug_assert_eq!(slot.len(), slot_size(kind));
    match kind {
        ColumnKind::Int => {
            slot.copy_from_slice(&value.as_int()?.to_le_bytes());
        }
        ColumnKind::Str { .. } => {
            let bytes = match value {
                Value::Null => &[][..],
                other => other.as_str()?.as_bytes(),
            };
            encode_prefixed(bytes, slot)?;
        }
        ColumnKind::Pickle { .. } => match value {
            Value::Null => slot.fill(0),
            other => encode_counted(other.as_bytes()?, slot)?,
        },
        ColumnKind::Foreign { .. } => {
            let id = value.as_id()?.unwrap_or(FOREIGN_NULL);
            slot.copy_from_slice(&id.to_le_bytes());
        }
        ColumnKind::StrBlob | ColumnKind::PickleBlob => {
            bail!("blob column cannot be encoded inline")
        }
    }
    Ok(())
}

fn encode_prefixed(bytes: &[u8], slot: &mut [u8]) -> Result<()> {
    ensure!(
        bytes.len() <= slot.len() - 4,
        "encoded length {} exceeds slot capacity {}; validation was skipped",
        bytes.len(),
        slot.len() - 4
    );
    slot[..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
    slot[4..4 + bytes.len()].copy_from_slice(bytes);
    slot[4 + bytes.len()..].fill(0);
    Ok(())
}

/// Like [`encode_prefixed`] but stores length + 1, reserving zero for
/// null so an empty payload survives the round trip.
fn encode_counted(bytes: &[u8], slot: &mut [u8]) -> Result<()> {
    ensure!(
        bytes.len() <= slot.len() - 4,
        "encoded length {} exceeds slot capacity {}; validation was skipped",
        bytes.len(),
        slot.len() - 4
    );
    slot[..4].copy_from_slice(&(bytes.len() as u32 + 1).to_le_bytes());
    slot[4..4 + bytes.len()].copy_from_slice(bytes);
    slot[4 + bytes.len()..].fill(0);
    Ok(())
}

/// Decodes an inline slot back to its runtime value.
pub fn decode_inline(kind: &ColumnKind, slot: &[u8]) -> Result<Value> {
    debug_assert_eq!(slot.len(), slot_size(kind));
    match kind {
        ColumnKind::Int => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(slot);
            Ok(Value::Int(i64::from_le_bytes(buf)))
        }
        ColumnKind::Str { .. } => {
            let bytes = decode_prefixed(slot)?;
            Ok(Value::Str(std::str::from_utf8(bytes)?.to_string()))
        }
        ColumnKind::Pickle { .. } => {
            let count = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]) as usize;
            if count == 0 {
                return Ok(Value::Null);
            }
            let len = count - 1;
            ensure!(
                len <= slot.len() - 4,
                "stored length {} exceeds slot capacity {}",
                len,
                slot.len() - 4
            );
            Ok(Value::Bytes(slot[4..4 + len].to_vec()))
        }
        ColumnKind::Foreign { .. } => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(slot);
            let id = u64::from_le_bytes(buf);
            if id == FOREIGN_NULL {
                Ok(Value::Null)
            } else {
                Ok(Value::Id(id))
            }
        }
        ColumnKind::StrBlob | ColumnKind::PickleBlob => {
            bail!("blob column cannot be decoded inline")
        }
    }
}

fn decode_prefixed(slot: &[u8]) -> Result<&[u8]> {
    let len = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]) as usize;
    ensure!(
        len <= slot.len() - 4,
        "stored length {} exceeds slot capacity {}",
        len,
        slot.len() - 4
    );
    Ok(&slot[4..4 + len])
}

/// Writes a blob column's inline reference: presence flag + the row id
/// that names its payload file.
pub fn encode_blob_ref(present: bool, row_id: u64, slot: &mut [u8]) {
    debug_assert_eq!(slot.len(), BLOB_SLOT_SIZE);
    slot[0] = present as u8;
    slot[1..9].copy_from_slice(&row_id.to_le_bytes());
}

/// Reads a blob column's inline reference back as (present, token).
pub fn decode_blob_ref(slot: &[u8]) -> Result<(bool, u64)> {
    debug_assert_eq!(slot.len(), BLOB_SLOT_SIZE);
    ensure!(slot[0] <= 1, "invalid blob presence flag: {:#04x}", slot[0]);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&slot[1..9]);
    Ok((slot[0] == 1, u64::from_le_bytes(buf)))
}

/// Tagged variable-length value encoding for index files.
pub fn encode_value(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => buf.push(0),
        Value::Int(i) => {
            buf.push(1);
            buf.extend(i.to_le_bytes());
        }
        Value::Str(s) => {
            buf.push(2);
            buf.extend((s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.push(3);
            buf.extend((b.len() as u32).to_le_bytes());
            buf.extend_from_slice(b);
        }
        Value::Id(id) => {
            buf.push(4);
            buf.extend(id.to_le_bytes());
        }
    }
}

/// Counterpart of [`encode_value`]; advances `pos` past the value.
pub fn decode_value(buf: &[u8], pos: &mut usize) -> Result<Value> {
    let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
        ensure!(*pos + n <= buf.len(), "value encoding truncated at {}", *pos);
        let slice = &buf[*pos..*pos + n];
        *pos += n;
        Ok(slice)
    };

    let tag = take(pos, 1)?[0];
    match tag {
        0 => Ok(Value::Null),
        1 => {
            let b = take(pos, 8)?;
            Ok(Value::Int(i64::from_le_bytes(b.try_into()?)))
        }
        2 => {
            let len = u32::from_le_bytes(take(pos, 4)?.try_into()?) as usize;
            let bytes = take(pos, len)?;
            Ok(Value::Str(std::str::from_utf8(bytes)?.to_string()))
        }
        3 => {
            let len = u32::from_le_bytes(take(pos, 4)?.try_into()?) as usize;
            Ok(Value::Bytes(take(pos, len)?.to_vec()))
        }
        4 => {
            let b = take(pos, 8)?;
            Ok(Value::Id(u64::from_le_bytes(b.try_into()?)))
        }
        other => bail!("invalid value tag: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(kind: &ColumnKind, value: Value) -> Value {
        validate("c", kind, &value).unwrap();
        let mut slot = vec![0u8; slot_size(kind)];
        encode_inline(kind, &value, &mut slot).unwrap();
        decode_inline(kind, &slot).unwrap()
    }

    #[test]
    fn int_round_trips() {
        let kind = ColumnKind::Int;
        assert_eq!(round_trip(&kind, Value::Int(0)), Value::Int(0));
        assert_eq!(round_trip(&kind, Value::Int(-7)), Value::Int(-7));
        assert_eq!(
            round_trip(&kind, Value::Int(i64::MAX)),
            Value::Int(i64::MAX)
        );
    }

    #[test]
    fn str_round_trips_including_unicode() {
        let kind = ColumnKind::Str { len: 16 };
        assert_eq!(round_trip(&kind, Value::str("")), Value::str(""));
        assert_eq!(round_trip(&kind, Value::str("Kirk")), Value::str("Kirk"));
        assert_eq!(round_trip(&kind, Value::str("日本語")), Value::str("日本語"));
    }

    #[test]
    fn str_at_exact_capacity_fits() {
        let kind = ColumnKind::Str { len: 4 };
        assert_eq!(round_trip(&kind, Value::str("abcd")), Value::str("abcd"));
    }

    #[test]
    fn oversized_str_fails_validation() {
        let kind = ColumnKind::Str { len: 8 };
        let err = validate("name", &kind, &Value::str("overlylongname")).unwrap_err();
        assert_eq!(
            err,
            StoreError::LengthExceeded {
                column: "name".to_string(),
                attempted: 14,
                max: 8,
            }
        );
    }

    #[test]
    fn multibyte_length_is_counted_in_bytes() {
        // 3 characters, 9 encoded bytes
        let kind = ColumnKind::Str { len: 8 };
        assert!(matches!(
            validate("name", &kind, &Value::str("日本語")),
            Err(StoreError::LengthExceeded { attempted: 9, .. })
        ));
    }

    #[test]
    fn pickle_round_trips_and_null_is_blank() {
        let kind = ColumnKind::Pickle { len: 8 };
        assert_eq!(
            round_trip(&kind, Value::bytes(vec![1u8, 2, 3])),
            Value::bytes(vec![1u8, 2, 3])
        );
        assert_eq!(round_trip(&kind, Value::Null), Value::Null);
    }

    #[test]
    fn empty_pickle_payload_is_not_null() {
        let kind = ColumnKind::Pickle { len: 8 };
        assert_eq!(round_trip(&kind, Value::bytes(vec![])), Value::bytes(vec![]));
    }

    #[test]
    fn pickle_at_exact_capacity_fits() {
        let kind = ColumnKind::Pickle { len: 4 };
        assert_eq!(
            round_trip(&kind, Value::bytes(vec![1u8, 2, 3, 4])),
            Value::bytes(vec![1u8, 2, 3, 4])
        );
    }

    #[test]
    fn foreign_round_trips_with_null_sentinel() {
        let kind = ColumnKind::Foreign {
            table: "human".to_string(),
        };
        assert_eq!(round_trip(&kind, Value::Id(42)), Value::Id(42));
        assert_eq!(round_trip(&kind, Value::Null), Value::Null);
        // id 0 is the reserved null encoding
        assert_eq!(round_trip(&kind, Value::Id(0)), Value::Null);
    }

    #[test]
    fn kind_mismatch_is_reported() {
        assert!(matches!(
            validate("n", &ColumnKind::Int, &Value::str("x")),
            Err(StoreError::KindMismatch {
                expected: "int",
                got: "str",
                ..
            })
        ));
        assert!(matches!(
            validate("n", &ColumnKind::Int, &Value::Null),
            Err(StoreError::KindMismatch { .. })
        ));
    }

    #[test]
    fn blob_ref_round_trips() {
        let mut slot = [0u8; BLOB_SLOT_SIZE];
        encode_blob_ref(true, 99, &mut slot);
        assert_eq!(decode_blob_ref(&slot).unwrap(), (true, 99));
        encode_blob_ref(false, 0, &mut slot);
        assert_eq!(decode_blob_ref(&slot).unwrap(), (false, 0));
    }

    #[test]
    fn tagged_values_round_trip() {
        let values = vec![
            Value::Null,
            Value::Int(-1),
            Value::str("hello"),
            Value::bytes(vec![9u8, 8, 7]),
            Value::Id(12),
        ];
        let mut buf = Vec::new();
        for v in &values {
            encode_value(v, &mut buf);
        }
        let mut pos = 0;
        for v in &values {
            assert_eq!(&decode_value(&buf, &mut pos).unwrap(), v);
        }
        assert_eq!(pos, buf.len());
    }
}
