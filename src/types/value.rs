//! # Runtime Value
//!
//! [`Value`] is the single runtime representation for everything a column
//! can hold: integers, strings, opaque serialized bytes, and row-id
//! references. It carries a total order so values (and tuples of values)
//! can serve directly as index keys.
//!
//! ## Ordering
//!
//! Values of the same kind compare by payload. Values of different kinds
//! compare by a fixed kind rank (`Null < Int < Str < Bytes < Id`), which
//! keeps index keys totally ordered even when a nullable column mixes
//! `Null` with concrete values. `Null` sorting first matches the reserved
//! zero encoding of a null foreign reference.

use std::cmp::Ordering;

use eyre::{bail, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Absent value: a null foreign reference, an unset serialized
    /// payload, or an empty blob.
    Null,
    Int(i64),
    Str(String),
    /// Opaque serialized payload of a `Pickle`/`PickleBlob` column.
    Bytes(Vec<u8>),
    /// Row id of a referenced row in a `Foreign` column.
    Id(u64),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(b.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short kind name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Id(_) => "id",
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            other => bail!("expected int, got {}", other.kind_name()),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(s) => Ok(s),
            other => bail!("expected str, got {}", other.kind_name()),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => bail!("expected bytes, got {}", other.kind_name()),
        }
    }

    /// Referenced row id of a foreign value, `None` for the null sentinel.
    pub fn as_id(&self) -> Result<Option<u64>> {
        match self {
            Value::Null => Ok(None),
            Value::Id(id) => Ok(Some(*id)),
            other => bail!("expected id, got {}", other.kind_name()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) => 1,
            Value::Str(_) => 2,
            Value::Bytes(_) => 3,
            Value::Id(_) => 4,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Id(a), Value::Id(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_kind_orders_by_payload() {
        assert!(Value::Int(1) < Value::Int(2));
        assert!(Value::str("a") < Value::str("b"));
        assert!(Value::Id(3) < Value::Id(30));
    }

    #[test]
    fn null_sorts_before_everything() {
        assert!(Value::Null < Value::Int(i64::MIN));
        assert!(Value::Null < Value::str(""));
        assert!(Value::Null < Value::Id(0));
    }

    #[test]
    fn accessors_reject_wrong_kind() {
        assert!(Value::str("x").as_int().is_err());
        assert!(Value::Int(1).as_str().is_err());
        assert!(Value::Bytes(vec![1]).as_id().is_err());
    }

    #[test]
    fn null_is_a_valid_foreign_reference() {
        assert_eq!(Value::Null.as_id().unwrap(), None);
        assert_eq!(Value::Id(7).as_id().unwrap(), Some(7));
    }
}
