//! # Error Types
//!
//! The typed failures callers are expected to match on. Everything else
//! (I/O, corrupt files) surfaces as a contextual [`eyre::Report`]; these
//! variants ride inside one, so `report.downcast_ref::<StoreError>()`
//! recovers the structured case when a caller needs to branch.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A value exceeds its column's fixed slot capacity.
    #[error("value for column '{column}' is {attempted} bytes, limit is {max}")]
    LengthExceeded {
        column: String,
        attempted: usize,
        max: usize,
    },

    /// A schema change could not be applied to the existing data. The
    /// table is left untouched on disk.
    #[error("cannot migrate table '{table}', column '{column}': {reason}")]
    Migration {
        table: String,
        column: String,
        reason: String,
    },

    /// A value of the wrong runtime kind was written to a column.
    #[error("column '{column}' expects {expected}, got {got}")]
    KindMismatch {
        column: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("table '{table}' has no column '{column}'")]
    UnknownColumn { table: String, column: String },

    #[error("no table named '{name}'")]
    UnknownTable { name: String },

    #[error("row {id} not found in table '{table}'")]
    RowNotFound { table: String, id: u64 },

    /// An index file's CRC64 trailer did not match its payload.
    #[error("checksum mismatch: stored {stored:#018x}, computed {computed:#018x}")]
    ChecksumMismatch { stored: u64, computed: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_parts() {
        let err = StoreError::LengthExceeded {
            column: "name".to_string(),
            attempted: 14,
            max: 8,
        };
        assert_eq!(
            err.to_string(),
            "value for column 'name' is 14 bytes, limit is 8"
        );

        let err = StoreError::RowNotFound {
            table: "tribble".to_string(),
            id: 7,
        };
        assert_eq!(err.to_string(), "row 7 not found in table 'tribble'");
    }

    #[test]
    fn recoverable_through_an_eyre_report() {
        let report = eyre::Report::new(StoreError::UnknownTable {
            name: "ghost".to_string(),
        });
        assert!(matches!(
            report.downcast_ref::<StoreError>(),
            Some(StoreError::UnknownTable { .. })
        ));
    }
}
