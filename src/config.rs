//! # Storage Configuration
//!
//! File-format constants shared across the storage layers. All on-disk
//! integers are little-endian; every file starts with a 16-byte magic
//! naming its role.

/// Magic prefix of per-table record files.
pub const TABLE_MAGIC: &[u8; 16] = b"shelfdb table\0\0\0";

/// Magic prefix of per-table schema descriptor files.
pub const SCHEMA_MAGIC: &[u8; 16] = b"shelfdb schema\0\0";

/// Magic prefix of per-index files.
pub const INDEX_MAGIC: &[u8; 16] = b"shelfdb index\0\0\0";

/// On-disk format version, shared by all file kinds.
pub const FORMAT_VERSION: u32 = 1;

/// Fixed size of the record file header.
pub const TABLE_HEADER_SIZE: usize = 64;

/// Bytes before a record's first column slot: liveness flag + row id.
pub const RECORD_PREFIX_SIZE: usize = 9;

/// Liveness flag of a stored record. Anything else (zero in practice)
/// is a tombstone.
pub const RECORD_LIVE: u8 = 1;

/// Inline slot width of a blob column: presence flag + row-id token.
pub const BLOB_SLOT_SIZE: usize = 9;

/// Stored foreign-reference encoding of null. Row ids start above it.
pub const FOREIGN_NULL: u64 = 0;

/// First row id ever allocated; ids grow monotonically and are never
/// reused.
pub const FIRST_ROW_ID: u64 = 1;

/// Upper bound on columns per table, fixed by the u64 dirty mask.
pub const MAX_COLUMNS: usize = 64;

pub const TABLE_EXT: &str = "tbl";
pub const SCHEMA_EXT: &str = "schema";
pub const INDEX_EXT: &str = "idx";
pub const BLOB_EXT: &str = "blob";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magics_fill_their_sixteen_bytes() {
        assert_eq!(TABLE_MAGIC.len(), 16);
        assert_eq!(SCHEMA_MAGIC.len(), 16);
        assert_eq!(INDEX_MAGIC.len(), 16);
    }

    #[test]
    fn record_prefix_covers_flag_and_id() {
        assert_eq!(RECORD_PREFIX_SIZE, 1 + 8);
        assert_eq!(BLOB_SLOT_SIZE, 1 + 8);
    }

    #[test]
    fn first_row_id_is_distinct_from_the_null_reference() {
        assert!(FIRST_ROW_ID > FOREIGN_NULL);
    }
}
