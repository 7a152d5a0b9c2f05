//! # Serializable Capability
//!
//! `Pickle` and `PickleBlob` columns store opaque byte payloads. The
//! [`Serializable`] trait is the explicit contract a value type implements
//! to flow through them; the engine itself only ever sees the bytes.
//!
//! Stock impls cover the common payloads (`String`, `Vec<u8>`, `i64`).
//! Application types implement the pair themselves, typically over their
//! own wire format.

use eyre::{ensure, Result};

pub trait Serializable: Sized {
    fn to_bytes(&self) -> Result<Vec<u8>>;
    fn from_bytes(bytes: &[u8]) -> Result<Self>;
}

impl Serializable for Vec<u8> {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.clone())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl Serializable for String {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

impl Serializable for i64 {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_le_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() == 8, "expected 8 bytes for i64, got {}", bytes.len());
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buf))
    }
}
