//! 12-byte object identifiers.
//!
//! Layout: 6-byte millisecond timestamp, big-endian, followed by a 6-byte
//! tail seeded once per process from a SHA3-256 hash of the wall clock and
//! process id and then incremented atomically. Monotonic-ish, not strictly
//! ordered across processes, matching the spec's "monotonic-ish but not
//! strictly ordered" requirement without pulling in a dedicated RNG crate
//! (the crate already links `tiny_keccak` for WAL/flush checksums).

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use tiny_keccak::sha3_256;

use error::{ErrorKind, Result};

/// A 12-byte object identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

static TAIL_INIT: Once = Once::new();
static TAIL_COUNTER: AtomicU64 = AtomicU64::new(0);

fn seed_tail() -> u64 {
    let mut seed_material = [0u8; 16];
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    BigEndian::write_u64(&mut seed_material[0..8], now.as_nanos() as u64);
    BigEndian::write_u32(&mut seed_material[8..12], ::std::process::id());
    let hash = sha3_256(&seed_material);
    BigEndian::read_u64(&hash[0..8])
}

fn next_tail() -> u64 {
    TAIL_INIT.call_once(|| {
        TAIL_COUNTER.store(seed_tail(), Ordering::SeqCst);
    });
    TAIL_COUNTER.fetch_add(1, Ordering::SeqCst)
}

impl ObjectId {
    /// Generates a fresh id using the current wall-clock time.
    pub fn new() -> ObjectId {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::with_timestamp_and_tail(millis, next_tail())
    }

    fn with_timestamp_and_tail(millis: u64, tail: u64) -> ObjectId {
        let mut bytes = [0u8; 12];
        let mut ts_buf = [0u8; 8];
        BigEndian::write_u64(&mut ts_buf, millis);
        bytes[0..6].copy_from_slice(&ts_buf[2..8]);
        let mut tail_buf = [0u8; 8];
        BigEndian::write_u64(&mut tail_buf, tail);
        bytes[6..12].copy_from_slice(&tail_buf[2..8]);
        ObjectId(bytes)
    }

    /// Wraps a caller-supplied 12-byte value, e.g. one round-tripped from a document.
    pub fn from_bytes(bytes: [u8; 12]) -> ObjectId {
        ObjectId(bytes)
    }

    /// Returns the raw 12 bytes.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Millisecond timestamp embedded in this id.
    pub fn timestamp_millis(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[2..8].copy_from_slice(&self.0[0..6]);
        BigEndian::read_u64(&buf)
    }

    /// Parses a 24-character hex string.
    pub fn parse_hex(text: &str) -> Result<ObjectId> {
        if text.len() != 24 {
            return Err(ErrorKind::InvalidOid(text.to_owned()).into());
        }
        let mut bytes = [0u8; 12];
        for i in 0..12 {
            let byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16)
                .map_err(|_| ErrorKind::InvalidOid(text.to_owned()))?;
            bytes[i] = byte;
        }
        Ok(ObjectId(bytes))
    }

    /// Renders as a 24-character lowercase hex string.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(24);
        for byte in &self.0 {
            s.push_str(&format!("{:02x}", byte));
        }
        s
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = ::error::Error;

    fn from_str(s: &str) -> Result<ObjectId> {
        ObjectId::parse_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::ObjectId;

    #[test]
    fn hex_round_trip() {
        let id = ObjectId::new();
        let hex = id.to_hex();
        let parsed = ObjectId::parse_hex(&hex).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_distinct_and_increasing_in_tail() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_bad_length() {
        assert!(ObjectId::parse_hex("abcd").is_err());
    }
}
