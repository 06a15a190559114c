//! Compression / encryption plug-in boundary.
//!
//! Modeled as a trait object rather than raw function pointers, per the
//! design note on "function pointers for codecs and duplicate-handlers":
//! injected once at open time, used to transform value bytes before they
//! are written and after they are read.

use error::Result;

/// Transforms record value bytes on the way to and from disk.
pub trait Codec: Send + Sync {
    /// Encodes `bytes` for storage.
    fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>>;
    /// Decodes previously-encoded bytes.
    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}

/// Identity codec, used when `CollectionOptions::compressed` is false.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCodec;

impl Codec for NoopCodec {
    fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Resolves duplicate-key conflicts for `Put` modes that need one.
pub enum DupAction {
    /// Keep the existing value, reject the write.
    Keep,
    /// Drop the existing value, delete the record.
    Drop,
    /// Replace with the given bytes.
    Replace(Vec<u8>),
}

/// A user-injected duplicate-resolution function, used by `PutMode::Proc`.
pub trait DupProc: Send + Sync {
    /// Decides what happens to an existing value found for a `Proc` put.
    fn resolve(&self, old: &[u8]) -> DupAction;
}
