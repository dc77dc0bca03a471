//! The block-descriptor seam between the store and its block types.
//!
//! The store does not understand block formats. It persists opaque
//! header/data byte pairs keyed by a 32-byte routing key and delegates
//! reconstruction and verification to a [`BlockAdapter`] supplied at open
//! time. One adapter instance describes one block type: its fixed header and
//! data lengths, whether two distinct blocks can share a routing key, and how
//! to rebuild a block from its stored bytes.

use std::fmt;

/// Length of a routing key in bytes.
pub const ROUTING_KEY_LENGTH: usize = 32;

/// A routing key: the public cryptographic identifier of a block.
pub type RoutingKey = [u8; ROUTING_KEY_LENGTH];

/// A block that can be stored.
///
/// `PartialEq` is used to distinguish "already stored" from a genuine key
/// collision when a `put` probes an occupied slot.
pub trait StorableBlock: PartialEq + Send + Sync {
    /// The routing key this block is stored under.
    fn routing_key(&self) -> &RoutingKey;

    /// The full key, as handed back to [`BlockAdapter::construct`] on fetch.
    fn full_key(&self) -> &[u8];

    fn header(&self) -> &[u8];

    fn data(&self) -> &[u8];
}

/// Block-type descriptor.
pub trait BlockAdapter: Send + Sync + 'static {
    type Block: StorableBlock;

    /// Whether two different blocks can legitimately carry the same routing
    /// key. When false a digested-key match is treated as "already stored"
    /// without reading the block back.
    fn collision_possible(&self) -> bool;

    /// Fixed header length in bytes.
    fn header_len(&self) -> usize;

    /// Fixed data length in bytes.
    fn data_len(&self) -> usize;

    /// Full key length in bytes.
    fn full_key_len(&self) -> usize;

    /// Rebuild and verify a block from decrypted stored bytes.
    ///
    /// Returns `Err(KeyVerifyError)` if the bytes do not verify against the
    /// routing key; the store treats that as a miss.
    fn construct(
        &self,
        header: &[u8],
        data: &[u8],
        routing_key: &RoutingKey,
        full_key: Option<&[u8]>,
    ) -> Result<Self::Block, KeyVerifyError>;
}

/// Verification failure while reconstructing a block from stored bytes.
///
/// Not fatal: the slot content is unusable (overwritten garbage or a salt
/// mismatch) and the lookup is counted as a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyVerifyError;

impl fmt::Display for KeyVerifyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "stored block failed key verification")
    }
}

impl std::error::Error for KeyVerifyError {}
