//! In-memory slot entry and its on-disk metadata codec.
//!
//! Every slot is represented on disk by a fixed 128-byte metadata record in
//! the `.metadata` file and a fixed-stride header+data record in the `.hd`
//! file. Integer fields are big-endian.
//!
//! ```text
//!  META-DATA RECORD
//!       +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!       |0|1|2|3|4|5|6|7|8|9|A|B|C|D|E|F|
//!  +----+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |0x00|                               |
//!  +----+     Digested Routing Key      |
//!  |0x10|                               |
//!  +----+-------------------------------+
//!  |0x20|       Data Encrypt IV         |
//!  +----+---------------+---------------+
//!  |0x30|     Flags     |  Store Size   |
//!  +----+---------------+---------------+
//!  |0x40|       Plain Routing Key       |
//!  |0x50|  (only if FLAG_PLAIN_KEY)     |
//!  +----+-------+-----------------------+
//!  |0x60|  Gen  |       Reserved        |
//!  +----+-------+-----------------------+
//!  |0x70|            Reserved           |
//!  +----+-------------------------------+
//! ```
//!
//! An all-zero record is the canonical free slot: `FLAG_OCCUPIED` is clear,
//! so the remaining bytes are irrelevant.

use byteorder::{BigEndian, ByteOrder};

use crate::block::RoutingKey;

/// Slot holds an entry.
pub(crate) const FLAG_OCCUPIED: u64 = 0x1;
/// The plain routing key is stored at 0x40.
pub(crate) const FLAG_PLAIN_KEY: u64 = 0x2;
/// Block was stored after the node stopped caching local requests.
pub(crate) const FLAG_NEW_BLOCK: u64 = 0x4;
/// Entry overflowed here from its natural store.
pub(crate) const FLAG_WRONG_STORE: u64 = 0x8;

/// On-disk metadata record length.
pub(crate) const METADATA_LENGTH: usize = 128;

/// Persist plain routing keys alongside entries. Debugging aid; breaks the
/// store's privacy properties when enabled.
const SAVE_PLAIN_KEY: bool = false;

/// Header and data bytes of one slot, pad stripped.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HeaderData {
    pub header: Vec<u8>,
    pub data: Vec<u8>,
}

/// One slot entry.
///
/// `hd` is lazily attached: metadata-only reads leave it `None`. The
/// `encrypted` flag tracks whether `hd` currently holds ciphertext; the
/// cipher manager flips it on encrypt/decrypt.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub digested_routing_key: [u8; 32],
    pub data_encrypt_iv: [u8; 16],
    pub flags: u64,
    pub store_size: u64,
    pub generation: u32,
    pub plain_routing_key: Option<RoutingKey>,
    pub hd: Option<HeaderData>,
    pub encrypted: bool,
    pub cur_offset: Option<u64>,
}

impl Entry {
    /// A fresh, unencrypted entry about to be written.
    pub(crate) fn new(
        plain_routing_key: RoutingKey,
        digested_routing_key: [u8; 32],
        header: &[u8],
        data: &[u8],
        new_block: bool,
        wrong_store: bool,
        store_size: u64,
        generation: u32,
    ) -> Self {
        let mut flags = FLAG_OCCUPIED;
        if new_block {
            flags |= FLAG_NEW_BLOCK;
        }
        if wrong_store {
            flags |= FLAG_WRONG_STORE;
        }
        if SAVE_PLAIN_KEY {
            flags |= FLAG_PLAIN_KEY;
        }

        Self {
            digested_routing_key,
            data_encrypt_iv: [0u8; 16],
            flags,
            store_size,
            generation,
            plain_routing_key: Some(plain_routing_key),
            hd: Some(HeaderData {
                header: header.to_vec(),
                data: data.to_vec(),
            }),
            encrypted: false,
            cur_offset: None,
        }
    }

    /// Decode a metadata record read from disk. The header+data record, if
    /// needed, is attached separately.
    pub(crate) fn decode(buf: &[u8], cur_offset: u64) -> Self {
        assert!(buf.len() >= METADATA_LENGTH);

        let mut digested_routing_key = [0u8; 32];
        digested_routing_key.copy_from_slice(&buf[0x00..0x20]);
        let mut data_encrypt_iv = [0u8; 16];
        data_encrypt_iv.copy_from_slice(&buf[0x20..0x30]);

        let flags = BigEndian::read_u64(&buf[0x30..0x38]);
        let store_size = BigEndian::read_u64(&buf[0x38..0x40]);

        let plain_routing_key = if flags & FLAG_PLAIN_KEY != 0 {
            let mut plain = [0u8; 32];
            plain.copy_from_slice(&buf[0x40..0x60]);
            Some(plain)
        } else {
            None
        };

        let generation = BigEndian::read_u32(&buf[0x60..0x64]);

        Self {
            digested_routing_key,
            data_encrypt_iv,
            flags,
            store_size,
            generation,
            plain_routing_key,
            hd: None,
            encrypted: true,
            cur_offset: Some(cur_offset),
        }
    }

    /// Encode the metadata record. The header+data record is written
    /// separately by the slot file layer.
    pub(crate) fn encode_metadata(&self) -> [u8; METADATA_LENGTH] {
        let mut buf = [0u8; METADATA_LENGTH];
        buf[0x00..0x20].copy_from_slice(&self.digested_routing_key);
        buf[0x20..0x30].copy_from_slice(&self.data_encrypt_iv);
        BigEndian::write_u64(&mut buf[0x30..0x38], self.flags);
        BigEndian::write_u64(&mut buf[0x38..0x40], self.store_size);
        if self.flags & FLAG_PLAIN_KEY != 0 {
            if let Some(plain) = &self.plain_routing_key {
                buf[0x40..0x60].copy_from_slice(plain);
            }
        }
        BigEndian::write_u32(&mut buf[0x60..0x64], self.generation);
        buf
    }

    pub(crate) fn is_free(&self) -> bool {
        self.flags & FLAG_OCCUPIED == 0
    }

    /// Attach a header+data record read from disk (ciphertext).
    pub(crate) fn set_hd(&mut self, header: Vec<u8>, data: Vec<u8>) {
        self.hd = Some(HeaderData { header, data });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> Entry {
        let mut entry = Entry::new(
            [0x11; 32],
            [0x22; 32],
            &[0xAA; 16],
            &[0xBB; 64],
            true,
            false,
            4096,
            3,
        );
        entry.data_encrypt_iv = [0x33; 16];
        entry.encrypted = true;
        entry
    }

    #[test]
    fn test_metadata_round_trip() {
        let entry = sample_entry();
        let buf = entry.encode_metadata();
        let decoded = Entry::decode(&buf, 17);

        assert_eq!(decoded.digested_routing_key, entry.digested_routing_key);
        assert_eq!(decoded.data_encrypt_iv, entry.data_encrypt_iv);
        assert_eq!(decoded.flags, entry.flags);
        assert_eq!(decoded.store_size, 4096);
        assert_eq!(decoded.generation, 3);
        assert_eq!(decoded.cur_offset, Some(17));
        assert!(decoded.hd.is_none());
        assert!(decoded.encrypted);
        // Plain key bit is off by default, so the key is not persisted.
        assert_eq!(decoded.plain_routing_key, None);
    }

    #[test]
    fn test_plain_key_round_trip() {
        let mut entry = sample_entry();
        entry.flags |= FLAG_PLAIN_KEY;
        let decoded = Entry::decode(&entry.encode_metadata(), 0);
        assert_eq!(decoded.plain_routing_key, Some([0x11; 32]));
    }

    #[test]
    fn test_zeroed_record_is_free() {
        let decoded = Entry::decode(&[0u8; METADATA_LENGTH], 5);
        assert!(decoded.is_free());
        assert_eq!(decoded.generation, 0);
    }

    #[test]
    fn test_flag_bits() {
        let entry = Entry::new([0; 32], [0; 32], &[], &[], true, true, 1, 0);
        assert_eq!(
            entry.flags,
            FLAG_OCCUPIED | FLAG_NEW_BLOCK | FLAG_WRONG_STORE
        );
        assert!(!entry.is_free());
    }
}
