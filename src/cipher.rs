//! Per-slot encryption and key digestion.
//!
//! The cipher manager owns two secrets: the in-memory salt and the disk
//! salt. They are equal unless a master key is configured, in which case the
//! persisted copy is the salt encrypted as a single AES-256 block.
//!
//! Keys are never stored in the clear. The slot metadata carries
//! `SHA-256(salt || routing_key)`; header+data records are encrypted with
//! AES-256-CTR under `SHA-256(routing_key || salt)` and a random per-write
//! IV. The two derivations use opposite concatenation order so the digest
//! persisted on disk never doubles as the data key: without the routing key
//! neither the slot owner nor its content can be recovered.

use std::cell::Cell;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::block::RoutingKey;
use crate::entry::Entry;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Length of the store salt in bytes.
pub(crate) const SALT_LENGTH: usize = 16;

thread_local! {
    // Digesting is on every hot path and callers tend to digest the same key
    // several times in a row (lock, probe, bloom). One memoized triple per
    // thread covers that without a shared cache.
    static DIGEST_MEMO: Cell<Option<([u8; SALT_LENGTH], RoutingKey, [u8; 32])>> =
        const { Cell::new(None) };
}

pub(crate) struct CipherManager {
    salt: [u8; SALT_LENGTH],
    disk_salt: [u8; SALT_LENGTH],
}

impl CipherManager {
    /// Create a manager with a freshly generated salt.
    pub(crate) fn create(rng: &mut dyn RngCore, master_key: Option<&[u8; 32]>) -> Self {
        let mut salt = [0u8; SALT_LENGTH];
        rng.fill_bytes(&mut salt);
        let disk_salt = match master_key {
            Some(key) => wrap_salt(&salt, key),
            None => salt,
        };
        Self { salt, disk_salt }
    }

    /// Recover a manager from the salt as persisted in the config record.
    pub(crate) fn from_disk_salt(disk_salt: [u8; SALT_LENGTH], master_key: Option<&[u8; 32]>) -> Self {
        let salt = match master_key {
            Some(key) => unwrap_salt(&disk_salt, key),
            None => disk_salt,
        };
        Self { salt, disk_salt }
    }

    /// The salt as it appears in the config record.
    pub(crate) fn disk_salt(&self) -> &[u8; SALT_LENGTH] {
        &self.disk_salt
    }

    /// `SHA-256(salt || plain_key)`: the key identifier persisted in slot
    /// metadata and fed to the bloom filter and offset hash.
    pub(crate) fn digested_key(&self, plain_key: &RoutingKey) -> [u8; 32] {
        DIGEST_MEMO.with(|memo| {
            if let Some((salt, key, digest)) = memo.get() {
                if salt == self.salt && key == *plain_key {
                    return digest;
                }
            }
            let mut hasher = Sha256::new();
            hasher.update(self.salt);
            hasher.update(plain_key);
            let digest: [u8; 32] = hasher.finalize().into();
            memo.set(Some((self.salt, *plain_key, digest)));
            digest
        })
    }

    /// Encrypt the entry's header+data in place under a fresh IV. No-op if
    /// the entry is already ciphertext.
    pub(crate) fn encrypt(&self, entry: &mut Entry, rng: &mut dyn RngCore) {
        if entry.encrypted {
            return;
        }
        let plain_key = match entry.plain_routing_key {
            Some(plain_key) => plain_key,
            // Only freshly-built or just-decrypted entries are plaintext,
            // and both carry their plain key.
            None => return,
        };

        let mut iv = [0u8; 16];
        rng.fill_bytes(&mut iv);
        self.apply_keystream(&plain_key, &iv, entry);
        entry.data_encrypt_iv = iv;
        entry.encrypted = true;
    }

    /// Decrypt the entry's header+data in place using the stored IV.
    ///
    /// CTR decryption cannot fail by itself; whether the result is a valid
    /// block is for the caller's block adapter to decide.
    pub(crate) fn decrypt(&self, entry: &mut Entry, plain_key: &RoutingKey) {
        if !entry.encrypted {
            return;
        }
        let iv = entry.data_encrypt_iv;
        self.apply_keystream(plain_key, &iv, entry);
        entry.plain_routing_key = Some(*plain_key);
        entry.encrypted = false;
    }

    fn apply_keystream(&self, plain_key: &RoutingKey, iv: &[u8; 16], entry: &mut Entry) {
        let hd = match entry.hd.as_mut() {
            Some(hd) => hd,
            None => return,
        };
        let key = self.data_key(plain_key);
        let mut cipher = Aes256Ctr::new(&key.into(), iv.into());
        cipher.apply_keystream(&mut hd.header);
        cipher.apply_keystream(&mut hd.data);
    }

    /// `SHA-256(plain_key || salt)`: the AES-256 key for header+data.
    fn data_key(&self, plain_key: &RoutingKey) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(plain_key);
        hasher.update(self.salt);
        hasher.finalize().into()
    }
}

fn wrap_salt(salt: &[u8; SALT_LENGTH], master_key: &[u8; 32]) -> [u8; SALT_LENGTH] {
    let cipher = Aes256::new(&(*master_key).into());
    let mut block = GenericArray::clone_from_slice(salt);
    cipher.encrypt_block(&mut block);
    block.into()
}

fn unwrap_salt(disk_salt: &[u8; SALT_LENGTH], master_key: &[u8; 32]) -> [u8; SALT_LENGTH] {
    let cipher = Aes256::new(&(*master_key).into());
    let mut block = GenericArray::clone_from_slice(disk_salt);
    cipher.decrypt_block(&mut block);
    block.into()
}
