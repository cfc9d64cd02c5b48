//! OPRF boundary: item hashing, label keys, and the label stream cipher
//!
//! The interactive OPRF protocol itself is a collaborator of this crate, not
//! part of it. What the match engine needs from it is small and fixed:
//!
//! - a **sender-local hash**: under the sender's [`OprfKey`], map each raw
//!   [`Item`] to the 128-bit [`HashedItem`] the engine stores, plus a
//!   per-item [`LabelKey`] used to encrypt that item's label;
//! - a **query-processing hook** ([`OprfProcessor`]) the embedder implements
//!   with its real (elliptic-curve) OPRF to answer receiver OPRF requests.
//!
//! Both halves must agree on the hash derivation; the deterministic keyed
//! derivation here (keyed BLAKE3 with a domain-separation preamble, XOF
//! split into item hash and label key) defines the boundary contract.
//!
//! Label encryption is a keystream XOR: the keystream is the BLAKE3 XOF of
//! `(label_key, nonce)`, so decryption is the same operation. A fresh random
//! nonce is drawn per encryption; with fewer than the maximum 16 nonce
//! bytes, re-encrypting labels for the same item can leak (see the SenderDB
//! construction warning).

#![forbid(unsafe_code)]

use rand::RngCore;

use crate::{EncryptedLabel, HashedItem, Item, Label};

/// Byte size of the sender's OPRF key.
pub const OPRF_KEY_SIZE: usize = 32;
/// Byte size of a per-item label encryption key.
pub const LABEL_KEY_SIZE: usize = 32;
/// Byte size of a single receiver OPRF query element on the wire.
pub const OPRF_QUERY_SIZE: usize = 32;
/// Largest admissible label nonce, in bytes.
pub const MAX_NONCE_BYTE_COUNT: usize = 16;
/// Largest admissible label, in bytes.
pub const MAX_LABEL_BYTE_COUNT: usize = 1024;

/// Errors surfaced by the OPRF boundary.
#[derive(Debug, thiserror::Error)]
pub enum OprfError {
    #[error("label is {got} bytes but the SenderDB stores {max}-byte labels")]
    LabelTooLong { got: usize, max: usize },
    #[error("nonce byte count {0} exceeds the maximum ({MAX_NONCE_BYTE_COUNT})")]
    NonceTooLong(usize),
    #[error("encrypted label is {got} bytes; needs at least the {nonce} nonce bytes")]
    CiphertextTooShort { got: usize, nonce: usize },
    #[error("OPRF request size {0} is not a multiple of {OPRF_QUERY_SIZE}")]
    QuerySizeMismatch(usize),
    #[error("OPRF query processing failed: {0}")]
    ProcessingFailed(String),
}

/// The sender's long-lived OPRF key.
///
/// Cleared (zeroized) when the owning SenderDB is stripped.
#[derive(Clone, PartialEq, Eq)]
pub struct OprfKey([u8; OPRF_KEY_SIZE]);

impl OprfKey {
    /// Draw a fresh random key.
    pub fn random() -> Self {
        let mut key = [0u8; OPRF_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        OprfKey(key)
    }

    /// Reconstruct a key from raw bytes (e.g., when loading a SenderDB).
    pub fn from_bytes(bytes: [u8; OPRF_KEY_SIZE]) -> Self {
        OprfKey(bytes)
    }

    /// The raw key bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; OPRF_KEY_SIZE] {
        &self.0
    }

    /// Overwrite the key material with zeros.
    pub fn clear(&mut self) {
        self.0 = [0u8; OPRF_KEY_SIZE];
    }
}

impl Default for OprfKey {
    fn default() -> Self {
        OprfKey([0u8; OPRF_KEY_SIZE])
    }
}

impl std::fmt::Debug for OprfKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("OprfKey(..)")
    }
}

/// A per-item key for label encryption, derived alongside the item hash.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LabelKey([u8; LABEL_KEY_SIZE]);

impl LabelKey {
    /// The raw key bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; LABEL_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for LabelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LabelKey(..)")
    }
}

/// The embedder's hook for answering receiver OPRF requests.
///
/// `data` is a concatenation of [`OPRF_QUERY_SIZE`]-byte query elements; the
/// response has the same shape. Implementations evaluate their OPRF on each
/// element under `key`.
pub trait OprfProcessor: Send + Sync {
    /// Process a batch of OPRF query elements.
    fn process_queries(&self, data: &[u8], key: &OprfKey) -> Result<Vec<u8>, OprfError>;
}

// ---------------------------- Item hashing ----------------------------

/// Derive the engine-side hash and label key of one item under `key`.
pub fn get_item_hash(item: &Item, key: &OprfKey) -> (HashedItem, LabelKey) {
    let mut hasher = blake3::Hasher::new_keyed(key.as_bytes());
    hasher.update(b"APSI.oprf.item.v1");
    hasher.update(&item.0);
    let mut xof = hasher.finalize_xof();

    let mut hashed = [0u8; 16];
    xof.fill(&mut hashed);
    let mut label_key = [0u8; LABEL_KEY_SIZE];
    xof.fill(&mut label_key);

    (HashedItem(hashed), LabelKey(label_key))
}

/// Hash a batch of unlabeled items.
pub fn compute_hashes(items: &[Item], key: &OprfKey) -> Vec<HashedItem> {
    items.iter().map(|it| get_item_hash(it, key).0).collect()
}

/// Hash a batch of labeled items and encrypt each label under its item key.
///
/// Labels shorter than `label_byte_count` are zero-padded; longer labels are
/// rejected.
pub fn compute_hashes_labeled(
    data: &[(Item, Label)],
    key: &OprfKey,
    label_byte_count: usize,
    nonce_byte_count: usize,
) -> Result<Vec<(HashedItem, EncryptedLabel)>, OprfError> {
    data.iter()
        .map(|(item, label)| {
            let (hashed, label_key) = get_item_hash(item, key);
            let enc = encrypt_label(label, &label_key, label_byte_count, nonce_byte_count)?;
            Ok((hashed, enc))
        })
        .collect()
}

// ---------------------------- Label cipher ----------------------------

/// Keystream for one (key, nonce) pair, XORed over `buf`.
fn apply_keystream(key: &LabelKey, nonce: &[u8], buf: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(key.as_bytes());
    hasher.update(b"APSI.label.v1");
    hasher.update(nonce);
    let mut xof = hasher.finalize_xof();

    let mut ks = vec![0u8; buf.len()];
    xof.fill(&mut ks);
    for (b, k) in buf.iter_mut().zip(ks.iter()) {
        *b ^= k;
    }
}

/// Encrypt a label under an item's [`LabelKey`] with a fresh random nonce.
///
/// The result is `nonce ‖ (padded label ⊕ keystream)` and has exactly
/// `nonce_byte_count + label_byte_count` bytes.
pub fn encrypt_label(
    label: &Label,
    key: &LabelKey,
    label_byte_count: usize,
    nonce_byte_count: usize,
) -> Result<EncryptedLabel, OprfError> {
    if nonce_byte_count > MAX_NONCE_BYTE_COUNT {
        return Err(OprfError::NonceTooLong(nonce_byte_count));
    }
    if label.len() > label_byte_count {
        return Err(OprfError::LabelTooLong {
            got: label.len(),
            max: label_byte_count,
        });
    }

    let mut out = vec![0u8; nonce_byte_count + label_byte_count];
    rand::thread_rng().fill_bytes(&mut out[..nonce_byte_count]);
    out[nonce_byte_count..nonce_byte_count + label.len()].copy_from_slice(label);

    let (nonce, body) = out.split_at_mut(nonce_byte_count);
    apply_keystream(key, nonce, body);
    Ok(out)
}

/// Decrypt an [`EncryptedLabel`]; the inverse of [`encrypt_label`].
pub fn decrypt_label(
    encrypted: &EncryptedLabel,
    key: &LabelKey,
    nonce_byte_count: usize,
) -> Result<Label, OprfError> {
    if nonce_byte_count > MAX_NONCE_BYTE_COUNT {
        return Err(OprfError::NonceTooLong(nonce_byte_count));
    }
    if encrypted.len() < nonce_byte_count {
        return Err(OprfError::CiphertextTooShort {
            got: encrypted.len(),
            nonce: nonce_byte_count,
        });
    }

    let (nonce, body) = encrypted.split_at(nonce_byte_count);
    let mut label = body.to_vec();
    apply_keystream(key, nonce, &mut label);
    Ok(label)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_hash_is_deterministic_and_key_dependent() {
        let item = Item::from(42u128);
        let k1 = OprfKey::from_bytes([1u8; 32]);
        let k2 = OprfKey::from_bytes([2u8; 32]);

        let (h1a, lk1a) = get_item_hash(&item, &k1);
        let (h1b, lk1b) = get_item_hash(&item, &k1);
        let (h2, _) = get_item_hash(&item, &k2);

        assert_eq!(h1a, h1b);
        assert_eq!(lk1a, lk1b);
        assert_ne!(h1a, h2);
    }

    #[test]
    fn distinct_items_get_distinct_hashes() {
        let key = OprfKey::from_bytes([7u8; 32]);
        let hashes = compute_hashes(
            &(0..64u128).map(Item::from).collect::<Vec<_>>(),
            &key,
        );
        let unique: std::collections::HashSet<_> = hashes.iter().collect();
        assert_eq!(unique.len(), 64);
    }

    #[test]
    fn label_roundtrip() {
        let key = LabelKey([9u8; 32]);
        let label: Label = b"HELLOAPS".to_vec();

        let enc = encrypt_label(&label, &key, 8, 4).unwrap();
        assert_eq!(enc.len(), 12);

        let dec = decrypt_label(&enc, &key, 4).unwrap();
        assert_eq!(dec, label);
    }

    #[test]
    fn short_labels_are_zero_padded() {
        let key = LabelKey([3u8; 32]);
        let enc = encrypt_label(&b"ab".to_vec(), &key, 8, 4).unwrap();
        let dec = decrypt_label(&enc, &key, 4).unwrap();
        assert_eq!(&dec[..2], b"ab");
        assert!(dec[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn oversized_label_is_rejected() {
        let key = LabelKey([3u8; 32]);
        assert!(matches!(
            encrypt_label(&vec![0u8; 9], &key, 8, 4),
            Err(OprfError::LabelTooLong { .. })
        ));
    }

    #[test]
    fn zero_nonce_still_roundtrips() {
        let key = LabelKey([5u8; 32]);
        let label: Label = vec![0xaa; 16];
        let enc = encrypt_label(&label, &key, 16, 0).unwrap();
        assert_eq!(enc.len(), 16);
        assert_eq!(decrypt_label(&enc, &key, 0).unwrap(), label);
    }

    #[test]
    fn fresh_nonces_randomize_ciphertexts() {
        let key = LabelKey([8u8; 32]);
        let label: Label = vec![0x55; 8];
        let e1 = encrypt_label(&label, &key, 8, 8).unwrap();
        let e2 = encrypt_label(&label, &key, 8, 8).unwrap();
        assert_ne!(e1, e2, "distinct nonces must give distinct ciphertexts");
    }
}
