//! Crate root: public surface, core aliases, and engine-wide invariants
//!
//! This crate implements the server side of a labeled asymmetric private set
//! intersection (APSI) protocol: the *match engine*. The sender's set is
//! preprocessed into a [`sender_db::SenderDB`] — a sharded collection of
//! [`bin_bundle::BinBundle`]s holding per-bin items and label fragments as
//! prime-field elements — and encrypted receiver queries are answered by
//! evaluating, entirely under homomorphic encryption, polynomials whose roots
//! are the sender's items.
//!
//! ## Invariants
//!
//! - **Field.** All algebra happens in `Z_p` for the plaintext prime `p`
//!   carried by [`params::PsiParams`]. A [`Felt`] is a `u64` residue with
//!   `0 ≤ felt < p`; the prime is a runtime parameter, never a compile-time
//!   constant.
//! - **Items.** A [`HashedItem`] is a 128-bit value produced by the OPRF
//!   layer and assumed uniformly distributed. The engine never sees raw
//!   receiver inputs.
//! - **HE boundary.** The homomorphic-encryption library is out of scope and
//!   is represented by the capability trait [`he::HeEvaluator`] operating on
//!   opaque [`he::Plaintext`]/[`he::Ciphertext`] containers. The engine is
//!   library-agnostic at the type level; the bundled [`he::ClearEvaluator`]
//!   backend exists for tests and reference runs only and makes no
//!   cryptographic claim.
//! - **Concurrency.** The SenderDB is guarded by a readers-writer lock;
//!   queries hold the read lock for their whole duration. Parallel work is
//!   partitioned by bundle index so no two workers alias a `BinBundle`, and
//!   runs on an explicit [`pool::WorkerPool`] handle (tests supply a serial
//!   pool).
//!
//! If any invariant is violated at runtime the failure mode is a precise,
//! typed error — never UB and never a panic on data-dependent paths.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use serde::{Deserialize, Serialize};

/// Sequence-to-field encoding of items and labels (bit packing, transpose).
pub mod encoding;
/// Arithmetic mod the plaintext prime; root-product and Newton polynomials.
pub mod poly;
/// OPRF boundary: item hashing, label keys, and the label stream cipher.
pub mod oprf;
/// Seeded location functions for the cuckoo table and the filter tag hash.
pub mod hashing;
/// Per-bin approximate membership filter with tag relocation.
pub mod cuckoo_filter;
/// Homomorphic-encryption capability trait, opaque containers, clear backend.
pub mod he;
/// Protocol parameters: validation, derived quantities, (de)serialization.
pub mod params;
/// Depth-optimal DAG producing all required ciphertext powers.
pub mod powers;
/// Batched bins, cached polynomials, and encrypted polynomial evaluation.
pub mod bin_bundle;
/// The sender's database: sharded BinBundles behind a readers-writer lock.
pub mod sender_db;
/// Query engine: request validation, power computation, result streaming.
pub mod sender;
/// Wire schema: operation header, request/response unions, result packages.
pub mod wire;
/// Explicit worker-pool handle backing all parallel sections.
pub mod pool;

// ============================================================================
// Canonical aliases and root-level types (centralization)
// ============================================================================

/// A field element: a residue modulo the plaintext prime `p`.
///
/// **Invariant:** `0 ≤ felt < p`. Functions producing `Felt`s reduce their
/// outputs; functions consuming them may debug-assert the bound.
pub type Felt = u64;

/// A sequence of field elements representing one hashed item.
pub type AlgItem = Vec<Felt>;

/// Like [`AlgItem`], but each item felt carries its aligned label felts.
pub type AlgItemLabel = Vec<(Felt, Vec<Felt>)>;

/// A raw (unhashed) sender or receiver input: a 128-bit value.
///
/// Arbitrary byte strings are admitted by hashing them down to 128 bits;
/// fixed-width integers map directly.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Item(pub [u8; 16]);

impl Item {
    /// Build an item from arbitrary bytes by hashing down to 128 bits.
    pub fn from_bytes(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest.as_bytes()[..16]);
        Item(out)
    }

    /// The two 64-bit words of the item, little-endian, low word first.
    #[inline]
    pub fn words(&self) -> (u64, u64) {
        let lo = u64::from_le_bytes(self.0[..8].try_into().expect("8 bytes"));
        let hi = u64::from_le_bytes(self.0[8..].try_into().expect("8 bytes"));
        (lo, hi)
    }
}

impl From<u128> for Item {
    fn from(value: u128) -> Self {
        Item(value.to_le_bytes())
    }
}

impl From<(u64, u64)> for Item {
    fn from((lo, hi): (u64, u64)) -> Self {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&lo.to_le_bytes());
        out[8..].copy_from_slice(&hi.to_le_bytes());
        Item(out)
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Item({})", hex::encode(self.0))
    }
}

/// A 128-bit OPRF output identifying one item inside the engine.
///
/// All deduplication, cuckoo placement, and bin membership is keyed on this
/// value; the engine never stores raw [`Item`]s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashedItem(pub [u8; 16]);

impl HashedItem {
    /// The two 64-bit words of the hashed item, low word first.
    #[inline]
    pub fn words(&self) -> (u64, u64) {
        let lo = u64::from_le_bytes(self.0[..8].try_into().expect("8 bytes"));
        let hi = u64::from_le_bytes(self.0[8..].try_into().expect("8 bytes"));
        (lo, hi)
    }
}

impl From<(u64, u64)> for HashedItem {
    fn from((lo, hi): (u64, u64)) -> Self {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&lo.to_le_bytes());
        out[8..].copy_from_slice(&hi.to_le_bytes());
        HashedItem(out)
    }
}

impl std::fmt::Debug for HashedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HashedItem({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for HashedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A plaintext user label (arbitrary bytes, up to 1024 after padding).
pub type Label = Vec<u8>;

/// A nonce-prefixed, keystream-encrypted label as stored in bins.
///
/// Layout: `nonce_byte_count` random bytes followed by `label_byte_count`
/// keystream-XOR bytes. See [`oprf::encrypt_label`].
pub type EncryptedLabel = Vec<u8>;

// ============================================================================
// Root-level re-exports
// ============================================================================

pub use crate::params::PsiParams;
pub use crate::pool::WorkerPool;
pub use crate::sender_db::SenderDB;
