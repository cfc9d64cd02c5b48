//! Homomorphic-encryption capability boundary
//!
//! The engine never talks to a concrete HE library. It talks to
//! [`HeEvaluator`], a minimal capability set — encode/decode, add, multiply,
//! square, relinearize, plain multiply/add, modulus switching, and NTT
//! transforms — over **opaque** [`Plaintext`] and [`Ciphertext`] byte
//! containers. A production embedding implements the trait over its BFV
//! library; everything above this module is agnostic to that choice.
//!
//! ## Levels and forms
//!
//! Two representation details of BFV leak through the capability on purpose,
//! because the evaluation schedule depends on them:
//!
//! - **Chain index** (modulus level): ciphertexts are switched down as they
//!   travel through the polynomial evaluation. High powers live at chain
//!   index 1, low powers one level above at chain index 2, so inner
//!   Paterson–Stockmeyer results land at the high level exactly when they
//!   meet the outer powers.
//! - **NTT form**: ciphertext-plaintext multiplication happens in NTT form;
//!   ciphertext-ciphertext multiplication happens out of it. Plaintext
//!   coefficients are pre-transformed to whichever form their multiplication
//!   partner will be in.
//!
//! ## The clear reference backend
//!
//! [`ClearEvaluator`] implements the trait on unencrypted slot vectors
//! modulo the plaintext prime while *enforcing* every form/level rule above
//! (mismatches are hard errors, as a real library would reject them). It
//! exists so the engine's algebra — including the PS/direct equivalence
//! contract — is testable hermetically. It provides `encrypt`/`decrypt` as
//! flagged identity operations and makes **no cryptographic claim**.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::poly::{add_mod, mul_mod};
use crate::Felt;

/// The chain index ciphertexts are switched to before plain multiplication.
pub const HIGH_POWERS_CHAIN_INDEX: u32 = 1;
/// The chain index for Paterson–Stockmeyer low powers (one level above).
pub const LOW_POWERS_CHAIN_INDEX: u32 = 2;

/// Errors surfaced at the HE boundary.
#[derive(Debug, thiserror::Error)]
pub enum HeError {
    #[error("operation `{0}` is not supported by this evaluator")]
    Unsupported(&'static str),
    #[error("ciphertext form mismatch: {0}")]
    FormMismatch(&'static str),
    #[error("chain index mismatch: expected {expected}, got {got}")]
    LevelMismatch { expected: u32, got: u32 },
    #[error("cannot switch modulus upward (from chain index {from} to {to})")]
    BadModSwitch { from: u32, to: u32 },
    #[error("relinearization requires key-switching keys")]
    KeysRequired,
    #[error("too many values for {slots} slots (got {got})")]
    TooManyValues { got: usize, slots: usize },
    #[error("slot value {0} is not reduced modulo the plain modulus")]
    UnreducedValue(u64),
    #[error("failed to load ciphertext: {0}")]
    InvalidCiphertext(String),
    #[error("failed to load plaintext: {0}")]
    InvalidPlaintext(String),
    #[error("failed to load relinearization keys: {0}")]
    InvalidKeys(String),
}

/// An opaque serialized plaintext, produced and consumed by an evaluator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plaintext(pub Vec<u8>);

impl Plaintext {
    /// The serialized bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// An opaque serialized ciphertext, produced and consumed by an evaluator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext(pub Vec<u8>);

impl Ciphertext {
    /// The serialized bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque relinearization (key-switching) keys from the query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelinKeys(pub Vec<u8>);

/// The capability set the match engine requires of an HE library.
pub trait HeEvaluator: Send + Sync {
    /// Number of batching slots per plaintext/ciphertext.
    fn slot_count(&self) -> usize;
    /// The plaintext prime `p`.
    fn plain_modulus(&self) -> u64;
    /// The highest chain index (freshly encrypted ciphertexts sit here).
    fn first_chain_index(&self) -> u32;
    /// Whether the scheme uses key switching (and thus relinearization).
    fn uses_keyswitching(&self) -> bool;

    /// Batch-encode slot values (padded with zeros) into a plaintext.
    fn encode(&self, values: &[Felt]) -> Result<Plaintext, HeError>;
    /// Decode a non-NTT plaintext back into slot values.
    fn decode(&self, pt: &Plaintext) -> Result<Vec<Felt>, HeError>;
    /// Transform a plaintext to NTT form at the given chain index.
    fn plain_to_ntt(&self, pt: &Plaintext, chain_index: u32) -> Result<Plaintext, HeError>;

    /// Validate and adopt serialized relinearization keys.
    fn load_relin_keys(&self, bytes: &[u8]) -> Result<RelinKeys, HeError>;
    /// Validate and adopt a serialized ciphertext (fails on wrong shape).
    fn load_ciphertext(&self, bytes: &[u8]) -> Result<Ciphertext, HeError>;
    /// Validate and adopt a serialized plaintext.
    fn load_plaintext(&self, bytes: &[u8]) -> Result<Plaintext, HeError>;

    /// Ciphertext addition (same form, level, for any operand sizes).
    fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, HeError>;
    /// Add a non-NTT plaintext to a non-NTT ciphertext.
    fn add_plain(&self, a: &Ciphertext, pt: &Plaintext) -> Result<Ciphertext, HeError>;
    /// Ciphertext multiplication (both non-NTT, same level; grows size).
    fn multiply(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, HeError>;
    /// Ciphertext squaring (non-NTT; grows size).
    fn square(&self, a: &Ciphertext) -> Result<Ciphertext, HeError>;
    /// Ciphertext-plaintext multiplication (forms must match; NTT-NTT
    /// additionally requires matching chain indices).
    fn multiply_plain(&self, a: &Ciphertext, pt: &Plaintext) -> Result<Ciphertext, HeError>;
    /// Reduce an expanded ciphertext back to size 2.
    fn relinearize(&self, a: &Ciphertext, keys: &RelinKeys) -> Result<Ciphertext, HeError>;
    /// Switch a ciphertext down to the given chain index.
    fn mod_switch_to(&self, a: &Ciphertext, chain_index: u32) -> Result<Ciphertext, HeError>;
    /// Transform a non-NTT ciphertext into NTT form.
    fn to_ntt(&self, a: &Ciphertext) -> Result<Ciphertext, HeError>;
    /// Transform an NTT ciphertext back out of NTT form.
    fn from_ntt(&self, a: &Ciphertext) -> Result<Ciphertext, HeError>;

    /// Optional: encrypt a plaintext (reference/test backends only).
    fn encrypt(&self, _pt: &Plaintext) -> Result<Ciphertext, HeError> {
        Err(HeError::Unsupported("encrypt"))
    }
    /// Optional: decrypt a non-NTT ciphertext (reference/test backends only).
    fn decrypt(&self, _ct: &Ciphertext) -> Result<Plaintext, HeError> {
        Err(HeError::Unsupported("decrypt"))
    }
}

/// The evaluator plus the per-query relinearization keys, handed around as
/// one unit (mirrors the original crypto-context bundle).
#[derive(Clone)]
pub struct CryptoContext {
    evaluator: std::sync::Arc<dyn HeEvaluator>,
    relin_keys: Option<std::sync::Arc<RelinKeys>>,
}

impl CryptoContext {
    /// Wrap an evaluator with no keys attached.
    pub fn new(evaluator: std::sync::Arc<dyn HeEvaluator>) -> Self {
        Self {
            evaluator,
            relin_keys: None,
        }
    }

    /// The evaluator capability.
    #[inline]
    pub fn evaluator(&self) -> &dyn HeEvaluator {
        &*self.evaluator
    }

    /// A shared handle to the evaluator.
    #[inline]
    pub fn evaluator_arc(&self) -> std::sync::Arc<dyn HeEvaluator> {
        self.evaluator.clone()
    }

    /// Attach relinearization keys for the duration of a query.
    pub fn set_relin_keys(&mut self, keys: RelinKeys) {
        self.relin_keys = Some(std::sync::Arc::new(keys));
    }

    /// The attached relinearization keys, if any.
    #[inline]
    pub fn relin_keys(&self) -> Option<&RelinKeys> {
        self.relin_keys.as_deref()
    }
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoContext")
            .field("slot_count", &self.evaluator.slot_count())
            .field("plain_modulus", &self.evaluator.plain_modulus())
            .field("has_relin_keys", &self.relin_keys.is_some())
            .finish()
    }
}

// ============================================================================
// Clear reference backend
// ============================================================================

/// Internal representation of a [`ClearEvaluator`] plaintext.
#[derive(Clone, Serialize, Deserialize)]
struct ClearPlaintext {
    slots: Vec<u64>,
    /// `Some(chain_index)` once NTT-transformed; non-NTT plaintexts are
    /// level-free.
    ntt_chain_index: Option<u32>,
}

/// Internal representation of a [`ClearEvaluator`] ciphertext.
#[derive(Clone, Serialize, Deserialize)]
struct ClearCiphertext {
    slots: Vec<u64>,
    chain_index: u32,
    ntt: bool,
    /// Polynomial count: 2 fresh, grows with multiplication, relinearized
    /// back down to 2.
    size: u8,
}

/// Reference backend: slot-wise arithmetic modulo `p` on unencrypted data,
/// with full enforcement of the form/level discipline.
pub struct ClearEvaluator {
    slot_count: usize,
    plain_modulus: u64,
    first_chain_index: u32,
    uses_keyswitching: bool,
}

impl ClearEvaluator {
    /// Construct a backend with the given shape.
    pub fn new(
        slot_count: usize,
        plain_modulus: u64,
        first_chain_index: u32,
        uses_keyswitching: bool,
    ) -> Self {
        Self {
            slot_count,
            plain_modulus,
            first_chain_index,
            uses_keyswitching,
        }
    }

    fn load_pt(&self, pt: &Plaintext) -> Result<ClearPlaintext, HeError> {
        let inner: ClearPlaintext = bincode::deserialize(pt.as_bytes())
            .map_err(|e| HeError::InvalidPlaintext(e.to_string()))?;
        if inner.slots.len() != self.slot_count {
            return Err(HeError::InvalidPlaintext(format!(
                "expected {} slots, got {}",
                self.slot_count,
                inner.slots.len()
            )));
        }
        Ok(inner)
    }

    fn load_ct(&self, ct: &Ciphertext) -> Result<ClearCiphertext, HeError> {
        let inner: ClearCiphertext = bincode::deserialize(ct.as_bytes())
            .map_err(|e| HeError::InvalidCiphertext(e.to_string()))?;
        if inner.slots.len() != self.slot_count {
            return Err(HeError::InvalidCiphertext(format!(
                "expected {} slots, got {}",
                self.slot_count,
                inner.slots.len()
            )));
        }
        if inner.chain_index > self.first_chain_index {
            return Err(HeError::InvalidCiphertext(format!(
                "chain index {} exceeds the context maximum {}",
                inner.chain_index, self.first_chain_index
            )));
        }
        if inner.size < 2 {
            return Err(HeError::InvalidCiphertext(format!(
                "ciphertext size {} is below the minimum of 2",
                inner.size
            )));
        }
        if let Some(&bad) = inner.slots.iter().find(|&&s| s >= self.plain_modulus) {
            return Err(HeError::InvalidCiphertext(format!(
                "slot value {bad} is not reduced"
            )));
        }
        Ok(inner)
    }

    fn store_pt(inner: &ClearPlaintext) -> Plaintext {
        Plaintext(bincode::serialize(inner).expect("plaintext serialization is infallible"))
    }

    fn store_ct(inner: &ClearCiphertext) -> Ciphertext {
        Ciphertext(bincode::serialize(inner).expect("ciphertext serialization is infallible"))
    }
}

impl HeEvaluator for ClearEvaluator {
    fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn plain_modulus(&self) -> u64 {
        self.plain_modulus
    }

    fn first_chain_index(&self) -> u32 {
        self.first_chain_index
    }

    fn uses_keyswitching(&self) -> bool {
        self.uses_keyswitching
    }

    fn encode(&self, values: &[Felt]) -> Result<Plaintext, HeError> {
        if values.len() > self.slot_count {
            return Err(HeError::TooManyValues {
                got: values.len(),
                slots: self.slot_count,
            });
        }
        if let Some(&bad) = values.iter().find(|&&v| v >= self.plain_modulus) {
            return Err(HeError::UnreducedValue(bad));
        }
        let mut slots = values.to_vec();
        slots.resize(self.slot_count, 0);
        Ok(Self::store_pt(&ClearPlaintext {
            slots,
            ntt_chain_index: None,
        }))
    }

    fn decode(&self, pt: &Plaintext) -> Result<Vec<Felt>, HeError> {
        let inner = self.load_pt(pt)?;
        if inner.ntt_chain_index.is_some() {
            return Err(HeError::FormMismatch("decode requires a non-NTT plaintext"));
        }
        Ok(inner.slots)
    }

    fn plain_to_ntt(&self, pt: &Plaintext, chain_index: u32) -> Result<Plaintext, HeError> {
        let mut inner = self.load_pt(pt)?;
        if inner.ntt_chain_index.is_some() {
            return Err(HeError::FormMismatch("plaintext is already in NTT form"));
        }
        inner.ntt_chain_index = Some(chain_index);
        Ok(Self::store_pt(&inner))
    }

    fn load_relin_keys(&self, bytes: &[u8]) -> Result<RelinKeys, HeError> {
        if self.uses_keyswitching && bytes.is_empty() {
            return Err(HeError::InvalidKeys(
                "empty relinearization keys under a key-switching scheme".into(),
            ));
        }
        Ok(RelinKeys(bytes.to_vec()))
    }

    fn load_ciphertext(&self, bytes: &[u8]) -> Result<Ciphertext, HeError> {
        let ct = Ciphertext(bytes.to_vec());
        self.load_ct(&ct)?;
        Ok(ct)
    }

    fn load_plaintext(&self, bytes: &[u8]) -> Result<Plaintext, HeError> {
        let pt = Plaintext(bytes.to_vec());
        self.load_pt(&pt)?;
        Ok(pt)
    }

    fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, HeError> {
        let x = self.load_ct(a)?;
        let y = self.load_ct(b)?;
        if x.ntt != y.ntt {
            return Err(HeError::FormMismatch("add requires matching NTT forms"));
        }
        if x.chain_index != y.chain_index {
            return Err(HeError::LevelMismatch {
                expected: x.chain_index,
                got: y.chain_index,
            });
        }
        let p = self.plain_modulus;
        let slots = x
            .slots
            .iter()
            .zip(y.slots.iter())
            .map(|(&u, &v)| add_mod(u, v, p))
            .collect();
        Ok(Self::store_ct(&ClearCiphertext {
            slots,
            chain_index: x.chain_index,
            ntt: x.ntt,
            size: x.size.max(y.size),
        }))
    }

    fn add_plain(&self, a: &Ciphertext, pt: &Plaintext) -> Result<Ciphertext, HeError> {
        let x = self.load_ct(a)?;
        let y = self.load_pt(pt)?;
        if x.ntt {
            return Err(HeError::FormMismatch("add_plain requires a non-NTT ciphertext"));
        }
        if y.ntt_chain_index.is_some() {
            return Err(HeError::FormMismatch("add_plain requires a non-NTT plaintext"));
        }
        let p = self.plain_modulus;
        let slots = x
            .slots
            .iter()
            .zip(y.slots.iter())
            .map(|(&u, &v)| add_mod(u, v, p))
            .collect();
        Ok(Self::store_ct(&ClearCiphertext {
            slots,
            chain_index: x.chain_index,
            ntt: false,
            size: x.size,
        }))
    }

    fn multiply(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, HeError> {
        let x = self.load_ct(a)?;
        let y = self.load_ct(b)?;
        if x.ntt || y.ntt {
            return Err(HeError::FormMismatch(
                "ciphertext multiplication requires non-NTT operands",
            ));
        }
        if x.chain_index != y.chain_index {
            return Err(HeError::LevelMismatch {
                expected: x.chain_index,
                got: y.chain_index,
            });
        }
        let p = self.plain_modulus;
        let slots = x
            .slots
            .iter()
            .zip(y.slots.iter())
            .map(|(&u, &v)| mul_mod(u, v, p))
            .collect();
        Ok(Self::store_ct(&ClearCiphertext {
            slots,
            chain_index: x.chain_index,
            ntt: false,
            size: x.size + y.size - 1,
        }))
    }

    fn square(&self, a: &Ciphertext) -> Result<Ciphertext, HeError> {
        self.multiply(a, a)
    }

    fn multiply_plain(&self, a: &Ciphertext, pt: &Plaintext) -> Result<Ciphertext, HeError> {
        let x = self.load_ct(a)?;
        let y = self.load_pt(pt)?;
        match (x.ntt, y.ntt_chain_index) {
            (true, Some(level)) => {
                if level != x.chain_index {
                    return Err(HeError::LevelMismatch {
                        expected: x.chain_index,
                        got: level,
                    });
                }
            }
            (false, None) => {}
            (true, None) => {
                return Err(HeError::FormMismatch(
                    "NTT ciphertext times non-NTT plaintext",
                ))
            }
            (false, Some(_)) => {
                return Err(HeError::FormMismatch(
                    "non-NTT ciphertext times NTT plaintext",
                ))
            }
        }
        let p = self.plain_modulus;
        let slots = x
            .slots
            .iter()
            .zip(y.slots.iter())
            .map(|(&u, &v)| mul_mod(u, v, p))
            .collect();
        Ok(Self::store_ct(&ClearCiphertext {
            slots,
            chain_index: x.chain_index,
            ntt: x.ntt,
            size: x.size,
        }))
    }

    fn relinearize(&self, a: &Ciphertext, _keys: &RelinKeys) -> Result<Ciphertext, HeError> {
        if !self.uses_keyswitching {
            return Err(HeError::Unsupported("relinearize without key switching"));
        }
        let mut x = self.load_ct(a)?;
        if x.ntt {
            return Err(HeError::FormMismatch("relinearize requires non-NTT form"));
        }
        x.size = 2;
        Ok(Self::store_ct(&x))
    }

    fn mod_switch_to(&self, a: &Ciphertext, chain_index: u32) -> Result<Ciphertext, HeError> {
        let mut x = self.load_ct(a)?;
        if chain_index > x.chain_index {
            return Err(HeError::BadModSwitch {
                from: x.chain_index,
                to: chain_index,
            });
        }
        x.chain_index = chain_index;
        Ok(Self::store_ct(&x))
    }

    fn to_ntt(&self, a: &Ciphertext) -> Result<Ciphertext, HeError> {
        let mut x = self.load_ct(a)?;
        if x.ntt {
            return Err(HeError::FormMismatch("ciphertext is already in NTT form"));
        }
        x.ntt = true;
        Ok(Self::store_ct(&x))
    }

    fn from_ntt(&self, a: &Ciphertext) -> Result<Ciphertext, HeError> {
        let mut x = self.load_ct(a)?;
        if !x.ntt {
            return Err(HeError::FormMismatch("ciphertext is not in NTT form"));
        }
        x.ntt = false;
        Ok(Self::store_ct(&x))
    }

    fn encrypt(&self, pt: &Plaintext) -> Result<Ciphertext, HeError> {
        let inner = self.load_pt(pt)?;
        if inner.ntt_chain_index.is_some() {
            return Err(HeError::FormMismatch("encrypt requires a non-NTT plaintext"));
        }
        Ok(Self::store_ct(&ClearCiphertext {
            slots: inner.slots,
            chain_index: self.first_chain_index,
            ntt: false,
            size: 2,
        }))
    }

    fn decrypt(&self, ct: &Ciphertext) -> Result<Plaintext, HeError> {
        let inner = self.load_ct(ct)?;
        if inner.ntt {
            return Err(HeError::FormMismatch("decrypt requires a non-NTT ciphertext"));
        }
        Ok(Self::store_pt(&ClearPlaintext {
            slots: inner.slots,
            ntt_chain_index: None,
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const P: u64 = 65537;

    fn backend() -> ClearEvaluator {
        ClearEvaluator::new(8, P, 3, true)
    }

    #[test]
    fn encode_decode_roundtrip_with_padding() {
        let ev = backend();
        let pt = ev.encode(&[1, 2, 3]).unwrap();
        assert_eq!(ev.decode(&pt).unwrap(), vec![1, 2, 3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn encode_rejects_unreduced_and_oversized() {
        let ev = backend();
        assert!(matches!(ev.encode(&[P]), Err(HeError::UnreducedValue(_))));
        assert!(matches!(
            ev.encode(&vec![0; 9]),
            Err(HeError::TooManyValues { .. })
        ));
    }

    #[test]
    fn encrypted_arithmetic_is_slotwise() {
        let ev = backend();
        let a = ev.encrypt(&ev.encode(&[3, 5, 7]).unwrap()).unwrap();
        let b = ev.encrypt(&ev.encode(&[10, 20, 30]).unwrap()).unwrap();

        let sum = ev.add(&a, &b).unwrap();
        let prod = ev.multiply(&a, &b).unwrap();

        let dec = |ct: &Ciphertext| ev.decode(&ev.decrypt(ct).unwrap()).unwrap();
        assert_eq!(&dec(&sum)[..3], &[13, 25, 37]);
        assert_eq!(&dec(&prod)[..3], &[30, 100, 210]);
    }

    #[test]
    fn multiplication_grows_size_and_relinearization_shrinks_it() {
        let ev = backend();
        let a = ev.encrypt(&ev.encode(&[2]).unwrap()).unwrap();
        let sq = ev.square(&a).unwrap();
        // A size-3 ciphertext multiplied again would keep growing; after
        // relinearization the chain is back at size 2 and multipliable.
        let keys = ev.load_relin_keys(b"keys").unwrap();
        let relin = ev.relinearize(&sq, &keys).unwrap();
        let quad = ev.square(&relin).unwrap();
        let dec = ev.decode(&ev.decrypt(&ev.relinearize(&quad, &keys).unwrap()).unwrap()).unwrap();
        assert_eq!(dec[0], 16);
    }

    #[test]
    fn form_discipline_is_enforced() {
        let ev = backend();
        let pt = ev.encode(&[1, 1]).unwrap();
        let ct = ev.encrypt(&pt).unwrap();
        let ct_ntt = ev.to_ntt(&ct).unwrap();

        // NTT ciphertexts cannot enter ct-ct multiplication.
        assert!(matches!(
            ev.multiply(&ct_ntt, &ct),
            Err(HeError::FormMismatch(_))
        ));
        // NTT ct × non-NTT pt is rejected.
        assert!(matches!(
            ev.multiply_plain(&ct_ntt, &pt),
            Err(HeError::FormMismatch(_))
        ));
        // Matching NTT forms at matching levels succeed.
        let pt_ntt = ev.plain_to_ntt(&pt, 3).unwrap();
        assert!(ev.multiply_plain(&ct_ntt, &pt_ntt).is_ok());
        // …but a level mismatch is caught.
        let down = ev.mod_switch_to(&ct, 1).unwrap();
        let down_ntt = ev.to_ntt(&down).unwrap();
        assert!(matches!(
            ev.multiply_plain(&down_ntt, &pt_ntt),
            Err(HeError::LevelMismatch { .. })
        ));
    }

    #[test]
    fn mod_switch_only_goes_down() {
        let ev = backend();
        let ct = ev.encrypt(&ev.encode(&[1]).unwrap()).unwrap();
        let low = ev.mod_switch_to(&ct, 1).unwrap();
        assert!(matches!(
            ev.mod_switch_to(&low, 2),
            Err(HeError::BadModSwitch { .. })
        ));
    }

    #[test]
    fn load_ciphertext_validates_shape() {
        let ev = backend();
        assert!(matches!(
            ev.load_ciphertext(b"garbage"),
            Err(HeError::InvalidCiphertext(_))
        ));

        // A ciphertext from an 8-slot context fails in a 4-slot context.
        let ct = ev.encrypt(&ev.encode(&[1]).unwrap()).unwrap();
        let small = ClearEvaluator::new(4, P, 3, true);
        assert!(matches!(
            small.load_ciphertext(ct.as_bytes()),
            Err(HeError::InvalidCiphertext(_))
        ));

        // The original context accepts its own ciphertext.
        assert!(ev.load_ciphertext(ct.as_bytes()).is_ok());
    }

    #[test]
    fn trait_object_is_usable() {
        let ev: Arc<dyn HeEvaluator> = Arc::new(backend());
        let ctx = CryptoContext::new(ev);
        let pt = ctx.evaluator().encode(&[4]).unwrap();
        let ct = ctx.evaluator().encrypt(&pt).unwrap();
        let out = ctx.evaluator().decode(&ctx.evaluator().decrypt(&ct).unwrap()).unwrap();
        assert_eq!(out[0], 4);
    }
}
