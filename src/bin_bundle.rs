//! BinBundle: batched bins, cached polynomials, encrypted evaluation
//!
//! A `BinBundle` is the unit of homomorphic evaluation: `bins_per_bundle`
//! parallel bins sharing one bundle index, each holding at most
//! `max_bin_size` field elements (plus, per label chunk, the aligned label
//! felts). Its cache holds, per bin, the *matching polynomial* (monic, roots
//! = the bin's items) and, per label chunk, the *Newton interpolation
//! polynomial* (mapping items to label felts) — batched **column-wise** into
//! plaintexts.
//!
//! Batching example. Three bins with matching polynomials
//!
//! ```text
//!     3x⁵ + 7x⁴ +  x³ + 9x² + 4x + 2
//!                 8x³ + 5x² +      1
//!           9x⁴ + 2x³ +       x  + 8
//! ```
//!
//! become six plaintexts P₀…P₅ where Pᵢ's slot `b` is bin `b`'s degree-`i`
//! coefficient. Evaluating `Σ Pᵢ·Cⁱ` on slot-wise ciphertext powers then
//! evaluates every bin's polynomial at its own slot of the query — one
//! ciphertext answers `bins_per_bundle` bins at once.
//!
//! ## Evaluation schedules
//!
//! [`BatchedPlaintextPolyn::eval`] is the direct schedule: one NTT
//! ciphertext-plaintext multiply per degree at the high-powers level.
//! [`BatchedPlaintextPolyn::eval_patstock`] is Paterson–Stockmeyer with
//! inner degree `ℓ`: inner polynomials are evaluated on the low powers
//! `C¹…C^ℓ` one modulus level higher, inverse-NTT'd, switched down, and
//! multiplied by the non-NTT high powers `C^{i(ℓ+1)}`. PS runs iff
//! `1 < ℓ < degree`; both schedules decrypt to the same result.
//!
//! ## Cache discipline
//!
//! Every mutating operation moves the cache to `Dirty`; [`BinBundle::
//! regen_cache`] recomputes polynomials and batched plaintexts and moves it
//! to `Ready`. Queries only ever touch `Ready` caches. [`BinBundle::strip`]
//! drops bins and filters, keeping just the cache — the bundle then serves
//! queries but accepts no further mutation.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::cuckoo_filter::{CuckooFilter, CuckooFilterData, FilterError};
use crate::he::{
    Ciphertext, CryptoContext, HeError, HIGH_POWERS_CHAIN_INDEX, LOW_POWERS_CHAIN_INDEX,
};
use crate::params::SERIALIZATION_VERSION;
use crate::poly::{newton_interpolate_polyn, polyn_with_roots, FEltPolyn, PolyError};
use crate::Felt;

/// Tag width of the per-bin cuckoo filters.
pub const FILTER_BITS_PER_TAG: u32 = 12;

/// Per-bundle ciphertext power buffer; slot 0 is never used, and only the
/// powers the schedule materializes are `Some`.
pub type CiphertextPowers = Vec<Option<Ciphertext>>;

/// Errors surfaced by BinBundle operations.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("cache is invalid; regen_cache must run first")]
    CacheInvalid,
    #[error("BinBundle is stripped")]
    Stripped,
    #[error("ciphertext power {0} was not materialized for this schedule")]
    MissingPower(usize),
    #[error("batched polynomial has no non-constant coefficients to evaluate")]
    EmptyPolyn,
    #[error("relinearization keys are required but missing from the query")]
    KeysRequired,
    #[error(transparent)]
    He(#[from] HeError),
    #[error(transparent)]
    Poly(#[from] PolyError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("serialized BinBundle is invalid: {0}")]
    Serialization(String),
    #[error("serialization version {got} is incompatible with {expected}")]
    VersionMismatch { got: u32, expected: u32 },
}

/// One insertable entry: an item felt plus its aligned label felts (empty
/// for unlabeled bundles). Implemented by `Felt` and `(Felt, Vec<Felt>)` so
/// the same insertion code serves both modes.
pub trait BundleEntry {
    /// The item field element.
    fn felt(&self) -> Felt;
    /// The aligned label felts, one per label chunk.
    fn label_parts(&self) -> &[Felt];
}

impl BundleEntry for Felt {
    #[inline]
    fn felt(&self) -> Felt {
        *self
    }
    #[inline]
    fn label_parts(&self) -> &[Felt] {
        &[]
    }
}

impl BundleEntry for (Felt, Vec<Felt>) {
    #[inline]
    fn felt(&self) -> Felt {
        self.0
    }
    #[inline]
    fn label_parts(&self) -> &[Felt] {
        &self.1
    }
}

// ============================================================================
// Batched plaintext polynomial
// ============================================================================

/// A column of per-bin polynomials batched into one plaintext per degree.
///
/// `batched_coeffs[d]` is the serialized plaintext whose slot `b` holds the
/// degree-`d` coefficient of bin `b`'s polynomial (zero where the bin's
/// polynomial is shorter). Form/level per degree:
///
/// - degree 0 stays non-NTT (it is `add_plain`ed at the end);
/// - with PS enabled, non-zero multiples of `ps_low_degree + 1` stay
///   non-NTT (they multiply the non-NTT high powers);
/// - everything else is NTT-transformed at the encode level.
pub struct BatchedPlaintextPolyn {
    /// Serialized plaintexts, one per degree, constant term first.
    pub batched_coeffs: Vec<Vec<u8>>,
}

impl BatchedPlaintextPolyn {
    /// Batch `polyns` (one per bin, degree-increasing coefficients) into
    /// plaintexts under the given evaluation schedule.
    ///
    /// Evaluation takes its own context so queries can supply the variant
    /// carrying their relinearization keys.
    pub fn new(
        polyns: &[FEltPolyn],
        crypto_context: &CryptoContext,
        ps_low_degree: u32,
    ) -> Result<Self, BundleError> {
        let ev = crypto_context.evaluator();
        // Evaluation needs at least one ciphertext multiplication to produce
        // an encrypted result, so a column of constant polynomials is padded
        // with an all-zero degree-1 coefficient.
        let max_deg = polyns
            .iter()
            .map(|p| p.len().saturating_sub(1))
            .max()
            .unwrap_or(0)
            .max(1);

        // PS with inner degree 0 or 1 degenerates to the direct schedule;
        // the NTT/level policy must match what the query engine sends.
        let ps_active = ps_low_degree > 1;

        // Leave one level for the direct schedule, two for PS.
        let encode_chain = ev.first_chain_index().min(if ps_active {
            LOW_POWERS_CHAIN_INDEX
        } else {
            HIGH_POWERS_CHAIN_INDEX
        });

        let mut batched_coeffs = Vec::with_capacity(max_deg + 1);
        for d in 0..=max_deg {
            let column: Vec<Felt> = polyns
                .iter()
                .map(|p| p.get(d).copied().unwrap_or(0))
                .collect();
            let mut pt = ev.encode(&column)?;

            if d != 0 {
                let is_high_power = ps_active && d % (ps_low_degree as usize + 1) == 0;
                if !is_high_power {
                    pt = ev.plain_to_ntt(&pt, encode_chain)?;
                }
            }
            batched_coeffs.push(pt.as_bytes().to_vec());
        }

        Ok(Self { batched_coeffs })
    }

    /// Rebuild from stored coefficient blobs (deserialization path).
    pub fn from_coeffs(batched_coeffs: Vec<Vec<u8>>) -> Self {
        Self { batched_coeffs }
    }

    /// Highest represented degree.
    #[inline]
    pub fn degree(&self) -> usize {
        self.batched_coeffs.len().saturating_sub(1)
    }

    /// Evaluate with whichever schedule the parameters select: PS iff
    /// `1 < ps_low_degree < degree`.
    pub fn eval_with_schedule(
        &self,
        crypto_context: &CryptoContext,
        powers: &CiphertextPowers,
        ps_low_degree: u32,
    ) -> Result<Ciphertext, BundleError> {
        let degree = self.degree();
        if ps_low_degree > 1 && (ps_low_degree as usize) < degree {
            self.eval_patstock(crypto_context, powers, ps_low_degree as usize)
        } else {
            self.eval(crypto_context, powers)
        }
    }

    fn power<'a>(
        powers: &'a CiphertextPowers,
        idx: usize,
    ) -> Result<&'a Ciphertext, BundleError> {
        powers
            .get(idx)
            .and_then(Option::as_ref)
            .ok_or(BundleError::MissingPower(idx))
    }

    /// Direct evaluation on NTT-form powers `C¹…C^degree` at the
    /// high-powers level: `Σ_{d≥1} coeff[d]·Cᵈ`, inverse NTT, `+ coeff[0]`.
    pub fn eval(
        &self,
        crypto_context: &CryptoContext,
        powers: &CiphertextPowers,
    ) -> Result<Ciphertext, BundleError> {
        let ev = crypto_context.evaluator();
        let degree = self.degree();
        if degree == 0 {
            return Err(BundleError::EmptyPolyn);
        }

        let mut acc: Option<Ciphertext> = None;
        for d in 1..=degree {
            let pt = ev.load_plaintext(&self.batched_coeffs[d])?;
            let term = ev.multiply_plain(Self::power(powers, d)?, &pt)?;
            acc = Some(match acc {
                None => term,
                Some(prev) => ev.add(&prev, &term)?,
            });
        }

        let result = ev.from_ntt(&acc.expect("degree >= 1 guarantees a term"))?;
        let constant = ev.load_plaintext(&self.batched_coeffs[0])?;
        Ok(ev.add_plain(&result, &constant)?)
    }

    /// Paterson–Stockmeyer evaluation with inner degree `ℓ = ps_low_degree`.
    ///
    /// Writing `H = ℓ + 1` and `h = degree / H`, the polynomial splits as
    /// `Σ_{i=0}^{h} Qᵢ(x)·x^{iH}` with `deg Qᵢ ≤ ℓ` (the last may be
    /// shorter). Inner polynomials are evaluated on NTT low powers one
    /// modulus level above the high powers; each free term `coeff[iH]` is
    /// folded in by a non-NTT plain multiply against the high power instead
    /// of travelling through the inner polynomial.
    pub fn eval_patstock(
        &self,
        crypto_context: &CryptoContext,
        powers: &CiphertextPowers,
        ps_low_degree: usize,
    ) -> Result<Ciphertext, BundleError> {
        let ev = crypto_context.evaluator();
        let degree = self.degree();
        if degree == 0 {
            return Err(BundleError::EmptyPolyn);
        }
        debug_assert!(ps_low_degree > 1 && ps_low_degree < degree);

        let ps_high_degree = ps_low_degree + 1;
        let high_powers_count = degree / ps_high_degree;
        let relinearize = ev.uses_keyswitching();

        let mut result: Option<Ciphertext> = None;
        let accumulate = |ev: &dyn crate::he::HeEvaluator,
                              term: Ciphertext,
                              result: &mut Option<Ciphertext>|
         -> Result<(), BundleError> {
            *result = Some(match result.take() {
                None => term,
                Some(prev) => ev.add(&prev, &term)?,
            });
            Ok(())
        };

        // Inner polynomial of one block: Σ_{j=1}^{last_j} coeff[base+j]·Cʲ
        // on the NTT low powers, then inverse NTT and switch to the high
        // level. The block's free term is handled separately below.
        let eval_inner = |base: usize, last_j: usize| -> Result<Ciphertext, BundleError> {
            let mut inner: Option<Ciphertext> = None;
            for j in 1..=last_j {
                let pt = ev.load_plaintext(&self.batched_coeffs[base + j])?;
                let term = ev.multiply_plain(Self::power(powers, j)?, &pt)?;
                inner = Some(match inner {
                    None => term,
                    Some(prev) => ev.add(&prev, &term)?,
                });
            }
            let inner = ev.from_ntt(&inner.expect("last_j >= 1"))?;
            Ok(ev.mod_switch_to(&inner, HIGH_POWERS_CHAIN_INDEX)?)
        };

        // Blocks i = 1 … h−1 have full inner degree ℓ.
        for i in 1..high_powers_count {
            let inner = eval_inner(i * ps_high_degree, ps_low_degree)?;
            let mut outer = ev.multiply(&inner, Self::power(powers, i * ps_high_degree)?)?;
            if relinearize {
                let keys = crypto_context
                    .relin_keys()
                    .ok_or(BundleError::KeysRequired)?;
                outer = ev.relinearize(&outer, keys)?;
            }
            accumulate(ev, outer, &mut result)?;
        }

        // The final block i = h carries the remainder degree.
        let remainder = degree % ps_high_degree;
        if remainder > 0 {
            let inner = eval_inner(high_powers_count * ps_high_degree, remainder)?;
            let mut outer = ev.multiply(
                &inner,
                Self::power(powers, high_powers_count * ps_high_degree)?,
            )?;
            if relinearize {
                let keys = crypto_context
                    .relin_keys()
                    .ok_or(BundleError::KeysRequired)?;
                outer = ev.relinearize(&outer, keys)?;
            }
            accumulate(ev, outer, &mut result)?;
        }

        // Block i = 0 needs no outer multiplication.
        for j in 1..=ps_low_degree.min(degree) {
            let pt = ev.load_plaintext(&self.batched_coeffs[j])?;
            let term = ev.multiply_plain(Self::power(powers, j)?, &pt)?;
            let term = ev.from_ntt(&term)?;
            let term = ev.mod_switch_to(&term, HIGH_POWERS_CHAIN_INDEX)?;
            accumulate(ev, term, &mut result)?;
        }

        // Free terms of blocks 1…h: coeff[iH]·C^{iH}, both non-NTT at the
        // high level already.
        for i in 1..=high_powers_count {
            let pt = ev.load_plaintext(&self.batched_coeffs[i * ps_high_degree])?;
            let term = ev.multiply_plain(Self::power(powers, i * ps_high_degree)?, &pt)?;
            let term = ev.mod_switch_to(&term, HIGH_POWERS_CHAIN_INDEX)?;
            accumulate(ev, term, &mut result)?;
        }

        let result = result.expect("degree >= 2 under PS guarantees terms");
        let constant = ev.load_plaintext(&self.batched_coeffs[0])?;
        Ok(ev.add_plain(&result, &constant)?)
    }
}

impl std::fmt::Debug for BatchedPlaintextPolyn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedPlaintextPolyn")
            .field("degree", &self.degree())
            .finish()
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Everything precomputable about a BinBundle's bins.
pub struct BinBundleCache {
    /// Per-bin matching polynomial (monic, roots = bin items).
    pub felt_matching_polyns: Vec<FEltPolyn>,
    /// Per label chunk, per bin: the Newton interpolation polynomial.
    /// Empty for unlabeled bundles.
    pub felt_interp_polyns: Vec<Vec<FEltPolyn>>,
    /// Batched plaintext form of the matching polynomials.
    pub batched_matching_polyn: BatchedPlaintextPolyn,
    /// Batched plaintext form of the interpolation polynomials, one per
    /// label chunk.
    pub batched_interp_polyns: Vec<BatchedPlaintextPolyn>,
}

/// The cache either needs regeneration or is ready to serve.
enum CacheState {
    Dirty,
    Ready(BinBundleCache),
}

#[derive(Serialize, Deserialize)]
struct CacheData {
    felt_matching_polyns: Vec<FEltPolyn>,
    felt_interp_polyns: Vec<Vec<FEltPolyn>>,
    batched_matching_coeffs: Vec<Vec<u8>>,
    batched_interp_coeffs: Vec<Vec<Vec<u8>>>,
}

#[derive(Serialize, Deserialize)]
struct BinBundleData {
    version: u32,
    bundle_idx: u32,
    stripped: bool,
    label_size: u64,
    /// Bins that currently hold at least one item (load-time sanity check).
    populated_bin_count: u32,
    item_bins: Option<Vec<Vec<Felt>>>,
    label_bins: Option<Vec<Vec<Vec<Felt>>>>,
    filters: Option<Vec<CuckooFilterData>>,
    cache: Option<CacheData>,
}

// ============================================================================
// BinBundle
// ============================================================================

/// A fixed-capacity batched container of bins for one bundle index.
pub struct BinBundle {
    crypto_context: CryptoContext,
    /// `item_bins[bin][pos]`: the items, pairwise distinct within a bin.
    item_bins: Vec<Vec<Felt>>,
    /// `label_bins[chunk][bin][pos]`, aligned with `item_bins`.
    label_bins: Vec<Vec<Vec<Felt>>>,
    /// One filter per bin, mirroring its item membership.
    filters: Vec<CuckooFilter>,
    cache: CacheState,
    stripped: bool,
    label_size: usize,
    max_bin_size: usize,
    ps_low_degree: u32,
    num_bins: usize,
}

impl BinBundle {
    /// Create an empty bundle.
    ///
    /// `label_size` is the label length in item-sized chunks (0 for
    /// unlabeled); `num_bins` is `bins_per_bundle` of the parameter set.
    pub fn new(
        crypto_context: CryptoContext,
        label_size: usize,
        max_bin_size: usize,
        ps_low_degree: u32,
        num_bins: usize,
        stripped: bool,
    ) -> Self {
        let mut bundle = Self {
            crypto_context,
            item_bins: Vec::new(),
            label_bins: Vec::new(),
            filters: Vec::new(),
            cache: CacheState::Dirty,
            stripped,
            label_size,
            max_bin_size,
            ps_low_degree,
            num_bins,
        };
        bundle.clear(stripped);
        bundle
    }

    /// Number of bins.
    #[inline]
    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    /// Label length in item-sized chunks.
    #[inline]
    pub fn label_size(&self) -> usize {
        self.label_size
    }

    /// Whether the bundle has been stripped down to its cache.
    #[inline]
    pub fn is_stripped(&self) -> bool {
        self.stripped
    }

    /// The per-bin item storage.
    #[inline]
    pub fn item_bins(&self) -> &[Vec<Felt>] {
        &self.item_bins
    }

    /// Whether every bin is empty.
    pub fn empty(&self) -> bool {
        self.item_bins.iter().all(|bin| bin.is_empty())
    }

    /// Whether the cache needs regeneration before serving.
    #[inline]
    pub fn cache_invalid(&self) -> bool {
        matches!(self.cache, CacheState::Dirty)
    }

    /// Borrow the ready cache; fails while dirty.
    pub fn get_cache(&self) -> Result<&BinBundleCache, BundleError> {
        match &self.cache {
            CacheState::Ready(cache) => Ok(cache),
            CacheState::Dirty => Err(BundleError::CacheInvalid),
        }
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Insert entries into consecutive bins starting at `start_bin_idx`.
    ///
    /// Returns the size of the largest touched bin after insertion, or `-1`
    /// if any entry collides with an existing item felt, would overflow
    /// `max_bin_size`, or the range/label shape is invalid. With `dry_run`
    /// the check runs without mutating. All-or-nothing either way.
    pub fn multi_insert<T: BundleEntry>(
        &mut self,
        entries: &[T],
        start_bin_idx: usize,
        dry_run: bool,
    ) -> i32 {
        if self.stripped {
            error!("cannot insert into a stripped BinBundle");
            return -1;
        }
        if entries.is_empty() || start_bin_idx + entries.len() > self.num_bins {
            return -1;
        }
        if entries.iter().any(|e| e.label_parts().len() != self.label_size) {
            error!(
                expected = self.label_size,
                "entry label shape does not match the bundle"
            );
            return -1;
        }

        // Validate capacity and distinctness before touching anything.
        let mut max_size = 0usize;
        for (i, entry) in entries.iter().enumerate() {
            let bin_idx = start_bin_idx + i;
            let bin = &self.item_bins[bin_idx];
            if bin.len() + 1 > self.max_bin_size {
                return -1;
            }
            // Filter first: a negative proves absence, a positive falls
            // through to the exact scan.
            if self.filters[bin_idx].contains(&[entry.felt()])
                && bin.contains(&entry.felt())
            {
                return -1;
            }
            max_size = max_size.max(bin.len() + 1);
        }

        if dry_run {
            return max_size as i32;
        }

        for (i, entry) in entries.iter().enumerate() {
            let bin_idx = start_bin_idx + i;
            self.item_bins[bin_idx].push(entry.felt());
            for (chunk, part) in entry.label_parts().iter().enumerate() {
                self.label_bins[chunk][bin_idx].push(*part);
            }
            let added = self.filters[bin_idx].try_add(&[entry.felt()]);
            debug_assert!(added, "filter saturated below max_bin_size");
        }
        self.cache = CacheState::Dirty;
        max_size as i32
    }

    /// Overwrite the labels of an already-present entry sequence. Returns
    /// true iff every item was found in its bin; otherwise nothing changes.
    pub fn try_multi_overwrite<T: BundleEntry>(
        &mut self,
        entries: &[T],
        start_bin_idx: usize,
    ) -> bool {
        if self.stripped
            || entries.is_empty()
            || start_bin_idx + entries.len() > self.num_bins
            || entries.iter().any(|e| e.label_parts().len() != self.label_size)
        {
            return false;
        }

        // Locate every item before overwriting any label.
        let mut positions = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let bin_idx = start_bin_idx + i;
            if !self.filters[bin_idx].contains(&[entry.felt()]) {
                return false;
            }
            match self.item_bins[bin_idx].iter().position(|&f| f == entry.felt()) {
                Some(pos) => positions.push(pos),
                None => return false,
            }
        }

        for ((i, entry), pos) in entries.iter().enumerate().zip(positions) {
            let bin_idx = start_bin_idx + i;
            for (chunk, part) in entry.label_parts().iter().enumerate() {
                self.label_bins[chunk][bin_idx][pos] = *part;
            }
        }
        self.cache = CacheState::Dirty;
        true
    }

    /// Remove an item sequence (and its labels) from consecutive bins.
    /// Returns true iff every item was found; otherwise nothing changes.
    /// Bin ordering is not preserved.
    pub fn try_multi_remove(&mut self, items: &[Felt], start_bin_idx: usize) -> bool {
        if self.stripped || items.is_empty() || start_bin_idx + items.len() > self.num_bins {
            return false;
        }

        let mut positions = Vec::with_capacity(items.len());
        for (i, &item) in items.iter().enumerate() {
            let bin_idx = start_bin_idx + i;
            if !self.filters[bin_idx].contains(&[item]) {
                return false;
            }
            match self.item_bins[bin_idx].iter().position(|&f| f == item) {
                Some(pos) => positions.push(pos),
                None => return false,
            }
        }

        for ((i, &item), pos) in items.iter().enumerate().zip(positions) {
            let bin_idx = start_bin_idx + i;
            self.item_bins[bin_idx].swap_remove(pos);
            for chunk in 0..self.label_size {
                self.label_bins[chunk][bin_idx].swap_remove(pos);
            }
            let removed = self.filters[bin_idx].remove(&[item]);
            debug_assert!(removed, "filter out of sync with bin contents");
        }
        self.cache = CacheState::Dirty;
        true
    }

    /// Read the label parts of an item sequence into `labels`, chunk-major
    /// (`labels[chunk · items.len() + i]`). Fails atomically — on any
    /// missing item `labels` is cleared and false is returned.
    pub fn try_get_multi_label(
        &self,
        items: &[Felt],
        start_bin_idx: usize,
        labels: &mut Vec<Felt>,
    ) -> bool {
        labels.clear();
        if self.stripped || items.is_empty() || start_bin_idx + items.len() > self.num_bins {
            return false;
        }

        let mut positions = Vec::with_capacity(items.len());
        for (i, &item) in items.iter().enumerate() {
            let bin_idx = start_bin_idx + i;
            if !self.filters[bin_idx].contains(&[item]) {
                return false;
            }
            match self.item_bins[bin_idx].iter().position(|&f| f == item) {
                Some(pos) => positions.push(pos),
                None => return false,
            }
        }

        labels.reserve(self.label_size * items.len());
        for chunk in 0..self.label_size {
            for (i, &pos) in positions.iter().enumerate() {
                labels.push(self.label_bins[chunk][start_bin_idx + i][pos]);
            }
        }
        true
    }

    /// Reset to the empty state (optionally the stripped empty state).
    pub fn clear(&mut self, stripped: bool) {
        self.item_bins = vec![Vec::new(); self.num_bins];
        self.label_bins = vec![vec![Vec::new(); self.num_bins]; self.label_size];
        self.filters = (0..self.num_bins)
            .map(|_| CuckooFilter::new(self.max_bin_size, FILTER_BITS_PER_TAG))
            .collect();
        self.cache = CacheState::Dirty;
        self.stripped = stripped;
    }

    // ------------------------------------------------------------------
    // Cache generation and stripping
    // ------------------------------------------------------------------

    /// Recompute per-bin polynomials and batch them into plaintexts.
    pub fn regen_cache(&mut self) -> Result<(), BundleError> {
        if self.stripped {
            return Err(BundleError::Stripped);
        }
        let p = self.crypto_context.evaluator().plain_modulus();

        let felt_matching_polyns: Vec<FEltPolyn> = self
            .item_bins
            .iter()
            .map(|bin| polyn_with_roots(bin, p))
            .collect();

        let mut felt_interp_polyns = Vec::with_capacity(self.label_size);
        for chunk in 0..self.label_size {
            let mut per_bin = Vec::with_capacity(self.num_bins);
            for (bin_idx, bin) in self.item_bins.iter().enumerate() {
                per_bin.push(newton_interpolate_polyn(
                    bin,
                    &self.label_bins[chunk][bin_idx],
                    p,
                )?);
            }
            felt_interp_polyns.push(per_bin);
        }

        let batched_matching_polyn = BatchedPlaintextPolyn::new(
            &felt_matching_polyns,
            &self.crypto_context,
            self.ps_low_degree,
        )?;
        let mut batched_interp_polyns = Vec::with_capacity(self.label_size);
        for per_bin in &felt_interp_polyns {
            batched_interp_polyns.push(BatchedPlaintextPolyn::new(
                per_bin,
                &self.crypto_context,
                self.ps_low_degree,
            )?);
        }

        self.cache = CacheState::Ready(BinBundleCache {
            felt_matching_polyns,
            felt_interp_polyns,
            batched_matching_polyn,
            batched_interp_polyns,
        });
        Ok(())
    }

    /// Drop bins, labels, and filters, keeping only the serving cache.
    /// Regenerates the cache first if it is dirty. Irreversible.
    pub fn strip(&mut self) -> Result<(), BundleError> {
        if self.stripped {
            return Ok(());
        }
        if self.cache_invalid() {
            self.regen_cache()?;
        }
        self.item_bins = vec![Vec::new(); self.num_bins];
        self.label_bins = vec![vec![Vec::new(); self.num_bins]; self.label_size];
        self.filters.clear();
        self.stripped = true;
        debug!("BinBundle stripped to its cache");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Serialize together with the bundle index that owns this bundle.
    pub fn save(&self, bundle_idx: u32) -> Result<Vec<u8>, BundleError> {
        let cache = match &self.cache {
            CacheState::Ready(cache) => Some(CacheData {
                felt_matching_polyns: cache.felt_matching_polyns.clone(),
                felt_interp_polyns: cache.felt_interp_polyns.clone(),
                batched_matching_coeffs: cache.batched_matching_polyn.batched_coeffs.clone(),
                batched_interp_coeffs: cache
                    .batched_interp_polyns
                    .iter()
                    .map(|p| p.batched_coeffs.clone())
                    .collect(),
            }),
            CacheState::Dirty => None,
        };
        if self.stripped && cache.is_none() {
            // Unreachable: strip() always leaves a ready cache behind.
            return Err(BundleError::CacheInvalid);
        }

        let data = BinBundleData {
            version: SERIALIZATION_VERSION,
            bundle_idx,
            stripped: self.stripped,
            label_size: self.label_size as u64,
            populated_bin_count: self.item_bins.iter().filter(|b| !b.is_empty()).count() as u32,
            item_bins: (!self.stripped).then(|| self.item_bins.clone()),
            label_bins: (!self.stripped).then(|| self.label_bins.clone()),
            filters: (!self.stripped)
                .then(|| self.filters.iter().map(|f| f.to_data()).collect()),
            cache,
        };
        bincode::serialize(&data).map_err(|e| BundleError::Serialization(e.to_string()))
    }

    /// Replace this (freshly constructed) bundle's contents from serialized
    /// data; returns the stored bundle index.
    pub fn load(&mut self, bytes: &[u8]) -> Result<u32, BundleError> {
        let data: BinBundleData =
            bincode::deserialize(bytes).map_err(|e| BundleError::Serialization(e.to_string()))?;
        if data.version != SERIALIZATION_VERSION {
            return Err(BundleError::VersionMismatch {
                got: data.version,
                expected: SERIALIZATION_VERSION,
            });
        }
        if data.label_size as usize != self.label_size {
            return Err(BundleError::Serialization(format!(
                "label size {} does not match the database's {}",
                data.label_size, self.label_size
            )));
        }

        let p = self.crypto_context.evaluator().plain_modulus();
        self.stripped = data.stripped;

        if data.stripped {
            self.item_bins = vec![Vec::new(); self.num_bins];
            self.label_bins = vec![vec![Vec::new(); self.num_bins]; self.label_size];
            self.filters.clear();
        } else {
            let item_bins = data
                .item_bins
                .ok_or_else(|| BundleError::Serialization("item bins missing".into()))?;
            let label_bins = data
                .label_bins
                .ok_or_else(|| BundleError::Serialization("label bins missing".into()))?;
            let filters = data
                .filters
                .ok_or_else(|| BundleError::Serialization("filters missing".into()))?;

            if item_bins.len() != self.num_bins
                || label_bins.len() != self.label_size
                || filters.len() != self.num_bins
            {
                return Err(BundleError::Serialization(
                    "bin/label/filter counts do not match the parameters".into(),
                ));
            }
            let populated = item_bins.iter().filter(|b| !b.is_empty()).count() as u32;
            if populated != data.populated_bin_count {
                return Err(BundleError::Serialization(format!(
                    "populated bin count {} does not match the stored {}",
                    populated, data.populated_bin_count
                )));
            }
            for bin in &item_bins {
                if bin.len() > self.max_bin_size {
                    return Err(BundleError::Serialization(
                        "a bin exceeds max_items_per_bin".into(),
                    ));
                }
                if bin.iter().any(|&f| f >= p) {
                    return Err(BundleError::Serialization(
                        "a bin holds an unreduced field element".into(),
                    ));
                }
            }
            for chunk in &label_bins {
                if chunk.len() != self.num_bins {
                    return Err(BundleError::Serialization(
                        "label chunk bin count mismatch".into(),
                    ));
                }
                for (bin_idx, labels) in chunk.iter().enumerate() {
                    if labels.len() != item_bins[bin_idx].len() {
                        return Err(BundleError::Serialization(
                            "label row is not aligned with its item bin".into(),
                        ));
                    }
                }
            }

            self.item_bins = item_bins;
            self.label_bins = label_bins;
            self.filters = filters
                .into_iter()
                .map(CuckooFilter::from_data)
                .collect::<Result<_, _>>()?;
        }

        match data.cache {
            Some(cache) => {
                if cache.batched_interp_coeffs.len() != self.label_size {
                    return Err(BundleError::Serialization(
                        "cached interpolation polynomial count mismatch".into(),
                    ));
                }
                self.cache = CacheState::Ready(BinBundleCache {
                    felt_matching_polyns: cache.felt_matching_polyns,
                    felt_interp_polyns: cache.felt_interp_polyns,
                    batched_matching_polyn: BatchedPlaintextPolyn::from_coeffs(
                        cache.batched_matching_coeffs,
                    ),
                    batched_interp_polyns: cache
                        .batched_interp_coeffs
                        .into_iter()
                        .map(BatchedPlaintextPolyn::from_coeffs)
                        .collect(),
                });
            }
            None => {
                if data.stripped {
                    return Err(BundleError::Serialization(
                        "stripped BinBundle stored without its cache".into(),
                    ));
                }
                self.cache = CacheState::Dirty;
            }
        }

        Ok(data.bundle_idx)
    }
}

impl std::fmt::Debug for BinBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinBundle")
            .field("num_bins", &self.num_bins)
            .field("label_size", &self.label_size)
            .field("stripped", &self.stripped)
            .field("cache_invalid", &self.cache_invalid())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::he::{ClearEvaluator, HeEvaluator};
    use crate::poly::{eval_polyn, pow_mod};
    use std::sync::Arc;

    const P: u64 = 65537;
    const NUM_BINS: usize = 64;
    const MAX_BIN: usize = 16;

    fn context(keyswitching: bool) -> CryptoContext {
        let ev: Arc<dyn HeEvaluator> = Arc::new(ClearEvaluator::new(NUM_BINS, P, 3, keyswitching));
        let mut ctx = CryptoContext::new(ev);
        if keyswitching {
            ctx.set_relin_keys(crate::he::RelinKeys(b"test-keys".to_vec()));
        }
        ctx
    }

    fn bundle(label_size: usize, ps_low_degree: u32) -> BinBundle {
        BinBundle::new(
            context(true),
            label_size,
            MAX_BIN,
            ps_low_degree,
            NUM_BINS,
            false,
        )
    }

    /// Materialize the power buffer the evaluation schedule expects for the
    /// slot-wise query values `x`, mirroring the query engine's step 5.
    fn make_powers(
        ctx: &CryptoContext,
        x: &[Felt],
        degree: usize,
        ps_low_degree: u32,
    ) -> CiphertextPowers {
        let ev = ctx.evaluator();
        let mut powers: CiphertextPowers = vec![None; degree + 1];
        for d in 1..=degree {
            let slots: Vec<Felt> = x.iter().map(|&v| pow_mod(v, d as u64, P)).collect();
            let fresh = ev.encrypt(&ev.encode(&slots).unwrap()).unwrap();
            let use_ps = ps_low_degree > 1;
            let ct = if !use_ps {
                let ct = ev.mod_switch_to(&fresh, HIGH_POWERS_CHAIN_INDEX).unwrap();
                ev.to_ntt(&ct).unwrap()
            } else if d <= ps_low_degree as usize {
                let ct = ev.mod_switch_to(&fresh, LOW_POWERS_CHAIN_INDEX).unwrap();
                ev.to_ntt(&ct).unwrap()
            } else if d % (ps_low_degree as usize + 1) == 0 {
                ev.mod_switch_to(&fresh, HIGH_POWERS_CHAIN_INDEX).unwrap()
            } else {
                continue; // not needed by the PS schedule
            };
            powers[d] = Some(ct);
        }
        powers
    }

    fn decrypt_slots(ctx: &CryptoContext, ct: &Ciphertext) -> Vec<Felt> {
        let ev = ctx.evaluator();
        ev.decode(&ev.decrypt(ct).unwrap()).unwrap()
    }

    #[test]
    fn multi_insert_dry_run_does_not_mutate() {
        let mut bb = bundle(0, 0);
        let entries: Vec<Felt> = (1..=8).collect();

        assert_eq!(bb.multi_insert(&entries, 0, true), 1);
        assert!(bb.empty());

        assert_eq!(bb.multi_insert(&entries, 0, false), 1);
        assert!(!bb.empty());
        // Same felts in the same bins collide now.
        assert_eq!(bb.multi_insert(&entries, 0, true), -1);
        // The same felts in different bins are fine.
        assert_eq!(bb.multi_insert(&entries, 8, true), 1);
    }

    #[test]
    fn multi_insert_rejects_overflow_and_bad_range() {
        let mut bb = bundle(0, 0);
        for round in 0..MAX_BIN as u64 {
            let entries: Vec<Felt> = (0..8).map(|i| round * 8 + i + 1).collect();
            assert_eq!(bb.multi_insert(&entries, 0, false), round as i32 + 1);
        }
        // Bins 0..8 are full now.
        assert_eq!(bb.multi_insert(&[60000u64], 0, true), -1);
        // Out-of-range start.
        assert_eq!(bb.multi_insert(&[1u64, 2], NUM_BINS - 1, true), -1);
    }

    #[test]
    fn overwrite_replaces_labels_only() {
        let mut bb = bundle(1, 0);
        let entries: Vec<(Felt, Vec<Felt>)> = (0..8).map(|i| (i + 10, vec![100 + i])).collect();
        assert!(bb.multi_insert(&entries, 0, false) > 0);

        let replacement: Vec<(Felt, Vec<Felt>)> =
            (0..8).map(|i| (i + 10, vec![200 + i])).collect();
        assert!(bb.try_multi_overwrite(&replacement, 0));

        let items: Vec<Felt> = (0..8).map(|i| i + 10).collect();
        let mut labels = Vec::new();
        assert!(bb.try_get_multi_label(&items, 0, &mut labels));
        assert_eq!(labels, (0..8).map(|i| 200 + i).collect::<Vec<_>>());

        // Overwriting a missing sequence changes nothing.
        let absent: Vec<(Felt, Vec<Felt>)> = (0..8).map(|i| (i + 50, vec![0])).collect();
        assert!(!bb.try_multi_overwrite(&absent, 0));
    }

    #[test]
    fn remove_is_atomic() {
        let mut bb = bundle(1, 0);
        let entries: Vec<(Felt, Vec<Felt>)> = (0..8).map(|i| (i + 10, vec![i])).collect();
        assert!(bb.multi_insert(&entries, 0, false) > 0);

        // One missing item fails the whole removal.
        let mut items: Vec<Felt> = (0..8).map(|i| i + 10).collect();
        items[3] = 9999;
        assert!(!bb.try_multi_remove(&items, 0));
        assert!(!bb.empty());

        let items: Vec<Felt> = (0..8).map(|i| i + 10).collect();
        assert!(bb.try_multi_remove(&items, 0));
        assert!(bb.empty());

        let mut labels = Vec::new();
        assert!(!bb.try_get_multi_label(&items, 0, &mut labels));
        assert!(labels.is_empty());
    }

    #[test]
    fn matching_polynomial_eval_matches_plain_algebra() {
        let mut bb = bundle(0, 0);
        // Distinct items across three stripes of the first 8 bins.
        for round in 0..3u64 {
            let entries: Vec<Felt> = (0..8).map(|i| round * 1000 + i + 1).collect();
            assert!(bb.multi_insert(&entries, 0, false) > 0);
        }
        bb.regen_cache().unwrap();
        let cache = bb.get_cache().unwrap();

        // Query values: slot b queries value b + 1; slot 2 queries an item.
        let ctx = context(true);
        let x: Vec<Felt> = (0..NUM_BINS as u64).map(|b| b + 1).collect();
        let degree = cache.batched_matching_polyn.degree();
        let powers = make_powers(&ctx, &x, degree, 0);

        let result = cache.batched_matching_polyn.eval(&ctx, &powers).unwrap();
        let slots = decrypt_slots(&ctx, &result);

        for b in 0..NUM_BINS {
            let expected = eval_polyn(&cache.felt_matching_polyns[b], x[b], P);
            assert_eq!(slots[b], expected, "slot {b}");
        }
        // Slot 2 queried value 3 = item of bin 2 (round 0 inserted 3 there).
        assert_eq!(slots[2], 0);
    }

    #[test]
    fn interpolation_recovers_labels_under_encryption() {
        let mut bb = bundle(1, 0);
        let entries: Vec<(Felt, Vec<Felt>)> =
            (0..8).map(|i| (i * 3 + 5, vec![i + 41])).collect();
        assert!(bb.multi_insert(&entries, 0, false) > 0);
        bb.regen_cache().unwrap();
        let cache = bb.get_cache().unwrap();

        let ctx = context(true);
        // Each slot queries its bin's own item.
        let mut x = vec![1u64; NUM_BINS];
        for (i, (felt, _)) in entries.iter().enumerate() {
            x[i] = *felt;
        }
        let match_deg = cache.batched_matching_polyn.degree();
        let interp_deg = cache.batched_interp_polyns[0].degree();
        let powers = make_powers(&ctx, &x, match_deg.max(interp_deg), 0);

        let matched = decrypt_slots(&ctx, &cache.batched_matching_polyn.eval(&ctx, &powers).unwrap());
        let labels = decrypt_slots(&ctx, &cache.batched_interp_polyns[0].eval(&ctx, &powers).unwrap());

        for i in 0..8 {
            assert_eq!(matched[i], 0, "bin {i} should match");
            assert_eq!(labels[i], (i as u64) + 41, "bin {i} label");
        }
    }

    #[test]
    fn ps_and_direct_schedules_agree() {
        let ps_low_degree = 4u32;
        for keyswitching in [true, false] {
            let ctx = context(keyswitching);
            let mut direct = BinBundle::new(ctx.clone(), 0, MAX_BIN, 0, NUM_BINS, false);
            let mut ps = BinBundle::new(ctx.clone(), 0, MAX_BIN, ps_low_degree, NUM_BINS, false);

            for round in 0..13u64 {
                let entries: Vec<Felt> = (0..8).map(|i| round * 512 + i + 2).collect();
                assert!(direct.multi_insert(&entries, 0, false) > 0);
                assert!(ps.multi_insert(&entries, 0, false) > 0);
            }
            direct.regen_cache().unwrap();
            ps.regen_cache().unwrap();

            let x: Vec<Felt> = (0..NUM_BINS as u64).map(|b| b * 7 + 3).collect();
            let degree = direct.get_cache().unwrap().batched_matching_polyn.degree();
            assert_eq!(degree, 13);

            let direct_powers = make_powers(&ctx, &x, degree, 0);
            let ps_powers = make_powers(&ctx, &x, degree, ps_low_degree);

            let direct_out = direct
                .get_cache()
                .unwrap()
                .batched_matching_polyn
                .eval_with_schedule(&ctx, &direct_powers, 0)
                .unwrap();
            let ps_out = ps
                .get_cache()
                .unwrap()
                .batched_matching_polyn
                .eval_with_schedule(&ctx, &ps_powers, ps_low_degree)
                .unwrap();

            assert_eq!(
                decrypt_slots(&ctx, &direct_out),
                decrypt_slots(&ctx, &ps_out),
                "keyswitching={keyswitching}"
            );
        }
    }

    #[test]
    fn ps_degree_exact_multiple_of_high_degree() {
        // degree = 15 = 3 · (ℓ+1) with ℓ = 4: remainder block is empty and
        // the leading coefficient flows through the free-term path.
        let ps_low_degree = 4u32;
        let ctx = context(true);
        let mut direct = BinBundle::new(ctx.clone(), 0, MAX_BIN, 0, NUM_BINS, false);
        let mut ps = BinBundle::new(ctx.clone(), 0, MAX_BIN, ps_low_degree, NUM_BINS, false);
        for round in 0..15u64 {
            let entries: Vec<Felt> = (0..8).map(|i| round * 256 + i + 1).collect();
            assert!(direct.multi_insert(&entries, 0, false) > 0);
            assert!(ps.multi_insert(&entries, 0, false) > 0);
        }
        direct.regen_cache().unwrap();
        ps.regen_cache().unwrap();

        let x: Vec<Felt> = (0..NUM_BINS as u64).map(|b| b + 11).collect();
        let direct_powers = make_powers(&ctx, &x, 15, 0);
        let ps_powers = make_powers(&ctx, &x, 15, ps_low_degree);

        let a = direct
            .get_cache()
            .unwrap()
            .batched_matching_polyn
            .eval_with_schedule(&ctx, &direct_powers, 0)
            .unwrap();
        let b = ps
            .get_cache()
            .unwrap()
            .batched_matching_polyn
            .eval_with_schedule(&ctx, &ps_powers, ps_low_degree)
            .unwrap();
        assert_eq!(decrypt_slots(&ctx, &a), decrypt_slots(&ctx, &b));
    }

    #[test]
    fn strip_keeps_serving_and_blocks_mutation() {
        let mut bb = bundle(0, 0);
        let entries: Vec<Felt> = (1..=8).collect();
        assert!(bb.multi_insert(&entries, 0, false) > 0);
        bb.regen_cache().unwrap();

        let ctx = context(true);
        let x = vec![1u64; NUM_BINS]; // slot 0 queries item 1 of bin 0
        let degree = bb.get_cache().unwrap().batched_matching_polyn.degree();
        let powers = make_powers(&ctx, &x, degree, 0);
        let before = decrypt_slots(
            &ctx,
            &bb.get_cache().unwrap().batched_matching_polyn.eval(&ctx, &powers).unwrap(),
        );

        bb.strip().unwrap();
        assert!(bb.is_stripped());
        let after = decrypt_slots(
            &ctx,
            &bb.get_cache().unwrap().batched_matching_polyn.eval(&ctx, &powers).unwrap(),
        );
        assert_eq!(before, after);

        assert_eq!(bb.multi_insert(&entries, 8, false), -1);
        assert!(matches!(bb.regen_cache(), Err(BundleError::Stripped)));
    }

    #[test]
    fn save_load_roundtrip_with_cache() {
        let mut bb = bundle(1, 0);
        let entries: Vec<(Felt, Vec<Felt>)> = (0..8).map(|i| (i + 77, vec![i])).collect();
        assert!(bb.multi_insert(&entries, 16, false) > 0);
        bb.regen_cache().unwrap();

        let bytes = bb.save(5).unwrap();
        let mut restored = BinBundle::new(context(true), 1, MAX_BIN, 0, NUM_BINS, false);
        let idx = restored.load(&bytes).unwrap();
        assert_eq!(idx, 5);
        assert!(!restored.cache_invalid());

        let items: Vec<Felt> = (0..8).map(|i| i + 77).collect();
        let mut labels = Vec::new();
        assert!(restored.try_get_multi_label(&items, 16, &mut labels));
        assert_eq!(labels, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn save_load_roundtrip_stripped() {
        let mut bb = bundle(0, 0);
        assert!(bb.multi_insert(&(1..=8).collect::<Vec<Felt>>(), 0, false) > 0);
        bb.strip().unwrap();

        let bytes = bb.save(2).unwrap();
        let mut restored = BinBundle::new(context(true), 0, MAX_BIN, 0, NUM_BINS, false);
        assert_eq!(restored.load(&bytes).unwrap(), 2);
        assert!(restored.is_stripped());
        assert!(!restored.cache_invalid());
    }

    #[test]
    fn load_rejects_wrong_shapes() {
        let mut bb = bundle(0, 0);
        assert!(bb.multi_insert(&(1..=4).collect::<Vec<Felt>>(), 0, false) > 0);
        let bytes = bb.save(0).unwrap();

        // Wrong label size.
        let mut labeled = BinBundle::new(context(true), 1, MAX_BIN, 0, NUM_BINS, false);
        assert!(labeled.load(&bytes).is_err());

        // Garbage.
        let mut fresh = BinBundle::new(context(true), 0, MAX_BIN, 0, NUM_BINS, false);
        assert!(fresh.load(b"junk").is_err());
    }
}
