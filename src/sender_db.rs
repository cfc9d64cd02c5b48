//! SenderDB: the sender's preprocessed set behind a readers-writer lock
//!
//! The SenderDB owns `bundle_idx_count` buckets of [`BinBundle`]s, the
//! global set of OPRF-hashed items (for dedup and membership), and the OPRF
//! key. All mutation happens under the write lock; queries hold the read
//! lock for their entire duration (continuous querying can therefore starve
//! writers — acceptable for the serve-mostly workload this engine targets).
//!
//! ## Insertion pipeline
//!
//! 1. OPRF-hash the raw inputs; labeled inserts also encrypt each label
//!    under its per-item key with a fresh nonce.
//! 2. Deduplicate against the global item set: already-present items are
//!    routed to *overwrite*, the rest to *insert*. Overwrites are applied
//!    before new insertions.
//! 3. Algebraize each entry and compute its cuckoo locations; every
//!    location yields a `(data, cuckoo_idx)` work item.
//! 4. Partition work by bundle index and run the partitions on the worker
//!    pool — partitions own disjoint buckets, so workers never alias a
//!    bundle. Within a partition each entry scans the existing bundles in
//!    reverse insertion order (dry-run first) and falls back to appending a
//!    fresh bundle; a fresh bundle refusing an entry is a fatal
//!    *CapacityFailure*.
//! 5. Regenerate the caches of every modified bundle, in parallel.
//!
//! Removal mirrors insertion and drops bundles that become empty. `strip`
//! irreversibly clears the item set and OPRF key and reduces every bundle
//! to its serving cache.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::bin_bundle::{BinBundle, BinBundleCache, BundleError, BundleEntry};
use crate::encoding::{
    algebraize_item, algebraize_item_label, dealgebraize_label, EncodingError,
};
use crate::hashing::{all_locations, hash_functions};
use crate::he::{CryptoContext, HeError, HeEvaluator};
use crate::oprf::{
    self, OprfError, OprfKey, MAX_LABEL_BYTE_COUNT, MAX_NONCE_BYTE_COUNT, OPRF_KEY_SIZE,
};
use crate::params::{ParamsError, PsiParams, SERIALIZATION_VERSION};
use crate::pool::WorkerPool;
use crate::{EncryptedLabel, HashedItem, Item, Label};

/// Errors surfaced by SenderDB operations.
#[derive(Debug, thiserror::Error)]
pub enum SenderDbError {
    #[error("operation not allowed on a stripped SenderDB")]
    Stripped,
    #[error("operation does not match the SenderDB mode (labeled: {labeled})")]
    WrongMode { labeled: bool },
    #[error("label byte count {0} exceeds the maximum ({MAX_LABEL_BYTE_COUNT})")]
    LabelByteCountTooLarge(usize),
    #[error("nonce byte count {0} exceeds the maximum ({MAX_NONCE_BYTE_COUNT})")]
    NonceByteCountTooLarge(usize),
    #[error("item is not present in the SenderDB")]
    MissingItem,
    #[error("insertion into a freshly created BinBundle failed at bundle index {0}")]
    CapacityFailure(usize),
    #[error("failed to overwrite an item that should exist at bundle index {0}")]
    OverwriteFailed(usize),
    #[error("failed to remove an item that should exist at bundle index {0}")]
    RemoveFailed(usize),
    #[error("evaluator does not match the parameters: {0}")]
    EvaluatorMismatch(String),
    #[error("serialized SenderDB is invalid: {0}")]
    Serialization(String),
    #[error("serialization version {got} is incompatible with {expected}")]
    VersionMismatch { got: u32, expected: u32 },
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error(transparent)]
    Oprf(#[from] OprfError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    He(#[from] HeError),
}

// ---------------------------- Internal helpers ----------------------------

/// Label length in item-sized chunks: `⌈label_bits / item_bit_count⌉`.
fn compute_label_size(label_byte_count: usize, params: &PsiParams) -> usize {
    (label_byte_count * 8 + params.item_bit_count() as usize - 1)
        / params.item_bit_count() as usize
}

/// Split a cuckoo index into its in-bundle bin index and bundle index.
fn unpack_cuckoo_idx(cuckoo_idx: usize, bins_per_bundle: usize) -> (usize, usize) {
    // Bin indices are relative to their bundle; a cuckoo index keeps
    // counting across bundle boundaries.
    (cuckoo_idx % bins_per_bundle, cuckoo_idx / bins_per_bundle)
}

/// Algebraize labeled entries and attach every cuckoo location.
fn preprocess_labeled_data(
    data: &[(HashedItem, EncryptedLabel)],
    params: &PsiParams,
) -> Result<Vec<(crate::AlgItemLabel, usize)>, SenderDbError> {
    debug!(items = data.len(), "preprocessing labeled items");
    let felts_per_item = params.item_params().felts_per_item as usize;
    let funcs = hash_functions(
        params.table_params().table_size,
        params.table_params().hash_func_count,
    );

    let mut out = Vec::new();
    for (item, label) in data {
        let alg = algebraize_item_label(
            item,
            label,
            params.item_bit_count(),
            params.plain_modulus(),
        )?;
        for location in all_locations(&funcs, item) {
            // A location indexes whole items; bins hold item chunks.
            out.push((alg.clone(), location as usize * felts_per_item));
        }
    }
    Ok(out)
}

/// Algebraize unlabeled entries and attach every cuckoo location.
fn preprocess_unlabeled_data(
    data: &[HashedItem],
    params: &PsiParams,
) -> Result<Vec<(crate::AlgItem, usize)>, SenderDbError> {
    debug!(items = data.len(), "preprocessing unlabeled items");
    let felts_per_item = params.item_params().felts_per_item as usize;
    let funcs = hash_functions(
        params.table_params().table_size,
        params.table_params().hash_func_count,
    );

    let mut out = Vec::new();
    for item in data {
        let alg = algebraize_item(item, params.item_bit_count(), params.plain_modulus())?;
        for location in all_locations(&funcs, item) {
            out.push((alg.clone(), location as usize * felts_per_item));
        }
    }
    Ok(out)
}

/// Insert (or overwrite) every work item belonging to `bundle_idx` into its
/// bundle set. Scans existing bundles newest-first; appends a fresh bundle
/// when none can absorb an entry.
#[allow(clippy::too_many_arguments)]
fn insert_or_assign_worker<T: BundleEntry>(
    data_with_indices: &[(Vec<T>, usize)],
    bundle_set: &mut Vec<BinBundle>,
    crypto_context: &CryptoContext,
    bundle_idx: usize,
    bins_per_bundle: usize,
    label_size: usize,
    max_bin_size: usize,
    ps_low_degree: u32,
    overwrite: bool,
) -> Result<(), SenderDbError> {
    debug!(
        bundle_idx,
        mode = if overwrite { "overwrite" } else { "insert" },
        "insert-or-assign worker started"
    );

    for (data, cuckoo_idx) in data_with_indices {
        let (bin_idx, idx) = unpack_cuckoo_idx(*cuckoo_idx, bins_per_bundle);
        if idx != bundle_idx {
            continue;
        }

        let mut written = false;
        for bundle in bundle_set.iter_mut().rev() {
            if overwrite {
                written = bundle.try_multi_overwrite(data, bin_idx);
                if written {
                    break;
                }
            }
            if bundle.multi_insert(data, bin_idx, true) >= 0 {
                bundle.multi_insert(data, bin_idx, false);
                written = true;
                break;
            }
        }

        if overwrite && !written {
            // Dedup routed this entry here because the item exists; a miss
            // means the bins and the item set disagree.
            error!(bundle_idx, "overwrite failed: item not found in any bundle");
            return Err(SenderDbError::OverwriteFailed(bundle_idx));
        }

        if !written {
            let mut fresh = BinBundle::new(
                crypto_context.clone(),
                label_size,
                max_bin_size,
                ps_low_degree,
                bins_per_bundle,
                false,
            );
            if fresh.multi_insert(data, bin_idx, false) < 0 {
                error!(bundle_idx, "insertion into a fresh BinBundle failed");
                return Err(SenderDbError::CapacityFailure(bundle_idx));
            }
            bundle_set.push(fresh);
        }
    }

    debug!(bundle_idx, "insert-or-assign worker finished");
    Ok(())
}

/// Remove every work item belonging to `bundle_idx`, dropping bundles that
/// become empty.
fn remove_worker(
    data_with_indices: &[(crate::AlgItem, usize)],
    bundle_set: &mut Vec<BinBundle>,
    bundle_idx: usize,
    bins_per_bundle: usize,
) -> Result<(), SenderDbError> {
    debug!(bundle_idx, "remove worker started");

    for (alg_item, cuckoo_idx) in data_with_indices {
        let (bin_idx, idx) = unpack_cuckoo_idx(*cuckoo_idx, bins_per_bundle);
        if idx != bundle_idx {
            continue;
        }

        let removed = bundle_set
            .iter_mut()
            .any(|bundle| bundle.try_multi_remove(alg_item, bin_idx));
        bundle_set.retain(|bundle| !bundle.empty());

        if !removed {
            error!(bundle_idx, "removal failed: item not found in any bundle");
            return Err(SenderDbError::RemoveFailed(bundle_idx));
        }
    }

    debug!(bundle_idx, "remove worker finished");
    Ok(())
}

// ---------------------------- Persistent format ----------------------------

#[derive(Serialize, Deserialize)]
struct SenderDbInfo {
    label_byte_count: u32,
    nonce_byte_count: u32,
    item_count: u32,
    compressed: bool,
    stripped: bool,
}

#[derive(Serialize, Deserialize)]
struct SenderDbFile {
    version: u32,
    params: Vec<u8>,
    info: SenderDbInfo,
    oprf_key: [u8; OPRF_KEY_SIZE],
    /// Absent (empty) when stripped.
    hashed_items: Vec<[u8; 16]>,
    /// One length-prefixed blob per BinBundle; each records its own bundle
    /// index.
    bin_bundles: Vec<Vec<u8>>,
}

// ---------------------------- State ----------------------------

pub(crate) struct SenderDbState {
    hashed_items: HashSet<HashedItem>,
    /// Survives `strip` (the item set does not).
    item_count: usize,
    bin_bundles: Vec<Vec<BinBundle>>,
    oprf_key: OprfKey,
    stripped: bool,
}

impl SenderDbState {
    fn clear(&mut self, bundle_idx_count: usize) {
        self.hashed_items.clear();
        self.item_count = 0;
        self.bin_bundles = (0..bundle_idx_count).map(|_| Vec::new()).collect();
        self.stripped = false;
    }

    fn bin_bundle_count(&self) -> usize {
        self.bin_bundles.iter().map(Vec::len).sum()
    }
}

/// A read-locked view of the SenderDB, held for the duration of a query.
pub struct SenderDbReader<'a> {
    guard: RwLockReadGuard<'a, SenderDbState>,
}

impl SenderDbReader<'_> {
    /// Total number of BinBundles (= result packages a query will emit).
    pub fn bin_bundle_count(&self) -> usize {
        self.guard.bin_bundle_count()
    }

    /// Number of distinct items (survives stripping).
    pub fn item_count(&self) -> usize {
        self.guard.item_count
    }

    /// Number of BinBundles at one bundle index.
    pub fn bin_bundle_count_at(&self, bundle_idx: u32) -> usize {
        self.guard
            .bin_bundles
            .get(bundle_idx as usize)
            .map_or(0, Vec::len)
    }

    /// Borrow the ready caches at one bundle index; fails if any bundle is
    /// dirty (mutations always regenerate, so this indicates a bug).
    pub fn caches_at(&self, bundle_idx: u32) -> Result<Vec<&BinBundleCache>, SenderDbError> {
        self.guard.bin_bundles[bundle_idx as usize]
            .iter()
            .map(|bb| bb.get_cache().map_err(SenderDbError::from))
            .collect()
    }
}

// ---------------------------- SenderDB ----------------------------

/// The sender's preprocessed, queryable set.
pub struct SenderDB {
    params: PsiParams,
    crypto_context: CryptoContext,
    label_byte_count: usize,
    nonce_byte_count: usize,
    compressed: bool,
    state: RwLock<SenderDbState>,
}

impl SenderDB {
    /// Create an empty SenderDB with a fresh random OPRF key.
    ///
    /// `label_byte_count = 0` selects unlabeled mode (and forces the nonce
    /// byte count to zero).
    pub fn new(
        params: PsiParams,
        label_byte_count: usize,
        nonce_byte_count: usize,
        compressed: bool,
        evaluator: Arc<dyn HeEvaluator>,
    ) -> Result<Self, SenderDbError> {
        Self::with_oprf_key(
            params,
            OprfKey::random(),
            label_byte_count,
            nonce_byte_count,
            compressed,
            evaluator,
        )
    }

    /// Create an empty SenderDB around an existing OPRF key.
    pub fn with_oprf_key(
        params: PsiParams,
        oprf_key: OprfKey,
        label_byte_count: usize,
        nonce_byte_count: usize,
        compressed: bool,
        evaluator: Arc<dyn HeEvaluator>,
    ) -> Result<Self, SenderDbError> {
        if label_byte_count > MAX_LABEL_BYTE_COUNT {
            error!(label_byte_count, "label byte count exceeds the maximum");
            return Err(SenderDbError::LabelByteCountTooLarge(label_byte_count));
        }
        let nonce_byte_count = if label_byte_count > 0 { nonce_byte_count } else { 0 };
        if nonce_byte_count > MAX_NONCE_BYTE_COUNT {
            error!(nonce_byte_count, "nonce byte count exceeds the maximum");
            return Err(SenderDbError::NonceByteCountTooLarge(nonce_byte_count));
        }
        if label_byte_count > 0 && nonce_byte_count < MAX_NONCE_BYTE_COUNT {
            warn!(
                nonce_byte_count,
                safe_default = MAX_NONCE_BYTE_COUNT,
                "labeled SenderDB with a reduced nonce width; updating or re-inserting \
                 labels for existing items may leak information about the labels"
            );
        }

        if evaluator.slot_count() as u64 != params.bfv_params().poly_modulus_degree {
            return Err(SenderDbError::EvaluatorMismatch(format!(
                "evaluator has {} slots, parameters require {}",
                evaluator.slot_count(),
                params.bfv_params().poly_modulus_degree
            )));
        }
        if evaluator.plain_modulus() != params.plain_modulus() {
            return Err(SenderDbError::EvaluatorMismatch(format!(
                "evaluator plain modulus {} differs from the parameters' {}",
                evaluator.plain_modulus(),
                params.plain_modulus()
            )));
        }

        let bundle_idx_count = params.bundle_idx_count() as usize;
        Ok(Self {
            params,
            crypto_context: CryptoContext::new(evaluator),
            label_byte_count,
            nonce_byte_count,
            compressed,
            state: RwLock::new(SenderDbState {
                hashed_items: HashSet::new(),
                item_count: 0,
                bin_bundles: (0..bundle_idx_count).map(|_| Vec::new()).collect(),
                oprf_key,
                stripped: false,
            }),
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The parameter bundle.
    #[inline]
    pub fn params(&self) -> &PsiParams {
        &self.params
    }

    /// The HE context shared by all bundles.
    #[inline]
    pub fn crypto_context(&self) -> &CryptoContext {
        &self.crypto_context
    }

    /// Whether this SenderDB stores labels.
    #[inline]
    pub fn is_labeled(&self) -> bool {
        self.label_byte_count > 0
    }

    /// Label length in bytes (0 when unlabeled).
    #[inline]
    pub fn label_byte_count(&self) -> usize {
        self.label_byte_count
    }

    /// Nonce length in bytes.
    #[inline]
    pub fn nonce_byte_count(&self) -> usize {
        self.nonce_byte_count
    }

    /// Whether plaintext blobs are stored compressed.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Whether the SenderDB has been stripped for serving.
    pub fn is_stripped(&self) -> bool {
        self.state.read().stripped
    }

    /// Number of distinct items inserted.
    pub fn get_item_count(&self) -> usize {
        self.state.read().item_count
    }

    /// Snapshot of the hashed item set (empty after `strip`).
    pub fn get_hashed_items(&self) -> Vec<HashedItem> {
        self.state.read().hashed_items.iter().copied().collect()
    }

    /// Total number of BinBundles.
    pub fn get_bin_bundle_count(&self) -> usize {
        self.state.read().bin_bundle_count()
    }

    /// Number of BinBundles at one bundle index.
    pub fn get_bin_bundle_count_at(&self, bundle_idx: u32) -> usize {
        self.state
            .read()
            .bin_bundles
            .get(bundle_idx as usize)
            .map_or(0, Vec::len)
    }

    /// Fraction of the theoretical bin capacity in use.
    pub fn get_packing_rate(&self) -> f64 {
        let state = self.state.read();
        let item_count = (state.item_count as u64)
            * u64::from(self.params.table_params().hash_func_count);
        let max_count = (state.bin_bundle_count() as u64)
            * u64::from(self.params.items_per_bundle())
            * u64::from(self.params.table_params().max_items_per_bin);
        if max_count == 0 {
            0.0
        } else {
            item_count as f64 / max_count as f64
        }
    }

    /// The OPRF key; unavailable once stripped.
    pub fn get_oprf_key(&self) -> Result<OprfKey, SenderDbError> {
        let state = self.state.read();
        if state.stripped {
            error!("cannot return the OPRF key of a stripped SenderDB");
            return Err(SenderDbError::Stripped);
        }
        Ok(state.oprf_key.clone())
    }

    /// Take the read lock for the duration of a query.
    pub fn read(&self) -> SenderDbReader<'_> {
        SenderDbReader {
            guard: self.state.read(),
        }
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Drop all content, returning to the freshly-constructed state.
    pub fn clear(&self) {
        let mut state = self.state.write();
        if !state.hashed_items.is_empty() {
            info!(
                items = state.hashed_items.len(),
                "removing all items from SenderDB"
            );
        }
        state.clear(self.params.bundle_idx_count() as usize);
    }

    /// Insert labeled items; items already present get their label
    /// overwritten instead.
    pub fn insert_or_assign_labeled(
        &self,
        data: &[(Item, Label)],
        pool: &WorkerPool,
    ) -> Result<(), SenderDbError> {
        if !self.is_labeled() {
            error!("attempted to insert labeled data into an unlabeled SenderDB");
            return Err(SenderDbError::WrongMode { labeled: false });
        }
        info!(items = data.len(), "inserting labeled items into SenderDB");

        // Hash and encrypt outside the lock; only the state mutation below
        // needs exclusivity.
        let oprf_key = self.get_oprf_key()?;
        let hashed_data = oprf::compute_hashes_labeled(
            data,
            &oprf_key,
            self.label_byte_count,
            self.nonce_byte_count,
        )?;

        let mut state = self.state.write();
        if state.stripped {
            error!("cannot insert into a stripped SenderDB");
            return Err(SenderDbError::Stripped);
        }

        // Split into items to overwrite and items to insert, registering
        // new items in the global set as we go.
        let mut to_insert = Vec::new();
        let mut to_overwrite = Vec::new();
        for entry in hashed_data {
            if state.hashed_items.contains(&entry.0) {
                to_overwrite.push(entry);
            } else {
                state.hashed_items.insert(entry.0);
                state.item_count += 1;
                to_insert.push(entry);
            }
        }

        let label_size = compute_label_size(
            self.nonce_byte_count + self.label_byte_count,
            &self.params,
        );

        if !to_overwrite.is_empty() {
            info!(items = to_overwrite.len(), "replacing existing item labels");
            let work = preprocess_labeled_data(&to_overwrite, &self.params)?;
            self.dispatch_insert_or_assign(&mut state, &work, label_size, true, pool)?;
        }
        if !to_insert.is_empty() {
            info!(items = to_insert.len(), "inserting new items");
            let work = preprocess_labeled_data(&to_insert, &self.params)?;
            self.dispatch_insert_or_assign(&mut state, &work, label_size, false, pool)?;
        }

        self.generate_caches(&mut state, pool)?;
        info!("finished inserting labeled items");
        Ok(())
    }

    /// Insert unlabeled items; duplicates are ignored.
    pub fn insert_or_assign(&self, data: &[Item], pool: &WorkerPool) -> Result<(), SenderDbError> {
        if self.is_labeled() {
            error!("attempted to insert unlabeled data into a labeled SenderDB");
            return Err(SenderDbError::WrongMode { labeled: true });
        }
        info!(items = data.len(), "inserting unlabeled items into SenderDB");

        let oprf_key = self.get_oprf_key()?;
        let hashed_data = oprf::compute_hashes(data, &oprf_key);

        let mut state = self.state.write();
        if state.stripped {
            error!("cannot insert into a stripped SenderDB");
            return Err(SenderDbError::Stripped);
        }

        let mut to_insert = Vec::new();
        for hashed in hashed_data {
            if state.hashed_items.insert(hashed) {
                state.item_count += 1;
                to_insert.push(hashed);
            }
        }
        info!(items = to_insert.len(), "new items after deduplication");

        if !to_insert.is_empty() {
            let work = preprocess_unlabeled_data(&to_insert, &self.params)?;
            self.dispatch_insert_or_assign(&mut state, &work, 0, false, pool)?;
        }

        self.generate_caches(&mut state, pool)?;
        info!("finished inserting unlabeled items");
        Ok(())
    }

    /// Replace the whole content: clear, then insert.
    pub fn set_data(&self, data: &[Item], pool: &WorkerPool) -> Result<(), SenderDbError> {
        self.clear();
        self.insert_or_assign(data, pool)
    }

    /// Replace the whole content with labeled data: clear, then insert.
    pub fn set_data_labeled(
        &self,
        data: &[(Item, Label)],
        pool: &WorkerPool,
    ) -> Result<(), SenderDbError> {
        self.clear();
        self.insert_or_assign_labeled(data, pool)
    }

    /// Remove items. Items not present are ignored with a warning.
    pub fn remove(&self, data: &[Item], pool: &WorkerPool) -> Result<(), SenderDbError> {
        info!(items = data.len(), "removing items from SenderDB");

        let oprf_key = self.get_oprf_key()?;
        let hashed_data = oprf::compute_hashes(data, &oprf_key);

        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.stripped {
            error!("cannot remove from a stripped SenderDB");
            return Err(SenderDbError::Stripped);
        }

        let mut existing = Vec::new();
        let mut missing = 0usize;
        for hashed in hashed_data {
            if state.hashed_items.remove(&hashed) {
                state.item_count -= 1;
                existing.push(hashed);
            } else {
                missing += 1;
            }
        }
        if missing > 0 {
            warn!(missing, "ignoring items that are not present in the SenderDB");
        }

        if !existing.is_empty() {
            let work = preprocess_unlabeled_data(&existing, &self.params)?;
            let bins_per_bundle = self.params.bins_per_bundle() as usize;
            let indices: BTreeSet<usize> = work
                .iter()
                .map(|(_, cuckoo_idx)| unpack_cuckoo_idx(*cuckoo_idx, bins_per_bundle).1)
                .collect();
            info!(workers = indices.len(), "launching remove worker tasks");

            let work_ref = &work;
            let bundles = &mut state.bin_bundles;
            pool.install(|| {
                bundles
                    .par_iter_mut()
                    .enumerate()
                    .filter(|(idx, _)| indices.contains(idx))
                    .try_for_each(|(idx, bundle_set)| {
                        remove_worker(work_ref, bundle_set, idx, bins_per_bundle)
                    })
            })?;
        }

        self.generate_caches(state, pool)?;
        info!("finished removing items");
        Ok(())
    }

    /// Whether an item is present (by its OPRF hash).
    pub fn has_item(&self, item: &Item) -> Result<bool, SenderDbError> {
        let oprf_key = self.get_oprf_key()?;
        let (hashed, _) = oprf::get_item_hash(item, &oprf_key);
        let state = self.state.read();
        if state.stripped {
            return Err(SenderDbError::Stripped);
        }
        Ok(state.hashed_items.contains(&hashed))
    }

    /// Retrieve and decrypt the label of a present item.
    pub fn get_label(&self, item: &Item) -> Result<Label, SenderDbError> {
        if !self.is_labeled() {
            error!("attempted to retrieve a label from an unlabeled SenderDB");
            return Err(SenderDbError::WrongMode { labeled: false });
        }
        let oprf_key = self.get_oprf_key()?;
        let (hashed, label_key) = oprf::get_item_hash(item, &oprf_key);

        let state = self.state.read();
        if state.stripped {
            error!("cannot retrieve a label from a stripped SenderDB");
            return Err(SenderDbError::Stripped);
        }
        if !state.hashed_items.contains(&hashed) {
            return Err(SenderDbError::MissingItem);
        }

        // Any one location carries the label; read the first.
        let alg_item = algebraize_item(
            &hashed,
            self.params.item_bit_count(),
            self.params.plain_modulus(),
        )?;
        let funcs = hash_functions(
            self.params.table_params().table_size,
            self.params.table_params().hash_func_count,
        );
        let location = *all_locations(&funcs, &hashed)
            .iter()
            .next()
            .expect("hash_func_count >= 1 guarantees a location");
        let cuckoo_idx = location as usize * self.params.item_params().felts_per_item as usize;
        let (bin_idx, bundle_idx) =
            unpack_cuckoo_idx(cuckoo_idx, self.params.bins_per_bundle() as usize);

        let mut alg_label = Vec::new();
        let found = state.bin_bundles[bundle_idx]
            .iter()
            .any(|bb| bb.try_get_multi_label(&alg_item, bin_idx, &mut alg_label));
        if !found {
            // Membership said yes but no bundle holds the label; the store
            // is inconsistent.
            error!("failed to retrieve a label for an item in the SenderDB");
            return Err(SenderDbError::MissingItem);
        }

        let mut encrypted: EncryptedLabel = dealgebraize_label(
            &alg_label,
            alg_label.len() as u32 * self.params.item_bit_count_per_felt(),
            self.params.plain_modulus(),
        )?;
        encrypted.truncate(self.nonce_byte_count + self.label_byte_count);

        Ok(oprf::decrypt_label(
            &encrypted,
            &label_key,
            self.nonce_byte_count,
        )?)
    }

    /// Strip to the serving-only state: clears the item set and OPRF key,
    /// reduces every bundle to its cache. Returns the cleared OPRF key.
    pub fn strip(&self, pool: &WorkerPool) -> Result<OprfKey, SenderDbError> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        state.stripped = true;
        state.hashed_items.clear();
        let oprf_key = state.oprf_key.clone();
        state.oprf_key.clear();

        let bundles = &mut state.bin_bundles;
        pool.install(|| {
            bundles.par_iter_mut().try_for_each(|bundle_set| {
                bundle_set
                    .par_iter_mut()
                    .try_for_each(|bb| bb.strip().map_err(SenderDbError::from))
            })
        })?;

        info!("SenderDB has been stripped");
        Ok(oprf_key)
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Serialize the whole SenderDB.
    pub fn save(&self) -> Result<Vec<u8>, SenderDbError> {
        let state = self.state.read();
        debug!("saving SenderDB");

        let mut bin_bundles = Vec::with_capacity(state.bin_bundle_count());
        for (bundle_idx, bundle_set) in state.bin_bundles.iter().enumerate() {
            for bb in bundle_set {
                bin_bundles.push(bb.save(bundle_idx as u32)?);
            }
        }

        let file = SenderDbFile {
            version: SERIALIZATION_VERSION,
            params: self.params.save(),
            info: SenderDbInfo {
                label_byte_count: self.label_byte_count as u32,
                nonce_byte_count: self.nonce_byte_count as u32,
                item_count: state.item_count as u32,
                compressed: self.compressed,
                stripped: state.stripped,
            },
            oprf_key: *state.oprf_key.as_bytes(),
            hashed_items: if state.stripped {
                Vec::new()
            } else {
                state.hashed_items.iter().map(|h| h.0).collect()
            },
            bin_bundles,
        };

        let bytes =
            bincode::serialize(&file).map_err(|e| SenderDbError::Serialization(e.to_string()))?;
        debug!(
            items = state.item_count,
            bytes = bytes.len(),
            "saved SenderDB"
        );
        Ok(bytes)
    }

    /// Reconstruct a SenderDB from [`SenderDB::save`] output. BinBundle
    /// blobs are deserialized on the worker pool.
    pub fn load(
        bytes: &[u8],
        evaluator: Arc<dyn HeEvaluator>,
        pool: &WorkerPool,
    ) -> Result<Self, SenderDbError> {
        debug!("loading SenderDB");
        let file: SenderDbFile =
            bincode::deserialize(bytes).map_err(|e| SenderDbError::Serialization(e.to_string()))?;
        if file.version != SERIALIZATION_VERSION {
            return Err(SenderDbError::VersionMismatch {
                got: file.version,
                expected: SERIALIZATION_VERSION,
            });
        }

        let params = PsiParams::load(&file.params)?;
        debug!(
            item_count = file.info.item_count,
            label_byte_count = file.info.label_byte_count,
            nonce_byte_count = file.info.nonce_byte_count,
            compressed = file.info.compressed,
            stripped = file.info.stripped,
            "loaded SenderDB properties"
        );

        let db = Self::with_oprf_key(
            params,
            OprfKey::from_bytes(file.oprf_key),
            file.info.label_byte_count as usize,
            file.info.nonce_byte_count as usize,
            file.info.compressed,
            evaluator,
        )?;

        {
            let mut state = db.state.write();
            state.stripped = file.info.stripped;
            state.item_count = file.info.item_count as usize;

            if !file.info.stripped {
                state.hashed_items = file.hashed_items.iter().map(|&b| HashedItem(b)).collect();
                if state.hashed_items.len() != file.info.item_count as usize {
                    error!(
                        indicated = file.info.item_count,
                        loaded = state.hashed_items.len(),
                        "SenderDB item count does not match the loaded data"
                    );
                    return Err(SenderDbError::Serialization(
                        "item count does not match the hashed item list".into(),
                    ));
                }
            }

            let label_size = compute_label_size(
                (file.info.nonce_byte_count + file.info.label_byte_count) as usize,
                &db.params,
            );
            let max_bin_size = db.params.table_params().max_items_per_bin as usize;
            let ps_low_degree = db.params.query_params().ps_low_degree;
            let bins_per_bundle = db.params.bins_per_bundle() as usize;
            let bundle_idx_count = db.params.bundle_idx_count() as usize;

            // Deserialize bundles in parallel, then place them serially.
            let loaded: Vec<(u32, BinBundle)> = pool.install(|| {
                file.bin_bundles
                    .par_iter()
                    .map(|blob| {
                        let mut bb = BinBundle::new(
                            db.crypto_context.clone(),
                            label_size,
                            max_bin_size,
                            ps_low_degree,
                            bins_per_bundle,
                            file.info.stripped,
                        );
                        let idx = bb.load(blob)?;
                        Ok::<_, SenderDbError>((idx, bb))
                    })
                    .collect::<Result<_, _>>()
            })?;

            for (idx, bb) in loaded {
                if idx as usize >= bundle_idx_count {
                    error!(
                        bundle_idx = idx,
                        max = bundle_idx_count - 1,
                        "loaded BinBundle has an out-of-range bundle index"
                    );
                    return Err(SenderDbError::Serialization(
                        "BinBundle bundle index out of range".into(),
                    ));
                }
                state.bin_bundles[idx as usize].push(bb);
            }

            Self::generate_caches_inner(&mut state, pool)?;
        }

        debug!(items = db.get_item_count(), "finished loading SenderDB");
        Ok(db)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn dispatch_insert_or_assign<T: BundleEntry + Send + Sync>(
        &self,
        state: &mut SenderDbState,
        data_with_indices: &[(Vec<T>, usize)],
        label_size: usize,
        overwrite: bool,
        pool: &WorkerPool,
    ) -> Result<(), SenderDbError> {
        let bins_per_bundle = self.params.bins_per_bundle() as usize;
        let max_bin_size = self.params.table_params().max_items_per_bin as usize;
        let ps_low_degree = self.params.query_params().ps_low_degree;

        // One worker per bundle index that actually has work; partitions
        // own disjoint bundle sets.
        let indices: BTreeSet<usize> = data_with_indices
            .iter()
            .map(|(_, cuckoo_idx)| unpack_cuckoo_idx(*cuckoo_idx, bins_per_bundle).1)
            .collect();
        info!(
            workers = indices.len(),
            "launching insert-or-assign worker tasks"
        );

        let ctx = &self.crypto_context;
        pool.install(|| {
            state
                .bin_bundles
                .par_iter_mut()
                .enumerate()
                .filter(|(idx, _)| indices.contains(idx))
                .try_for_each(|(idx, bundle_set)| {
                    insert_or_assign_worker(
                        data_with_indices,
                        bundle_set,
                        ctx,
                        idx,
                        bins_per_bundle,
                        label_size,
                        max_bin_size,
                        ps_low_degree,
                        overwrite,
                    )
                })
        })?;
        info!("finished insert-or-assign worker tasks");
        Ok(())
    }

    fn generate_caches(
        &self,
        state: &mut SenderDbState,
        pool: &WorkerPool,
    ) -> Result<(), SenderDbError> {
        Self::generate_caches_inner(state, pool)
    }

    fn generate_caches_inner(
        state: &mut SenderDbState,
        pool: &WorkerPool,
    ) -> Result<(), SenderDbError> {
        info!("generating BinBundle caches");
        pool.install(|| {
            state
                .bin_bundles
                .par_iter_mut()
                .try_for_each(|bundle_set| {
                    bundle_set.par_iter_mut().try_for_each(|bb| {
                        if bb.cache_invalid() && !bb.is_stripped() {
                            bb.regen_cache().map_err(SenderDbError::from)
                        } else {
                            Ok(())
                        }
                    })
                })
        })?;
        info!("finished generating BinBundle caches");
        Ok(())
    }
}

impl std::fmt::Debug for SenderDB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("SenderDB")
            .field("item_count", &state.item_count)
            .field("bin_bundle_count", &state.bin_bundle_count())
            .field("labeled", &self.is_labeled())
            .field("stripped", &state.stripped)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
