//! Query engine: request validation, power computation, result streaming
//!
//! The engine answers three operations. Parameter requests return the
//! serialized [`PsiParams`]. OPRF requests pass through the embedder's
//! [`OprfProcessor`] (and deliberately send nothing when processing fails —
//! a malformed OPRF request may be an attempt to probe the key). Queries run
//! the full evaluation pipeline, entirely under the SenderDB read lock:
//!
//! 1. send the [`QueryResponse`] declaring how many result packages follow;
//! 2. for every bundle index, seed a power buffer (`max_items_per_bin + 1`
//!    slots, slot 0 unused) with the transmitted source powers and let the
//!    [`PowersDag`] fill in the rest — squaring when a node's parents
//!    coincide, multiplying otherwise, relinearizing when the scheme
//!    key-switches;
//! 3. modulus-switch and NTT-transform every materialized power to where
//!    the evaluation schedule wants it: everything NTT at the high level
//!    without Paterson–Stockmeyer; with PS, powers `≤ ps_low_degree` NTT
//!    one level higher and the high multiples non-NTT at the high level;
//! 4. evaluate every BinBundle cache (matching polynomial, then one
//!    interpolation polynomial per label chunk) and stream each
//!    [`ResultPackage`] the moment it is ready.
//!
//! Result packages of one query are unordered among themselves. Any failure
//! aborts the whole query — one error to the caller, no retries, no further
//! packages.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use rayon::prelude::*;
use tracing::{debug, error, info};

use crate::bin_bundle::{BinBundleCache, BundleError, CiphertextPowers};
use crate::he::{
    Ciphertext, CryptoContext, HeError, RelinKeys, HIGH_POWERS_CHAIN_INDEX,
    LOW_POWERS_CHAIN_INDEX,
};
use crate::oprf::{OprfError, OprfKey, OprfProcessor};
use crate::params::PsiParams;
use crate::pool::WorkerPool;
use crate::powers::{PowersDag, PowersError};
use crate::sender_db::{SenderDB, SenderDbError, SenderDbReader};
use crate::wire::{
    OprfRequest, OprfResponse, ParmsResponse, QueryRequest, QueryResponse, ResultPackage,
    SenderResponse, WireError,
};

/// Errors surfaced by the query engine.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("query request is invalid: {0}")]
    InvalidRequest(&'static str),
    #[error("duplicate query exponent {0}")]
    DuplicateExponent(u32),
    #[error("query part for exponent {exponent} carries {got} ciphertexts; expected {expected}")]
    WrongCiphertextCount {
        exponent: u32,
        got: usize,
        expected: usize,
    },
    #[error("query power set does not match the parameters' query_powers")]
    PowerSetMismatch,
    #[error("ciphertext power {0} was not materialized during power computation")]
    MissingPower(u32),
    #[error("relinearization keys are required but missing from the query")]
    KeysRequired,
    #[error(transparent)]
    SenderDb(#[from] SenderDbError),
    #[error(transparent)]
    Powers(#[from] PowersError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    He(#[from] HeError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Oprf(#[from] OprfError),
}

/// The power set the evaluation schedule needs: all of `1..=target_degree`
/// without Paterson–Stockmeyer; with PS, the low powers `1..=ps_low_degree`
/// plus every multiple of `ps_low_degree + 1` up to the target.
pub fn create_powers_set(ps_low_degree: u32, target_degree: u32) -> BTreeSet<u32> {
    debug_assert!(ps_low_degree <= target_degree);
    let mut powers = BTreeSet::new();
    if ps_low_degree > 1 {
        for power in 1..=ps_low_degree {
            powers.insert(power);
        }
        let high = ps_low_degree + 1;
        for power in (high..=target_degree).step_by(high as usize) {
            powers.insert(power);
        }
    } else {
        for power in 1..=target_degree {
            powers.insert(power);
        }
    }
    powers
}

// ============================================================================
// Query
// ============================================================================

/// A validated query: loaded ciphertexts, loaded relinearization keys, and
/// the configured [`PowersDag`].
pub struct Query {
    compression: u8,
    relin_keys: Option<RelinKeys>,
    /// One entry per transmitted power: `(exponent, ciphertext per bundle
    /// index)`.
    data: Vec<(u32, Vec<Ciphertext>)>,
    powers_dag: PowersDag,
}

impl Query {
    /// Validate a [`QueryRequest`] against a SenderDB.
    ///
    /// Rejects duplicate exponents, ciphertext vectors of the wrong length,
    /// a transmitted power set differing from the parameters'
    /// `query_powers`, and any ciphertext or key blob the HE context
    /// refuses to load.
    pub fn new(request: &QueryRequest, sender_db: &SenderDB) -> Result<Self, QueryError> {
        let params = sender_db.params();
        let ev = sender_db.crypto_context().evaluator();
        let bundle_idx_count = params.bundle_idx_count() as usize;

        let relin_keys = if ev.uses_keyswitching() {
            Some(ev.load_relin_keys(&request.relin_keys)?)
        } else {
            None
        };

        let mut data = Vec::with_capacity(request.query.len());
        let mut seen = BTreeSet::new();
        for part in &request.query {
            if !seen.insert(part.exponent) {
                error!(exponent = part.exponent, "duplicate exponent in query");
                return Err(QueryError::DuplicateExponent(part.exponent));
            }
            if part.cts.len() != bundle_idx_count {
                error!(
                    exponent = part.exponent,
                    got = part.cts.len(),
                    expected = bundle_idx_count,
                    "query part has the wrong ciphertext count"
                );
                return Err(QueryError::WrongCiphertextCount {
                    exponent: part.exponent,
                    got: part.cts.len(),
                    expected: bundle_idx_count,
                });
            }
            let cts = part
                .cts
                .iter()
                .map(|ct| ev.load_ciphertext(ct.as_bytes()))
                .collect::<Result<Vec<_>, _>>()?;
            data.push((part.exponent, cts));
        }

        if seen != params.query_params().query_powers {
            error!("query power set does not match the parameters");
            return Err(QueryError::PowerSetMismatch);
        }

        let target_powers = create_powers_set(
            params.query_params().ps_low_degree,
            params.table_params().max_items_per_bin,
        );
        let powers_dag = PowersDag::configure(&seen, &target_powers)?;
        debug!(
            depth = powers_dag.depth(),
            sources = powers_dag.source_count(),
            targets = target_powers.len(),
            "configured PowersDag for query"
        );

        Ok(Self {
            compression: request.compression,
            relin_keys,
            data,
            powers_dag,
        })
    }

    /// Compression mode requested for the result ciphertexts.
    #[inline]
    pub fn compression(&self) -> u8 {
        self.compression
    }

    /// The configured DAG.
    #[inline]
    pub fn powers_dag(&self) -> &PowersDag {
        &self.powers_dag
    }
}

// ============================================================================
// Sender
// ============================================================================

/// The stateless request handlers of the match engine.
pub struct Sender;

impl Sender {
    /// Answer a parameter request.
    pub fn run_params<F>(sender_db: &SenderDB, send: F) -> Result<(), QueryError>
    where
        F: FnOnce(SenderResponse) -> Result<(), WireError>,
    {
        info!("processing parameter request");
        send(SenderResponse::Parms(ParmsResponse {
            params: sender_db.params().save(),
        }))?;
        info!("finished processing parameter request");
        Ok(())
    }

    /// Answer an OPRF request through the embedder's processor.
    ///
    /// When processing fails, nothing is sent: responding to malformed OPRF
    /// data risks leaking information about the key.
    pub fn run_oprf<F>(
        request: &OprfRequest,
        key: &OprfKey,
        processor: &dyn OprfProcessor,
        send: F,
    ) -> Result<(), QueryError>
    where
        F: FnOnce(SenderResponse) -> Result<(), WireError>,
    {
        info!(
            items = request.data.len() / crate::oprf::OPRF_QUERY_SIZE,
            "processing OPRF request"
        );
        let data = match processor.process_queries(&request.data, key) {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "OPRF query processing failed; not responding");
                return Err(QueryError::Oprf(e));
            }
        };
        send(SenderResponse::Oprf(OprfResponse { data }))?;
        info!("finished processing OPRF request");
        Ok(())
    }

    /// Run a validated query to completion, streaming result packages
    /// through `send_rp`. Holds the SenderDB read lock throughout.
    pub fn run_query<FR, FP>(
        query: &Query,
        sender_db: &SenderDB,
        pool: &WorkerPool,
        send_response: FR,
        send_rp: FP,
    ) -> Result<(), QueryError>
    where
        FR: FnOnce(SenderResponse) -> Result<(), WireError>,
        FP: Fn(ResultPackage) -> Result<(), WireError> + Sync,
    {
        let reader = sender_db.read();
        info!(
            items = reader.item_count(),
            packages = reader.bin_bundle_count(),
            "processing query request"
        );

        let params = sender_db.params();
        let mut crypto_context = sender_db.crypto_context().clone();
        if let Some(keys) = &query.relin_keys {
            crypto_context.set_relin_keys(keys.clone());
        }

        // The response only announces how many packages to expect.
        send_response(SenderResponse::Query(QueryResponse {
            package_count: reader.bin_bundle_count() as u32,
        }))?;

        let bundle_idx_count = params.bundle_idx_count() as usize;
        let mut all_powers = Vec::with_capacity(bundle_idx_count);
        for bundle_idx in 0..bundle_idx_count {
            all_powers.push(Self::compute_powers(
                query,
                &crypto_context,
                &reader,
                params,
                bundle_idx,
                pool,
            )?);
        }
        debug!("finished computing powers for all bundle indices");

        let label_byte_count = sender_db.label_byte_count() as u32;
        let nonce_byte_count = sender_db.nonce_byte_count() as u32;
        let ps_low_degree = params.query_params().ps_low_degree;
        let ctx = &crypto_context;
        let powers = &all_powers;
        let reader_ref = &reader;
        let send_rp_ref = &send_rp;

        pool.install(|| {
            (0..bundle_idx_count)
                .into_par_iter()
                .try_for_each(|bundle_idx| {
                    let caches = reader_ref.caches_at(bundle_idx as u32)?;
                    caches.into_par_iter().try_for_each(|cache| {
                        Self::process_bin_bundle_cache(
                            cache,
                            ctx,
                            &powers[bundle_idx],
                            bundle_idx as u32,
                            query.compression,
                            label_byte_count,
                            nonce_byte_count,
                            ps_low_degree,
                            send_rp_ref,
                        )
                    })
                })
        })?;

        info!("finished processing query request");
        Ok(())
    }

    /// Materialize every target power for one bundle index: seed the buffer
    /// with the transmitted powers, walk the DAG, then switch/transform
    /// everything to where the evaluation schedule wants it.
    fn compute_powers(
        query: &Query,
        crypto_context: &CryptoContext,
        reader: &SenderDbReader<'_>,
        params: &PsiParams,
        bundle_idx: usize,
        pool: &WorkerPool,
    ) -> Result<CiphertextPowers, QueryError> {
        let ev = crypto_context.evaluator();
        let max_items_per_bin = params.table_params().max_items_per_bin as usize;

        // Slot 0 stays empty; powers index directly by exponent.
        let mut powers: CiphertextPowers = vec![None; max_items_per_bin + 1];
        for (exponent, cts) in &query.data {
            powers[*exponent as usize] = Some(cts[bundle_idx].clone());
        }

        // Nothing to serve at this bundle index; don't burn work on it.
        if reader.bin_bundle_count_at(bundle_idx as u32) == 0 {
            return Ok(powers);
        }
        debug!(bundle_idx, "computing query ciphertext powers");

        let relinearize = ev.uses_keyswitching();
        let powers_lock = parking_lot::RwLock::new(powers);
        query
            .powers_dag
            .parallel_apply(pool, |node| -> Result<(), QueryError> {
                let (p1, p2) = match node.parents {
                    None => return Ok(()),
                    Some(parents) => parents,
                };
                let prod = {
                    let guard = powers_lock.read();
                    let a = guard[p1 as usize]
                        .as_ref()
                        .ok_or(QueryError::MissingPower(p1))?;
                    if p1 == p2 {
                        ev.square(a)?
                    } else {
                        let b = guard[p2 as usize]
                            .as_ref()
                            .ok_or(QueryError::MissingPower(p2))?;
                        ev.multiply(a, b)?
                    }
                };
                let prod = if relinearize {
                    let keys = crypto_context
                        .relin_keys()
                        .ok_or(QueryError::KeysRequired)?;
                    ev.relinearize(&prod, keys)?
                } else {
                    prod
                };
                powers_lock.write()[node.power as usize] = Some(prod);
                Ok(())
            })?;
        let mut powers = powers_lock.into_inner();

        // All multiplications are done; now move every power to its
        // schedule position. Low powers sit one modulus level above high
        // powers so inner PS results meet the outer powers at their level.
        let ps_low_degree = params.query_params().ps_low_degree;
        let transformed: Vec<(u32, Ciphertext)> = pool.install(|| {
            query
                .powers_dag
                .target_powers()
                .par_iter()
                .map(|&power| {
                    let ct = powers[power as usize]
                        .as_ref()
                        .ok_or(QueryError::MissingPower(power))?;
                    let ct = if ps_low_degree <= 1 {
                        // Direct schedule (PS disabled or degenerate).
                        let ct = ev.mod_switch_to(ct, HIGH_POWERS_CHAIN_INDEX)?;
                        ev.to_ntt(&ct)?
                    } else if power <= ps_low_degree {
                        let ct = ev.mod_switch_to(ct, LOW_POWERS_CHAIN_INDEX)?;
                        ev.to_ntt(&ct)?
                    } else {
                        ev.mod_switch_to(ct, HIGH_POWERS_CHAIN_INDEX)?
                    };
                    Ok((power, ct))
                })
                .collect::<Result<_, QueryError>>()
        })?;
        for (power, ct) in transformed {
            powers[power as usize] = Some(ct);
        }
        Ok(powers)
    }

    /// Evaluate one cache and stream its result package.
    #[allow(clippy::too_many_arguments)]
    fn process_bin_bundle_cache<FP>(
        cache: &BinBundleCache,
        crypto_context: &CryptoContext,
        powers: &CiphertextPowers,
        bundle_idx: u32,
        compression: u8,
        label_byte_count: u32,
        nonce_byte_count: u32,
        ps_low_degree: u32,
        send_rp: &FP,
    ) -> Result<(), QueryError>
    where
        FP: Fn(ResultPackage) -> Result<(), WireError> + Sync,
    {
        let psi_result =
            cache
                .batched_matching_polyn
                .eval_with_schedule(crypto_context, powers, ps_low_degree)?;
        let label_result = cache
            .batched_interp_polyns
            .iter()
            .map(|polyn| polyn.eval_with_schedule(crypto_context, powers, ps_low_degree))
            .collect::<Result<Vec<_>, _>>()?;

        send_rp(ResultPackage {
            bundle_idx,
            compression,
            label_byte_count,
            nonce_byte_count,
            psi_result,
            label_result,
        })?;
        Ok(())
    }
}

// ============================================================================
// Tests: end-to-end scenarios through the clear backend
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{algebraize_item, dealgebraize_label};
    use crate::he::{ClearEvaluator, HeEvaluator};
    use crate::hashing::{all_locations, hash_functions};
    use crate::oprf;
    use crate::params::test_params;
    use crate::poly::pow_mod;
    use crate::wire::{QueryPart, COMPR_MODE_NONE};
    use crate::{Felt, HashedItem, Item, Label};
    use std::sync::Arc;
    use std::sync::Mutex;

    fn evaluator(params: &PsiParams) -> Arc<dyn HeEvaluator> {
        Arc::new(ClearEvaluator::new(
            params.bfv_params().poly_modulus_degree as usize,
            params.plain_modulus(),
            (params.bfv_params().coeff_modulus_bits.len() - 1) as u32,
            true,
        ))
    }

    /// Test-side receiver: cuckoo-places its items, encrypts the source
    /// powers, and decodes result packages. (The real receiver is outside
    /// this crate; this mirrors just enough of it to drive the engine.)
    struct Receiver {
        params: PsiParams,
        ev: Arc<dyn HeEvaluator>,
        /// Table slot → the hashed item placed there.
        table: Vec<Option<HashedItem>>,
        /// Hashed item → chosen table location.
        placements: Vec<(HashedItem, usize)>,
    }

    impl Receiver {
        fn new(params: PsiParams, ev: Arc<dyn HeEvaluator>, hashed_items: &[HashedItem]) -> Self {
            let table_size = params.table_params().table_size;
            let funcs = hash_functions(table_size, params.table_params().hash_func_count);
            let mut table: Vec<Option<HashedItem>> = vec![None; table_size as usize];
            let mut placements = Vec::new();
            for item in hashed_items {
                let location = all_locations(&funcs, item)
                    .into_iter()
                    .find(|&loc| table[loc as usize].is_none())
                    .expect("test query items must not exhaust their locations");
                table[location as usize] = Some(*item);
                placements.push((*item, location as usize));
            }
            Self {
                params,
                ev,
                table,
                placements,
            }
        }

        /// Slot-wise query values: each placed item contributes its felts;
        /// free slots hold a filler the sender's bins never contain.
        fn slot_values(&self) -> Vec<Felt> {
            let p = self.params.plain_modulus();
            let fpi = self.params.item_params().felts_per_item as usize;
            let mut slots = vec![p - 1; self.table.len() * fpi];
            for (slot, entry) in self.table.iter().enumerate() {
                if let Some(item) = entry {
                    let felts =
                        algebraize_item(item, self.params.item_bit_count(), p).unwrap();
                    slots[slot * fpi..slot * fpi + fpi].copy_from_slice(&felts);
                }
            }
            slots
        }

        fn build_request(&self) -> QueryRequest {
            let p = self.params.plain_modulus();
            let bins_per_bundle = self.params.bins_per_bundle() as usize;
            let bundle_idx_count = self.params.bundle_idx_count() as usize;
            let slots = self.slot_values();

            let mut query = Vec::new();
            for &exponent in &self.params.query_params().query_powers {
                let mut cts = Vec::with_capacity(bundle_idx_count);
                for bundle_idx in 0..bundle_idx_count {
                    let start = bundle_idx * bins_per_bundle;
                    let values: Vec<Felt> = slots[start..start + bins_per_bundle]
                        .iter()
                        .map(|&v| pow_mod(v, exponent as u64, p))
                        .collect();
                    let pt = self.ev.encode(&values).unwrap();
                    cts.push(self.ev.encrypt(&pt).unwrap());
                }
                query.push(QueryPart { exponent, cts });
            }
            QueryRequest {
                compression: COMPR_MODE_NONE,
                relin_keys: b"receiver-relin-keys".to_vec(),
                query,
            }
        }

        /// Decode the streamed packages: for every queried item, whether it
        /// matched and (if labeled) its decrypted label parts.
        fn decode(
            &self,
            packages: &[ResultPackage],
        ) -> Vec<(HashedItem, bool, Option<Vec<u8>>)> {
            let p = self.params.plain_modulus();
            let fpi = self.params.item_params().felts_per_item as usize;
            let bins_per_bundle = self.params.bins_per_bundle() as usize;

            let mut out = Vec::new();
            for &(item, location) in &self.placements {
                let cuckoo_idx = location * fpi;
                let bundle_idx = (cuckoo_idx / bins_per_bundle) as u32;
                let bin_idx = cuckoo_idx % bins_per_bundle;

                let mut matched = false;
                let mut label = None;
                for rp in packages.iter().filter(|rp| rp.bundle_idx == bundle_idx) {
                    let psi = self
                        .ev
                        .decode(&self.ev.decrypt(&rp.psi_result).unwrap())
                        .unwrap();
                    if !psi[bin_idx..bin_idx + fpi].iter().all(|&v| v == 0) {
                        continue;
                    }
                    matched = true;
                    if !rp.label_result.is_empty() {
                        let mut felts = Vec::new();
                        for ct in &rp.label_result {
                            let slots =
                                self.ev.decode(&self.ev.decrypt(ct).unwrap()).unwrap();
                            felts.extend_from_slice(&slots[bin_idx..bin_idx + fpi]);
                        }
                        let bytes = dealgebraize_label(
                            &felts,
                            felts.len() as u32 * self.params.item_bit_count_per_felt(),
                            p,
                        )
                        .unwrap();
                        label = Some(bytes);
                    }
                    break;
                }
                out.push((item, matched, label));
            }
            out
        }
    }

    /// Drive one full query; returns the collected result packages.
    fn run(db: &SenderDB, request: &QueryRequest, pool: &WorkerPool) -> Vec<ResultPackage> {
        let query = Query::new(request, db).unwrap();
        let packages = Mutex::new(Vec::new());
        let declared = Mutex::new(0u32);
        Sender::run_query(
            &query,
            db,
            pool,
            |resp| {
                if let SenderResponse::Query(q) = resp {
                    *declared.lock().unwrap() = q.package_count;
                }
                Ok(())
            },
            |rp| {
                packages.lock().unwrap().push(rp);
                Ok(())
            },
        )
        .unwrap();
        let packages = packages.into_inner().unwrap();
        assert_eq!(*declared.lock().unwrap() as usize, packages.len());
        packages
    }

    /// What the receiver would learn from the OPRF exchange.
    fn query_items(key: &OprfKey, items: &[Item]) -> Vec<HashedItem> {
        oprf::compute_hashes(items, key)
    }

    #[test]
    fn unlabeled_match_and_nonmatch() {
        let params = test_params(0, &[1, 2, 4, 8]);
        let ev = evaluator(&params);
        let db = SenderDB::new(params.clone(), 0, 0, false, ev.clone()).unwrap();
        let pool = WorkerPool::with_threads(2);

        let sender_set: Vec<Item> = (0..100u128).map(Item::from).collect();
        db.insert_or_assign(&sender_set, &pool).unwrap();
        let key = db.get_oprf_key().unwrap();

        let queried = query_items(&key, &[Item::from(50u128), Item::from(200u128)]);
        let receiver = Receiver::new(params, ev, &queried);
        let packages = run(&db, &receiver.build_request(), &pool);

        let results = receiver.decode(&packages);
        assert!(results[0].1, "h(50) must match");
        assert!(!results[1].1, "h(200) must not match");
    }

    #[test]
    fn labeled_match_returns_label() {
        let params = test_params(0, &[1, 2, 4, 8]);
        let ev = evaluator(&params);
        let db = SenderDB::new(params.clone(), 8, 4, false, ev.clone()).unwrap();
        let pool = WorkerPool::with_threads(2);

        let item = Item::from(7u128);
        db.insert_or_assign_labeled(&[(item, b"HELLOAPS".to_vec())], &pool)
            .unwrap();
        let key = db.get_oprf_key().unwrap();

        let queried = query_items(&key, &[item, Item::from(8u128)]);
        let receiver = Receiver::new(params, ev, &queried);
        let packages = run(&db, &receiver.build_request(), &pool);
        let results = receiver.decode(&packages);

        assert!(results[0].1, "h(7) must match");
        let (_, label_key) = oprf::get_item_hash(&item, &key);
        let mut encrypted = results[0].2.clone().unwrap();
        encrypted.truncate(4 + 8);
        let label: Label = oprf::decrypt_label(&encrypted, &label_key, 4).unwrap();
        assert_eq!(label, b"HELLOAPS".to_vec());

        assert!(!results[1].1, "h(8) must not match");
        assert_eq!(db.get_item_count(), 1);
    }

    #[test]
    fn overwrite_serves_the_new_label() {
        let params = test_params(0, &[1, 2, 4, 8]);
        let ev = evaluator(&params);
        let db = SenderDB::new(params.clone(), 8, 4, false, ev.clone()).unwrap();
        let pool = WorkerPool::serial();

        let item = Item::from(7u128);
        db.insert_or_assign_labeled(&[(item, b"LABEL-V1".to_vec())], &pool)
            .unwrap();
        db.insert_or_assign_labeled(&[(item, b"LABEL-V2".to_vec())], &pool)
            .unwrap();
        assert_eq!(db.get_item_count(), 1);

        let key = db.get_oprf_key().unwrap();
        let queried = query_items(&key, &[item]);
        let receiver = Receiver::new(params, ev, &queried);
        let results = receiver.decode(&run(&db, &receiver.build_request(), &pool));

        assert!(results[0].1);
        let (_, label_key) = oprf::get_item_hash(&item, &key);
        let mut encrypted = results[0].2.clone().unwrap();
        encrypted.truncate(12);
        assert_eq!(
            oprf::decrypt_label(&encrypted, &label_key, 4).unwrap(),
            b"LABEL-V2".to_vec()
        );
    }

    #[test]
    fn remove_then_reinsert_roundtrip() {
        let params = test_params(0, &[1, 2, 4, 8]);
        let ev = evaluator(&params);
        let db = SenderDB::new(params.clone(), 0, 0, false, ev.clone()).unwrap();
        let pool = WorkerPool::serial();

        db.insert_or_assign(&[1u128, 2, 3].map(Item::from), &pool)
            .unwrap();
        let bundles_before = db.get_bin_bundle_count();
        let key = db.get_oprf_key().unwrap();

        db.remove(&[Item::from(2u128)], &pool).unwrap();
        assert!(db.get_bin_bundle_count() <= bundles_before);
        let queried = query_items(&key, &[Item::from(2u128)]);
        let receiver = Receiver::new(params.clone(), ev.clone(), &queried);
        let results = receiver.decode(&run(&db, &receiver.build_request(), &pool));
        assert!(!results[0].1, "removed item must not match");

        db.insert_or_assign(&[Item::from(2u128)], &pool).unwrap();
        let receiver = Receiver::new(params, ev, &queried);
        let results = receiver.decode(&run(&db, &receiver.build_request(), &pool));
        assert!(results[0].1, "re-inserted item must match");
    }

    #[test]
    fn ps_and_direct_parameterizations_agree() {
        let sender_set: Vec<Item> = (0..60u128).map(Item::from).collect();
        let query_set: Vec<Item> = vec![
            Item::from(5u128),
            Item::from(30u128),
            Item::from(77u128),
            Item::from(200u128),
        ];

        let mut outcomes = Vec::new();
        for (ps, powers) in [(0u32, &[1u32, 2, 4, 8][..]), (4, &[1, 3, 5, 10][..])] {
            let params = test_params(ps, powers);
            let ev = evaluator(&params);
            let db = SenderDB::new(params.clone(), 8, 4, false, ev.clone()).unwrap();
            let pool = WorkerPool::with_threads(2);

            let data: Vec<(Item, Label)> = sender_set
                .iter()
                .map(|&it| (it, format!("L{:07}", it.words().0).into_bytes()))
                .collect();
            db.insert_or_assign_labeled(&data, &pool).unwrap();
            let key = db.get_oprf_key().unwrap();

            let queried = query_items(&key, &query_set);
            let receiver = Receiver::new(params, ev, &queried);
            let results = receiver.decode(&run(&db, &receiver.build_request(), &pool));

            let decoded: Vec<(bool, Option<Label>)> = results
                .iter()
                .zip(&query_set)
                .map(|((_, matched, enc), item)| {
                    let label = enc.as_ref().filter(|_| *matched).map(|bytes| {
                        let (_, label_key) = oprf::get_item_hash(item, &key);
                        let mut enc = bytes.clone();
                        enc.truncate(12);
                        oprf::decrypt_label(&enc, &label_key, 4).unwrap()
                    });
                    (*matched, label)
                })
                .collect();
            outcomes.push(decoded);
        }

        assert_eq!(outcomes[0], outcomes[1], "PS and direct must agree");
        // Sanity: the in-set queries matched, the out-of-set did not.
        assert!(outcomes[0][0].0 && outcomes[0][1].0);
        assert!(!outcomes[0][2].0 && !outcomes[0][3].0);
    }

    #[test]
    fn strip_save_load_then_serve() {
        let params = test_params(0, &[1, 2, 4, 8]);
        let ev = evaluator(&params);
        let db = SenderDB::new(params.clone(), 8, 4, false, ev.clone()).unwrap();
        let pool = WorkerPool::serial();

        let data: Vec<(Item, Label)> = (0..20u128)
            .map(|i| (Item::from(i), format!("VALUE{i:03}").into_bytes()))
            .collect();
        db.insert_or_assign_labeled(&data, &pool).unwrap();
        let key = db.get_oprf_key().unwrap();

        let query_set = vec![Item::from(3u128), Item::from(500u128)];
        let queried = query_items(&key, &query_set);
        let receiver = Receiver::new(params.clone(), ev.clone(), &queried);
        let request = receiver.build_request();
        let before = receiver.decode(&run(&db, &request, &pool));

        let returned_key = db.strip(&pool).unwrap();
        assert_eq!(returned_key.as_bytes(), key.as_bytes());
        let bytes = db.save().unwrap();
        let restored = SenderDB::load(&bytes, ev.clone(), &pool).unwrap();
        assert!(restored.is_stripped());

        let after = receiver.decode(&run(&restored, &request, &pool));
        assert_eq!(before, after, "stripped+reloaded DB must serve identically");
        assert!(before[0].1 && !before[1].1);
    }

    #[test]
    fn malformed_queries_are_rejected() {
        let params = test_params(0, &[1, 2, 4, 8]);
        let ev = evaluator(&params);
        let db = SenderDB::new(params.clone(), 0, 0, false, ev.clone()).unwrap();
        let pool = WorkerPool::serial();
        db.insert_or_assign(&[Item::from(1u128)], &pool).unwrap();
        let key = db.get_oprf_key().unwrap();

        let queried = query_items(&key, &[Item::from(1u128)]);
        let receiver = Receiver::new(params.clone(), ev, &queried);
        let good = receiver.build_request();

        // Duplicate exponent.
        let mut bad = good.clone();
        let dup = bad.query[0].clone();
        bad.query.push(dup);
        assert!(matches!(
            Query::new(&bad, &db),
            Err(QueryError::DuplicateExponent(_))
        ));

        // Wrong ciphertext count.
        let mut bad = good.clone();
        bad.query[0].cts.pop();
        assert!(matches!(
            Query::new(&bad, &db),
            Err(QueryError::WrongCiphertextCount { .. })
        ));

        // Power set mismatch.
        let mut bad = good.clone();
        bad.query.remove(1);
        assert!(matches!(
            Query::new(&bad, &db),
            Err(QueryError::PowerSetMismatch)
        ));

        // Garbage ciphertext.
        let mut bad = good;
        bad.query[0].cts[0] = Ciphertext(b"garbage".to_vec());
        assert!(matches!(Query::new(&bad, &db), Err(QueryError::He(_))));
    }

    #[test]
    fn run_params_and_oprf_roundtrip() {
        let params = test_params(0, &[1, 2, 4, 8]);
        let ev = evaluator(&params);
        let db = SenderDB::new(params.clone(), 0, 0, false, ev).unwrap();

        let sent = Mutex::new(None);
        Sender::run_params(&db, |resp| {
            *sent.lock().unwrap() = Some(resp);
            Ok(())
        })
        .unwrap();
        match sent.into_inner().unwrap().unwrap() {
            SenderResponse::Parms(r) => {
                assert_eq!(PsiParams::load(&r.params).unwrap(), params);
            }
            other => panic!("unexpected response {other:?}"),
        }

        // A processor that XORs a fixed byte, as a stand-in for the real
        // OPRF evaluation.
        struct Flip;
        impl OprfProcessor for Flip {
            fn process_queries(
                &self,
                data: &[u8],
                _key: &OprfKey,
            ) -> Result<Vec<u8>, OprfError> {
                Ok(data.iter().map(|b| b ^ 0x5a).collect())
            }
        }

        let request = OprfRequest {
            data: vec![1u8; crate::oprf::OPRF_QUERY_SIZE],
        };
        let sent = Mutex::new(None);
        Sender::run_oprf(&request, &OprfKey::default(), &Flip, |resp| {
            *sent.lock().unwrap() = Some(resp);
            Ok(())
        })
        .unwrap();
        match sent.into_inner().unwrap().unwrap() {
            SenderResponse::Oprf(r) => assert_eq!(r.data, vec![1u8 ^ 0x5a; 32]),
            other => panic!("unexpected response {other:?}"),
        }

        // Processing failure sends nothing.
        struct Failing;
        impl OprfProcessor for Failing {
            fn process_queries(
                &self,
                _data: &[u8],
                _key: &OprfKey,
            ) -> Result<Vec<u8>, OprfError> {
                Err(OprfError::ProcessingFailed("bad point".into()))
            }
        }
        let sent = Mutex::new(false);
        let err = Sender::run_oprf(&request, &OprfKey::default(), &Failing, |_| {
            *sent.lock().unwrap() = true;
            Ok(())
        });
        assert!(err.is_err());
        assert!(!*sent.lock().unwrap());
    }
}
