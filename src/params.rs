//! Protocol parameters: validation, derived quantities, serialization
//!
//! [`PsiParams`] is the immutable bundle every other component consumes. It
//! is created once, validated exhaustively at construction, and never
//! mutated; all derived quantities (`item_bit_count`, `items_per_bundle`,
//! `bins_per_bundle`, `bundle_idx_count`) are computed here so the rest of
//! the engine can treat them as facts.
//!
//! The interlocking constraints, in dependency order:
//!
//! - `felts_per_item ∈ [2, 32]`, `hash_func_count ∈ [1, 8]`, non-zero
//!   `table_size` and `max_items_per_bin`;
//! - `query_powers` contains 1, never 0, has at most `max_items_per_bin`
//!   entries all `≤ max_items_per_bin`, and entries above `ps_low_degree`
//!   are multiples of `ps_low_degree + 1` (the Paterson–Stockmeyer high
//!   powers);
//! - the plain modulus is a prime supporting batching (`p ≡ 1 mod 2N`),
//!   and `item_bit_count = felts_per_item · (bitlen(p) − 1) ∈ [80, 128]`;
//! - at least one item fits a ciphertext (`items_per_bundle ≥ 1`) and
//!   `table_size` divides evenly into bundles;
//! - the modulus chain is deep enough for the chosen evaluation schedule
//!   (two levels for direct evaluation, three when PS is enabled).
//!
//! Two loaders exist: the versioned binary form used on the wire and in
//! persisted SenderDBs, and a human-readable JSON superset that can derive
//! the plain modulus via a batching-prime search.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::encoding::bits_per_felt;
use crate::he::{HIGH_POWERS_CHAIN_INDEX, LOW_POWERS_CHAIN_INDEX};
use crate::poly::is_prime;

/// Version tag checked by every binary loader in this crate.
pub const SERIALIZATION_VERSION: u32 = 1;

/// Bounds on `felts_per_item`.
pub const FELTS_PER_ITEM_MIN: u32 = 2;
/// Upper bound on `felts_per_item`.
pub const FELTS_PER_ITEM_MAX: u32 = 32;
/// Bounds on `hash_func_count`.
pub const HASH_FUNC_COUNT_MIN: u32 = 1;
/// Upper bound on `hash_func_count`.
pub const HASH_FUNC_COUNT_MAX: u32 = 8;
/// Smallest admissible effective item width, in bits.
pub const ITEM_BIT_COUNT_MIN: u32 = 80;
/// Largest admissible effective item width, in bits.
pub const ITEM_BIT_COUNT_MAX: u32 = 128;

/// Errors surfaced by parameter validation and loading.
#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("table_size cannot be zero")]
    ZeroTableSize,
    #[error("max_items_per_bin cannot be zero")]
    ZeroMaxItemsPerBin,
    #[error("hash_func_count {0} is out of range [{HASH_FUNC_COUNT_MIN}, {HASH_FUNC_COUNT_MAX}]")]
    BadHashFuncCount(u32),
    #[error("felts_per_item {0} is out of range [{FELTS_PER_ITEM_MIN}, {FELTS_PER_ITEM_MAX}]")]
    BadFeltsPerItem(u32),
    #[error("ps_low_degree {ps_low_degree} cannot exceed max_items_per_bin {max_items_per_bin}")]
    PsLowDegreeTooLarge {
        ps_low_degree: u32,
        max_items_per_bin: u32,
    },
    #[error("query_powers is invalid: {0}")]
    BadQueryPowers(&'static str),
    #[error("poly_modulus_degree must be a power of two of at least 2 (got {0})")]
    BadPolyModulusDegree(u64),
    #[error("plain_modulus {0} does not support batching (must be a prime ≡ 1 mod 2·poly_modulus_degree)")]
    NoBatchingSupport(u64),
    #[error("parameters give item_bit_count {0}, outside [{ITEM_BIT_COUNT_MIN}, {ITEM_BIT_COUNT_MAX}]")]
    BadItemBitCount(u32),
    #[error("poly_modulus_degree is too small to hold a single item")]
    PolyModulusDegreeTooSmall,
    #[error("table_size must be a multiple of items_per_bundle ({items_per_bundle})")]
    TableSizeNotMultiple { items_per_bundle: u32 },
    #[error("coefficient modulus chain has {got} primes; the evaluation schedule needs at least {needed}")]
    InsufficientCoeffModulus { got: usize, needed: usize },
    #[error("no {bit_size}-bit batching prime exists for poly_modulus_degree {poly_modulus_degree}")]
    NoBatchingPrime {
        poly_modulus_degree: u64,
        bit_size: u32,
    },
    #[error("serialized parameters are invalid: {0}")]
    Serialization(String),
    #[error("serialization version {got} is incompatible with {expected}")]
    VersionMismatch { got: u32, expected: u32 },
    #[error("failed to load parameters from JSON: {0}")]
    Json(String),
}

/// Shape of one item in field elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemParams {
    /// How many field elements one hashed item splits into.
    pub felts_per_item: u32,
}

/// Cuckoo table shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableParams {
    /// Number of item slots in the cuckoo table.
    pub table_size: u32,
    /// Bin capacity; also the highest matching-polynomial degree.
    pub max_items_per_bin: u32,
    /// Number of cuckoo hash functions.
    pub hash_func_count: u32,
}

/// Query evaluation schedule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    /// Paterson–Stockmeyer inner degree; 0 disables PS.
    pub ps_low_degree: u32,
    /// The powers the receiver transmits (the DAG's source set).
    pub query_powers: BTreeSet<u32>,
}

/// BFV encryption parameters, as far as the engine needs to know them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BfvParams {
    /// Ring degree; also the batching slot count.
    pub poly_modulus_degree: u64,
    /// The plaintext prime `p`.
    pub plain_modulus: u64,
    /// Bit sizes of the coefficient modulus primes (depth budget).
    pub coeff_modulus_bits: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
struct PsiParamsData {
    version: u32,
    item_params: ItemParams,
    table_params: TableParams,
    query_params: QueryParams,
    bfv_params: BfvParams,
}

/// The validated, immutable parameter bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PsiParams {
    item_params: ItemParams,
    table_params: TableParams,
    query_params: QueryParams,
    bfv_params: BfvParams,

    // Derived at construction.
    item_bit_count_per_felt: u32,
    item_bit_count: u32,
    items_per_bundle: u32,
    bins_per_bundle: u32,
    bundle_idx_count: u32,
}

impl PsiParams {
    /// Validate the parameter set and derive the dependent quantities.
    pub fn new(
        item_params: ItemParams,
        table_params: TableParams,
        query_params: QueryParams,
        bfv_params: BfvParams,
    ) -> Result<Self, ParamsError> {
        if table_params.table_size == 0 {
            return Err(ParamsError::ZeroTableSize);
        }
        if table_params.max_items_per_bin == 0 {
            return Err(ParamsError::ZeroMaxItemsPerBin);
        }
        if !(HASH_FUNC_COUNT_MIN..=HASH_FUNC_COUNT_MAX).contains(&table_params.hash_func_count) {
            return Err(ParamsError::BadHashFuncCount(table_params.hash_func_count));
        }
        if !(FELTS_PER_ITEM_MIN..=FELTS_PER_ITEM_MAX).contains(&item_params.felts_per_item) {
            return Err(ParamsError::BadFeltsPerItem(item_params.felts_per_item));
        }
        if query_params.ps_low_degree > table_params.max_items_per_bin {
            return Err(ParamsError::PsLowDegreeTooLarge {
                ps_low_degree: query_params.ps_low_degree,
                max_items_per_bin: table_params.max_items_per_bin,
            });
        }
        if query_params.query_powers.contains(&0) {
            return Err(ParamsError::BadQueryPowers("cannot contain 0"));
        }
        if !query_params.query_powers.contains(&1) {
            return Err(ParamsError::BadQueryPowers("must contain 1"));
        }
        if query_params.query_powers.len() > table_params.max_items_per_bin as usize {
            return Err(ParamsError::BadQueryPowers(
                "cannot have more entries than max_items_per_bin",
            ));
        }
        let ps_high_degree = query_params.ps_low_degree + 1;
        for &power in &query_params.query_powers {
            if power > table_params.max_items_per_bin {
                return Err(ParamsError::BadQueryPowers(
                    "cannot contain values larger than max_items_per_bin",
                ));
            }
            if power > query_params.ps_low_degree && power % ps_high_degree != 0 {
                return Err(ParamsError::BadQueryPowers(
                    "values above ps_low_degree must be multiples of ps_low_degree + 1",
                ));
            }
        }

        let n = bfv_params.poly_modulus_degree;
        if n < 2 || !n.is_power_of_two() {
            return Err(ParamsError::BadPolyModulusDegree(n));
        }
        let p = bfv_params.plain_modulus;
        if p < 2 || !is_prime(p) || p % (2 * n) != 1 {
            return Err(ParamsError::NoBatchingSupport(p));
        }
        let needed_chain = if query_params.ps_low_degree > 0 {
            LOW_POWERS_CHAIN_INDEX
        } else {
            HIGH_POWERS_CHAIN_INDEX
        } as usize
            + 1;
        if bfv_params.coeff_modulus_bits.len() < needed_chain {
            return Err(ParamsError::InsufficientCoeffModulus {
                got: bfv_params.coeff_modulus_bits.len(),
                needed: needed_chain,
            });
        }

        let item_bit_count_per_felt = bits_per_felt(p);
        let item_bit_count = item_bit_count_per_felt * item_params.felts_per_item;
        if !(ITEM_BIT_COUNT_MIN..=ITEM_BIT_COUNT_MAX).contains(&item_bit_count) {
            return Err(ParamsError::BadItemBitCount(item_bit_count));
        }

        // If felts_per_item does not divide the ring degree, the trailing
        // slots of every ciphertext simply go unused.
        let items_per_bundle = (n / item_params.felts_per_item as u64) as u32;
        if items_per_bundle == 0 {
            return Err(ParamsError::PolyModulusDegreeTooSmall);
        }
        let bins_per_bundle = items_per_bundle * item_params.felts_per_item;

        if table_params.table_size % items_per_bundle != 0 {
            return Err(ParamsError::TableSizeNotMultiple { items_per_bundle });
        }
        let bundle_idx_count = table_params.table_size / items_per_bundle;

        Ok(Self {
            item_params,
            table_params,
            query_params,
            bfv_params,
            item_bit_count_per_felt,
            item_bit_count,
            items_per_bundle,
            bins_per_bundle,
            bundle_idx_count,
        })
    }

    // ---------------------------- Accessors ----------------------------

    /// Item shape parameters.
    #[inline]
    pub fn item_params(&self) -> &ItemParams {
        &self.item_params
    }

    /// Cuckoo table parameters.
    #[inline]
    pub fn table_params(&self) -> &TableParams {
        &self.table_params
    }

    /// Query schedule parameters.
    #[inline]
    pub fn query_params(&self) -> &QueryParams {
        &self.query_params
    }

    /// BFV parameters.
    #[inline]
    pub fn bfv_params(&self) -> &BfvParams {
        &self.bfv_params
    }

    /// The plaintext prime.
    #[inline]
    pub fn plain_modulus(&self) -> u64 {
        self.bfv_params.plain_modulus
    }

    /// Bits one felt carries: `bitlen(p) − 1`.
    #[inline]
    pub fn item_bit_count_per_felt(&self) -> u32 {
        self.item_bit_count_per_felt
    }

    /// Effective item width in bits.
    #[inline]
    pub fn item_bit_count(&self) -> u32 {
        self.item_bit_count
    }

    /// Items per BinBundle (= per ciphertext).
    #[inline]
    pub fn items_per_bundle(&self) -> u32 {
        self.items_per_bundle
    }

    /// Bins per BinBundle (= used slots per ciphertext).
    #[inline]
    pub fn bins_per_bundle(&self) -> u32 {
        self.bins_per_bundle
    }

    /// Number of bundle indices the cuckoo table shards into.
    #[inline]
    pub fn bundle_idx_count(&self) -> u32 {
        self.bundle_idx_count
    }

    // ---------------------------- Serialization ----------------------------

    /// Serialize to the versioned binary form.
    pub fn save(&self) -> Vec<u8> {
        let data = PsiParamsData {
            version: SERIALIZATION_VERSION,
            item_params: self.item_params,
            table_params: self.table_params,
            query_params: self.query_params.clone(),
            bfv_params: self.bfv_params.clone(),
        };
        bincode::serialize(&data).expect("parameter serialization is infallible")
    }

    /// Load from the versioned binary form, re-running full validation.
    pub fn load(bytes: &[u8]) -> Result<Self, ParamsError> {
        let data: PsiParamsData =
            bincode::deserialize(bytes).map_err(|e| ParamsError::Serialization(e.to_string()))?;
        if data.version != SERIALIZATION_VERSION {
            return Err(ParamsError::VersionMismatch {
                got: data.version,
                expected: SERIALIZATION_VERSION,
            });
        }
        Self::new(
            data.item_params,
            data.table_params,
            data.query_params,
            data.bfv_params,
        )
    }

    /// Load from the human-readable JSON superset.
    ///
    /// `bfv_params` accepts either an explicit `plain_modulus` or a
    /// `plain_modulus_bits` to search a batching prime for; `query_powers`
    /// implicitly contains 1.
    pub fn from_json(input: &str) -> Result<Self, ParamsError> {
        let root: serde_json::Value =
            serde_json::from_str(input).map_err(|e| ParamsError::Json(e.to_string()))?;

        let table = json_object(&root, "table_params")?;
        let table_params = TableParams {
            table_size: json_u32(table, "table_size")?,
            max_items_per_bin: json_u32(table, "max_items_per_bin")?,
            hash_func_count: json_u32(table, "hash_func_count")?,
        };

        let item = json_object(&root, "item_params")?;
        let item_params = ItemParams {
            felts_per_item: json_u32(item, "felts_per_item")?,
        };

        let query = json_object(&root, "query_params")?;
        let mut query_powers: BTreeSet<u32> = BTreeSet::new();
        query_powers.insert(1);
        let powers = query
            .get("query_powers")
            .and_then(|v| v.as_array())
            .ok_or(ParamsError::Json("query_powers must be an array".into()))?;
        for power in powers {
            query_powers.insert(
                power
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or(ParamsError::Json("query_powers entries must be u32".into()))?,
            );
        }
        let query_params = QueryParams {
            ps_low_degree: json_u32(query, "ps_low_degree")?,
            query_powers,
        };

        let bfv = json_object(&root, "bfv_params")?;
        let poly_modulus_degree = bfv
            .get("poly_modulus_degree")
            .and_then(|v| v.as_u64())
            .ok_or(ParamsError::Json("poly_modulus_degree must be a u64".into()))?;

        let plain_modulus = match (bfv.get("plain_modulus"), bfv.get("plain_modulus_bits")) {
            (Some(_), Some(_)) => {
                return Err(ParamsError::Json(
                    "only one of plain_modulus and plain_modulus_bits may be specified".into(),
                ))
            }
            (Some(v), None) => v
                .as_u64()
                .ok_or(ParamsError::Json("plain_modulus must be a u64".into()))?,
            (None, Some(v)) => {
                let bits = v
                    .as_u64()
                    .and_then(|b| u32::try_from(b).ok())
                    .ok_or(ParamsError::Json("plain_modulus_bits must be a u32".into()))?;
                batching_prime(poly_modulus_degree, bits)?
            }
            (None, None) => {
                return Err(ParamsError::Json(
                    "neither plain_modulus nor plain_modulus_bits was specified".into(),
                ))
            }
        };

        let coeff = bfv
            .get("coeff_modulus_bits")
            .and_then(|v| v.as_array())
            .ok_or(ParamsError::Json("coeff_modulus_bits must be an array".into()))?;
        let mut coeff_modulus_bits = Vec::with_capacity(coeff.len());
        for c in coeff {
            coeff_modulus_bits.push(
                c.as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or(ParamsError::Json("coeff_modulus_bits entries must be u32".into()))?,
            );
        }

        Self::new(
            item_params,
            table_params,
            query_params,
            BfvParams {
                poly_modulus_degree,
                plain_modulus,
                coeff_modulus_bits,
            },
        )
    }
}

impl std::fmt::Display for PsiParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "item_params.felts_per_item: {}; table_params.table_size: {}; \
             table_params.max_items_per_bin: {}; table_params.hash_func_count: {}; \
             query_params.ps_low_degree: {}; query_params.query_powers: {:?}; \
             bfv_params.poly_modulus_degree: {}; bfv_params.plain_modulus: {}; \
             bfv_params.coeff_modulus_bits: {:?}",
            self.item_params.felts_per_item,
            self.table_params.table_size,
            self.table_params.max_items_per_bin,
            self.table_params.hash_func_count,
            self.query_params.ps_low_degree,
            self.query_params.query_powers,
            self.bfv_params.poly_modulus_degree,
            self.bfv_params.plain_modulus,
            self.bfv_params.coeff_modulus_bits,
        )
    }
}

// ---------------------------- JSON helpers ----------------------------

fn json_object<'a>(
    parent: &'a serde_json::Value,
    name: &str,
) -> Result<&'a serde_json::Value, ParamsError> {
    parent
        .get(name)
        .filter(|v| !v.is_null())
        .ok_or_else(|| ParamsError::Json(format!("{name} is not present")))
}

fn json_u32(parent: &serde_json::Value, name: &str) -> Result<u32, ParamsError> {
    parent
        .get(name)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| ParamsError::Json(format!("{name} should be an unsigned int32")))
}

// ---------------------------- Batching prime search ----------------------------

/// The largest `bit_size`-bit prime congruent to 1 modulo
/// `2·poly_modulus_degree`, i.e. a plain modulus enabling batching.
pub fn batching_prime(poly_modulus_degree: u64, bit_size: u32) -> Result<u64, ParamsError> {
    let no_prime = ParamsError::NoBatchingPrime {
        poly_modulus_degree,
        bit_size,
    };
    if !(2..=62).contains(&bit_size) || poly_modulus_degree < 2 {
        return Err(no_prime);
    }
    let factor = 2 * poly_modulus_degree;
    let upper = (1u64 << bit_size) - 1;
    let lower = 1u64 << (bit_size - 1);

    // Largest candidate ≡ 1 (mod factor) below 2^bit_size, stepping down.
    let mut candidate = (upper - 1) / factor * factor + 1;
    while candidate > lower {
        if is_prime(candidate) {
            return Ok(candidate);
        }
        match candidate.checked_sub(factor) {
            Some(next) => candidate = next,
            None => break,
        }
    }
    Err(no_prime)
}

// ============================================================================
// Test parameter sets
// ============================================================================

/// A small parameter set shared by tests across the crate: 64-slot
/// ciphertexts, 8 felts per item over `p = 65537`, 8 bundle indices.
#[cfg(test)]
pub(crate) fn test_params(ps_low_degree: u32, query_powers: &[u32]) -> PsiParams {
    PsiParams::new(
        ItemParams { felts_per_item: 8 },
        TableParams {
            table_size: 64,
            max_items_per_bin: 16,
            hash_func_count: 3,
        },
        QueryParams {
            ps_low_degree,
            query_powers: query_powers.iter().copied().collect(),
        },
        BfvParams {
            poly_modulus_degree: 64,
            plain_modulus: 65537,
            coeff_modulus_bits: vec![50, 40, 40, 50],
        },
    )
    .unwrap()
}

// ============================================================================
// Tests
// ============================================================================
