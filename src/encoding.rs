//! Algebraic encoding of items and labels
//!
//! Hashed items and encrypted labels cross into the match engine as bit
//! strings and live inside it as sequences of field elements modulo the
//! plaintext prime `p`. The packing is fixed:
//!
//! - `bits_per_felt = ⌊log2 p⌋` bits go into each element (the largest `n`
//!   with `2ⁿ ≤ p`, so every packed value is a valid residue);
//! - bits are consumed little-endian across the input (bit `i` of the stream
//!   is bit `i mod 8` of byte `i / 8`), and the final element is
//!   zero-padded.
//!
//! For labeled bins the label is algebraized independently, padded to a
//! multiple of the item length, and **transposed** so that entry `i` of the
//! result carries item felt `i` together with the `i`-th column of label
//! felts. The receiver can then concatenate the label parts it recovers per
//! item felt without any reindexing.

#![forbid(unsafe_code)]

use crate::{AlgItem, AlgItemLabel, EncryptedLabel, Felt, HashedItem};

/// Errors surfaced by the encoder.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("modulus cannot be zero")]
    ZeroModulus,
    #[error("input field elements cannot be empty")]
    EmptyInput,
    #[error("bit count {bit_count} exceeds the {max_bits} bits the input holds")]
    BitCountTooLarge { bit_count: u32, max_bits: u32 },
    #[error("bit count {bit_count} would ignore whole input elements")]
    BitCountSkipsElements { bit_count: u32 },
    #[error("buffer holds {len} bytes but {bit_count} bits require exactly {expected}")]
    BadBufferLength {
        len: usize,
        bit_count: u32,
        expected: usize,
    },
    #[error("item bit count {0} is out of range (must be in [1, 128])")]
    BadItemBitCount(u32),
}

/// A borrowed byte buffer interpreted as exactly `bit_count` bits.
#[derive(Clone, Copy, Debug)]
pub struct BitstringView<'a> {
    data: &'a [u8],
    bit_count: u32,
}

impl<'a> BitstringView<'a> {
    /// Wrap `data` as a view of exactly `bit_count` bits.
    ///
    /// The buffer must be exactly `⌈bit_count / 8⌉` bytes long.
    pub fn new(data: &'a [u8], bit_count: u32) -> Result<Self, EncodingError> {
        let expected = ((bit_count as usize) + 7) / 8;
        if bit_count == 0 || data.len() != expected {
            return Err(EncodingError::BadBufferLength {
                len: data.len(),
                bit_count,
                expected,
            });
        }
        Ok(Self { data, bit_count })
    }

    /// Number of bits in the view.
    #[inline]
    pub fn bit_count(&self) -> u32 {
        self.bit_count
    }

    /// The underlying bytes (the final byte may carry padding bits).
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// An owned byte buffer interpreted as exactly `bit_count` bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitstring {
    data: Vec<u8>,
    bit_count: u32,
}

impl Bitstring {
    /// Wrap `data` as exactly `bit_count` bits; same shape rule as
    /// [`BitstringView::new`].
    pub fn new(data: Vec<u8>, bit_count: u32) -> Result<Self, EncodingError> {
        let expected = ((bit_count as usize) + 7) / 8;
        if bit_count == 0 || data.len() != expected {
            return Err(EncodingError::BadBufferLength {
                len: data.len(),
                bit_count,
                expected,
            });
        }
        Ok(Self { data, bit_count })
    }

    /// Number of bits.
    #[inline]
    pub fn bit_count(&self) -> u32 {
        self.bit_count
    }

    /// Borrow as a view.
    pub fn to_view(&self) -> BitstringView<'_> {
        BitstringView {
            data: &self.data,
            bit_count: self.bit_count,
        }
    }

    /// Consume, returning the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

// ---------------------------- Bit-level copies ----------------------------

/// Read `count ≤ 64` bits starting at `bit_offset`, little-endian.
fn read_bits(src: &[u8], bit_offset: u32, count: u32) -> u64 {
    debug_assert!(count <= 64);
    debug_assert!((bit_offset + count) as usize <= src.len() * 8);

    let mut out: u64 = 0;
    let mut filled: u32 = 0;
    let mut byte_idx = (bit_offset / 8) as usize;
    let mut in_byte = bit_offset % 8;

    while filled < count {
        let take = (8 - in_byte).min(count - filled);
        let mask: u8 = if take == 8 {
            0xff
        } else {
            ((1u16 << take) - 1) as u8
        };
        let bits = (src[byte_idx] >> in_byte) & mask;
        out |= (bits as u64) << filled;
        filled += take;
        byte_idx += 1;
        in_byte = 0;
    }
    out
}

/// Write the low `count ≤ 64` bits of `value` starting at `bit_offset`,
/// little-endian; other bits of `dst` are left untouched.
fn write_bits(dst: &mut [u8], bit_offset: u32, count: u32, mut value: u64) {
    debug_assert!(count <= 64);
    debug_assert!((bit_offset + count) as usize <= dst.len() * 8);

    let mut remaining = count;
    let mut byte_idx = (bit_offset / 8) as usize;
    let mut in_byte = bit_offset % 8;

    while remaining > 0 {
        let put = (8 - in_byte).min(remaining);
        let mask: u8 = if put == 8 {
            0xff
        } else {
            ((1u16 << put) - 1) as u8
        };
        let bits = (value as u8) & mask;
        dst[byte_idx] = (dst[byte_idx] & !(mask << in_byte)) | (bits << in_byte);
        value >>= put;
        remaining -= put;
        byte_idx += 1;
        in_byte = 0;
    }
}

/// The largest `n` such that `2ⁿ ≤ p`: how many bits one felt can carry.
#[inline]
pub fn bits_per_felt(p: u64) -> u32 {
    debug_assert!(p > 1);
    (64 - p.leading_zeros()) - 1
}

// ---------------------------- Felt packing ----------------------------

/// Pack a bit string into field elements, `bits_per_felt` bits apiece.
///
/// The final element is zero-padded when the bit count is not a multiple of
/// `bits_per_felt`. Every produced value is `< 2^bits_per_felt ≤ p`.
pub fn bits_to_felts(bits: BitstringView<'_>, p: u64) -> Result<Vec<Felt>, EncodingError> {
    if p == 0 {
        return Err(EncodingError::ZeroModulus);
    }
    let bpf = bits_per_felt(p);
    let num_felts = (bits.bit_count() + bpf - 1) / bpf;

    let mut felts = Vec::with_capacity(num_felts as usize);
    let mut uncopied = bits.bit_count();
    for j in 0..num_felts {
        let copy_size = bpf.min(uncopied);
        felts.push(read_bits(bits.data(), j * bpf, copy_size));
        uncopied -= copy_size;
    }
    Ok(felts)
}

/// Unpack field elements into a bit string of exactly `bit_count` bits.
///
/// `bit_count` must not exceed what the elements hold, and must not be so
/// small that whole input elements are ignored.
pub fn felts_to_bits(felts: &[Felt], bit_count: u32, p: u64) -> Result<Bitstring, EncodingError> {
    if felts.is_empty() {
        return Err(EncodingError::EmptyInput);
    }
    if p == 0 {
        return Err(EncodingError::ZeroModulus);
    }
    let bpf = bits_per_felt(p);
    let max_bits = bpf
        .checked_mul(felts.len() as u32)
        .ok_or(EncodingError::BitCountTooLarge {
            bit_count,
            max_bits: u32::MAX,
        })?;
    if bit_count > max_bits {
        return Err(EncodingError::BitCountTooLarge {
            bit_count,
            max_bits,
        });
    }
    if bit_count <= max_bits - bpf {
        return Err(EncodingError::BitCountSkipsElements { bit_count });
    }

    let mut buf = vec![0u8; ((bit_count as usize) + 7) / 8];
    let mut uncopied = bit_count;
    let mut offset = 0u32;
    for &felt in felts {
        let copy_size = bpf.min(uncopied);
        write_bits(&mut buf, offset, copy_size, felt);
        offset += copy_size;
        uncopied -= copy_size;
    }
    Bitstring::new(buf, bit_count)
}

// ---------------------------- Item / label encoding ----------------------------

/// Algebraize the first `item_bit_count` bits of a hashed item.
pub fn algebraize_item(
    item: &HashedItem,
    item_bit_count: u32,
    p: u64,
) -> Result<AlgItem, EncodingError> {
    if item_bit_count == 0 || item_bit_count > 128 {
        return Err(EncodingError::BadItemBitCount(item_bit_count));
    }
    let byte_count = ((item_bit_count as usize) + 7) / 8;
    let view = BitstringView::new(&item.0[..byte_count], item_bit_count)?;
    bits_to_felts(view, p)
}

/// Inverse of [`algebraize_item`]: reassemble the 128-bit item,
/// zero-extending past `item_bit_count`.
pub fn dealgebraize_item(
    alg_item: &[Felt],
    item_bit_count: u32,
    p: u64,
) -> Result<HashedItem, EncodingError> {
    if item_bit_count == 0 || item_bit_count > 128 {
        return Err(EncodingError::BadItemBitCount(item_bit_count));
    }
    let bits = felts_to_bits(alg_item, item_bit_count, p)?;
    let mut out = [0u8; 16];
    let bytes = bits.into_bytes();
    out[..bytes.len()].copy_from_slice(&bytes);
    Ok(HashedItem(out))
}

/// Algebraize an item together with its encrypted label.
///
/// The label is packed independently, padded with zero felts to a multiple
/// of the item length, and transposed: entry `i` of the result carries item
/// felt `i` plus label felts `{i, i + felts_per_item, i + 2·felts_per_item,
/// …}`. The per-entry label vectors all have length `label_size =
/// ⌈label_felts / felts_per_item⌉`.
pub fn algebraize_item_label(
    item: &HashedItem,
    label: &EncryptedLabel,
    item_bit_count: u32,
    p: u64,
) -> Result<AlgItemLabel, EncodingError> {
    let alg_item = algebraize_item(item, item_bit_count, p)?;
    let felts_per_item = alg_item.len();

    // Unlabeled mode: every entry carries an empty label vector.
    if label.is_empty() {
        return Ok(alg_item.into_iter().map(|f| (f, Vec::new())).collect());
    }

    let label_view = BitstringView::new(label, (label.len() * 8) as u32)?;
    let mut alg_label = bits_to_felts(label_view, p)?;

    // Pad to a whole number of item-sized chunks; label_size counts chunks.
    let label_size = (alg_label.len() + felts_per_item - 1) / felts_per_item;
    alg_label.resize(label_size * felts_per_item, 0);

    // Transpose so the receiver can concatenate recovered parts in order.
    let mut out = Vec::with_capacity(felts_per_item);
    for felt_idx in 0..felts_per_item {
        let mut parts = Vec::with_capacity(label_size);
        for chunk_idx in 0..label_size {
            parts.push(alg_label[chunk_idx * felts_per_item + felt_idx]);
        }
        out.push((alg_item[felt_idx], parts));
    }
    Ok(out)
}

/// Inverse of the label packing: turn aligned label felts back into bytes.
///
/// `label_bit_count` is the total number of packed bits (normally
/// `alg_label.len() · bits_per_felt`); the caller truncates the result to
/// the effective byte count.
pub fn dealgebraize_label(
    alg_label: &[Felt],
    label_bit_count: u32,
    p: u64,
) -> Result<Vec<u8>, EncodingError> {
    Ok(felts_to_bits(alg_label, label_bit_count, p)?.into_bytes())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const P: u64 = 65537; // bits_per_felt = 16

    #[test]
    fn bits_per_felt_is_floor_log2() {
        assert_eq!(bits_per_felt(65537), 16);
        assert_eq!(bits_per_felt(65536), 16);
        assert_eq!(bits_per_felt(65535), 15);
        assert_eq!(bits_per_felt(2), 1);
    }

    #[test]
    fn read_write_bits_roundtrip_unaligned() {
        let mut buf = vec![0u8; 8];
        write_bits(&mut buf, 3, 13, 0b1_0110_1101_0101);
        assert_eq!(read_bits(&buf, 3, 13), 0b1_0110_1101_0101);
        // Neighbouring bits untouched.
        assert_eq!(read_bits(&buf, 0, 3), 0);
        assert_eq!(read_bits(&buf, 16, 8), 0);
    }

    #[test]
    fn bits_felts_roundtrip() {
        let data: Vec<u8> = (0u8..16).collect();
        let view = BitstringView::new(&data, 128).unwrap();
        let felts = bits_to_felts(view, P).unwrap();
        assert_eq!(felts.len(), 8);
        for &f in &felts {
            assert!(f < P);
        }

        let back = felts_to_bits(&felts, 128, P).unwrap();
        assert_eq!(back.into_bytes(), data);
    }

    #[test]
    fn felts_to_bits_rejects_bad_bit_counts() {
        let felts = vec![1u64, 2, 3];
        // Exceeds capacity (3 × 16 = 48).
        assert!(matches!(
            felts_to_bits(&felts, 49, P),
            Err(EncodingError::BitCountTooLarge { .. })
        ));
        // Ignores the last element entirely (32 ≤ 48 − 16).
        assert!(matches!(
            felts_to_bits(&felts, 32, P),
            Err(EncodingError::BitCountSkipsElements { .. })
        ));
        // Partial use of the last element is fine.
        assert!(felts_to_bits(&felts, 33, P).is_ok());
    }

    #[test]
    fn item_roundtrip_full_width() {
        let item = HashedItem::from((0x0123_4567_89ab_cdef, 0xfedc_ba98_7654_3210));
        let alg = algebraize_item(&item, 128, P).unwrap();
        assert_eq!(alg.len(), 8);
        let back = dealgebraize_item(&alg, 128, P).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn item_roundtrip_partial_width_zero_extends() {
        // 80 bits at 16 bits/felt → 5 felts; the reassembled item keeps only
        // the low 80 bits.
        let item = HashedItem::from((u64::MAX, u64::MAX));
        let alg = algebraize_item(&item, 80, P).unwrap();
        assert_eq!(alg.len(), 5);
        let back = dealgebraize_item(&alg, 80, P).unwrap();
        let (lo, hi) = back.words();
        assert_eq!(lo, u64::MAX);
        assert_eq!(hi, 0xffff); // bits 64..80 survive, the rest is zero
    }

    #[test]
    fn item_label_transpose_shape_and_content() {
        let item = HashedItem::from((7, 9));
        let label: EncryptedLabel = (0u8..12).collect(); // 96 bits → 6 felts
        let alg = algebraize_item_label(&item, &label, 128, P).unwrap();

        // felts_per_item = 8; 6 label felts pad to 8 → label_size = 1.
        assert_eq!(alg.len(), 8);
        for (_, parts) in &alg {
            assert_eq!(parts.len(), 1);
        }

        // Reassembling column-major must reproduce the label bytes.
        let label_felts: Vec<Felt> = alg.iter().map(|(_, parts)| parts[0]).collect();
        let bytes = dealgebraize_label(&label_felts, 8 * 16, P).unwrap();
        assert_eq!(&bytes[..12], &label[..]);
        assert!(bytes[12..].iter().all(|&b| b == 0));
    }

    #[test]
    fn long_label_produces_multiple_chunks() {
        let item = HashedItem::from((1, 2));
        let label: EncryptedLabel = vec![0xab; 20]; // 160 bits → 10 felts → 2 chunks
        let alg = algebraize_item_label(&item, &label, 128, P).unwrap();
        assert_eq!(alg.len(), 8);
        for (_, parts) in &alg {
            assert_eq!(parts.len(), 2);
        }

        // Un-transpose and unpack.
        let mut label_felts = Vec::new();
        for chunk_idx in 0..2 {
            for entry in &alg {
                label_felts.push(entry.1[chunk_idx]);
            }
        }
        let bytes = dealgebraize_label(&label_felts, 16 * 16, P).unwrap();
        assert_eq!(&bytes[..20], &label[..]);
    }

    #[test]
    fn empty_label_yields_empty_part_vectors() {
        let item = HashedItem::from((1, 2));
        let alg = algebraize_item_label(&item, &Vec::new(), 128, P).unwrap();
        assert_eq!(alg.len(), 8);
        assert!(alg.iter().all(|(_, parts)| parts.is_empty()));
    }
}
