//! Geohash encoding and the bit-level distance helpers built on it.
//!
//! Standard interleaved-bit Base32 geohash: even bits split the longitude
//! range, odd bits the latitude range, five bits per output character.
//! Overlay construction never compares hashes as strings; it works on the
//! binary expansion, where the leftmost differing bit measures how early
//! two cells diverge.

use crate::NodeId;

/// The geohash Base32 alphabet (digits then consonant-ish letters,
/// skipping a, i, l, o).
pub const BASE32_ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Bits encoded per Base32 character.
pub const BITS_PER_CHAR: usize = 5;

/// Maximum supported precision (bit expansion must fit in 64 bits).
pub const MAX_PRECISION: usize = 12;

/// Index of a character in the Base32 alphabet, if valid.
pub fn char_index(c: u8) -> Option<usize> {
    BASE32_ALPHABET.iter().position(|&a| a == c)
}

/// Encode a coordinate to a geohash of `precision` characters.
///
/// Returns an empty string for zero precision.
pub fn encode(lat: f64, lon: f64, precision: usize) -> String {
    let mut hash = String::with_capacity(precision);
    let (mut lat_min, mut lat_max) = (-90.0_f64, 90.0_f64);
    let (mut lon_min, mut lon_max) = (-180.0_f64, 180.0_f64);

    let mut even = true;
    let mut bit = 0;
    let mut idx = 0usize;

    while hash.len() < precision {
        if even {
            let mid = (lon_min + lon_max) / 2.0;
            if lon >= mid {
                idx = idx * 2 + 1;
                lon_min = mid;
            } else {
                idx *= 2;
                lon_max = mid;
            }
        } else {
            let mid = (lat_min + lat_max) / 2.0;
            if lat >= mid {
                idx = idx * 2 + 1;
                lat_min = mid;
            } else {
                idx *= 2;
                lat_max = mid;
            }
        }
        even = !even;

        bit += 1;
        if bit == BITS_PER_CHAR {
            hash.push(BASE32_ALPHABET[idx] as char);
            bit = 0;
            idx = 0;
        }
    }

    hash
}

/// Decode a geohash to the midpoint of its cell as `(lat, lon)`.
///
/// Characters outside the alphabet are skipped.
pub fn decode(hash: &str) -> (f64, f64) {
    let (mut lat_min, mut lat_max) = (-90.0_f64, 90.0_f64);
    let (mut lon_min, mut lon_max) = (-180.0_f64, 180.0_f64);
    let mut even = true;

    for c in hash.bytes() {
        let Some(idx) = char_index(c) else { continue };
        for i in (0..BITS_PER_CHAR).rev() {
            let bit = (idx >> i) & 1;
            if even {
                let mid = (lon_min + lon_max) / 2.0;
                if bit == 1 {
                    lon_min = mid;
                } else {
                    lon_max = mid;
                }
            } else {
                let mid = (lat_min + lat_max) / 2.0;
                if bit == 1 {
                    lat_min = mid;
                } else {
                    lat_max = mid;
                }
            }
            even = !even;
        }
    }

    ((lat_min + lat_max) / 2.0, (lon_min + lon_max) / 2.0)
}

/// The binary expansion of a geohash, packed MSB-first into a u64.
///
/// Bit 0 of the expansion (the leftmost bit of the first character) sits
/// at the high end, so XOR plus leading-zero counting recovers the first
/// differing position directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeohashBits {
    bits: u64,
    len: u32,
}

impl GeohashBits {
    /// Expand a geohash string. Invalid characters count as index 0,
    /// matching the encoder's alphabet.
    pub fn from_hash(hash: &str) -> Self {
        debug_assert!(hash.len() <= MAX_PRECISION);
        let mut bits = 0u64;
        let mut len = 0u32;
        for c in hash.bytes() {
            let idx = char_index(c).unwrap_or(0) as u64;
            bits = (bits << BITS_PER_CHAR) | idx;
            len += BITS_PER_CHAR as u32;
        }
        GeohashBits { bits, len }
    }

    /// Number of bits in the expansion.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Render as a 0/1 string, mostly for diagnostics.
    pub fn to_bit_string(&self) -> String {
        (0..self.len)
            .map(|i| {
                if (self.bits >> (self.len - 1 - i)) & 1 == 1 {
                    '1'
                } else {
                    '0'
                }
            })
            .collect()
    }
}

/// Position of the leftmost differing bit between two equal-length
/// expansions, or `None` if they are identical.
pub fn first_diff_bit_pos(a: GeohashBits, b: GeohashBits) -> Option<usize> {
    debug_assert_eq!(a.len, b.len);
    let xor = a.bits ^ b.bits;
    if xor == 0 {
        return None;
    }
    Some(a.len as usize + xor.leading_zeros() as usize - 64)
}

/// Bucket index between two hashes: 0 for identical hashes, otherwise
/// `total_bits - first_diff_bit_pos`, so an earlier divergence (a larger
/// geographic gap) lands in a higher-numbered bucket.
pub fn bucket_index_between(a: GeohashBits, b: GeohashBits, total_bits: usize) -> usize {
    match first_diff_bit_pos(a, b) {
        None => 0,
        Some(pos) => total_bits - pos,
    }
}

/// Children of position `idx` in an implicit k-ary tree laid over a list
/// of `total` members.
pub fn kary_children(idx: usize, total: usize, k: usize) -> Vec<usize> {
    let mut children = Vec::with_capacity(k);
    for i in 1..=k {
        let child = idx * k + i;
        if child < total {
            children.push(child);
        }
    }
    children
}

/// Per-character XOR between two hashes at character position `pos`,
/// if both hashes reach it.
pub fn char_xor_at(a: &str, b: &str, pos: usize) -> Option<usize> {
    let ca = char_index(*a.as_bytes().get(pos)?)?;
    let cb = char_index(*b.as_bytes().get(pos)?)?;
    Some(ca ^ cb)
}

/// Group node ids by their full geohash, preserving ascending id order
/// within each group.
pub fn group_by_hash(hashes: &[String]) -> std::collections::HashMap<String, Vec<NodeId>> {
    let mut groups: std::collections::HashMap<String, Vec<NodeId>> =
        std::collections::HashMap::new();
    for (id, hash) in hashes.iter().enumerate() {
        groups.entry(hash.clone()).or_default().push(id);
    }
    groups
}
