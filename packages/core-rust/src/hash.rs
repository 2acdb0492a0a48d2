//! FNV-1a hash utilities for table schema fingerprints.
//!
//! The local store remembers one fingerprint per table. When a table's
//! declared shape changes between runs, its fingerprint changes and the store
//! upgrades that table's areas.

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes a 32-bit FNV-1a hash over raw bytes.
///
/// # Examples
///
/// ```
/// use replica_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash(b"hello"), 1_335_831_723);
/// assert_eq!(fnv1a_hash(b""), 2_166_136_261); // FNV offset basis
/// ```
#[must_use]
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hashes a sequence of string parts, separating them so that
/// `["ab", "c"]` and `["a", "bc"]` differ.
#[must_use]
pub fn fnv1a_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for part in parts {
        for &byte in part.as_bytes().iter().chain(std::iter::once(&0xFF)) {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}
