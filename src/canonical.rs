//! Canonical serialization for deterministic fingerprints.
//!
//! Fingerprints are xxh64 over compact `serde_json` bytes. Anything hashed
//! here must serialize deterministically: struct fields in declaration
//! order, `BTreeMap`/`BTreeSet` for keyed data, never `HashMap`.

use serde::Serialize;
use xxhash_rust::xxh64::xxh64;

/// Serialize a value to canonical JSON bytes.
///
/// Only called on crate types whose `Serialize` impls are derived and
/// cannot fail.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("Canonical serialization failed")
}

/// Canonical xxh64 hash of a value.
pub fn canonical_hash<T: Serialize>(value: &T) -> u64 {
    xxh64(&to_canonical_bytes(value), 0)
}

/// Canonical hash as 16 hex digits.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> String {
    format!("{:016x}", canonical_hash(value))
}

/// Order-insensitive fingerprint of a collection of fingerprints.
pub fn set_fingerprint<I, S>(fingerprints: I) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut all: Vec<String> = fingerprints.into_iter().map(Into::into).collect();
    all.sort();
    canonical_hash_hex(&all)
}
