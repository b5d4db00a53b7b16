//! Deterministic checksums for render-frames.
//!
//! Two clients holding the same render-frame must compute the same checksum,
//! so the hash cannot use `std`'s randomly seeded hasher. Values are
//! serialized with bincode using fixed-width integers, then hashed with
//! FNV-1a.
//!
//! ```
//! use rollback_chaser::checksum::compute_checksum;
//!
//! let a = compute_checksum(&(1u32, "left")).expect("serializes");
//! let b = compute_checksum(&(1u32, "left")).expect("serializes");
//! assert_eq!(a, b);
//! ```

use std::fmt;
use std::hash::Hasher;

use serde::Serialize;

/// FNV-1a 64-bit offset basis constant.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime constant.
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// FNV-1a hasher with a fixed seed.
#[derive(Debug, Clone)]
pub struct DeterministicHasher {
    state: u64,
}

impl DeterministicHasher {
    /// Creates a hasher at the FNV-1a offset basis.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }
}

impl Default for DeterministicHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for DeterministicHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }
}

/// Errors that can occur during checksum computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumError {
    /// Serialization of the value failed.
    SerializationFailed(String),
}

impl fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializationFailed(message) => {
                write!(f, "checksum serialization failed: {message}")
            },
        }
    }
}

impl std::error::Error for ChecksumError {}

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Computes a deterministic checksum of a serializable value.
pub fn compute_checksum<T: Serialize>(value: &T) -> Result<u128, ChecksumError> {
    let bytes = bincode::serde::encode_to_vec(value, config())
        .map_err(|err| ChecksumError::SerializationFailed(err.to_string()))?;
    Ok(hash_bytes_fnv1a(&bytes))
}

/// FNV-1a of raw bytes, widened to `u128`.
#[inline]
#[must_use]
pub fn hash_bytes_fnv1a(bytes: &[u8]) -> u128 {
    let mut hasher = DeterministicHasher::new();
    hasher.write(bytes);
    u128::from(hasher.finish())
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_vector() {
        // FNV-1a 64 of the empty input is the offset basis.
        assert_eq!(hash_bytes_fnv1a(b""), u128::from(FNV_OFFSET_BASIS));
        assert_eq!(hash_bytes_fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn checksum_distinguishes_values() {
        let a = compute_checksum(&(3i32, 4i32)).unwrap();
        let b = compute_checksum(&(4i32, 3i32)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn fixed_int_encoding_is_width_sensitive() {
        assert_ne!(
            compute_checksum(&1u8).unwrap(),
            compute_checksum(&1u32).unwrap()
        );
    }
}
