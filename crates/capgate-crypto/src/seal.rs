//! Authority seals
//!
//! A seal is 256 bits from the system CSPRNG. Every capability object an
//! authority hands out carries a shared reference to the authority's seal;
//! authenticity is a constant-time comparison against it. The bytes live in
//! `Zeroizing<>` so they are scrubbed when the last reference drops.

use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use zeroize::Zeroizing;

/// 256-bit seal (32 bytes)
pub const SEAL_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum SealError {
    #[error("System random number generator unavailable")]
    RandomUnavailable,
}

/// Per-authority secret value.
///
/// Not `Clone`; holders share it through `Arc<Seal>`.
pub struct Seal {
    bytes: Zeroizing<[u8; SEAL_SIZE]>,
}

impl Seal {
    /// Generate a fresh seal from the system CSPRNG
    pub fn generate() -> Result<Self, SealError> {
        let mut bytes = Zeroizing::new([0u8; SEAL_SIZE]);
        SystemRandom::new()
            .fill(bytes.as_mut())
            .map_err(|_| SealError::RandomUnavailable)?;
        Ok(Self { bytes })
    }

    /// Constant-time equality
    pub fn matches(&self, other: &Seal) -> bool {
        ring::constant_time::verify_slices_are_equal(self.bytes.as_ref(), other.bytes.as_ref())
            .is_ok()
    }

    /// Short, non-reversible identifier that is safe to put in logs.
    pub fn fingerprint(&self) -> String {
        let hash = digest::digest(&digest::SHA256, self.bytes.as_ref());
        hash.as_ref()[..6]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

impl std::fmt::Debug for Seal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seal")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_matches_itself() {
        let seal = Seal::generate().unwrap();
        assert!(seal.matches(&seal));
    }

    #[test]
    fn test_independent_seals_differ() {
        let a = Seal::generate().unwrap();
        let b = Seal::generate().unwrap();
        assert!(!a.matches(&b));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_debug_does_not_leak_bytes() {
        let seal = Seal::generate().unwrap();
        let rendered = format!("{:?}", seal);
        assert!(rendered.contains(&seal.fingerprint()));
        assert_eq!(seal.fingerprint().len(), 12);
    }
}
