//! The random-number source collaborator (spec.md §6: `random.get() -> u32`).
//! Out of scope per spec.md §1 beyond its interface; this module supplies
//! one concrete OS-backed implementation plus a deterministic test double.

use crate::error::Result;

pub trait NonceSource: Send + Sync {
    /// Generate a fresh 32-bit nonce. Fallible per spec.md §4.3.1 step 1
    /// ("On failure → propagate"), even though this crate's single
    /// concrete source (`rand`) never actually fails.
    fn next_nonce(&self) -> Result<u32>;
}

pub struct OsNonceSource;

impl NonceSource for OsNonceSource {
    fn next_nonce(&self) -> Result<u32> {
        Ok(rand::random())
    }
}

/// Always returns the same nonce; used by handshake/worker/core tests that
/// need a predictable expected response.
#[cfg(test)]
pub struct FixedNonceSource(pub u32);

#[cfg(test)]
impl NonceSource for FixedNonceSource {
    fn next_nonce(&self) -> Result<u32> {
        Ok(self.0)
    }
}
