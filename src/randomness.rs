//! Seed generation for fulfillments.
//!
//! Seeds are trusted, not verifiable: the relay draws them from the
//! operating system CSPRNG and the coordinator accepts them as given.

use alloy_primitives::U256;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::EntropyError;

/// Source of uniformly distributed 256-bit seeds.
pub trait RandomnessSource: Send + Sync {
    /// A uniform integer in `[0, 2^256)`.
    fn generate(&self) -> Result<U256, EntropyError>;
}

/// Seeds straight from the OS entropy pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandomness;

impl RandomnessSource for OsRandomness {
    fn generate(&self) -> Result<U256, EntropyError> {
        let mut bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| EntropyError(e.to_string()))?;
        Ok(U256::from_be_bytes(bytes))
    }
}
