//! Error taxonomy shared by the relay components.
//!
//! Chain reads fail with [`ChainError`] and are retried. Submission failures
//! are [`SubmitError`] and stay contained to the request that produced them.
//! Only [`FatalError`] ends the process.

use alloy_primitives::{B256, U256};
use std::time::Duration;
use thiserror::Error;

/// Exit status for an unrecoverable entropy failure.
pub const EXIT_ENTROPY: u8 = 1;
/// Exit status for a configuration error detected at startup.
pub const EXIT_CONFIGURATION: u8 = 2;

/// A failed JSON-RPC interaction with a chain node.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("{method} timed out")]
    Timeout { method: &'static str },

    #[error("{method} transport failed: {message}")]
    Transport { method: &'static str, message: String },

    #[error("{method} returned rpc error {code}: {message}")]
    Rpc {
        method: &'static str,
        code: i64,
        message: String,
    },

    #[error("failed to decode {method} response: {message}")]
    Decode { method: &'static str, message: String },
}

impl ChainError {
    /// Whether another endpoint might answer where this one did not.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }
}

/// The secure random number generator could not produce output.
#[derive(Debug, Error)]
#[error("secure entropy source unavailable: {0}")]
pub struct EntropyError(pub String);

/// Why a fulfillment did not land.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("nonce {nonce} rejected as stale: {message}")]
    StaleNonce { nonce: u64, message: String },

    #[error("insufficient funds for fulfillment gas: {0}")]
    InsufficientFunds(String),

    #[error("broadcast rejected: {0}")]
    Rejected(String),

    #[error("failed to sign fulfillment: {0}")]
    Signing(String),

    #[error("transaction {tx_hash} not mined within {timeout:?}")]
    ConfirmationTimeout { tx_hash: B256, timeout: Duration },

    #[error("transaction {tx_hash} reverted while request {request_id} is still pending")]
    Reverted { request_id: U256, tx_hash: B256 },
}

/// Conditions that terminate the process.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("configuration error: {0:#}")]
    Configuration(anyhow::Error),

    #[error(transparent)]
    Entropy(#[from] EntropyError),
}

impl FatalError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Configuration(_) => EXIT_CONFIGURATION,
            Self::Entropy(_) => EXIT_ENTROPY,
        }
    }
}
