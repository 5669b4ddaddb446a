//! The relay's view of the coordinator chain.
//!
//! [`CoordinatorChain`] is the seam between relay logic and the JSON-RPC
//! transport in [`crate::rpc`]; tests drive the relay through an in-memory
//! coordinator instead.

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;

use crate::abi::FulfilledLog;
use crate::error::ChainError;
use crate::request::RandomnessRequest;

/// Coordinator logs from one block range, in chain order.
#[derive(Debug, Clone, Default)]
pub struct VrfLogs {
    pub requested: Vec<RandomnessRequest>,
    pub fulfilled: Vec<FulfilledLog>,
}

/// The subset of a transaction receipt the relay needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub success: bool,
}

#[async_trait]
pub trait CoordinatorChain: Send + Sync {
    async fn latest_block(&self) -> Result<u64, ChainError>;

    /// Requested and fulfilled logs in `[from_block, to_block]`.
    async fn vrf_logs(&self, from_block: u64, to_block: u64) -> Result<VrfLogs, ChainError>;

    /// Stored commitment for a request; zero once fulfilled or if unknown.
    async fn commitment(&self, request_id: U256) -> Result<B256, ChainError>;

    /// Next nonce for `address`, counting transactions still in the mempool.
    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError>;

    /// Broadcast a signed transaction and return its hash.
    async fn broadcast(&self, raw_tx: &[u8]) -> Result<B256, ChainError>;

    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ChainError>;

    /// Whether the coordinator still waits on this request.
    async fn is_pending(&self, request_id: U256) -> Result<bool, ChainError> {
        Ok(self.commitment(request_id).await? != B256::ZERO)
    }
}
