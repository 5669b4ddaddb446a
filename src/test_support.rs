//! In-memory coordinator and recording collaborators for tests.
//!
//! [`MockCoordinator`] behaves like a coordinator contract on a chain that
//! mines every accepted transaction into the next block. Several relays can
//! share one coordinator through per-sender [`MockChain`] handles.

use alloy_primitives::{Address, B256, U256, keccak256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::abi::{self, FulfilledLog};
use crate::chain::{CoordinatorChain, TxReceipt, VrfLogs};
use crate::error::{ChainError, EntropyError};
use crate::keys::Wallet;
use crate::notify::{AlertSink, FulfillmentReport, FulfillmentSink, Severity};
use crate::randomness::RandomnessSource;
use crate::request::RandomnessRequest;
use crate::tx;

/// A transaction the mock coordinator accepted and mined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub sender: Address,
    pub nonce: u64,
    pub request_id: U256,
    pub seed: U256,
    pub block_number: u64,
    pub success: bool,
}

#[derive(Debug, Default)]
struct MockState {
    latest_block: u64,
    requests: Vec<RandomnessRequest>,
    fulfilled: Vec<FulfilledLog>,
    pending: HashSet<U256>,
    nonces: HashMap<Address, u64>,
    receipts: HashMap<B256, TxReceipt>,
    submissions: Vec<Submission>,
    log_queries: Vec<(u64, u64)>,
    failing_reads: u32,
    stale_commitment_reads: u32,
    hide_fulfilled_logs: bool,
    dropped_broadcasts: u32,
    panic_on_request: Option<U256>,
}

#[derive(Clone, Default)]
pub struct MockCoordinator {
    state: Arc<Mutex<MockState>>,
}

impl MockCoordinator {
    pub fn new(latest_block: u64) -> Self {
        let mock = Self::default();
        mock.state.lock().unwrap().latest_block = latest_block;
        mock
    }

    /// A chain handle whose broadcasts are attributed to `sender`.
    pub fn chain_for(&self, sender: Address) -> Arc<MockChain> {
        Arc::new(MockChain {
            state: Arc::clone(&self.state),
            sender,
        })
    }

    /// Emit a `RandomWordsRequested` log and mark the request pending.
    pub fn add_request(&self, request: RandomnessRequest) {
        let mut state = self.state.lock().unwrap();
        state.pending.insert(request.request_id);
        state.requests.push(request);
    }

    pub fn latest_block(&self) -> u64 {
        self.state.lock().unwrap().latest_block
    }

    pub fn advance_blocks(&self, blocks: u64) {
        self.state.lock().unwrap().latest_block += blocks;
    }

    pub fn set_transaction_count(&self, sender: Address, count: u64) {
        self.state.lock().unwrap().nonces.insert(sender, count);
    }

    /// Fail the next `count` block-number and log reads.
    pub fn fail_next_reads(&self, count: u32) {
        self.state.lock().unwrap().failing_reads = count;
    }

    /// Report fulfilled requests as still pending for the next `count`
    /// commitment reads, like a node that lags behind the chain head.
    pub fn stale_commitment_reads(&self, count: u32) {
        self.state.lock().unwrap().stale_commitment_reads = count;
    }

    pub fn hide_fulfilled_logs(&self, hide: bool) {
        self.state.lock().unwrap().hide_fulfilled_logs = hide;
    }

    /// Accept the next `count` broadcasts without ever mining them, like a
    /// node that loses the transaction.
    pub fn drop_next_broadcasts(&self, count: u32) {
        self.state.lock().unwrap().dropped_broadcasts = count;
    }

    /// Panic inside `broadcast` when this request is submitted.
    pub fn panic_on(&self, request_id: U256) {
        self.state.lock().unwrap().panic_on_request = Some(request_id);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn successful_fulfillments(&self, request_id: U256) -> usize {
        self.state
            .lock()
            .unwrap()
            .submissions
            .iter()
            .filter(|s| s.request_id == request_id && s.success)
            .count()
    }

    pub fn is_pending(&self, request_id: U256) -> bool {
        self.state.lock().unwrap().pending.contains(&request_id)
    }

    pub fn log_queries(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().log_queries.clone()
    }
}

pub struct MockChain {
    state: Arc<Mutex<MockState>>,
    sender: Address,
}

impl MockChain {
    fn failing_read(&self, method: &'static str) -> Result<(), ChainError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(ChainError::Transport {
                method,
                message: "connection refused".into(),
            });
        }
        Ok(())
    }
}

fn rpc_error(message: &str) -> ChainError {
    ChainError::Rpc {
        method: "eth_sendRawTransaction",
        code: -32000,
        message: message.into(),
    }
}

#[async_trait]
impl CoordinatorChain for MockChain {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        self.failing_read("eth_blockNumber")?;
        Ok(self.state.lock().unwrap().latest_block)
    }

    async fn vrf_logs(&self, from_block: u64, to_block: u64) -> Result<VrfLogs, ChainError> {
        self.failing_read("eth_getLogs")?;
        let mut state = self.state.lock().unwrap();
        state.log_queries.push((from_block, to_block));
        let in_range = |block: u64| (from_block..=to_block).contains(&block);
        let requested = state
            .requests
            .iter()
            .filter(|r| in_range(r.block_number))
            .cloned()
            .collect();
        let fulfilled = if state.hide_fulfilled_logs {
            Vec::new()
        } else {
            state
                .fulfilled
                .iter()
                .filter(|f| in_range(f.block_number))
                .cloned()
                .collect()
        };
        Ok(VrfLogs {
            requested,
            fulfilled,
        })
    }

    async fn commitment(&self, request_id: U256) -> Result<B256, ChainError> {
        let mut state = self.state.lock().unwrap();
        let known = state.requests.iter().any(|r| r.request_id == request_id);
        let pending = state.pending.contains(&request_id);
        if pending {
            return Ok(keccak256(request_id.to_be_bytes::<32>()));
        }
        if known && state.stale_commitment_reads > 0 {
            state.stale_commitment_reads -= 1;
            return Ok(keccak256(request_id.to_be_bytes::<32>()));
        }
        Ok(B256::ZERO)
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .nonces
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<B256, ChainError> {
        let (nonce, input) = tx::decode_nonce_and_input(raw_tx)
            .map_err(|e| rpc_error(&format!("invalid transaction: {e}")))?;
        let (request_id, seed) =
            abi::decode_fulfill(&input).ok_or_else(|| rpc_error("unknown calldata"))?;

        let panic_on = self.state.lock().unwrap().panic_on_request;
        if panic_on == Some(request_id) {
            panic!("mock node crashed on request {request_id}");
        }

        let mut state = self.state.lock().unwrap();
        if state.dropped_broadcasts > 0 {
            state.dropped_broadcasts -= 1;
            return Ok(keccak256(raw_tx));
        }
        let expected = state.nonces.get(&self.sender).copied().unwrap_or_default();
        if nonce < expected {
            return Err(rpc_error("nonce too low"));
        }
        if nonce > expected {
            return Err(rpc_error("nonce too high"));
        }

        state.latest_block += 1;
        let block_number = state.latest_block;
        state.nonces.insert(self.sender, expected + 1);
        let success = state.pending.remove(&request_id);
        if success {
            state.fulfilled.push(FulfilledLog {
                request_id,
                block_number,
                success: true,
            });
        }

        let tx_hash = keccak256(raw_tx);
        state.receipts.insert(
            tx_hash,
            TxReceipt {
                tx_hash,
                block_number,
                success,
            },
        );
        state.submissions.push(Submission {
            sender: self.sender,
            nonce,
            request_id,
            seed,
            block_number,
            success,
        });
        Ok(tx_hash)
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ChainError> {
        Ok(self.state.lock().unwrap().receipts.get(&tx_hash).copied())
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<(Severity, String)>>,
}

impl RecordingAlerts {
    pub fn all(&self) -> Vec<(Severity, String)> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn with_severity(&self, severity: Severity) -> Vec<String> {
        self.all()
            .into_iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, m)| m)
            .collect()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn notify(&self, severity: Severity, message: &str) {
        self.alerts
            .lock()
            .unwrap()
            .push((severity, message.to_string()));
    }
}

#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<FulfillmentReport>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<FulfillmentReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl FulfillmentSink for RecordingSink {
    async fn report(&self, report: &FulfillmentReport) {
        self.reports.lock().unwrap().push(report.clone());
    }
}

/// Hands out 1, 2, 3, ... so tests can tell seeds apart.
#[derive(Default)]
pub struct CountingRandomness {
    next: Mutex<u64>,
}

impl RandomnessSource for CountingRandomness {
    fn generate(&self) -> Result<U256, EntropyError> {
        let mut next = self.next.lock().unwrap();
        *next += 1;
        Ok(U256::from(*next))
    }
}

pub struct FailingRandomness;

impl RandomnessSource for FailingRandomness {
    fn generate(&self) -> Result<U256, EntropyError> {
        Err(EntropyError("getrandom: device not configured".into()))
    }
}

/// A wallet with a deterministic secret derived from `seed`.
pub fn test_wallet(seed: u8) -> Wallet {
    Wallet::from_secret(&[seed; 32]).unwrap()
}
