//! Fulfillment engine: builds, signs and broadcasts `fulfillRandomWords`
//! transactions and waits for them to be mined.
//!
//! Submission is split in two so the caller can keep broadcasts strictly
//! sequential while confirmations run concurrently:
//! 1. [`FulfillmentSubmitter::broadcast`] checks the request is still
//!    pending, leases a nonce, signs and multisends.
//! 2. [`FulfillmentSubmitter::confirm`] polls for the receipt and reports
//!    the outcome.

use alloy_primitives::{Address, U256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::abi;
use crate::chain::{CoordinatorChain, TxReceipt};
use crate::error::{ChainError, SubmitError};
use crate::keys::Wallet;
use crate::nonce::{InFlight, NonceLease, NonceManager};
use crate::notify::{FulfillmentReport, FulfillmentSink};
use crate::request::{FulfillmentAttempt, InstanceRole, RandomnessRequest};
use crate::tx::{GasPricing, UnsignedTx};

/// Node rejections that mean our nonce counter is out of date.
const STALE_NONCE_MARKERS: &[&str] = &[
    "nonce too low",
    "nonce too high",
    "invalid nonce",
    "already known",
    "replacement transaction underpriced",
];

#[derive(Debug, Clone)]
pub struct SubmitSettings {
    pub chain_id: u64,
    pub coordinator: Address,
    pub pricing: GasPricing,
    pub gas_limit: u64,
    pub confirmation_timeout: Duration,
    pub receipt_poll_interval: Duration,
}

/// How a fulfillment ended, when it did not fail.
#[derive(Debug, Clone)]
pub enum FulfillmentOutcome {
    /// Our transaction fulfilled the request.
    Fulfilled {
        attempt: FulfillmentAttempt,
        block_number: u64,
    },
    /// The chain reported the request fulfilled before we spent gas.
    AlreadyFulfilled,
    /// Our transaction reverted because another instance got there first.
    Reverted { attempt: FulfillmentAttempt },
}

pub type TransactionResult = Result<FulfillmentOutcome, SubmitError>;

/// A broadcast transaction awaiting its receipt.
#[derive(Debug)]
pub struct PendingFulfillment {
    pub attempt: FulfillmentAttempt,
    in_flight: InFlight,
}

#[derive(Debug)]
pub enum Broadcast {
    Skipped,
    Sent(PendingFulfillment),
}

/// Owns the signing key and its nonce counter.
pub struct FulfillmentSubmitter {
    chain: Arc<dyn CoordinatorChain>,
    wallet: Wallet,
    nonces: NonceManager,
    settings: SubmitSettings,
    role: InstanceRole,
    sink: Arc<dyn FulfillmentSink>,
}

fn is_stale_nonce(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    STALE_NONCE_MARKERS.iter().any(|m| lower.contains(m))
}

impl FulfillmentSubmitter {
    pub fn new(
        chain: Arc<dyn CoordinatorChain>,
        wallet: Wallet,
        settings: SubmitSettings,
        role: InstanceRole,
        sink: Arc<dyn FulfillmentSink>,
    ) -> Self {
        let nonces = NonceManager::new(wallet.address());
        Self {
            chain,
            wallet,
            nonces,
            settings,
            role,
            sink,
        }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Broadcast then wait for the receipt.
    pub async fn submit(&self, request: &RandomnessRequest, seed: U256) -> TransactionResult {
        match self.broadcast(request, seed).await? {
            Broadcast::Skipped => Ok(FulfillmentOutcome::AlreadyFulfilled),
            Broadcast::Sent(pending) => self.confirm(request, pending).await,
        }
    }

    /// Sign and multisend a fulfillment for `request`.
    ///
    /// The nonce lock is held from lease to broadcast, so concurrent callers
    /// are served in call order.
    #[instrument(skip_all, fields(request_id = %request.request_id, role = %self.role))]
    pub async fn broadcast(
        &self,
        request: &RandomnessRequest,
        seed: U256,
    ) -> Result<Broadcast, SubmitError> {
        if !self.chain.is_pending(request.request_id).await? {
            info!("Request already fulfilled on-chain, skipping");
            return Ok(Broadcast::Skipped);
        }

        let input = abi::encode_fulfill(request, seed);
        let lease = self.nonces.acquire(self.chain.as_ref()).await?;
        let nonce = lease.nonce();
        let tx = UnsignedTx {
            chain_id: self.settings.chain_id,
            nonce,
            gas_limit: self.settings.gas_limit,
            pricing: self.settings.pricing,
            to: self.settings.coordinator,
            value: U256::ZERO,
            input,
        };
        let signed = self
            .wallet
            .sign(&tx)
            .map_err(|e| SubmitError::Signing(e.to_string()))?;

        match self.chain.broadcast(&signed.raw).await {
            Ok(tx_hash) => {
                if tx_hash != signed.hash {
                    warn!(expected = %signed.hash, reported = %tx_hash, "Node reported a different tx hash");
                }
                let in_flight = lease.commit();
                info!(
                    nonce,
                    tx_hash = %signed.hash,
                    outstanding = self.nonces.outstanding(),
                    "Fulfillment broadcast"
                );
                Ok(Broadcast::Sent(PendingFulfillment {
                    attempt: FulfillmentAttempt {
                        request_id: request.request_id,
                        seed,
                        tx_hash: signed.hash,
                        nonce,
                        submitted_at: Instant::now(),
                        role: self.role,
                    },
                    in_flight,
                }))
            }
            Err(e) => Err(classify_broadcast_error(e, lease)),
        }
    }

    /// Wait for the receipt of a broadcast fulfillment.
    #[instrument(skip_all, fields(request_id = %request.request_id, tx_hash = %pending.attempt.tx_hash))]
    pub async fn confirm(
        &self,
        request: &RandomnessRequest,
        pending: PendingFulfillment,
    ) -> TransactionResult {
        let PendingFulfillment { attempt, in_flight } = pending;
        let receipt = match self.wait_for_receipt(&attempt).await {
            Ok(receipt) => receipt,
            Err(e) => {
                // The transaction may never have reached a node, leaving a
                // gap at its nonce.
                drop(in_flight);
                self.nonces.reset().await;
                return Err(e);
            }
        };
        drop(in_flight);

        if receipt.success {
            let blocks_to_fulfill = receipt.block_number.saturating_sub(request.block_number);
            info!(
                block = receipt.block_number,
                blocks_to_fulfill,
                latency_ms = attempt.submitted_at.elapsed().as_millis() as u64,
                "Fulfilled successfully"
            );
            self.sink
                .report(&FulfillmentReport {
                    request_id: request.request_id,
                    seed: attempt.seed,
                    tx_hash: attempt.tx_hash,
                    blocks_to_fulfill,
                })
                .await;
            return Ok(FulfillmentOutcome::Fulfilled {
                attempt,
                block_number: receipt.block_number,
            });
        }

        if self.chain.is_pending(request.request_id).await? {
            return Err(SubmitError::Reverted {
                request_id: request.request_id,
                tx_hash: attempt.tx_hash,
            });
        }
        info!(
            block = receipt.block_number,
            "Fulfillment reverted, request already fulfilled by another instance"
        );
        Ok(FulfillmentOutcome::Reverted { attempt })
    }

    async fn wait_for_receipt(&self, attempt: &FulfillmentAttempt) -> Result<TxReceipt, SubmitError> {
        let timeout = self.settings.confirmation_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.chain.receipt(attempt.tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Receipt lookup failed, retrying"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SubmitError::ConfirmationTimeout {
                    tx_hash: attempt.tx_hash,
                    timeout,
                });
            }
            tokio::time::sleep(self.settings.receipt_poll_interval).await;
        }
    }
}

/// Map a broadcast failure onto the submit taxonomy, settling the lease.
fn classify_broadcast_error(error: ChainError, lease: NonceLease<'_>) -> SubmitError {
    let nonce = lease.nonce();
    match error {
        ChainError::Rpc { message, .. } if is_stale_nonce(&message) => {
            warn!(nonce, reason = %message, "Stale nonce, resyncing");
            lease.invalidate();
            SubmitError::StaleNonce { nonce, message }
        }
        ChainError::Rpc { message, .. } if message.to_ascii_lowercase().contains("insufficient funds") => {
            SubmitError::InsufficientFunds(message)
        }
        ChainError::Rpc { message, .. } => SubmitError::Rejected(message),
        // The transaction may or may not have reached a node.
        other => {
            lease.invalidate();
            SubmitError::Chain(other)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::tests::sample_request;
    use crate::test_support::{MockCoordinator, RecordingSink, test_wallet};

    fn settings() -> SubmitSettings {
        SubmitSettings {
            chain_id: 8453,
            coordinator: Address::repeat_byte(0xc0),
            pricing: GasPricing::Eip1559 {
                max_fee_per_gas: 2_000_000_000,
                max_priority_fee_per_gas: 1_000_000,
            },
            gas_limit: 1_500_000,
            confirmation_timeout: Duration::from_millis(200),
            receipt_poll_interval: Duration::from_millis(10),
        }
    }

    fn submitter(mock: &MockCoordinator, seed: u8, sink: Arc<RecordingSink>) -> FulfillmentSubmitter {
        let wallet = test_wallet(seed);
        let chain = mock.chain_for(wallet.address());
        FulfillmentSubmitter::new(chain, wallet, settings(), InstanceRole::Immediate, sink)
    }

    #[test]
    fn stale_nonce_markers_match_node_messages() {
        assert!(is_stale_nonce("Nonce too low: next nonce 5, tx nonce 4"));
        assert!(is_stale_nonce("already known"));
        assert!(!is_stale_nonce("insufficient funds for gas * price + value"));
    }

    #[tokio::test]
    async fn fulfills_pending_request_and_reports() {
        let mock = MockCoordinator::new(100);
        let request = sample_request(1, 100);
        mock.add_request(request.clone());
        let sink = Arc::new(RecordingSink::default());
        let submitter = submitter(&mock, 1, sink.clone());

        let outcome = submitter.submit(&request, U256::from(99u64)).await.unwrap();

        assert!(matches!(outcome, FulfillmentOutcome::Fulfilled { block_number: 101, .. }));
        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].seed, U256::from(99u64));
        assert_eq!(reports[0].blocks_to_fulfill, 1);
        assert_eq!(mock.submissions()[0].seed, U256::from(99u64));
    }

    #[tokio::test]
    async fn already_fulfilled_request_spends_no_gas() {
        let mock = MockCoordinator::new(100);
        let request = sample_request(1, 100);
        let sink = Arc::new(RecordingSink::default());
        let submitter = submitter(&mock, 1, sink.clone());

        // Never added, so the coordinator reports a zero commitment.
        let outcome = submitter.submit(&request, U256::from(1u64)).await.unwrap();

        assert!(matches!(outcome, FulfillmentOutcome::AlreadyFulfilled));
        assert!(mock.submissions().is_empty());
        assert!(sink.reports().is_empty());
    }

    #[tokio::test]
    async fn lost_race_is_a_revert_not_an_error() {
        let mock = MockCoordinator::new(100);
        let request = sample_request(1, 100);
        mock.add_request(request.clone());
        let winner = submitter(&mock, 1, Arc::new(RecordingSink::default()));
        let loser_sink = Arc::new(RecordingSink::default());
        let loser = submitter(&mock, 2, loser_sink.clone());

        winner.submit(&request, U256::from(1u64)).await.unwrap();
        mock.stale_commitment_reads(1);
        let outcome = loser.submit(&request, U256::from(2u64)).await.unwrap();

        assert!(matches!(outcome, FulfillmentOutcome::Reverted { .. }));
        assert_eq!(mock.successful_fulfillments(request.request_id), 1);
        assert!(loser_sink.reports().is_empty());
    }

    #[tokio::test]
    async fn stale_nonce_is_typed_and_recovers() {
        let mock = MockCoordinator::new(100);
        let first = sample_request(1, 100);
        let second = sample_request(2, 100);
        mock.add_request(first.clone());
        mock.add_request(second.clone());
        let wallet = test_wallet(1);
        let submitter = submitter(&mock, 1, Arc::new(RecordingSink::default()));

        submitter.submit(&first, U256::from(1u64)).await.unwrap();
        // Another process shares the key and bumps the nonce behind our back.
        mock.set_transaction_count(wallet.address(), 0);
        let err = submitter.submit(&second, U256::from(2u64)).await.unwrap_err();
        assert!(matches!(err, SubmitError::StaleNonce { nonce: 1, .. }));

        let outcome = submitter.submit(&second, U256::from(2u64)).await.unwrap();
        assert!(matches!(outcome, FulfillmentOutcome::Fulfilled { .. }));
        assert_eq!(mock.submissions()[1].nonce, 0);
    }

    #[tokio::test]
    async fn consecutive_broadcasts_use_increasing_nonces() {
        let mock = MockCoordinator::new(100);
        let sink = Arc::new(RecordingSink::default());
        let submitter = submitter(&mock, 1, sink);
        for id in 1..=3 {
            let request = sample_request(id, 100);
            mock.add_request(request.clone());
            match submitter.broadcast(&request, U256::from(id)).await.unwrap() {
                Broadcast::Sent(pending) => assert_eq!(pending.attempt.nonce, id - 1),
                Broadcast::Skipped => panic!("request {id} skipped"),
            }
        }
    }
}
