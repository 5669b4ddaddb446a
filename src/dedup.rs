//! Local claim bookkeeping so one process never has two fulfillments in
//! flight for the same request.
//!
//! This is advisory. Two relay instances each keep their own table and the
//! coordinator contract settles any race between them.
//!
//! Failed requests with retries left stay in the table with their full
//! commitment, so they are retried even after they drop out of the reader's
//! scan window.

use alloy_primitives::U256;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::request::{RandomnessRequest, RequestStatus};

#[derive(Debug, Clone)]
struct ClaimEntry {
    status: RequestStatus,
    attempts: u32,
    claimed_at: Instant,
    request: RandomnessRequest,
}

/// Per-process claim table keyed by request ID.
#[derive(Debug)]
pub struct DedupCoordinator {
    claim_ttl: Duration,
    max_attempts: u32,
    entries: HashMap<U256, ClaimEntry>,
}

impl DedupCoordinator {
    pub fn new(claim_ttl: Duration, max_attempts: u32) -> Self {
        Self {
            claim_ttl,
            max_attempts: max_attempts.max(1),
            entries: HashMap::new(),
        }
    }

    /// Claim `request_id` for fulfillment.
    ///
    /// Returns true at most once per claim window. An expired or failed
    /// claim can be taken again until the attempt budget runs out.
    pub fn try_claim(&mut self, request: &RandomnessRequest, now: Instant) -> bool {
        let request_id = request.request_id;
        let Some(entry) = self.entries.get_mut(&request_id) else {
            self.entries.insert(
                request_id,
                ClaimEntry {
                    status: RequestStatus::Claimed,
                    attempts: 1,
                    claimed_at: now,
                    request: request.clone(),
                },
            );
            return true;
        };

        let reclaimable = match entry.status {
            RequestStatus::Fulfilled => false,
            RequestStatus::Claimed | RequestStatus::Fulfilling => {
                now.saturating_duration_since(entry.claimed_at) >= self.claim_ttl
            }
            RequestStatus::Failed | RequestStatus::Pending => true,
        };
        if !reclaimable {
            return false;
        }
        if entry.attempts >= self.max_attempts {
            debug!(%request_id, attempts = entry.attempts, "Retry budget exhausted");
            return false;
        }

        entry.status = RequestStatus::Claimed;
        entry.attempts += 1;
        entry.claimed_at = now;
        entry.request = request.clone();
        true
    }

    pub fn mark_fulfilling(&mut self, request_id: U256) {
        if let Some(entry) = self.entries.get_mut(&request_id) {
            entry.status = RequestStatus::Fulfilling;
        }
    }

    pub fn mark_fulfilled(&mut self, request_id: U256) {
        if let Some(entry) = self.entries.get_mut(&request_id) {
            entry.status = RequestStatus::Fulfilled;
        }
    }

    /// Record a failed attempt. Returns true when no retries remain.
    pub fn mark_failed(&mut self, request_id: U256) -> bool {
        match self.entries.get_mut(&request_id) {
            Some(entry) => {
                entry.status = RequestStatus::Failed;
                entry.attempts >= self.max_attempts
            }
            None => false,
        }
    }

    /// Failed requests that still have attempts left, oldest first.
    pub fn retry_candidates(&self) -> Vec<RandomnessRequest> {
        let mut retries: Vec<RandomnessRequest> = self
            .entries
            .values()
            .filter(|e| e.status == RequestStatus::Failed && e.attempts < self.max_attempts)
            .map(|e| e.request.clone())
            .collect();
        retries.sort_by_key(|r| (r.block_number, r.request_id));
        retries
    }

    pub fn status(&self, request_id: U256) -> RequestStatus {
        self.entries
            .get(&request_id)
            .map_or(RequestStatus::Pending, |e| e.status)
    }

    /// Forget settled requests observed below `min_block`.
    ///
    /// Requests below the reader's scan window can no longer be returned by
    /// a poll. In-flight entries and failures with retries left are kept.
    pub fn prune(&mut self, min_block: u64) {
        let before = self.entries.len();
        let max_attempts = self.max_attempts;
        self.entries.retain(|_, e| {
            e.request.block_number >= min_block
                || matches!(e.status, RequestStatus::Claimed | RequestStatus::Fulfilling)
                || (e.status == RequestStatus::Failed && e.attempts < max_attempts)
        });
        let pruned = before - self.entries.len();
        if pruned > 0 {
            debug!(pruned, min_block, "Pruned claim table");
        }
    }

    pub fn in_flight(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.status, RequestStatus::Claimed | RequestStatus::Fulfilling))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
