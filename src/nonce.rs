//! Nonce allocation for the relay's signing account.
//!
//! One counter guarded by an async mutex. A [`NonceLease`] holds the lock,
//! so everything between acquiring a nonce and broadcasting the transaction
//! runs one request at a time, in dispatch order.

use alloy_primitives::Address;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::chain::CoordinatorChain;
use crate::error::ChainError;

/// Resync from the node when nothing is outstanding and we have been quiet
/// for this long.
pub const IDLE_RESYNC: Duration = Duration::from_secs(4);

#[derive(Debug)]
struct Activity {
    outstanding: AtomicUsize,
    last_ms: AtomicU64,
    epoch: Instant,
}

impl Activity {
    fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

#[derive(Debug)]
pub struct NonceManager {
    address: Address,
    idle_resync: Duration,
    next: Mutex<Option<u64>>,
    activity: Arc<Activity>,
}

impl NonceManager {
    pub fn new(address: Address) -> Self {
        Self::with_idle_resync(address, IDLE_RESYNC)
    }

    pub fn with_idle_resync(address: Address, idle_resync: Duration) -> Self {
        Self {
            address,
            idle_resync,
            next: Mutex::new(None),
            activity: Arc::new(Activity {
                outstanding: AtomicUsize::new(0),
                last_ms: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
        }
    }

    /// Lock the counter and hand out the next nonce.
    pub async fn acquire(&self, chain: &dyn CoordinatorChain) -> Result<NonceLease<'_>, ChainError> {
        let mut next = self.next.lock().await;

        let idle = self.activity.outstanding.load(Ordering::Relaxed) == 0
            && self.activity.idle_for() >= self.idle_resync;
        if next.is_none() || idle {
            let synced = chain.transaction_count(self.address).await?;
            if *next != Some(synced) {
                info!(address = %self.address, previous = ?*next, nonce = synced, "Synced nonce from chain");
            }
            *next = Some(synced);
        }
        let nonce = next.unwrap_or_default();
        self.activity.touch();
        debug!(nonce, "Nonce leased");

        Ok(NonceLease {
            guard: next,
            nonce,
            activity: Arc::clone(&self.activity),
        })
    }

    /// Forget the counter; the next lease rereads it from the node.
    pub async fn reset(&self) {
        *self.next.lock().await = None;
    }

    pub fn outstanding(&self) -> usize {
        self.activity.outstanding.load(Ordering::Relaxed)
    }
}

/// Exclusive use of the next nonce. Dropping the lease returns the nonce
/// unused.
pub struct NonceLease<'a> {
    guard: MutexGuard<'a, Option<u64>>,
    nonce: u64,
    activity: Arc<Activity>,
}

impl NonceLease<'_> {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// The transaction was accepted: consume the nonce.
    pub fn commit(mut self) -> InFlight {
        *self.guard = Some(self.nonce + 1);
        self.activity.outstanding.fetch_add(1, Ordering::Relaxed);
        self.activity.touch();
        InFlight {
            activity: Arc::clone(&self.activity),
        }
    }

    /// The node disagrees with our counter: reread it on the next acquire.
    pub fn invalidate(mut self) {
        *self.guard = None;
    }
}

/// Marks a broadcast transaction as not yet mined. Settles on drop.
#[derive(Debug)]
pub struct InFlight {
    activity: Arc<Activity>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.activity.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.activity.touch();
    }
}
