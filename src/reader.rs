//! Polls the coordinator for outstanding randomness requests.
//!
//! Each poll scans a bounded block window that overlaps the previous one by
//! `rescan_blocks + delay_blocks`, so late-served logs and requests held
//! back by the delay filter are picked up on a later pass. Fulfilled logs
//! seen in any window are remembered until they fall out of the window.

use alloy_primitives::U256;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::abi::CoordinatorEvent;
use crate::chain::CoordinatorChain;
use crate::cursor::CursorStore;
use crate::error::ChainError;
use crate::notify::{AlertSink, Severity};
use crate::request::RandomnessRequest;

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub rescan_blocks: u64,
    /// Requests younger than this many blocks are left for a later poll.
    pub delay_blocks: u64,
    pub max_block_range: u64,
    pub startup_lookback_blocks: u64,
    /// Alert after this many consecutive failed polls, and every multiple.
    pub alert_threshold: u32,
}

impl ScanSettings {
    fn overlap(&self) -> u64 {
        self.rescan_blocks + self.delay_blocks
    }
}

/// Doubling delay between failed reads.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(d) => d.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

pub struct ChainReader {
    chain: Arc<dyn CoordinatorChain>,
    store: CursorStore,
    alerts: Arc<dyn AlertSink>,
    settings: ScanSettings,
    /// Last block fully scanned.
    cursor: Option<u64>,
    /// Fulfilled request IDs with the block of their fulfillment log.
    fulfilled: HashMap<U256, u64>,
    backoff: Backoff,
    consecutive_failures: u32,
    stalled: bool,
}

impl ChainReader {
    pub fn new(
        chain: Arc<dyn CoordinatorChain>,
        store: CursorStore,
        alerts: Arc<dyn AlertSink>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            chain,
            store,
            alerts,
            settings,
            cursor: None,
            fulfilled: HashMap::new(),
            backoff: Backoff::new(BACKOFF_INITIAL, BACKOFF_MAX),
            consecutive_failures: 0,
            stalled: false,
        }
    }

    /// Requests observed pending since the last scanned block, in chain
    /// order and without duplicates.
    ///
    /// A failed read leaves the cursor untouched and arms the backoff
    /// returned by [`Self::retry_delay`].
    pub async fn poll(&mut self) -> Result<Vec<RandomnessRequest>, ChainError> {
        match self.scan().await {
            Ok(batch) => {
                if self.consecutive_failures > 0 {
                    info!(
                        failures = self.consecutive_failures,
                        cursor = ?self.cursor,
                        "Chain reads recovered"
                    );
                }
                self.consecutive_failures = 0;
                self.backoff.reset();
                Ok(batch)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                let failures = self.consecutive_failures;
                let delay = self.backoff.next_delay();
                warn!(error = %e, failures, retry_in = ?delay, "Chain poll failed");

                let threshold = self.settings.alert_threshold;
                if threshold > 0 && failures % threshold == 0 {
                    self.alerts
                        .notify(
                            Severity::Warning,
                            &format!("{failures} consecutive chain read failures, last error: {e}"),
                        )
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn scan(&mut self) -> Result<Vec<RandomnessRequest>, ChainError> {
        let latest = self.chain.latest_block().await?;
        let cursor = match self.cursor {
            Some(cursor) => cursor,
            None => {
                let cursor = self.resume_point(latest);
                self.cursor = Some(cursor);
                cursor
            }
        };

        if latest <= cursor {
            self.stalled = true;
            debug!(latest, cursor, "No new blocks");
            return Ok(Vec::new());
        }
        self.stalled = false;

        let from = cursor.saturating_sub(self.settings.overlap());
        let to = latest.min(from + self.settings.max_block_range);
        let logs = self.chain.vrf_logs(from, to).await?;

        for fulfilled in &logs.fulfilled {
            self.fulfilled
                .insert(fulfilled.request_id, fulfilled.block_number);
        }

        let ready_up_to = to.saturating_sub(self.settings.delay_blocks);
        let mut seen = HashSet::new();
        let batch: Vec<RandomnessRequest> = logs
            .requested
            .into_iter()
            .filter(|r| r.block_number <= ready_up_to)
            .filter(|r| !self.fulfilled.contains_key(&r.request_id))
            .filter(|r| seen.insert(r.request_id))
            .collect();

        self.cursor = Some(to);
        if let Err(e) = self.store.save(to) {
            warn!(error = %format!("{e:#}"), "Failed to persist cursor");
        }

        let next_from = to.saturating_sub(self.settings.overlap());
        self.fulfilled.retain(|_, block| *block >= next_from);

        debug!(from, to, pending = batch.len(), "Scanned coordinator logs");
        Ok(batch)
    }

    fn resume_point(&self, latest: u64) -> u64 {
        let fallback = latest.saturating_sub(self.settings.startup_lookback_blocks);
        let cursor = match self.store.load() {
            Ok(Some(stored)) if stored <= latest => stored,
            Ok(Some(stored)) => {
                warn!(stored, latest, "Stored cursor is ahead of the chain, rescanning");
                fallback
            }
            Ok(None) => fallback,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Unreadable cursor, rescanning");
                fallback
            }
        };
        info!(cursor, latest, state = %self.store.path().display(), "Resuming scan");
        cursor
    }

    /// Filter a log delivered by a live subscription.
    ///
    /// Returns the request when it can be dispatched right away. With a
    /// delay configured, requests are left to the regular polls.
    pub fn observe_live(&mut self, event: CoordinatorEvent) -> Option<RandomnessRequest> {
        match event {
            CoordinatorEvent::Fulfilled(fulfilled) => {
                self.fulfilled
                    .insert(fulfilled.request_id, fulfilled.block_number);
                None
            }
            CoordinatorEvent::Requested(request) => {
                if self.settings.delay_blocks > 0
                    || self.fulfilled.contains_key(&request.request_id)
                {
                    return None;
                }
                Some(request)
            }
        }
    }

    /// Move the cursor back so the next poll rescans `blocks` more blocks.
    pub fn rewind(&mut self, blocks: u64) {
        if let Some(cursor) = self.cursor {
            let rewound = cursor.saturating_sub(blocks);
            debug!(cursor, rewound, "Rewinding scan cursor");
            self.cursor = Some(rewound);
        }
    }

    /// Delay before the next poll after a failure, if the last poll failed.
    pub fn retry_delay(&self) -> Option<Duration> {
        if self.consecutive_failures == 0 {
            return None;
        }
        self.backoff.current
    }

    /// Whether the last poll found no new blocks.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Lowest block the next poll will scan.
    pub fn window_start(&self) -> Option<u64> {
        self.cursor
            .map(|c| c.saturating_sub(self.settings.overlap()))
    }
}
