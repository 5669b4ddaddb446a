//! The polling and dispatch loop.
//!
//! One tick polls the chain reader, claims each returned request (plus any
//! earlier failure with retries left), draws a seed and broadcasts the
//! fulfillment. Broadcasts are sequential so nonces
//! follow dispatch order; confirmations run as tasks bounded by a semaphore.
//! A failure or panic in one request is contained to that request.
//!
//! With a live log subscription attached, requests it delivers are
//! dispatched between ticks and every reconnect triggers a backfill poll.

use alloy_primitives::U256;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::dedup::DedupCoordinator;
use crate::error::{FatalError, SubmitError};
use crate::fulfiller::{Broadcast, FulfillmentOutcome, FulfillmentSubmitter, TransactionResult};
use crate::metrics::RelayMetrics;
use crate::notify::{AlertSink, Severity};
use crate::randomness::RandomnessSource;
use crate::reader::ChainReader;
use crate::request::{InstanceRole, RandomnessRequest, RequestStatus};
use crate::subscribe::{BACKFILL_BLOCKS, LiveEvent};

/// Loop cadence for one relay instance.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub role: InstanceRole,
    /// Poll interval with the role multiplier applied.
    pub poll_interval: Duration,
    pub fulfillment_concurrency: usize,
    pub summary_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
    Dispatching,
    ShuttingDown,
}

type Completion = (RandomnessRequest, std::thread::Result<TransactionResult>);

/// What ended a wait between ticks.
enum Wake {
    Tick,
    Live(Option<LiveEvent>),
    Signal { sender_alive: bool },
}

async fn next_live_event(live: &mut Option<mpsc::Receiver<LiveEvent>>) -> Option<LiveEvent> {
    match live {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub struct Relay {
    settings: LoopSettings,
    reader: ChainReader,
    dedup: DedupCoordinator,
    randomness: Arc<dyn RandomnessSource>,
    submitter: Arc<FulfillmentSubmitter>,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<RelayMetrics>,
    permits: Arc<Semaphore>,
    confirmations: JoinSet<Completion>,
    live: Option<mpsc::Receiver<LiveEvent>>,
    state: LoopState,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Relay {
    pub fn new(
        settings: LoopSettings,
        reader: ChainReader,
        dedup: DedupCoordinator,
        randomness: Arc<dyn RandomnessSource>,
        submitter: Arc<FulfillmentSubmitter>,
        alerts: Arc<dyn AlertSink>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.fulfillment_concurrency.max(1)));
        Self {
            settings,
            reader,
            dedup,
            randomness,
            submitter,
            alerts,
            metrics,
            permits,
            confirmations: JoinSet::new(),
            live: None,
            state: LoopState::Idle,
        }
    }

    /// Also act on logs pushed by a live subscription.
    pub fn with_live_events(mut self, live: mpsc::Receiver<LiveEvent>) -> Self {
        self.live = Some(live);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn status(&self, request_id: U256) -> RequestStatus {
        self.dedup.status(request_id)
    }

    /// Run until `shutdown` flips to true or a fatal error occurs.
    ///
    /// Confirmations still in flight are awaited before returning.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), FatalError> {
        info!(
            role = %self.settings.role,
            interval = ?self.settings.poll_interval,
            sender = %self.submitter.address(),
            "Relay loop started"
        );
        let mut last_summary = Instant::now();

        'run: while !*shutdown.borrow() {
            if let Err(fatal) = self.tick().await {
                return Err(self.stop_fatal(fatal));
            }

            if last_summary.elapsed() >= self.settings.summary_interval {
                self.log_summary();
                last_summary = Instant::now();
            }

            let deadline = tokio::time::Instant::now() + self.next_wait();
            loop {
                let wake = tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => Wake::Tick,
                    event = next_live_event(&mut self.live) => Wake::Live(event),
                    changed = shutdown.changed() => Wake::Signal { sender_alive: changed.is_ok() },
                };
                match wake {
                    Wake::Tick => break,
                    Wake::Signal { sender_alive } => {
                        if !sender_alive || *shutdown.borrow() {
                            break 'run;
                        }
                    }
                    Wake::Live(event) => {
                        if let Err(fatal) = self.handle_live(event).await {
                            return Err(self.stop_fatal(fatal));
                        }
                    }
                }
            }
        }

        self.state = LoopState::ShuttingDown;
        info!(in_flight = self.confirmations.len(), "Shutting down, draining confirmations");
        self.drain_confirmations().await;
        self.log_summary();
        Ok(())
    }

    fn stop_fatal(&mut self, fatal: FatalError) -> FatalError {
        self.state = LoopState::ShuttingDown;
        error!(error = %fatal, "Fatal error, stopping relay");
        self.log_summary();
        fatal
    }

    /// Act on one message from the live subscription.
    pub(crate) async fn handle_live(&mut self, event: Option<LiveEvent>) -> Result<(), FatalError> {
        match event {
            None => {
                warn!("Log subscription closed, continuing with polling only");
                self.live = None;
                Ok(())
            }
            Some(LiveEvent::Connected) => {
                self.reader.rewind(BACKFILL_BLOCKS);
                self.tick().await
            }
            Some(LiveEvent::Log(event)) => {
                let Some(request) = self.reader.observe_live(event) else {
                    return Ok(());
                };
                self.reap_confirmations().await;
                self.state = LoopState::Dispatching;
                let result = self.dispatch(request).await;
                if result.is_ok() {
                    self.state = LoopState::Idle;
                }
                result
            }
        }
    }

    /// How long to idle before the next tick.
    pub(crate) fn next_wait(&self) -> Duration {
        if let Some(delay) = self.reader.retry_delay() {
            delay
        } else if self.reader.is_stalled() {
            self.settings.poll_interval * 2
        } else {
            self.settings.poll_interval
        }
    }

    fn log_summary(&self) {
        info!(
            metrics = %self.metrics.to_json(),
            cursor = ?self.reader.cursor(),
            tracked = self.dedup.len(),
            in_flight = self.dedup.in_flight(),
            "Relay summary"
        );
    }

    /// One poll-and-dispatch cycle.
    pub async fn tick(&mut self) -> Result<(), FatalError> {
        self.reap_confirmations().await;

        self.state = LoopState::Polling;
        let batch = match self.reader.poll().await {
            Ok(batch) => batch,
            Err(_) => {
                // Already logged and, past the threshold, alerted by the reader.
                self.metrics.record_poll_failure();
                self.state = LoopState::Idle;
                return Ok(());
            }
        };
        if let Some(start) = self.reader.window_start() {
            self.dedup.prune(start);
        }

        // Earlier failures may already be below the scan window.
        let mut batch = batch;
        let retries: Vec<RandomnessRequest> = self
            .dedup
            .retry_candidates()
            .into_iter()
            .filter(|r| batch.iter().all(|b| b.request_id != r.request_id))
            .collect();
        if !retries.is_empty() {
            debug!(count = retries.len(), "Retrying failed requests");
            batch.extend(retries);
        }

        self.state = LoopState::Dispatching;
        for request in batch {
            self.dispatch(request).await?;
        }
        self.state = LoopState::Idle;
        Ok(())
    }

    async fn dispatch(&mut self, request: RandomnessRequest) -> Result<(), FatalError> {
        let request_id = request.request_id;
        let first_sighting = self.dedup.status(request_id) == RequestStatus::Pending;
        if !self.dedup.try_claim(&request, Instant::now()) {
            debug!(%request_id, "Request already claimed, skipping");
            return Ok(());
        }
        if first_sighting {
            self.metrics.record_requests(1);
        }
        info!(
            %request_id,
            requester = %request.requester,
            block = request.block_number,
            "Fulfilling randomness request"
        );

        if self.settings.role == InstanceRole::Delay {
            self.alerts
                .notify(
                    Severity::Warning,
                    &format!("Unexpectedly fulfilling request {request_id} from a delay instance"),
                )
                .await;
        }

        let seed = match self.randomness.generate() {
            Ok(seed) => seed,
            Err(e) => {
                self.state = LoopState::ShuttingDown;
                self.alerts
                    .notify(Severity::Critical, &format!("Shutting down: {e}"))
                    .await;
                return Err(FatalError::Entropy(e));
            }
        };

        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                error!("Semaphore closed, dropping request");
                self.dedup.mark_failed(request_id);
                return Ok(());
            }
        };
        self.dedup.mark_fulfilling(request_id);

        let submitter = Arc::clone(&self.submitter);
        let sent = AssertUnwindSafe(submitter.broadcast(&request, seed))
            .catch_unwind()
            .await;
        let pending = match sent {
            Ok(Ok(Broadcast::Sent(pending))) => pending,
            Ok(Ok(Broadcast::Skipped)) => {
                self.apply_outcome(&request, Ok(FulfillmentOutcome::AlreadyFulfilled))
                    .await;
                return Ok(());
            }
            Ok(Err(e)) => {
                self.apply_outcome(&request, Err(e)).await;
                return Ok(());
            }
            Err(panic) => {
                self.contain_panic(&request, &*panic).await;
                return Ok(());
            }
        };

        self.confirmations.spawn(async move {
            let _permit = permit;
            let result = AssertUnwindSafe(submitter.confirm(&request, pending))
                .catch_unwind()
                .await;
            (request, result)
        });
        Ok(())
    }

    async fn contain_panic(&mut self, request: &RandomnessRequest, payload: &(dyn Any + Send)) {
        let message = panic_message(payload);
        self.metrics.record_failure();
        self.dedup.mark_failed(request.request_id);
        self.alerts
            .notify(
                Severity::Critical,
                &format!(
                    "Fulfillment of request {} panicked: {message}",
                    request.request_id
                ),
            )
            .await;
    }

    async fn apply_outcome(&mut self, request: &RandomnessRequest, result: TransactionResult) {
        let request_id = request.request_id;
        match result {
            Ok(FulfillmentOutcome::Fulfilled { block_number, .. }) => {
                self.dedup.mark_fulfilled(request_id);
                self.metrics
                    .record_fulfillment(block_number.saturating_sub(request.block_number));
            }
            Ok(FulfillmentOutcome::AlreadyFulfilled) => {
                self.dedup.mark_fulfilled(request_id);
                self.metrics.record_skip();
            }
            Ok(FulfillmentOutcome::Reverted { attempt }) => {
                info!(%request_id, tx_hash = %attempt.tx_hash, "Lost fulfillment race");
                self.dedup.mark_fulfilled(request_id);
                self.metrics.record_revert();
            }
            Err(e) => {
                self.metrics.record_failure();
                let exhausted = self.dedup.mark_failed(request_id);
                warn!(%request_id, error = %e, exhausted, "Fulfillment failed");
                match &e {
                    SubmitError::InsufficientFunds(_) => {
                        self.alerts
                            .notify(
                                Severity::Critical,
                                &format!("Relay wallet {} is out of funds: {e}", self.submitter.address()),
                            )
                            .await;
                    }
                    SubmitError::Reverted { .. } => {
                        self.alerts
                            .notify(Severity::Warning, &format!("Fulfillment reverted: {e}"))
                            .await;
                    }
                    _ => {}
                }
                if exhausted {
                    self.alerts
                        .notify(
                            Severity::Critical,
                            &format!("Giving up on request {request_id}: {e}"),
                        )
                        .await;
                }
            }
        }
    }

    async fn handle_completion(&mut self, joined: Result<Completion, JoinError>) {
        match joined {
            Ok((request, Ok(result))) => self.apply_outcome(&request, result).await,
            Ok((request, Err(panic))) => self.contain_panic(&request, &*panic).await,
            Err(e) => error!(error = %e, "Confirmation task aborted"),
        }
    }

    /// Apply results of confirmations that already finished.
    async fn reap_confirmations(&mut self) {
        while let Some(joined) = self.confirmations.try_join_next() {
            self.handle_completion(joined).await;
        }
    }

    /// Wait for every outstanding confirmation and apply its result.
    pub async fn drain_confirmations(&mut self) {
        while let Some(joined) = self.confirmations.join_next().await {
            self.handle_completion(joined).await;
        }
    }
}
