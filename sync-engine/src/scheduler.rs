//! Background sync scheduler
//!
//! Actor-style worker draining the offline queue to the batch transport:
//! a mailbox for control messages (`sync_now`, shutdown), an interval
//! timer for periodic drains, and a retry timer driven by exponential
//! backoff. All communication is message passing; nothing shares mutable
//! fields with the timer callback, so a concurrent `sync_now` cannot
//! race a scheduled pass.
//!
//! # State machine
//!
//! `Idle → Scheduled → Syncing → (Idle | BackoffWait)`
//!
//! Backoff doubles from a floor (0.5s) to a ceiling (30s) and resets on
//! any success. It is per-scheduler state, not per-event.

use crate::error::{Error, Result};
use crate::metrics::{EVENTS_SYNCED_TOTAL, SYNC_BATCHES_TOTAL, SYNC_BATCH_DURATION};
use crate::queue::OfflineQueue;
use crate::transport::{AuthProvider, BatchItemStatus, BatchTransport};
use event_core::config::SyncConfig;
use event_core::{EventId, WorkflowEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Observable scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Nothing pending, nothing scheduled
    Idle,
    /// Waiting for the next interval tick
    Scheduled,
    /// A drain pass is running
    Syncing,
    /// Last pass failed; waiting out the backoff delay
    BackoffWait,
}

/// Result of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Events acknowledged by the remote
    pub synced: usize,
    /// Events the remote already knew (at-least-once replay)
    pub duplicates: usize,
    /// Events rejected and requeued
    pub rejected: usize,
    /// Entries still pending after the pass
    pub remaining: usize,
}

/// Exponential backoff state: doubles from a floor to a ceiling, resets
/// on success
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    /// New backoff starting at the floor
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Delay to wait after the latest failure
    pub fn next_delay(&mut self) -> Duration {
        self.current = (self.current * 2).min(self.ceiling);
        self.current
    }

    /// Back to the floor after a success
    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    /// Current delay without advancing
    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Control messages for the worker
enum SchedulerMessage {
    /// Immediate blocking drain, bypassing the timer
    SyncNow {
        response: oneshot::Sender<Result<SyncReport>>,
    },
    /// Stop after a best-effort final flush
    Shutdown,
}

/// Handle to a running scheduler
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SchedulerMessage>,
    state_rx: watch::Receiver<SchedulerState>,
    join: Arc<parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl SyncHandle {
    /// Immediate drain, bypassing the timer. Reports its own outcome —
    /// this is an operator action and failures are real failures.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(SchedulerMessage::SyncNow { response })
            .await
            .map_err(|_| Error::Scheduler("worker not running".to_string()))?;
        rx.await
            .map_err(|_| Error::Scheduler("worker dropped the request".to_string()))?
    }

    /// Request shutdown without blocking. Safe to call from a shutdown
    /// hook; the worker runs its own short-timeout final flush and
    /// exits.
    pub fn stop(&self) {
        let _ = self.tx.try_send(SchedulerMessage::Shutdown);
    }

    /// Stop and wait for the worker to finish (tests, orderly shutdown)
    pub async fn shutdown(&self) {
        let _ = self.tx.send(SchedulerMessage::Shutdown).await;
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Current worker state
    pub fn state(&self) -> SchedulerState {
        *self.state_rx.borrow()
    }
}

/// The background worker
pub struct SyncScheduler {
    queue: Arc<OfflineQueue>,
    auth: Arc<dyn AuthProvider>,
    transport: Arc<dyn BatchTransport>,
    config: SyncConfig,
    mailbox: mpsc::Receiver<SchedulerMessage>,
    state_tx: watch::Sender<SchedulerState>,
    backoff: Backoff,
    last_batch_at: Option<Instant>,
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("config", &self.config)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Spawn the scheduler worker and return its handle
pub fn spawn_sync_scheduler(
    queue: Arc<OfflineQueue>,
    auth: Arc<dyn AuthProvider>,
    transport: Arc<dyn BatchTransport>,
    config: SyncConfig,
) -> SyncHandle {
    let (tx, mailbox) = mpsc::channel(16);
    let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);

    let backoff = Backoff::new(
        Duration::from_millis(config.backoff_floor_ms),
        Duration::from_millis(config.backoff_ceiling_ms),
    );

    let worker = SyncScheduler {
        queue,
        auth,
        transport,
        config,
        mailbox,
        state_tx,
        backoff,
        last_batch_at: None,
    };

    let join = tokio::spawn(worker.run());

    SyncHandle {
        tx,
        state_rx,
        join: Arc::new(parking_lot::Mutex::new(Some(join))),
    }
}

impl SyncScheduler {
    /// Run the worker loop until shutdown
    pub async fn run(mut self) {
        let mut timer = interval(Duration::from_secs(self.config.interval_secs));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so startup does
        // not race the caller's setup.
        timer.tick().await;

        let mut retry_at: Option<Instant> = None;

        loop {
            let retry_timer = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(SchedulerMessage::SyncNow { response }) => {
                        let result = self.drain().await;
                        retry_at = self.after_pass(&result);
                        let _ = response.send(result);
                    }
                    // Shutdown request, or every handle dropped
                    Some(SchedulerMessage::Shutdown) | None => {
                        self.final_flush().await;
                        break;
                    }
                },

                _ = timer.tick() => {
                    if self.should_drain() {
                        let result = self.drain().await;
                        retry_at = self.after_pass(&result);
                    } else {
                        self.set_state(SchedulerState::Idle);
                    }
                }

                _ = retry_timer => {
                    retry_at = None;
                    if self.should_drain() {
                        let result = self.drain().await;
                        retry_at = self.after_pass(&result);
                    }
                }
            }
        }
    }

    /// Periodic drains run only when there is something to deliver
    fn should_drain(&self) -> bool {
        match self.queue.is_empty() {
            Ok(empty) => !empty,
            Err(e) => {
                tracing::warn!("Queue status check failed: {}", e);
                false
            }
        }
    }

    fn set_state(&self, state: SchedulerState) {
        let _ = self.state_tx.send(state);
    }

    fn after_pass(&mut self, result: &Result<SyncReport>) -> Option<Instant> {
        match result {
            Ok(_) => None,
            Err(_) => {
                let delay = self.backoff.next_delay();
                self.set_state(SchedulerState::BackoffWait);
                Some(Instant::now() + delay)
            }
        }
    }

    /// Best-effort flush at shutdown; bounded by its own timeout so
    /// process exit is never delayed past it.
    async fn final_flush(&mut self) {
        if !self.should_drain() {
            return;
        }
        let budget = Duration::from_millis(self.config.shutdown_flush_timeout_ms);
        match tokio::time::timeout(budget, self.drain()).await {
            Ok(Ok(report)) => {
                tracing::info!(synced = report.synced, "Final flush complete");
            }
            Ok(Err(e)) => {
                tracing::warn!("Final flush failed; events remain queued: {}", e);
            }
            Err(_) => {
                tracing::warn!(
                    "Final flush exceeded {}ms; events remain queued",
                    budget.as_millis()
                );
            }
        }
    }

    /// One drain pass: batches until the pass has offered every entry
    /// that was pending when it started.
    async fn drain(&mut self) -> Result<SyncReport> {
        self.set_state(SchedulerState::Syncing);

        if !self.auth.is_authenticated() {
            return Err(Error::Auth("not authenticated".to_string()));
        }

        let mut report = SyncReport::default();
        let mut budget = self.queue.len()?;

        while budget > 0 {
            let entries = self.queue.dequeue_batch(self.config.batch_size.min(budget))?;
            if entries.is_empty() {
                break;
            }
            budget = budget.saturating_sub(entries.len());

            self.rate_limit().await;

            let events: Vec<WorkflowEvent> =
                entries.iter().map(|entry| entry.event.clone()).collect();

            let timer = SYNC_BATCH_DURATION.start_timer();
            let outcomes = self.send_batch_with_auth_retry(&events).await;
            timer.observe_duration();
            self.last_batch_at = Some(Instant::now());

            let outcomes = match outcomes {
                Ok(outcomes) => {
                    SYNC_BATCHES_TOTAL.with_label_values(&["success"]).inc();
                    self.backoff.reset();
                    outcomes
                }
                Err(e) => {
                    SYNC_BATCHES_TOTAL.with_label_values(&["failure"]).inc();
                    tracing::warn!("Sync batch failed; events remain queued: {}", e);
                    return Err(e);
                }
            };

            let mut confirmed: Vec<EventId> = Vec::new();
            let mut failed: Vec<(EventId, String)> = Vec::new();
            for outcome in outcomes {
                match outcome.status {
                    BatchItemStatus::Acknowledged => {
                        EVENTS_SYNCED_TOTAL
                            .with_label_values(&["acknowledged"])
                            .inc();
                        report.synced += 1;
                        confirmed.push(outcome.event_id);
                    }
                    BatchItemStatus::Duplicate => {
                        EVENTS_SYNCED_TOTAL.with_label_values(&["duplicate"]).inc();
                        report.duplicates += 1;
                        confirmed.push(outcome.event_id);
                    }
                    BatchItemStatus::Rejected(reason) => {
                        EVENTS_SYNCED_TOTAL.with_label_values(&["rejected"]).inc();
                        report.rejected += 1;
                        failed.push((outcome.event_id, reason));
                    }
                }
            }

            self.queue.ack(&confirmed)?;
            for (event_id, reason) in &failed {
                self.queue.requeue(&[*event_id], reason)?;
            }
        }

        report.remaining = self.queue.len()?;
        if report.remaining == 0 {
            self.set_state(SchedulerState::Idle);
        } else {
            // Rejected entries wait for the next scheduled pass
            self.set_state(SchedulerState::Scheduled);
        }

        tracing::debug!(
            synced = report.synced,
            duplicates = report.duplicates,
            rejected = report.rejected,
            remaining = report.remaining,
            "Drain pass complete"
        );
        Ok(report)
    }

    /// Minimum spacing between consecutive batch calls
    async fn rate_limit(&self) {
        if let Some(last) = self.last_batch_at {
            let min_interval = Duration::from_millis(self.config.min_batch_interval_ms);
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                tokio::time::sleep(min_interval - elapsed).await;
            }
        }
    }

    /// One batch call, with exactly one token-refresh-and-retry cycle on
    /// an auth failure — a permanently invalid credential must not loop.
    async fn send_batch_with_auth_retry(
        &self,
        events: &[WorkflowEvent],
    ) -> Result<Vec<crate::transport::BatchItemOutcome>> {
        let token = self.auth.access_token().await?;

        match self.call_transport(&token, events).await {
            Err(Error::Auth(reason)) => {
                tracing::info!("Batch rejected for auth ({}); refreshing token once", reason);
                let token = self.auth.refresh_access_token().await?;
                self.call_transport(&token, events).await
            }
            other => other,
        }
    }

    async fn call_transport(
        &self,
        token: &str,
        events: &[WorkflowEvent],
    ) -> Result<Vec<crate::transport::BatchItemOutcome>> {
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        tokio::time::timeout(timeout, self.transport.send_batch(token, events))
            .await
            .map_err(|_| Error::Timeout(timeout.as_millis() as u64))?
    }
}
