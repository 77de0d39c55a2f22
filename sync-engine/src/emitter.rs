//! Event emitter — the single entry point for producing events
//!
//! Emission is non-blocking by contract, not as an optimization: the
//! calling workflow command (a lane transition, a feature creation) must
//! succeed even when validation, clock persistence, queueing or delivery
//! fails. Only the durable-log append can fail meaningfully, and even
//! that is caught at this boundary and surfaced as a warning. Network
//! I/O never happens on the calling path; the best-effort immediate send
//! runs in a spawned task and falls through to the offline queue.

use crate::error::Error;
use crate::queue::{OfflineQueue, QueueStatus};
use crate::scheduler::{spawn_sync_scheduler, SchedulerState, SyncHandle, SyncReport};
use crate::transport::{AuthProvider, BatchTransport, ConnectionStatus, LiveTransport};
use chrono::Utc;
use event_core::metrics::EVENTS_RECORDED_TOTAL;
use event_core::store::StoreStats;
use event_core::{
    Config, EntityId, EntityType, EventFilter, EventId, EventPayload, LogicalClock,
    Reconstruction, EventStore, WorkflowEvent,
};
use std::sync::{Arc, OnceLock};

/// Per-emission context supplied by the caller
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    /// Event/command that caused this emission
    pub causation_id: Option<String>,
    /// Groups events from one logical operation/session
    pub correlation_id: Option<String>,
}

/// Process-wide emission context: clock, store, queue, auth and
/// transports wired together once.
///
/// Constructed explicitly and either passed to call sites or installed
/// into the process-wide accessor ([`install`]/[`global`]); there is no
/// hidden mutable global, and tests substitute fakes through the trait
/// seams.
pub struct Emitter {
    store: Arc<EventStore>,
    clock: Arc<LogicalClock>,
    queue: Arc<OfflineQueue>,
    auth: Arc<dyn AuthProvider>,
    live: Option<Arc<dyn LiveTransport>>,
    sync: SyncHandle,
    node_id: String,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

static GLOBAL: OnceLock<Arc<Emitter>> = OnceLock::new();

/// Install the process-wide emitter (first caller wins)
pub fn install(emitter: Arc<Emitter>) -> crate::Result<()> {
    GLOBAL
        .set(emitter)
        .map_err(|_| Error::Scheduler("emitter already installed".to_string()))
}

/// The installed process-wide emitter, if any
pub fn global() -> Option<Arc<Emitter>> {
    GLOBAL.get().cloned()
}

impl Emitter {
    /// Open the store, clock and queue, spawn the sync scheduler, and
    /// wire everything into one emission context.
    pub fn start(
        config: Config,
        auth: Arc<dyn AuthProvider>,
        live: Option<Arc<dyn LiveTransport>>,
        batch: Arc<dyn BatchTransport>,
    ) -> crate::Result<Self> {
        let store = Arc::new(EventStore::open(config.clone())?);

        let log_for_recovery = Arc::clone(&store);
        let clock = Arc::new(LogicalClock::open(config.clock_path(), move || {
            log_for_recovery.max_clock()
        })?);

        let queue = Arc::new(OfflineQueue::open(
            config.queue_path(),
            config.queue.capacity,
            config.queue.max_retries,
        )?);

        let sync = spawn_sync_scheduler(
            Arc::clone(&queue),
            Arc::clone(&auth),
            batch,
            config.sync.clone(),
        );

        let node_id = clock.node_id();

        Ok(Self {
            store,
            clock,
            queue,
            auth,
            live,
            sync,
            node_id,
        })
    }

    /// Stable producer id stamped on every event
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Emit one event.
    ///
    /// Returns the recorded event, or `None` when it was discarded — a
    /// warning has already been logged in that case. Nothing in here
    /// raises into the caller.
    pub fn emit(
        &self,
        entity_id: impl Into<String>,
        entity_type: EntityType,
        payload: EventPayload,
        opts: EmitOptions,
    ) -> Option<WorkflowEvent> {
        let entity_id = EntityId::new(entity_id);
        let event_type = payload.event_type();

        // Validate before touching the clock; a malformed event is
        // discarded, never logged.
        if entity_id.is_empty() {
            EVENTS_RECORDED_TOTAL
                .with_label_values(&[event_type.as_str(), "discarded"])
                .inc();
            tracing::warn!(
                event_type = %event_type,
                "Event discarded: empty entity id"
            );
            return None;
        }
        if let Err(e) = payload.validate() {
            EVENTS_RECORDED_TOTAL
                .with_label_values(&[event_type.as_str(), "discarded"])
                .inc();
            tracing::warn!(
                event_type = %event_type,
                entity_id = %entity_id,
                "Event discarded: {}",
                e
            );
            return None;
        }

        let logical_clock = self.clock.tick();

        let event = WorkflowEvent {
            event_id: EventId::generate(),
            entity_id,
            entity_type,
            logical_clock,
            node_id: self.node_id.clone(),
            causation_id: opts.causation_id,
            correlation_id: opts.correlation_id,
            team_id: self.auth.team_id(),
            timestamp: Utc::now(),
            payload,
        };

        if let Err(e) = self.store.append(&event) {
            EVENTS_RECORDED_TOTAL
                .with_label_values(&[event_type.as_str(), "storage_error"])
                .inc();
            tracing::warn!(
                event_id = %event.event_id,
                entity_id = %event.entity_id,
                "Event not recorded (append failed): {}",
                e
            );
            return None;
        }

        EVENTS_RECORDED_TOTAL
            .with_label_values(&[event_type.as_str(), "recorded"])
            .inc();

        self.route(event.clone());
        Some(event)
    }

    /// Decide the delivery path for a freshly recorded event.
    ///
    /// With a live, authenticated connection the send is attempted in a
    /// spawned task — failure there enqueues instead. Everything else
    /// goes straight to the offline queue. Delivery failures never reach
    /// the caller; the event is already durable in the log.
    fn route(&self, event: WorkflowEvent) {
        let live = match (&self.live, self.auth.is_authenticated()) {
            (Some(live), true) if live.is_connected() => Arc::clone(live),
            _ => {
                self.enqueue_for_sync(&event);
                return;
            }
        };

        let auth = Arc::clone(&self.auth);
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            let sent = match auth.access_token().await {
                Ok(token) => match live.send(&token, &event).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!(
                            event_id = %event.event_id,
                            "Immediate send failed; falling back to queue: {}",
                            e
                        );
                        false
                    }
                },
                Err(e) => {
                    tracing::debug!("No access token for immediate send: {}", e);
                    false
                }
            };

            if !sent {
                if let Err(e) = queue.enqueue(&event) {
                    Self::warn_enqueue_failed(&event, &e);
                }
            }
        });
    }

    fn enqueue_for_sync(&self, event: &WorkflowEvent) {
        if let Err(e) = self.queue.enqueue(event) {
            Self::warn_enqueue_failed(event, &e);
        }
    }

    fn warn_enqueue_failed(event: &WorkflowEvent, error: &Error) {
        // QueueFull already warned with capacity details at the queue
        if !matches!(error, Error::QueueFull { .. }) {
            tracing::warn!(
                event_id = %event.event_id,
                "Event not queued for sync (it remains in the local log): {}",
                error
            );
        }
    }

    // Convenience emitters, one per registered event type

    /// Record a lane transition
    pub fn emit_status_changed(
        &self,
        entity_id: impl Into<String>,
        entity_type: EntityType,
        from: Option<String>,
        to: impl Into<String>,
        opts: EmitOptions,
    ) -> Option<WorkflowEvent> {
        self.emit(
            entity_id,
            entity_type,
            EventPayload::StatusChanged {
                from,
                to: to.into(),
                note: None,
            },
            opts,
        )
    }

    /// Record entity creation
    pub fn emit_created(
        &self,
        entity_id: impl Into<String>,
        entity_type: EntityType,
        name: impl Into<String>,
        parent_id: Option<String>,
        opts: EmitOptions,
    ) -> Option<WorkflowEvent> {
        self.emit(
            entity_id,
            entity_type,
            EventPayload::Created {
                name: name.into(),
                description: None,
                parent_id,
            },
            opts,
        )
    }

    /// Record an agent assignment
    pub fn emit_assigned(
        &self,
        entity_id: impl Into<String>,
        entity_type: EntityType,
        agent: impl Into<String>,
        role: Option<String>,
        opts: EmitOptions,
    ) -> Option<WorkflowEvent> {
        self.emit(
            entity_id,
            entity_type,
            EventPayload::Assigned {
                agent: agent.into(),
                role,
            },
            opts,
        )
    }

    /// Record completion
    pub fn emit_completed(
        &self,
        entity_id: impl Into<String>,
        entity_type: EntityType,
        outcome: impl Into<String>,
        summary: Option<String>,
        opts: EmitOptions,
    ) -> Option<WorkflowEvent> {
        self.emit(
            entity_id,
            entity_type,
            EventPayload::Completed {
                outcome: outcome.into(),
                summary,
            },
            opts,
        )
    }

    /// Record a history entry
    pub fn emit_history_added(
        &self,
        entity_id: impl Into<String>,
        entity_type: EntityType,
        entry: impl Into<String>,
        author: Option<String>,
        opts: EmitOptions,
    ) -> Option<WorkflowEvent> {
        self.emit(
            entity_id,
            entity_type,
            EventPayload::HistoryAdded {
                entry: entry.into(),
                author,
            },
            opts,
        )
    }

    /// Record a command error
    pub fn emit_error_logged(
        &self,
        entity_id: impl Into<String>,
        entity_type: EntityType,
        message: impl Into<String>,
        command: Option<String>,
        opts: EmitOptions,
    ) -> Option<WorkflowEvent> {
        self.emit(
            entity_id,
            entity_type,
            EventPayload::ErrorLogged {
                message: message.into(),
                command,
            },
            opts,
        )
    }

    /// Record a resolved dependency
    pub fn emit_dependency_resolved(
        &self,
        entity_id: impl Into<String>,
        entity_type: EntityType,
        dependency_id: impl Into<String>,
        resolution: impl Into<String>,
        opts: EmitOptions,
    ) -> Option<WorkflowEvent> {
        self.emit(
            entity_id,
            entity_type,
            EventPayload::DependencyResolved {
                dependency_id: dependency_id.into(),
                resolution: resolution.into(),
            },
            opts,
        )
    }

    // Read-side and operator surfaces

    /// Read events for state reconstruction and reporting
    pub fn read(&self, filter: &EventFilter) -> crate::Result<Vec<WorkflowEvent>> {
        Ok(self.store.read(filter)?)
    }

    /// Replay one entity into its current state, resolving conflicts
    pub fn reconstruct(&self, entity_id: &EntityId) -> crate::Result<Option<Reconstruction>> {
        Ok(self.store.reconstruct(entity_id)?)
    }

    /// Offline queue status for operator output
    pub fn queue_status(&self) -> crate::Result<QueueStatus> {
        self.queue.status()
    }

    /// Operator-facing connection state
    pub fn connection_status(&self) -> ConnectionStatus {
        if !self.auth.is_authenticated() {
            return ConnectionStatus::Offline;
        }
        match &self.live {
            Some(live) if live.is_connected() => ConnectionStatus::Connected,
            Some(_) => ConnectionStatus::Reconnecting,
            None => ConnectionStatus::OfflineBatchMode,
        }
    }

    /// Background scheduler state
    pub fn scheduler_state(&self) -> SchedulerState {
        self.sync.state()
    }

    /// Operator action: immediate blocking drain of the offline queue
    pub async fn sync_now(&self) -> crate::Result<SyncReport> {
        self.sync.sync_now().await
    }

    /// Operator action: drop and re-derive the query index
    pub fn rebuild_index(&self) -> crate::Result<()> {
        Ok(self.store.rebuild_index()?)
    }

    /// Storage statistics for operator status output
    pub fn stats(&self) -> crate::Result<StoreStats> {
        Ok(self.store.stats()?)
    }

    /// Non-blocking shutdown request (safe from shutdown hooks)
    pub fn stop(&self) {
        self.sync.stop();
    }

    /// Orderly shutdown: stop the scheduler and wait for its final flush
    pub async fn shutdown(&self) {
        self.sync.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BatchItemOutcome, BatchItemStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeAuth {
        authenticated: bool,
    }

    #[async_trait]
    impl AuthProvider for FakeAuth {
        fn is_authenticated(&self) -> bool {
            self.authenticated
        }

        async fn access_token(&self) -> crate::Result<String> {
            if self.authenticated {
                Ok("token".to_string())
            } else {
                Err(Error::Auth("not authenticated".to_string()))
            }
        }

        async fn refresh_access_token(&self) -> crate::Result<String> {
            self.access_token().await
        }

        fn team_id(&self) -> Option<String> {
            self.authenticated.then(|| "team-1".to_string())
        }
    }

    struct AckingBatch;

    #[async_trait]
    impl BatchTransport for AckingBatch {
        async fn send_batch(
            &self,
            _token: &str,
            events: &[WorkflowEvent],
        ) -> crate::Result<Vec<BatchItemOutcome>> {
            Ok(events
                .iter()
                .map(|e| BatchItemOutcome {
                    event_id: e.event_id,
                    status: BatchItemStatus::Acknowledged,
                })
                .collect())
        }
    }

    struct FakeLive {
        connected: bool,
        fail_sends: bool,
        sent: Mutex<Vec<EventId>>,
    }

    impl FakeLive {
        fn new(connected: bool, fail_sends: bool) -> Self {
            Self {
                connected,
                fail_sends,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LiveTransport for FakeLive {
        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn send(&self, _token: &str, event: &WorkflowEvent) -> crate::Result<()> {
            if self.fail_sends {
                return Err(Error::Transport("socket closed".to_string()));
            }
            self.sent.lock().push(event.event_id);
            Ok(())
        }
    }

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.sync.interval_secs = 3600;
        config.sync.min_batch_interval_ms = 0;
        config
    }

    fn offline_emitter(dir: &TempDir) -> Emitter {
        Emitter::start(
            test_config(dir),
            Arc::new(FakeAuth {
                authenticated: false,
            }),
            None,
            Arc::new(AckingBatch),
        )
        .unwrap()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_emit_offline_logs_and_queues() {
        let dir = TempDir::new().unwrap();
        let emitter = offline_emitter(&dir);

        let event = emitter
            .emit_status_changed(
                "WP-1",
                EntityType::WorkPackage,
                Some("backlog".to_string()),
                "doing",
                EmitOptions::default(),
            )
            .expect("emission must succeed");

        assert_eq!(event.logical_clock, 1);
        assert!(event.team_id.is_none());

        let logged = emitter.read(&EventFilter::all()).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].event_id, event.event_id);

        assert_eq!(emitter.queue_status().unwrap().size, 1);
        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_emit_invalid_payload_discarded_without_raising() {
        let dir = TempDir::new().unwrap();
        let emitter = offline_emitter(&dir);

        let result = emitter.emit(
            "WP-1",
            EntityType::WorkPackage,
            EventPayload::StatusChanged {
                from: None,
                to: String::new(),
                note: None,
            },
            EmitOptions::default(),
        );

        assert!(result.is_none());
        assert!(emitter.read(&EventFilter::all()).unwrap().is_empty());
        assert_eq!(emitter.queue_status().unwrap().size, 0);
        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_emit_empty_entity_discarded() {
        let dir = TempDir::new().unwrap();
        let emitter = offline_emitter(&dir);

        let result = emitter.emit_history_added(
            "",
            EntityType::WorkPackage,
            "note",
            None,
            EmitOptions::default(),
        );
        assert!(result.is_none());
        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_emit_survives_full_queue() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.queue.capacity = 1;

        let emitter = Emitter::start(
            config,
            Arc::new(FakeAuth {
                authenticated: false,
            }),
            None,
            Arc::new(AckingBatch),
        )
        .unwrap();

        let first = emitter.emit_history_added(
            "WP-1",
            EntityType::WorkPackage,
            "first",
            None,
            EmitOptions::default(),
        );
        assert!(first.is_some());

        // Queue is full now; emission still succeeds and the event is
        // durably logged.
        let second = emitter.emit_history_added(
            "WP-1",
            EntityType::WorkPackage,
            "second",
            None,
            EmitOptions::default(),
        );
        assert!(second.is_some());

        assert_eq!(emitter.read(&EventFilter::all()).unwrap().len(), 2);
        assert_eq!(emitter.queue_status().unwrap().size, 1);
        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_live_send_bypasses_queue() {
        let dir = TempDir::new().unwrap();
        let live = Arc::new(FakeLive::new(true, false));

        let emitter = Emitter::start(
            test_config(&dir),
            Arc::new(FakeAuth {
                authenticated: true,
            }),
            Some(live.clone()),
            Arc::new(AckingBatch),
        )
        .unwrap();

        let event = emitter
            .emit_created(
                "F-1",
                EntityType::Feature,
                "auth feature",
                None,
                EmitOptions::default(),
            )
            .unwrap();
        assert_eq!(event.team_id.as_deref(), Some("team-1"));

        assert!(
            wait_until(|| live.sent.lock().contains(&event.event_id)).await,
            "live transport should have received the event"
        );
        assert_eq!(emitter.queue_status().unwrap().size, 0);
        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_live_send_falls_through_to_queue() {
        let dir = TempDir::new().unwrap();
        let live = Arc::new(FakeLive::new(true, true));

        let emitter = Emitter::start(
            test_config(&dir),
            Arc::new(FakeAuth {
                authenticated: true,
            }),
            Some(live),
            Arc::new(AckingBatch),
        )
        .unwrap();

        let event = emitter
            .emit_completed(
                "WP-1",
                EntityType::WorkPackage,
                "done",
                None,
                EmitOptions::default(),
            )
            .unwrap();

        let queue_status = || emitter.queue_status().map(|s| s.size).unwrap_or(0);
        assert!(
            wait_until(|| queue_status() == 1).await,
            "failed live send must fall through to the queue"
        );

        // The event stayed durable throughout
        let logged = emitter.read(&EventFilter::all()).unwrap();
        assert_eq!(logged[0].event_id, event.event_id);
        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_status_mapping() {
        let dir = TempDir::new().unwrap();

        let offline = offline_emitter(&dir);
        assert_eq!(offline.connection_status(), ConnectionStatus::Offline);
        offline.shutdown().await;

        let dir = TempDir::new().unwrap();
        let batch_only = Emitter::start(
            test_config(&dir),
            Arc::new(FakeAuth {
                authenticated: true,
            }),
            None,
            Arc::new(AckingBatch),
        )
        .unwrap();
        assert_eq!(
            batch_only.connection_status(),
            ConnectionStatus::OfflineBatchMode
        );
        batch_only.shutdown().await;

        let dir = TempDir::new().unwrap();
        let reconnecting = Emitter::start(
            test_config(&dir),
            Arc::new(FakeAuth {
                authenticated: true,
            }),
            Some(Arc::new(FakeLive::new(false, false))),
            Arc::new(AckingBatch),
        )
        .unwrap();
        assert_eq!(
            reconnecting.connection_status(),
            ConnectionStatus::Reconnecting
        );
        reconnecting.shutdown().await;

        let dir = TempDir::new().unwrap();
        let connected = Emitter::start(
            test_config(&dir),
            Arc::new(FakeAuth {
                authenticated: true,
            }),
            Some(Arc::new(FakeLive::new(true, false))),
            Arc::new(AckingBatch),
        )
        .unwrap();
        assert_eq!(connected.connection_status(), ConnectionStatus::Connected);
        connected.shutdown().await;
    }

    #[tokio::test]
    async fn test_clock_advances_across_emissions() {
        let dir = TempDir::new().unwrap();
        let emitter = offline_emitter(&dir);

        let clocks: Vec<u64> = (0..5)
            .filter_map(|i| {
                emitter
                    .emit_history_added(
                        "WP-1",
                        EntityType::WorkPackage,
                        format!("entry {}", i),
                        None,
                        EmitOptions::default(),
                    )
                    .map(|e| e.logical_clock)
            })
            .collect();

        assert_eq!(clocks, vec![1, 2, 3, 4, 5]);
        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_global_accessor_installs_once() {
        let dir = TempDir::new().unwrap();
        assert!(global().is_none());

        let emitter = Arc::new(offline_emitter(&dir));
        install(emitter.clone()).unwrap();
        assert!(global().is_some());

        // Second install is rejected; the first wiring stays
        assert!(install(emitter).is_err());
        global().unwrap().shutdown().await;
    }

    #[tokio::test]
    async fn test_convenience_emitters_shape_payloads() {
        let dir = TempDir::new().unwrap();
        let emitter = offline_emitter(&dir);

        emitter
            .emit_assigned(
                "WP-1",
                EntityType::WorkPackage,
                "agent-7",
                Some("reviewer".to_string()),
                EmitOptions::default(),
            )
            .unwrap();
        emitter
            .emit_error_logged(
                "WP-1",
                EntityType::WorkPackage,
                "merge failed",
                Some("specify implement".to_string()),
                EmitOptions::default(),
            )
            .unwrap();
        emitter
            .emit_dependency_resolved(
                "WP-1",
                EntityType::WorkPackage,
                "WP-0",
                "merged",
                EmitOptions::default(),
            )
            .unwrap();

        let state = emitter
            .reconstruct(&EntityId::new("WP-1"))
            .unwrap()
            .unwrap()
            .state;
        assert_eq!(state.assignee.as_deref(), Some("agent-7"));
        assert_eq!(state.errors_logged, 1);
        assert_eq!(state.resolved_dependencies, vec!["WP-0".to_string()]);
        emitter.shutdown().await;
    }
}
