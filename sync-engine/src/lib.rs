//! FlowLedger Sync Engine
//!
//! Offline-first delivery of workflow events to a remote team service.
//!
//! # Architecture
//!
//! - **Emitter**: the single entry point for producing events; validates,
//!   stamps, appends to the durable log and routes to delivery — the
//!   calling workflow command never fails because of sync
//! - **Offline Queue**: bounded, durable FIFO of events awaiting remote
//!   acknowledgment; separate from the log (delivery, not truth)
//! - **Scheduler**: background worker draining the queue in batches with
//!   exponential backoff and rate limiting
//! - **Trait seams**: auth and transport are consumed interfaces; the
//!   engine decides only when to call them and what to do with results

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod emitter;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod transport;

// Re-exports
pub use emitter::{EmitOptions, Emitter};
pub use error::{Error, Result};
pub use queue::{OfflineQueue, QueueEntry, QueueStatus};
pub use scheduler::{SchedulerState, SyncHandle, SyncReport, SyncScheduler};
pub use transport::{
    AuthProvider, BatchItemOutcome, BatchItemStatus, BatchTransport, ConnectionStatus,
    LiveTransport,
};
