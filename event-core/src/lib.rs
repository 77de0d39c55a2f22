//! FlowLedger Event Core
//!
//! Append-only workflow event log with causal (Lamport) ordering and a
//! derived, rebuildable query index.
//!
//! # Architecture
//!
//! - **Event Sourcing**: All workflow state is derived from immutable events
//! - **Arena/Index**: Date-partitioned JSONL files are the only source of
//!   truth; the SQLite index is derived and always rebuildable
//! - **Logical Clock**: Causal ordering without wall-clock dependency
//! - **Deterministic Conflicts**: Concurrent writes at the same causal
//!   position resolve by last-write-wins on the sortable event id
//!
//! # Invariants
//!
//! - Causal monotonicity: clock values never decrease
//! - Deterministic replay: Same events → same state
//! - Append-only: Events never modified or deleted
//! - Derived index: never authoritative, corruption never loses data

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod clock;
pub mod config;
pub mod error;
pub mod index;
pub mod log;
pub mod metrics;
pub mod resolver;
pub mod store;
pub mod types;

// Re-exports
pub use clock::LogicalClock;
pub use config::Config;
pub use error::{Error, Result};
pub use index::{IndexRecord, QueryIndex};
pub use log::{DurableLog, EventFilter};
pub use resolver::Reconstruction;
pub use store::{EventStore, StoreStats};
pub use types::{
    Conflict, EntityId, EntityState, EntityType, EventId, EventPayload, EventType, WorkflowEvent,
};
