//! Orchestration layer over the log, index and resolver
//!
//! The store enforces the arena/index discipline: the log is written
//! first and is the only authority; the index is updated synchronously
//! after each append and rebuilt transparently whenever it is missing or
//! inconsistent, so readers never see an error for index damage.

use crate::config::Config;
use crate::error::Result;
use crate::index::QueryIndex;
use crate::log::{DurableLog, EventFilter};
use crate::resolver::{self, Reconstruction};
use crate::types::{EntityId, WorkflowEvent};
use parking_lot::Mutex;

/// Store statistics for operator status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Parseable events in the log
    pub total_events: u64,
    /// Date partitions on disk
    pub total_partitions: u64,
    /// Records currently in the derived index
    pub indexed_records: u64,
}

/// Event store: durable log + derived index + conflict-resolving replay
#[derive(Debug)]
pub struct EventStore {
    log: DurableLog,
    index: Mutex<QueryIndex>,
    config: Config,
}

impl EventStore {
    /// Open the store, verifying the index against the log.
    ///
    /// A row-count mismatch (stale or damaged index) triggers a rebuild
    /// here rather than surfacing later as wrong query results.
    pub fn open(config: Config) -> Result<Self> {
        let log = DurableLog::open(config.events_dir(), config.log.fsync_on_append)?;
        let index = QueryIndex::open(config.index_path())?;

        let expected = log.event_count()?;
        if !index.verify(expected)? {
            tracing::warn!(
                expected_records = expected,
                "Query index out of step with log; rebuilding"
            );
            index.rebuild(&log)?;
        }

        Ok(Self {
            log,
            index: Mutex::new(index),
            config,
        })
    }

    /// The underlying log (for clock recovery scans)
    pub fn log(&self) -> &DurableLog {
        &self.log
    }

    /// Append one validated event: log first, then the synchronous index
    /// update.
    ///
    /// An index failure does not fail the append — the event is already
    /// durable in the log and the index is derived state that the next
    /// verify or rebuild repairs.
    pub fn append(&self, event: &WorkflowEvent) -> Result<()> {
        event.validate()?;
        self.log.append(event)?;

        if let Err(e) = self.index.lock().update(event) {
            tracing::warn!(
                event_id = %event.event_id,
                "Index update failed (rebuild will repair): {}",
                e
            );
        }
        Ok(())
    }

    /// Read matching events in causal order.
    ///
    /// Filtered reads go through the index to touch only matching
    /// partitions; a missing or failing index is rebuilt transparently.
    pub fn read(&self, filter: &EventFilter) -> Result<Vec<WorkflowEvent>> {
        if filter.is_unfiltered() {
            return self.log.read(filter);
        }

        let partitions = match self.indexed_partitions(filter) {
            Ok(partitions) => partitions,
            Err(e) => {
                tracing::warn!("Index query failed ({}); falling back to full scan", e);
                return self.log.read(filter);
            }
        };

        let paths: Vec<_> = partitions
            .iter()
            .map(|date| self.log.partition_path(date))
            .collect();
        self.log.read_partitions(&paths, filter)
    }

    fn indexed_partitions(&self, filter: &EventFilter) -> Result<Vec<String>> {
        let mut index = self.index.lock();

        if !index.file_present() {
            tracing::warn!("Query index file missing; rebuilding from log");
            *index = QueryIndex::open(self.config.index_path())?;
            index.rebuild(&self.log)?;
        }

        match index.partitions_for(filter) {
            Ok(partitions) => Ok(partitions),
            Err(e) => {
                tracing::warn!("Index query error ({}); rebuilding from log", e);
                *index = QueryIndex::open(self.config.index_path())?;
                index.rebuild(&self.log)?;
                index.partitions_for(filter)
            }
        }
    }

    /// Replay one entity into its current state, resolving conflicts
    pub fn reconstruct(&self, entity_id: &EntityId) -> Result<Option<Reconstruction>> {
        let events = self.read(&EventFilter::all().entity(entity_id.clone()))?;
        resolver::reconstruct(&events)
    }

    /// Operator action: drop and re-derive the index from a full replay
    pub fn rebuild_index(&self) -> Result<()> {
        let mut index = self.index.lock();
        *index = QueryIndex::open(self.config.index_path())?;
        index.rebuild(&self.log)
    }

    /// Maximum logical clock present in the log (0 when empty)
    pub fn max_clock(&self) -> Result<u64> {
        self.log.max_clock()
    }

    /// Storage statistics
    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            total_events: self.log.event_count()?,
            total_partitions: self.log.partitions()?.len() as u64,
            indexed_records: self.index.lock().count()?,
        })
    }
}
