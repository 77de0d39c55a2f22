//! Append-only, date-partitioned durable log
//!
//! The log is the only source of truth. One JSONL file per day
//! (`events-YYYY-MM-DD.jsonl`); existing partitions are never rewritten,
//! which keeps the files merge-friendly under version control. Appends
//! take an advisory file lock scoped to the single write so concurrent
//! CLI processes interleave safely without serializing reads.

use crate::error::{Error, Result};
use crate::metrics::CORRUPT_LINES_TOTAL;
use crate::types::{EntityId, EventType, WorkflowEvent};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Read-side filter over the log
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events for this entity
    pub entity_id: Option<EntityId>,
    /// Only events of this type
    pub event_type: Option<EventType>,
    /// Only events at or after this causal position
    pub since_clock: Option<u64>,
}

impl EventFilter {
    /// Filter matching every event (full scan)
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one entity
    pub fn entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    /// Restrict to one event type
    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    /// Restrict to events with `logical_clock >= since`
    pub fn since_clock(mut self, since: u64) -> Self {
        self.since_clock = Some(since);
        self
    }

    /// True when no restriction is set
    pub fn is_unfiltered(&self) -> bool {
        self.entity_id.is_none() && self.event_type.is_none() && self.since_clock.is_none()
    }

    /// Does this event pass the filter?
    pub fn matches(&self, event: &WorkflowEvent) -> bool {
        if let Some(ref entity_id) = self.entity_id {
            if &event.entity_id != entity_id {
                return false;
            }
        }
        if let Some(event_type) = self.event_type {
            if event.event_type() != event_type {
                return false;
            }
        }
        if let Some(since) = self.since_clock {
            if event.logical_clock < since {
                return false;
            }
        }
        true
    }
}

/// Append-only date-partitioned JSONL store
#[derive(Debug)]
pub struct DurableLog {
    dir: PathBuf,
    fsync_on_append: bool,
}

impl DurableLog {
    /// Open (creating the directory if needed)
    pub fn open(dir: impl Into<PathBuf>, fsync_on_append: bool) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            fsync_on_append,
        })
    }

    /// Directory holding the partitions
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one event to its date partition.
    ///
    /// The advisory lock covers only this write; readers never take it.
    pub fn append(&self, event: &WorkflowEvent) -> Result<()> {
        let line = event.to_json_line()?;
        let path = self.partition_path(&event.date_partition());

        let lock = self.acquire_append_lock()?;

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        if self.fsync_on_append {
            file.sync_all()?;
        }

        // Advisory lock is released when the handle closes
        drop(lock);

        tracing::debug!(
            event_id = %event.event_id,
            entity_id = %event.entity_id,
            logical_clock = event.logical_clock,
            "Event appended"
        );

        Ok(())
    }

    fn acquire_append_lock(&self) -> Result<File> {
        let lock_path = self.dir.join("log.lock");
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        FileExt::lock_exclusive(&lock)
            .map_err(|e| Error::Concurrency(format!("log append lock: {}", e)))?;
        Ok(lock)
    }

    /// Read matching events from all partitions, sorted by causal order
    /// `(logical_clock, event_id)` — never by file order or timestamp.
    pub fn read(&self, filter: &EventFilter) -> Result<Vec<WorkflowEvent>> {
        let partitions = self.partitions()?;
        self.read_partitions(&partitions, filter)
    }

    /// Read matching events from the given partitions only
    pub fn read_partitions(
        &self,
        partitions: &[PathBuf],
        filter: &EventFilter,
    ) -> Result<Vec<WorkflowEvent>> {
        let mut events = Vec::new();
        for path in partitions {
            self.scan_partition(path, |event| {
                if filter.matches(&event) {
                    events.push(event);
                }
            })?;
        }
        events.sort_by(|a, b| {
            a.logical_clock
                .cmp(&b.logical_clock)
                .then(a.event_id.cmp(&b.event_id))
        });
        Ok(events)
    }

    /// Visit every parseable event in one partition.
    ///
    /// A line that fails to parse is skipped with a warning — one bad
    /// record must never block reconstruction of everything else.
    fn scan_partition<F>(&self, path: &Path, mut visit: F) -> Result<()>
    where
        F: FnMut(WorkflowEvent),
    {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match WorkflowEvent::from_json_line(&line) {
                Ok(event) => visit(event),
                Err(e) => {
                    CORRUPT_LINES_TOTAL.inc();
                    tracing::warn!(
                        partition = %path.display(),
                        line = lineno + 1,
                        "Skipping unparsable log line: {}",
                        e
                    );
                }
            }
        }
        Ok(())
    }

    /// All partition files, oldest first (file name order is date order)
    pub fn partitions(&self) -> Result<Vec<PathBuf>> {
        let mut partitions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if name.starts_with("events-") && name.ends_with(".jsonl") {
                partitions.push(path);
            }
        }
        partitions.sort();
        Ok(partitions)
    }

    /// Path of the partition for a `YYYY-MM-DD` date
    pub fn partition_path(&self, date: &str) -> PathBuf {
        self.dir.join(format!("events-{}.jsonl", date))
    }

    /// Maximum logical clock across the whole log (0 when empty).
    ///
    /// The clock recovery path scans with this.
    pub fn max_clock(&self) -> Result<u64> {
        let mut max = 0;
        for path in self.partitions()? {
            self.scan_partition(&path, |event| {
                max = max.max(event.logical_clock);
            })?;
        }
        Ok(max)
    }

    /// Number of parseable events across the whole log
    pub fn event_count(&self) -> Result<u64> {
        let mut count = 0;
        for path in self.partitions()? {
            self.scan_partition(&path, |_| count += 1)?;
        }
        Ok(count)
    }
}
