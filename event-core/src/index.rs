//! Derived query index over the durable log
//!
//! SQLite lookup table keyed by event id. Never authoritative: the index
//! can be deleted at any time and rebuilt from a full log replay, so
//! corruption here costs a slower read, never data. Updates are
//! idempotent because rebuild replays the whole log.

use crate::error::Result;
use crate::log::{DurableLog, EventFilter};
use crate::metrics::INDEX_REBUILDS_TOTAL;
use crate::types::WorkflowEvent;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::PathBuf;

/// One row of the index (never authoritative)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    /// Event id (primary key)
    pub event_id: String,
    /// Causal position
    pub logical_clock: u64,
    /// Entity the event concerns
    pub entity_id: String,
    /// Kind of entity
    pub entity_type: String,
    /// Registered event type
    pub event_type: String,
    /// Log partition holding the event
    pub date_partition: String,
}

/// SQLite-backed secondary index
#[derive(Debug)]
pub struct QueryIndex {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl QueryIndex {
    /// Open or create the index database
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS index_records (
                event_id       TEXT PRIMARY KEY,
                logical_clock  INTEGER NOT NULL,
                entity_id      TEXT NOT NULL,
                entity_type    TEXT NOT NULL,
                event_type     TEXT NOT NULL,
                date_partition TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_entity ON index_records (entity_id);
            CREATE INDEX IF NOT EXISTS idx_records_type ON index_records (event_type);
            CREATE INDEX IF NOT EXISTS idx_records_clock ON index_records (logical_clock);",
        )?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Index file path
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// True while the index file is present on disk.
    ///
    /// An open connection keeps a deleted file readable on some
    /// platforms, so the store checks this before trusting a query.
    pub fn file_present(&self) -> bool {
        self.path.exists()
    }

    /// Insert one record; inserting the same `event_id` twice is a no-op
    pub fn update(&self, event: &WorkflowEvent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO index_records
             (event_id, logical_clock, entity_id, entity_type, event_type, date_partition)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.event_id.to_string(),
                event.logical_clock as i64,
                event.entity_id.as_str(),
                event.entity_type.as_str(),
                event.event_type().as_str(),
                event.date_partition(),
            ],
        )?;
        Ok(())
    }

    /// Matching event ids, in causal order
    pub fn query(&self, filter: &EventFilter) -> Result<Vec<String>> {
        let (where_clause, args) = Self::where_clause(filter);
        let sql = format!(
            "SELECT event_id FROM index_records {} ORDER BY logical_clock, event_id",
            where_clause
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| row.get(0))?;

        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    /// Distinct partitions containing matching events, oldest first
    pub fn partitions_for(&self, filter: &EventFilter) -> Result<Vec<String>> {
        let (where_clause, args) = Self::where_clause(filter);
        let sql = format!(
            "SELECT DISTINCT date_partition FROM index_records {} ORDER BY date_partition",
            where_clause
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| row.get(0))?;

        let mut partitions = Vec::new();
        for partition in rows {
            partitions.push(partition?);
        }
        Ok(partitions)
    }

    fn where_clause(filter: &EventFilter) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut args = Vec::new();

        if let Some(ref entity_id) = filter.entity_id {
            clauses.push(format!("entity_id = ?{}", args.len() + 1));
            args.push(entity_id.as_str().to_string());
        }
        if let Some(event_type) = filter.event_type {
            clauses.push(format!("event_type = ?{}", args.len() + 1));
            args.push(event_type.as_str().to_string());
        }
        if let Some(since) = filter.since_clock {
            clauses.push(format!("logical_clock >= ?{}", args.len() + 1));
            args.push(since.to_string());
        }

        if clauses.is_empty() {
            (String::new(), args)
        } else {
            (format!("WHERE {}", clauses.join(" AND ")), args)
        }
    }

    /// Matching rows in full, for diagnostics and verification tooling
    pub fn records(&self, filter: &EventFilter) -> Result<Vec<IndexRecord>> {
        let (where_clause, args) = Self::where_clause(filter);
        let sql = format!(
            "SELECT event_id, logical_clock, entity_id, entity_type, event_type, date_partition
             FROM index_records {} ORDER BY logical_clock, event_id",
            where_clause
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| {
            Ok(IndexRecord {
                event_id: row.get(0)?,
                logical_clock: row.get::<_, i64>(1)? as u64,
                entity_id: row.get(2)?,
                entity_type: row.get(3)?,
                event_type: row.get(4)?,
                date_partition: row.get(5)?,
            })
        })?;

        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }
        Ok(records)
    }

    /// Number of indexed records
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM index_records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Row-count check against the log
    pub fn verify(&self, expected_events: u64) -> Result<bool> {
        Ok(self.file_present() && self.count()? == expected_events)
    }

    /// Drop everything and re-derive from a full log replay
    pub fn rebuild(&self, log: &DurableLog) -> Result<()> {
        INDEX_REBUILDS_TOTAL.inc();
        tracing::info!(index = %self.path.display(), "Rebuilding query index from log");

        let events = log.read(&EventFilter::all())?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM index_records", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO index_records
                 (event_id, logical_clock, entity_id, entity_type, event_type, date_partition)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for event in &events {
                stmt.execute(params![
                    event.event_id.to_string(),
                    event.logical_clock as i64,
                    event.entity_id.as_str(),
                    event.entity_type.as_str(),
                    event.event_type().as_str(),
                    event.date_partition(),
                ])?;
            }
        }
        tx.commit()?;

        tracing::info!(records = events.len(), "Index rebuild complete");
        Ok(())
    }
}
