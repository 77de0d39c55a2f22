//! Bounded durable offline queue
//!
//! Delivery-side store for events not yet acknowledged by the remote
//! service. Separate from the durable log on purpose: every queued event
//! is already durably logged, so abandoning the queue loses sync
//! progress, never history. SQLite in WAL mode gives crash-safe
//! enqueue/ack across concurrent CLI processes.
//!
//! At capacity, new entries are rejected with a visible warning — losing
//! the newest unsent work silently would be worse than a visible
//! failure. Entries that exhaust their retries move to a dead-letter
//! table, never disappear without trace.

use crate::error::{Error, Result};
use crate::metrics::{DEAD_LETTERS_TOTAL, QUEUE_REJECTED_TOTAL};
use chrono::{DateTime, Utc};
use event_core::{EventId, WorkflowEvent};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;

/// One queued event with delivery metadata
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// The full event (identical to its durable-log record)
    pub event: WorkflowEvent,
    /// When the entry was enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub retry_count: u32,
}

/// Operator-facing queue status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    /// Pending entries
    pub size: usize,
    /// Enqueue time of the oldest pending entry
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
}

/// SQLite-backed bounded FIFO
#[derive(Debug)]
pub struct OfflineQueue {
    conn: Mutex<Connection>,
    capacity: usize,
    max_retries: u32,
}

impl OfflineQueue {
    /// Open or create the queue database
    pub fn open(path: impl Into<PathBuf>, capacity: usize, max_retries: u32) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::QueueStorage(e.to_string()))?;
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queue_entries (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id    TEXT NOT NULL UNIQUE,
                event_json  TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS dead_letters (
                event_id    TEXT PRIMARY KEY,
                event_json  TEXT NOT NULL,
                reason      TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                failed_at   TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            capacity,
            max_retries,
        })
    }

    /// Enqueue one event for later delivery.
    ///
    /// Re-enqueueing an already-pending event id is a no-op
    /// (at-least-once delivery tolerates duplicates on the remote side;
    /// the queue does not need two copies). At capacity the entry is
    /// rejected with [`Error::QueueFull`].
    pub fn enqueue(&self, event: &WorkflowEvent) -> Result<()> {
        let conn = self.conn.lock();

        let pending: i64 =
            conn.query_row("SELECT COUNT(*) FROM queue_entries", [], |row| row.get(0))?;
        if pending as usize >= self.capacity {
            QUEUE_REJECTED_TOTAL.inc();
            tracing::warn!(
                event_id = %event.event_id,
                capacity = self.capacity,
                "Offline queue full; event not queued for sync (it remains in the local log)"
            );
            return Err(Error::QueueFull {
                capacity: self.capacity,
                event_id: event.event_id.to_string(),
            });
        }

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO queue_entries (event_id, event_json, enqueued_at, retry_count)
             VALUES (?1, ?2, ?3, 0)",
            params![
                event.event_id.to_string(),
                event.to_json_line().map_err(Error::Core)?,
                Utc::now().to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            tracing::debug!(event_id = %event.event_id, "Event already queued");
        }
        Ok(())
    }

    /// Oldest pending entries, up to `max_n`.
    ///
    /// Entries stay queued until acknowledged; a crash between dequeue
    /// and ack redelivers them (at-least-once).
    pub fn dequeue_batch(&self, max_n: usize) -> Result<Vec<QueueEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT event_id, event_json, enqueued_at, retry_count
             FROM queue_entries ORDER BY seq LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![max_n as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        let mut unparsable = Vec::new();
        for row in rows {
            let (event_id, event_json, enqueued_at, retry_count) = row?;
            match WorkflowEvent::from_json_line(&event_json) {
                Ok(event) => entries.push(QueueEntry {
                    event,
                    enqueued_at: enqueued_at
                        .parse()
                        .unwrap_or_else(|_| Utc::now()),
                    retry_count: retry_count as u32,
                }),
                Err(e) => {
                    tracing::warn!(
                        event_id = %event_id,
                        "Queued event unparsable; moving to dead letters: {}",
                        e
                    );
                    unparsable.push((event_id, event_json, retry_count));
                }
            }
        }
        drop(stmt);

        for (event_id, event_json, retry_count) in unparsable {
            Self::dead_letter(&conn, &event_id, &event_json, "unparsable entry", retry_count)?;
        }

        Ok(entries)
    }

    /// Remove entries confirmed (acknowledged or duplicate) by the remote
    pub fn ack(&self, event_ids: &[EventId]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut removed = 0;
        for event_id in event_ids {
            removed += tx.execute(
                "DELETE FROM queue_entries WHERE event_id = ?1",
                params![event_id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Record a failed delivery attempt for each entry.
    ///
    /// Entries that exceed the retry budget move to the dead-letter
    /// table; the rest stay queued with an incremented retry count.
    pub fn requeue(&self, event_ids: &[EventId], reason: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for event_id in event_ids {
            let id = event_id.to_string();
            tx.execute(
                "UPDATE queue_entries SET retry_count = retry_count + 1 WHERE event_id = ?1",
                params![id],
            )?;

            let row: Option<(String, i64)> = tx
                .query_row(
                    "SELECT event_json, retry_count FROM queue_entries WHERE event_id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((event_json, retry_count)) = row {
                if retry_count as u32 > self.max_retries {
                    Self::dead_letter(&tx, &id, &event_json, reason, retry_count)?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn dead_letter(
        conn: &Connection,
        event_id: &str,
        event_json: &str,
        reason: &str,
        retry_count: i64,
    ) -> Result<()> {
        DEAD_LETTERS_TOTAL.inc();
        tracing::warn!(
            event_id = %event_id,
            retry_count,
            "Delivery abandoned after retries; entry preserved in dead letters: {}",
            reason
        );
        conn.execute(
            "INSERT OR REPLACE INTO dead_letters
             (event_id, event_json, reason, retry_count, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![event_id, event_json, reason, retry_count, Utc::now().to_rfc3339()],
        )?;
        conn.execute(
            "DELETE FROM queue_entries WHERE event_id = ?1",
            params![event_id],
        )?;
        Ok(())
    }

    /// Pending entry count
    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM queue_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Operator-facing status
    pub fn status(&self) -> Result<QueueStatus> {
        let conn = self.conn.lock();
        let size: i64 =
            conn.query_row("SELECT COUNT(*) FROM queue_entries", [], |row| row.get(0))?;
        let oldest: Option<String> = conn
            .query_row(
                "SELECT enqueued_at FROM queue_entries ORDER BY seq LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        Ok(QueueStatus {
            size: size as usize,
            oldest_enqueued_at: oldest.and_then(|s| s.parse().ok()),
        })
    }

    /// Entries abandoned after exhausting retries
    pub fn dead_letter_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
