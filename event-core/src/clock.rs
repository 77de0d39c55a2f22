//! Persisted logical (Lamport) clock
//!
//! Gives every event a causal position independent of wall clocks. The
//! counter is persisted on every increment with a write-temp-then-rename
//! so a crash can never leave a partially written clock file. If the file
//! is missing or unparsable the clock recovers from the maximum clock
//! value observed in the durable log.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Persisted clock state
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClockState {
    /// Current counter value
    value: u64,
    /// Stable, anonymized producer id
    node_id: String,
}

/// Monotonically increasing causal counter, persisted per increment
#[derive(Debug)]
pub struct LogicalClock {
    path: PathBuf,
    state: Mutex<ClockState>,
}

impl LogicalClock {
    /// Open the clock file, recovering from the log when it is unreadable.
    ///
    /// `recover_max` is consulted only when the persisted state is missing
    /// or corrupt; it must return the maximum `logical_clock` present in
    /// the durable log (0 for an empty log).
    pub fn open<F>(path: PathBuf, recover_max: F) -> Result<Self>
    where
        F: FnOnce() -> Result<u64>,
    {
        let state = match Self::read_state(&path) {
            Ok(state) => state,
            Err(e) => {
                let max = recover_max()?;
                tracing::warn!(
                    clock_path = %path.display(),
                    recovered_value = max,
                    "Clock file unreadable ({}), recovering from log scan",
                    e
                );
                ClockState {
                    value: max,
                    node_id: uuid::Uuid::new_v4().to_string(),
                }
            }
        };

        let clock = Self {
            path,
            state: Mutex::new(state),
        };
        clock.save()?;
        Ok(clock)
    }

    fn read_state(path: &PathBuf) -> Result<ClockState> {
        if !path.exists() {
            return Err(Error::Corruption(format!(
                "clock file {} missing",
                path.display()
            )));
        }
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Corruption(format!("clock file unparsable: {}", e)))
    }

    /// Increment for a locally produced event and return the new value.
    ///
    /// The in-memory value stays monotonic even if persistence fails; a
    /// persist failure is downgraded to a warning because emission must
    /// not abort and the log scan recovers the durable value.
    pub fn tick(&self) -> u64 {
        let mut state = self.state.lock();
        state.value += 1;
        let value = state.value;
        if let Err(e) = Self::persist(&self.path, &state) {
            tracing::warn!("Clock persist failed after tick: {}", e);
        }
        value
    }

    /// Observe a remote clock value and advance past it.
    pub fn receive(&self, remote: u64) -> u64 {
        let mut state = self.state.lock();
        state.value = state.value.max(remote) + 1;
        let value = state.value;
        if let Err(e) = Self::persist(&self.path, &state) {
            tracing::warn!("Clock persist failed after receive: {}", e);
        }
        value
    }

    /// Current value without incrementing
    pub fn value(&self) -> u64 {
        self.state.lock().value
    }

    /// Stable producer id persisted alongside the counter
    pub fn node_id(&self) -> String {
        self.state.lock().node_id.clone()
    }

    /// Persist the current state (write-temp-then-rename)
    pub fn save(&self) -> Result<()> {
        let state = self.state.lock();
        Self::persist(&self.path, &state)
    }

    fn persist(path: &PathBuf, state: &ClockState) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string(state)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
