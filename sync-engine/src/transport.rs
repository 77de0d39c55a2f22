//! Auth and transport seams
//!
//! The engine never opens connections or stores credentials itself; it
//! consumes these interfaces and decides only when to call them and what
//! to do with the results. Concrete implementations (WebSocket sender,
//! batch HTTP client, token store) live outside the core.

use crate::error::Result;
use async_trait::async_trait;
use event_core::{EventId, WorkflowEvent};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authentication provider consumed by the emitter and scheduler.
///
/// Token refresh is exposed so the scheduler can run its single
/// refresh-and-retry cycle on a 401-class batch failure.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Is there a usable credential right now?
    fn is_authenticated(&self) -> bool;

    /// Current access token
    async fn access_token(&self) -> Result<String>;

    /// Force a refresh and return the new token
    async fn refresh_access_token(&self) -> Result<String>;

    /// Team/tenant the credential belongs to
    fn team_id(&self) -> Option<String>;
}

/// Live-connection sender for best-effort immediate delivery
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Is the connection currently established?
    fn is_connected(&self) -> bool;

    /// Send one event; any error falls through to the offline queue
    async fn send(&self, token: &str, event: &WorkflowEvent) -> Result<()>;
}

/// Batch sender used by the scheduler to drain the offline queue
#[async_trait]
pub trait BatchTransport: Send + Sync {
    /// Send a batch; returns one outcome per event.
    ///
    /// A 401-class failure must surface as [`crate::Error::Auth`] so the
    /// caller can run its refresh cycle.
    async fn send_batch(
        &self,
        token: &str,
        events: &[WorkflowEvent],
    ) -> Result<Vec<BatchItemOutcome>>;
}

/// Per-event result of a batch call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemOutcome {
    /// The event this outcome concerns
    pub event_id: EventId,
    /// What the remote said
    pub status: BatchItemStatus,
}

/// Remote disposition of one batched event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemStatus {
    /// Stored remotely; safe to remove from the queue
    Acknowledged,
    /// Already known remotely (at-least-once replay); safe to remove
    Duplicate,
    /// Rejected; requeue with incremented retry count
    Rejected(String),
}

/// Operator-facing connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Live transport established
    Connected,
    /// Authenticated, live transport present but down
    Reconnecting,
    /// No usable credential
    Offline,
    /// Authenticated, batch delivery only
    OfflineBatchMode,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Offline => "offline",
            ConnectionStatus::OfflineBatchMode => "offline_batch_mode",
        };
        write!(f, "{}", s)
    }
}
