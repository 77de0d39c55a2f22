//! Core types for the workflow event log
//!
//! All types are designed for:
//! - One-JSON-object-per-line log records (serde_json)
//! - Lexicographically time-sortable identifiers (ULID)
//! - Deterministic replay (state derived only from events)

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Globally unique, lexicographically time-sortable event identifier.
///
/// 26-character Crockford base32; string order equals generation order,
/// which the conflict tiebreak depends on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventId(Ulid);

impl EventId {
    /// Generate a fresh id
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Construct from an existing ULID
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidEvent(format!("Bad event id {}: {}", s, e)))
    }
}

/// Identifier of the aggregate an event concerns (task key, feature slug)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    /// Create new entity ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the id is empty (invalid for emission)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of aggregate the event concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A work package (task) moving through lanes
    WorkPackage,
    /// A feature grouping work packages
    Feature,
    /// A subtask within a work package
    Subtask,
}

impl EntityType {
    /// Stable string form (matches the serialized representation)
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::WorkPackage => "work_package",
            EntityType::Feature => "feature",
            EntityType::Subtask => "subtask",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Registered event types (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Entity moved between lanes
    StatusChanged,
    /// Entity created
    Created,
    /// Agent assigned to entity
    Assigned,
    /// Entity completed
    Completed,
    /// Free-form history entry recorded
    HistoryAdded,
    /// Command error recorded against entity
    ErrorLogged,
    /// Dependency on another entity resolved
    DependencyResolved,
}

impl EventType {
    /// All registered types
    pub const ALL: [EventType; 7] = [
        EventType::StatusChanged,
        EventType::Created,
        EventType::Assigned,
        EventType::Completed,
        EventType::HistoryAdded,
        EventType::ErrorLogged,
        EventType::DependencyResolved,
    ];

    /// Stable string form (matches the serialized representation)
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StatusChanged => "status_changed",
            EventType::Created => "created",
            EventType::Assigned => "assigned",
            EventType::Completed => "completed",
            EventType::HistoryAdded => "history_added",
            EventType::ErrorLogged => "error_logged",
            EventType::DependencyResolved => "dependency_resolved",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Type-specific event payload, dispatched by `event_type`.
///
/// Serializes adjacently tagged so a log record carries `event_type` next
/// to a `payload` object; a record whose payload does not match its type
/// fails to parse instead of silently round-tripping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    /// Entity moved between lanes
    StatusChanged {
        /// Lane the entity left, if known
        from: Option<String>,
        /// Lane the entity entered
        to: String,
        /// Optional operator note
        note: Option<String>,
    },
    /// Entity created
    Created {
        /// Human-readable name
        name: String,
        /// Optional description
        description: Option<String>,
        /// Parent entity id (feature for a work package, etc.)
        parent_id: Option<String>,
    },
    /// Agent assigned to entity
    Assigned {
        /// Agent identifier
        agent: String,
        /// Role the agent takes (implementer, reviewer)
        role: Option<String>,
    },
    /// Entity completed
    Completed {
        /// Terminal outcome (done, cancelled)
        outcome: String,
        /// Optional completion summary
        summary: Option<String>,
    },
    /// Free-form history entry
    HistoryAdded {
        /// The entry text
        entry: String,
        /// Author, if attributable
        author: Option<String>,
    },
    /// Command error recorded against entity
    ErrorLogged {
        /// One-line error message
        message: String,
        /// The command that failed
        command: Option<String>,
    },
    /// Dependency on another entity resolved
    DependencyResolved {
        /// Entity id of the dependency
        dependency_id: String,
        /// How it resolved (merged, completed, dropped)
        resolution: String,
    },
}

impl EventPayload {
    /// The registered type this payload belongs to
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::StatusChanged { .. } => EventType::StatusChanged,
            EventPayload::Created { .. } => EventType::Created,
            EventPayload::Assigned { .. } => EventType::Assigned,
            EventPayload::Completed { .. } => EventType::Completed,
            EventPayload::HistoryAdded { .. } => EventType::HistoryAdded,
            EventPayload::ErrorLogged { .. } => EventType::ErrorLogged,
            EventPayload::DependencyResolved { .. } => EventType::DependencyResolved,
        }
    }

    /// Validate payload invariants for the variant's schema
    pub fn validate(&self) -> Result<()> {
        match self {
            EventPayload::StatusChanged { to, .. } => {
                if to.is_empty() {
                    return Err(Error::InvalidEvent(
                        "status_changed requires a target lane".to_string(),
                    ));
                }
            }
            EventPayload::Created { name, .. } => {
                if name.is_empty() {
                    return Err(Error::InvalidEvent(
                        "created requires a name".to_string(),
                    ));
                }
            }
            EventPayload::Assigned { agent, .. } => {
                if agent.is_empty() {
                    return Err(Error::InvalidEvent(
                        "assigned requires an agent".to_string(),
                    ));
                }
            }
            EventPayload::Completed { outcome, .. } => {
                if outcome.is_empty() {
                    return Err(Error::InvalidEvent(
                        "completed requires an outcome".to_string(),
                    ));
                }
            }
            EventPayload::HistoryAdded { entry, .. } => {
                if entry.is_empty() {
                    return Err(Error::InvalidEvent(
                        "history_added requires an entry".to_string(),
                    ));
                }
            }
            EventPayload::ErrorLogged { message, .. } => {
                if message.is_empty() {
                    return Err(Error::InvalidEvent(
                        "error_logged requires a message".to_string(),
                    ));
                }
            }
            EventPayload::DependencyResolved {
                dependency_id,
                resolution,
            } => {
                if dependency_id.is_empty() || resolution.is_empty() {
                    return Err(Error::InvalidEvent(
                        "dependency_resolved requires a dependency id and resolution"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Immutable workflow event (one log line)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Unique, time-sortable event id
    pub event_id: EventId,

    /// The aggregate this event concerns
    pub entity_id: EntityId,

    /// Kind of aggregate
    pub entity_type: EntityType,

    /// Causal position from the logical clock; determines replay order
    pub logical_clock: u64,

    /// Stable, anonymized id of the producing machine/user
    pub node_id: String,

    /// Event/command that caused this event (idempotency, correlation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Groups events from one logical operation/session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Tenant marker for multi-tenant sync routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,

    /// Wall-clock time, informational only — never used for ordering
    pub timestamp: DateTime<Utc>,

    /// Type tag + type-specific payload
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl WorkflowEvent {
    /// The registered event type (derived from the payload variant)
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// The `YYYY-MM-DD` log partition this event belongs to
    pub fn date_partition(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }

    /// Validate event invariants
    pub fn validate(&self) -> Result<()> {
        if self.entity_id.is_empty() {
            return Err(Error::InvalidEvent("Entity id must not be empty".to_string()));
        }
        if self.node_id.is_empty() {
            return Err(Error::InvalidEvent("Node id must not be empty".to_string()));
        }
        self.payload.validate()
    }

    /// Serialize to one JSON log line (no trailing newline)
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one JSON log line
    pub fn from_json_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// A concurrent-write conflict detected during reconstruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Entity the competing events target
    pub entity_id: EntityId,

    /// The shared causal position
    pub logical_clock: u64,

    /// Event that won the deterministic tiebreak
    pub winner: EventId,

    /// Events whose payloads were not applied at this position
    pub losers: Vec<EventId>,
}

/// Workflow entity state, derived purely from events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    /// Entity ID
    pub entity_id: EntityId,

    /// Kind of aggregate
    pub entity_type: EntityType,

    /// Current lane, if any status change has been applied
    pub status: Option<String>,

    /// Currently assigned agent
    pub assignee: Option<String>,

    /// Name from the creation event
    pub name: Option<String>,

    /// True once a completion event has been applied
    pub completed: bool,

    /// Terminal outcome from the completion event
    pub outcome: Option<String>,

    /// Number of history entries recorded
    pub history_entries: u64,

    /// Number of errors logged
    pub errors_logged: u64,

    /// Dependencies resolved so far
    pub resolved_dependencies: Vec<String>,

    /// Wall-clock creation time (informational)
    pub created_at: Option<DateTime<Utc>>,

    /// Wall-clock time of the last applied event (informational)
    pub updated_at: Option<DateTime<Utc>>,

    /// Causal position of the last applied event
    pub last_clock: u64,

    /// Event IDs that produced this state, in applied order
    pub applied_events: Vec<EventId>,
}

impl EntityState {
    /// Empty state for an entity, before any events
    pub fn new(entity_id: EntityId, entity_type: EntityType) -> Self {
        Self {
            entity_id,
            entity_type,
            status: None,
            assignee: None,
            name: None,
            completed: false,
            outcome: None,
            history_entries: 0,
            errors_logged: 0,
            resolved_dependencies: Vec::new(),
            created_at: None,
            updated_at: None,
            last_clock: 0,
            applied_events: Vec::new(),
        }
    }

    /// Apply event to derive new state
    pub fn apply(&mut self, event: &WorkflowEvent) -> Result<()> {
        // Verify event belongs to this entity
        if event.entity_id != self.entity_id {
            return Err(Error::InvalidEvent(
                "Event entity_id mismatch".to_string(),
            ));
        }

        match &event.payload {
            EventPayload::StatusChanged { to, .. } => {
                self.status = Some(to.clone());
            }
            EventPayload::Created { name, .. } => {
                self.name = Some(name.clone());
                self.created_at = Some(event.timestamp);
            }
            EventPayload::Assigned { agent, .. } => {
                self.assignee = Some(agent.clone());
            }
            EventPayload::Completed { outcome, .. } => {
                self.completed = true;
                self.outcome = Some(outcome.clone());
            }
            EventPayload::HistoryAdded { .. } => {
                self.history_entries += 1;
            }
            EventPayload::ErrorLogged { .. } => {
                self.errors_logged += 1;
            }
            EventPayload::DependencyResolved { dependency_id, .. } => {
                if !self.resolved_dependencies.contains(dependency_id) {
                    self.resolved_dependencies.push(dependency_id.clone());
                }
            }
        }

        self.updated_at = Some(event.timestamp);
        self.last_clock = event.logical_clock;
        self.applied_events.push(event.event_id);

        Ok(())
    }

    /// Event id of the last applied event, if any
    pub fn last_event_id(&self) -> Option<EventId> {
        self.applied_events.last().copied()
    }
}
