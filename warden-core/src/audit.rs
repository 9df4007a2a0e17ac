//! Audit trail for gate decisions.
//!
//! Separate from diagnostic `tracing` output: audit events are structured
//! records of what each gate decided, meant to be shipped to a log store.
//! Loggers are passed to the components that emit events; there is no global.

use crate::options::Gate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Kinds of audited events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A gate ran and passed
    GatePassed,
    /// A gate ran and failed
    GateFailed,
    /// A gate was skipped or tolerated by a development bypass
    GateBypassed,
    /// A bypass was requested where it is not allowed
    BypassRejected,
    /// Startup proceeded with no signed policy
    InsecureMode,
    /// Startup reached Ready
    StartupReady,
    /// Startup reached Blocked
    StartupBlocked,
    /// A process authorization decision
    ProcessAuthorized,
    ProcessDenied,
    /// A helper call with a session token
    HelperInvoked,
    HelperRejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: String,

    pub event_type: AuditEventType,

    pub timestamp: DateTime<Utc>,

    /// Gate this event concerns (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<Gate>,

    /// Who/what triggered this event
    pub actor: String,

    /// Additional context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, actor: impl Into<String>) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::now_v7().simple()),
            event_type,
            timestamp: Utc::now(),
            gate: None,
            actor: actor.into(),
            details: None,
        }
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Trait for audit loggers.
pub trait AuditLogger: Send + Sync + std::fmt::Debug {
    fn log(&self, event: AuditEvent);
}

/// Writes events to stdout as JSON lines.
#[derive(Debug, Default)]
pub struct StdoutLogger;

impl StdoutLogger {
    pub fn new() -> Self {
        Self
    }
}

impl AuditLogger for StdoutLogger {
    fn log(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => println!("{}", json),
            Err(e) => tracing::error!(error = %e, id = %event.id, "failed to serialize audit event"),
        }
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoOpLogger;

impl AuditLogger for NoOpLogger {
    fn log(&self, _event: AuditEvent) {}
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Events of one type.
    pub fn of_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl AuditLogger for MemoryLogger {
    fn log(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

/// Shared handle used by the components.
pub type SharedAuditLogger = Arc<dyn AuditLogger>;

pub fn noop() -> SharedAuditLogger {
    Arc::new(NoOpLogger)
}
