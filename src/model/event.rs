// src/model/event.rs

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of an entry in a service's event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceEventKind {
    Created,
    Queued,
    Submitted,
    Running,
    WaitingForDependencies,
    Suspended,
    Resumed,
    Completed,
    Failed,
    Canceled,
    Timeout,
    Updated,
}

impl fmt::Display for ServiceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceEventKind::Created => "created",
            ServiceEventKind::Queued => "queued",
            ServiceEventKind::Submitted => "submitted",
            ServiceEventKind::Running => "running",
            ServiceEventKind::WaitingForDependencies => "waiting_for_dependencies",
            ServiceEventKind::Suspended => "suspended",
            ServiceEventKind::Resumed => "resumed",
            ServiceEventKind::Completed => "completed",
            ServiceEventKind::Failed => "failed",
            ServiceEventKind::Canceled => "canceled",
            ServiceEventKind::Timeout => "timeout",
            ServiceEventKind::Updated => "updated",
        };
        f.write_str(s)
    }
}

/// One entry in a service's ordered event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub kind: ServiceEventKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ServiceEvent {
    pub fn new(kind: ServiceEventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}
