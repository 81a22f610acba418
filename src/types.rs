// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identity of a persisted service record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a service record.
///
/// ```text
/// CREATED -> QUEUED -> SUBMITTED -> RUNNING <-> WAITING_FOR_DEPENDENCIES
///                                     |
///                                     v
///             SUCCESSFUL | ERROR | CANCELED | TIMEOUT
/// ```
///
/// `Retry` and `Resumed` re-enter the queue. Terminal states never change in
/// the normal lifecycle; only an admin retry (unsuccessful states to
/// `Retry`) or a forced update moves a record out of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Created,
    Queued,
    Submitted,
    Running,
    WaitingForDependencies,
    Suspended,
    Resumed,
    Retry,
    Successful,
    Error,
    Canceled,
    Timeout,
}

impl ServiceState {
    /// States the admission queue may pick up from the persisted backlog.
    pub const ADMISSIBLE: [ServiceState; 4] = [
        ServiceState::Created,
        ServiceState::Queued,
        ServiceState::Resumed,
        ServiceState::Retry,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ServiceState::Successful
                | ServiceState::Error
                | ServiceState::Canceled
                | ServiceState::Timeout
        )
    }

    pub fn is_unsuccessful(self) -> bool {
        matches!(
            self,
            ServiceState::Error | ServiceState::Canceled | ServiceState::Timeout
        )
    }

    /// Whether an admin may send a service in this state back to the queue.
    pub fn can_retry(self) -> bool {
        self.is_unsuccessful()
    }

    pub fn is_admissible(self) -> bool {
        Self::ADMISSIBLE.contains(&self)
    }

    /// Whether a record in `self` may move to `to`.
    ///
    /// Staying in the same state is always allowed (it is a no-op for the
    /// store).
    pub fn can_transition_to(self, to: ServiceState) -> bool {
        use ServiceState::*;

        if self == to {
            return true;
        }

        match self {
            Created => matches!(to, Queued | Submitted | Suspended | Canceled | Timeout),
            Queued => matches!(to, Submitted | Suspended | Canceled | Timeout),
            Submitted => matches!(
                to,
                Running
                    | WaitingForDependencies
                    | Suspended
                    | Canceled
                    | Timeout
                    | Successful
                    | Error
            ),
            Running => matches!(
                to,
                WaitingForDependencies | Suspended | Canceled | Timeout | Successful | Error
            ),
            WaitingForDependencies => {
                matches!(to, Running | Suspended | Canceled | Timeout | Error)
            }
            Suspended => matches!(to, Resumed),
            Resumed | Retry => matches!(to, Queued | Submitted | Suspended | Canceled | Timeout),
            Successful | Error | Canceled | Timeout => false,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Created => "CREATED",
            ServiceState::Queued => "QUEUED",
            ServiceState::Submitted => "SUBMITTED",
            ServiceState::Running => "RUNNING",
            ServiceState::WaitingForDependencies => "WAITING_FOR_DEPENDENCIES",
            ServiceState::Suspended => "SUSPENDED",
            ServiceState::Resumed => "RESUMED",
            ServiceState::Retry => "RETRY",
            ServiceState::Successful => "SUCCESSFUL",
            ServiceState::Error => "ERROR",
            ServiceState::Canceled => "CANCELED",
            ServiceState::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// Where the external job of a service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingLocation {
    /// Child process on this host.
    Local,
    /// Submitted through a cluster scheduler command.
    #[serde(alias = "grid")]
    Cluster,
}

impl Default for ProcessingLocation {
    fn default() -> Self {
        ProcessingLocation::Local
    }
}

impl FromStr for ProcessingLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(ProcessingLocation::Local),
            "cluster" | "grid" => Ok(ProcessingLocation::Cluster),
            other => Err(format!(
                "invalid processing_location: {other} (expected \"local\" or \"cluster\")"
            )),
        }
    }
}
