// src/errors.rs

//! Crate-wide error types.
//!
//! - [`SvcflowError`] is what public APIs return.
//! - [`ComputationError`] is carried through staged computations. It is
//!   `Clone` because every downstream stage observes the same upstream
//!   failure.

use std::time::Duration;

use thiserror::Error;

use crate::types::{ServiceId, ServiceState};

#[derive(Error, Debug)]
pub enum SvcflowError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid state transition for service {service}: {from:?} -> {to:?}")]
    InvalidTransition {
        service: ServiceId,
        from: ServiceState,
        to: ServiceState,
    },

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Computation(#[from] ComputationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure of a computation stage.
///
/// Every variant carries the owning service when one is known so callers can
/// go back to its persisted event log.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputationError {
    #[error("service {service} canceled: dependencies finished unsuccessfully: {failed:?}")]
    DependencyFailed {
        service: ServiceId,
        failed: Vec<ServiceId>,
    },

    #[error("{} timed out after {}ms (budget {}ms)", owner(.service), millis(.elapsed), millis(.budget))]
    Timeout {
        service: Option<ServiceId>,
        elapsed: Duration,
        budget: Duration,
    },

    #[error("job for {} failed: {message}", owner(.service))]
    JobExecution {
        service: Option<ServiceId>,
        message: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("computation canceled")]
    Canceled,

    #[error("service {service} already finished as {state:?}")]
    Terminated {
        service: ServiceId,
        state: ServiceState,
    },

    /// The service was suspended, or re-dispatched after a resume, while
    /// this computation was still in flight.
    #[error("service {service} suspended")]
    Suspended { service: ServiceId },

    #[error("{message}")]
    Failed {
        service: Option<ServiceId>,
        message: String,
    },
}

fn millis(d: &Duration) -> u128 {
    d.as_millis()
}

fn owner(service: &Option<ServiceId>) -> String {
    match service {
        Some(id) => format!("service {id}"),
        None => "computation".to_string(),
    }
}

impl ComputationError {
    pub fn failed(message: impl Into<String>) -> Self {
        ComputationError::Failed {
            service: None,
            message: message.into(),
        }
    }

    /// Service that owns the failure, if known.
    pub fn service(&self) -> Option<ServiceId> {
        match self {
            ComputationError::DependencyFailed { service, .. }
            | ComputationError::Terminated { service, .. }
            | ComputationError::Suspended { service } => Some(*service),
            ComputationError::Timeout { service, .. }
            | ComputationError::JobExecution { service, .. }
            | ComputationError::Failed { service, .. } => *service,
            ComputationError::Configuration(_) | ComputationError::Canceled => None,
        }
    }

    /// Attach an owner to failures that were raised without one.
    pub fn with_service(self, id: ServiceId) -> Self {
        match self {
            ComputationError::Timeout {
                service: None,
                elapsed,
                budget,
            } => ComputationError::Timeout {
                service: Some(id),
                elapsed,
                budget,
            },
            ComputationError::JobExecution {
                service: None,
                message,
            } => ComputationError::JobExecution {
                service: Some(id),
                message,
            },
            ComputationError::Failed {
                service: None,
                message,
            } => ComputationError::Failed {
                service: Some(id),
                message,
            },
            other => other,
        }
    }

    /// Terminal state a service should end up in after this failure.
    ///
    /// [`ComputationError::Suspended`] maps to `Suspended`, which is not
    /// terminal; the service is left for its next dispatch.
    pub fn terminal_state(&self) -> ServiceState {
        match self {
            ComputationError::Suspended { .. } => ServiceState::Suspended,
            ComputationError::Timeout { .. } => ServiceState::Timeout,
            ComputationError::DependencyFailed { .. } | ComputationError::Canceled => {
                ServiceState::Canceled
            }
            ComputationError::Terminated { state, .. } => *state,
            _ => ServiceState::Error,
        }
    }

    /// Whether another attempt could possibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ComputationError::JobExecution { .. } | ComputationError::Failed { .. }
        )
    }
}

impl From<anyhow::Error> for ComputationError {
    fn from(err: anyhow::Error) -> Self {
        ComputationError::failed(format!("{err:#}"))
    }
}

impl From<SvcflowError> for ComputationError {
    fn from(err: SvcflowError) -> Self {
        match err {
            SvcflowError::Computation(inner) => inner,
            SvcflowError::UnknownService(name) => {
                ComputationError::Configuration(format!("unknown service: {name}"))
            }
            SvcflowError::ConfigError(msg) => ComputationError::Configuration(msg),
            other => ComputationError::failed(other.to_string()),
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, SvcflowError>;
