// src/model/mod.rs

//! Persisted service data: records, resource hints and the event log.

pub mod event;
pub mod record;

pub use event::{ServiceEvent, ServiceEventKind};
pub use record::{ResourceHints, ServiceArgs, ServiceRecord};
