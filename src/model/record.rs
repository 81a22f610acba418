// src/model/record.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::event::{ServiceEvent, ServiceEventKind};
use crate::types::{ProcessingLocation, ServiceId, ServiceState};

/// Resource hints attached to a service. Backends interpret them loosely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(default)]
    pub slots: Option<u32>,
    #[serde(default)]
    pub memory_gb: Option<u32>,
    #[serde(default)]
    pub max_duration: Option<Duration>,
}

/// Arguments a caller hands to a processor when asking for a new record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceArgs {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dictionary_args: BTreeMap<String, Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceHints,
}

impl ServiceArgs {
    pub fn with_dictionary_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.dictionary_args.insert(key.to_string(), value.into());
        self
    }
}

/// A persisted unit of work.
///
/// `id` is `None` until the record is saved; persistence assigns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: Option<ServiceId>,
    /// Processor lookup key.
    pub name: String,
    pub state: ServiceState,
    /// Higher runs first.
    pub priority: i32,
    pub parent_id: Option<ServiceId>,
    /// Dispatcher queue that owns this record, once claimed.
    pub queue_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub process_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: Vec<ServiceId>,
    #[serde(default)]
    pub resources: ResourceHints,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dictionary_args: BTreeMap<String, Value>,
    pub result: Option<Value>,
    /// Budget measured from process start (or creation when never started).
    pub timeout: Option<Duration>,
    pub processing_location: Option<ProcessingLocation>,
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub events: Vec<ServiceEvent>,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            name: name.into(),
            state: ServiceState::Created,
            priority: 0,
            parent_id: None,
            queue_id: None,
            created_at: now,
            modified_at: now,
            process_started_at: None,
            dependencies: Vec::new(),
            resources: ResourceHints::default(),
            args: Vec::new(),
            dictionary_args: BTreeMap::new(),
            result: None,
            timeout: None,
            processing_location: None,
            workspace: None,
            env: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Copy caller-supplied arguments into the record.
    pub fn apply_args(&mut self, args: ServiceArgs) {
        self.args = args.args;
        self.dictionary_args = args.dictionary_args;
        self.env = args.env;
        self.resources = args.resources;
    }

    /// Printable identity for logs; unsaved records show their name only.
    pub fn label(&self) -> String {
        match self.id {
            Some(id) => format!("{}#{}", self.name, id),
            None => self.name.clone(),
        }
    }

    pub fn has_completed(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn has_completed_successfully(&self) -> bool {
        self.state == ServiceState::Successful
    }

    pub fn has_completed_unsuccessfully(&self) -> bool {
        self.state.is_unsuccessful()
    }

    pub fn is_suspended(&self) -> bool {
        self.state == ServiceState::Suspended
    }

    pub fn has_parent(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Reference point for the timeout budget.
    pub fn started_or_created_at(&self) -> DateTime<Utc> {
        self.process_started_at.unwrap_or(self.created_at)
    }

    /// Time spent since [`Self::started_or_created_at`], clamped at zero.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_or_created_at())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn push_event(&mut self, event: ServiceEvent) {
        self.modified_at = event.at;
        self.events.push(event);
    }

    pub fn last_event(&self) -> Option<&ServiceEvent> {
        self.events.last()
    }

    pub fn has_event(&self, kind: ServiceEventKind) -> bool {
        self.events.iter().any(|e| e.kind == kind)
    }

    pub fn dictionary_str(&self, key: &str) -> Option<&str> {
        self.dictionary_args.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_falls_back_to_creation_time() {
        let mut record = ServiceRecord::new("sleep");
        record.created_at = Utc::now() - chrono::Duration::seconds(10);
        assert!(record.elapsed(Utc::now()) >= Duration::from_secs(10));

        record.process_started_at = Some(Utc::now());
        assert!(record.elapsed(Utc::now()) < Duration::from_secs(10));
    }

    #[test]
    fn record_roundtrips_through_json() {
        let mut record = ServiceRecord::new("exe");
        record.id = Some(ServiceId(4));
        record.timeout = Some(Duration::from_millis(250));
        record
            .dictionary_args
            .insert("cmd".into(), Value::from("echo hi"));
        record.push_event(ServiceEvent::new(ServiceEventKind::Created, "created"));

        let json = serde_json::to_string(&record).unwrap();
        let back: ServiceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.dictionary_str("cmd"), Some("echo hi"));
    }
}
