// src/config/model.rs

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::computation::SchedulerOptions;
use crate::engine::RuntimeOptions;
use crate::engine::core::EngineOptions;
use crate::exec::ThrottleOptions;
use crate::exec::cluster::DEFAULT_CLUSTER_SUBMIT;
use crate::types::ProcessingLocation;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [engine]
/// processing_slots = 4
/// max_ready_capacity = 2
///
/// [throttle.max_running]
/// align = 2
///
/// [service.fetch]
/// cmd = "curl -sO https://example.org/data.csv"
///
/// [service.align]
/// cmd = "./align.sh data.csv"
/// after = ["fetch"]
/// timeout = "2h"
/// ```
///
/// Every section is optional except at least one `[service.<label>]`.
/// Durations stay strings here; [`ConfigFile`] holds them parsed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: RawEngineSection,

    #[serde(default)]
    pub scheduler: RawSchedulerSection,

    #[serde(default)]
    pub throttle: RawThrottleSection,

    #[serde(default)]
    pub default: DefaultSection,

    /// All services from `[service.<label>]`, keyed by label.
    #[serde(default)]
    pub service: BTreeMap<String, RawServiceConfig>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEngineSection {
    #[serde(default = "default_queue_id")]
    pub queue_id: String,
    #[serde(default = "default_processing_slots")]
    pub processing_slots: usize,
    #[serde(default = "default_max_ready_capacity")]
    pub max_ready_capacity: usize,
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: usize,
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval: String,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,
    #[serde(default = "default_stale_submission")]
    pub stale_submission: String,
}

fn default_queue_id() -> String {
    EngineOptions::default().queue_id
}

fn default_processing_slots() -> usize {
    EngineOptions::default().processing_slots
}

fn default_max_ready_capacity() -> usize {
    EngineOptions::default().max_ready_capacity
}

fn default_dispatch_batch_size() -> usize {
    EngineOptions::default().dispatch_batch_size
}

fn default_dispatch_interval() -> String {
    "100ms".to_string()
}

fn default_refresh_interval() -> String {
    "1s".to_string()
}

fn default_stale_submission() -> String {
    "5m".to_string()
}

impl Default for RawEngineSection {
    fn default() -> Self {
        Self {
            queue_id: default_queue_id(),
            processing_slots: default_processing_slots(),
            max_ready_capacity: default_max_ready_capacity(),
            dispatch_batch_size: default_dispatch_batch_size(),
            dispatch_interval: default_dispatch_interval(),
            refresh_interval: default_refresh_interval(),
            stale_submission: default_stale_submission(),
        }
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSchedulerSection {
    #[serde(default = "default_inspector_interval")]
    pub inspector_interval: String,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

fn default_inspector_interval() -> String {
    "100ms".to_string()
}

fn default_worker_pool_size() -> usize {
    SchedulerOptions::default().worker_pool_size
}

impl Default for RawSchedulerSection {
    fn default() -> Self {
        Self {
            inspector_interval: default_inspector_interval(),
            worker_pool_size: default_worker_pool_size(),
        }
    }
}

/// `[throttle]` section. A limit of 0 means unlimited.
#[derive(Debug, Clone, Deserialize)]
pub struct RawThrottleSection {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,
    #[serde(default)]
    pub default_max_running: usize,
    /// Per job type limits from `[throttle.max_running]`.
    #[serde(default)]
    pub max_running: BTreeMap<String, usize>,
}

fn default_sweep_interval() -> String {
    "500ms".to_string()
}

impl Default for RawThrottleSection {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            default_max_running: 0,
            max_running: BTreeMap::new(),
        }
    }
}

/// `[default]` section: settings shared by every service.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultSection {
    #[serde(default)]
    pub processing_location: ProcessingLocation,

    /// Root directory under which each service gets its own workspace.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    /// Blocking submit command for `processing_location = "cluster"`.
    #[serde(default = "default_cluster_submit")]
    pub cluster_submit: String,

    /// Regex that marks a line of job output as an error.
    #[serde(default)]
    pub error_pattern: Option<String>,
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".svcflow")
}

fn default_cluster_submit() -> String {
    DEFAULT_CLUSTER_SUBMIT.to_string()
}

impl Default for DefaultSection {
    fn default() -> Self {
        Self {
            processing_location: ProcessingLocation::default(),
            workspace: default_workspace(),
            cluster_submit: default_cluster_submit(),
            error_pattern: None,
        }
    }
}

/// `[service.<label>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawServiceConfig {
    /// Shell command run by the service.
    pub cmd: String,

    /// Labels of services that must finish successfully first.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub priority: Option<i32>,

    /// Duration string such as `"30s"`, measured from process start.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Throttle bucket; defaults to the label.
    #[serde(default)]
    pub job_type: Option<String>,

    #[serde(default)]
    pub processing_location: Option<ProcessingLocation>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Validated configuration. Build it with `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineOptions,
    pub runtime: RuntimeOptions,
    pub scheduler: SchedulerOptions,
    pub throttle: ThrottleOptions,
    pub default: DefaultSection,
    pub service: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub cmd: String,
    pub after: Vec<String>,
    pub priority: Option<i32>,
    pub timeout: Option<Duration>,
    pub job_type: Option<String>,
    pub processing_location: Option<ProcessingLocation>,
    pub env: BTreeMap<String, String>,
}

impl ServiceConfig {
    pub fn job_type_or<'a>(&'a self, label: &'a str) -> &'a str {
        self.job_type.as_deref().unwrap_or(label)
    }
}

impl RawThrottleSection {
    pub(crate) fn limits(&self) -> HashMap<String, usize> {
        self.max_running
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

/// Parse a duration string like `"250ms"`, `"3s"`, `"2m"`, `"1h"` or `"1d"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' is missing a unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{num_part}': {e}"))?;
    let unit = unit_part.trim().to_lowercase();

    let secs = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is too large"))
    };

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => secs(1),
        "m" => secs(60),
        "h" => secs(60 * 60),
        "d" => secs(24 * 60 * 60),
        _ => Err(format!(
            "unsupported duration unit '{unit}'; expected ms, s, m, h or d"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration(" 3s "), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1d"), Ok(Duration::from_secs(86_400)));
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("5 weeks").is_err());
    }

    #[test]
    fn sections_default_when_missing() {
        let raw: RawConfigFile = toml::from_str(
            r#"
            [service.a]
            cmd = "echo a"
            processing_location = "grid"
            "#,
        )
        .unwrap();
        assert_eq!(raw.engine.max_ready_capacity, 20);
        assert_eq!(raw.throttle.sweep_interval, "500ms");
        assert_eq!(raw.default.workspace, PathBuf::from(".svcflow"));
        assert_eq!(
            raw.service["a"].processing_location,
            Some(ProcessingLocation::Cluster)
        );
    }
}
