// src/config/validate.rs

use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::computation::SchedulerOptions;
use crate::config::model::{
    ConfigFile, RawConfigFile, RawServiceConfig, ServiceConfig, parse_duration,
};
use crate::engine::RuntimeOptions;
use crate::engine::core::EngineOptions;
use crate::errors::{Result, SvcflowError};
use crate::exec::ThrottleOptions;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = SvcflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;

        let engine = EngineOptions {
            queue_id: raw.engine.queue_id.clone(),
            processing_slots: raw.engine.processing_slots,
            max_ready_capacity: raw.engine.max_ready_capacity,
            dispatch_batch_size: raw.engine.dispatch_batch_size,
            stale_submission: duration("engine.stale_submission", &raw.engine.stale_submission)?,
        };
        let runtime = RuntimeOptions {
            dispatch_interval: duration("engine.dispatch_interval", &raw.engine.dispatch_interval)?,
            refresh_interval: duration("engine.refresh_interval", &raw.engine.refresh_interval)?,
            exit_when_idle: true,
        };
        let scheduler = SchedulerOptions {
            inspector_interval: duration(
                "scheduler.inspector_interval",
                &raw.scheduler.inspector_interval,
            )?,
            worker_pool_size: raw.scheduler.worker_pool_size,
        };
        let throttle = ThrottleOptions {
            sweep_interval: duration("throttle.sweep_interval", &raw.throttle.sweep_interval)?,
            default_max_running: raw.throttle.default_max_running,
            max_running: raw.throttle.limits(),
        };

        let mut service = std::collections::BTreeMap::new();
        for (label, cfg) in raw.service {
            let parsed = service_config(&label, cfg)?;
            service.insert(label, parsed);
        }

        Ok(ConfigFile {
            engine,
            runtime,
            scheduler,
            throttle,
            default: raw.default,
            service,
        })
    }
}

fn duration(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| SvcflowError::ConfigError(format!("[{field}]: {e}")))
}

fn service_config(label: &str, raw: RawServiceConfig) -> Result<ServiceConfig> {
    let timeout = match raw.timeout.as_deref() {
        Some(s) => Some(duration(&format!("service.{label}.timeout"), s)?),
        None => None,
    };
    Ok(ServiceConfig {
        cmd: raw.cmd,
        after: raw.after,
        priority: raw.priority,
        timeout,
        job_type: raw.job_type,
        processing_location: raw.processing_location,
        env: raw.env,
    })
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_services(cfg)?;
    validate_sizes(cfg)?;
    validate_service_dependencies(cfg)?;
    validate_dag(cfg)?;
    Ok(())
}

fn ensure_has_services(cfg: &RawConfigFile) -> Result<()> {
    if cfg.service.is_empty() {
        return Err(SvcflowError::ConfigError(
            "config must contain at least one [service.<label>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_sizes(cfg: &RawConfigFile) -> Result<()> {
    let sizes = [
        ("engine.processing_slots", cfg.engine.processing_slots),
        ("engine.max_ready_capacity", cfg.engine.max_ready_capacity),
        ("engine.dispatch_batch_size", cfg.engine.dispatch_batch_size),
        ("scheduler.worker_pool_size", cfg.scheduler.worker_pool_size),
    ];
    for (field, value) in sizes {
        if value == 0 {
            return Err(SvcflowError::ConfigError(format!(
                "[{field}] must be >= 1 (got 0)"
            )));
        }
    }

    for (label, service) in &cfg.service {
        if service.cmd.trim().is_empty() {
            return Err(SvcflowError::ConfigError(format!(
                "service '{label}' has an empty `cmd`"
            )));
        }
    }
    Ok(())
}

fn validate_service_dependencies(cfg: &RawConfigFile) -> Result<()> {
    for (name, service) in cfg.service.iter() {
        for dep in service.after.iter() {
            if dep == name {
                return Err(SvcflowError::ConfigError(format!(
                    "service '{name}' cannot depend on itself in `after`"
                )));
            }
            if !cfg.service.contains_key(dep) {
                return Err(SvcflowError::ConfigError(format!(
                    "service '{name}' has unknown dependency '{dep}' in `after`"
                )));
            }
        }
    }
    Ok(())
}

/// Service labels in dependency order (dependencies first, ties by label).
pub fn dependency_order(cfg: &ConfigFile) -> Result<Vec<String>> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for name in cfg.service.keys() {
        graph.add_node(name.as_str());
    }
    for (name, service) in cfg.service.iter() {
        for dep in service.after.iter() {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    // Kahn's algorithm over sorted labels keeps the order stable.
    let mut order = Vec::with_capacity(cfg.service.len());
    let mut remaining: Vec<&str> = cfg.service.keys().map(String::as_str).collect();
    while !remaining.is_empty() {
        let Some(pos) = remaining.iter().position(|n| {
            graph
                .neighbors_directed(*n, petgraph::Direction::Incoming)
                .all(|dep| order.iter().any(|done: &String| done == dep))
        }) else {
            return Err(SvcflowError::ConfigError(
                "cycle detected in service graph".to_string(),
            ));
        };
        order.push(remaining.remove(pos).to_string());
    }
    Ok(order)
}

fn validate_dag(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: dep -> service
    // For:
    //   [service.B]
    //   after = ["A"]
    // we add edge A -> B.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in cfg.service.keys() {
        graph.add_node(name.as_str());
    }

    for (name, service) in cfg.service.iter() {
        for dep in service.after.iter() {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    // A topological sort will fail if there is a cycle.
    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => {
            let node = cycle.node_id();
            Err(SvcflowError::ConfigError(format!(
                "cycle detected in service graph involving service '{node}'"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<ConfigFile> {
        let raw: RawConfigFile = toml::from_str(toml_src)?;
        ConfigFile::try_from(raw)
    }

    #[test]
    fn converts_durations_and_limits() {
        let cfg = parse(
            r#"
            [engine]
            dispatch_interval = "50ms"
            stale_submission = "1m"

            [throttle]
            default_max_running = 4
            [throttle.max_running]
            align = 2

            [service.fetch]
            cmd = "echo fetch"

            [service.align]
            cmd = "echo align"
            after = ["fetch"]
            timeout = "2h"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.runtime.dispatch_interval, Duration::from_millis(50));
        assert_eq!(cfg.engine.stale_submission, Duration::from_secs(60));
        assert_eq!(cfg.throttle.limit_for("align"), 2);
        assert_eq!(cfg.throttle.limit_for("fetch"), 4);
        assert_eq!(cfg.service["align"].timeout, Some(Duration::from_secs(7200)));
        assert_eq!(dependency_order(&cfg).unwrap(), vec!["fetch", "align"]);
    }

    #[test]
    fn rejects_empty_and_zero_sizes() {
        assert!(matches!(parse(""), Err(SvcflowError::ConfigError(_))));
        let err = parse(
            r#"
            [engine]
            max_ready_capacity = 0
            [service.a]
            cmd = "true"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_ready_capacity"));
    }

    #[test]
    fn rejects_unknown_self_and_cyclic_dependencies() {
        let unknown = parse("[service.a]\ncmd = \"true\"\nafter = [\"b\"]\n").unwrap_err();
        assert!(unknown.to_string().contains("unknown dependency"));

        let own = parse("[service.a]\ncmd = \"true\"\nafter = [\"a\"]\n").unwrap_err();
        assert!(own.to_string().contains("itself"));

        let cycle = parse(
            "[service.a]\ncmd = \"true\"\nafter = [\"b\"]\n[service.b]\ncmd = \"true\"\nafter = [\"a\"]\n",
        )
        .unwrap_err();
        assert!(cycle.to_string().contains("cycle"));
    }

    #[test]
    fn rejects_bad_duration() {
        let err = parse("[service.a]\ncmd = \"true\"\ntimeout = \"soon\"\n").unwrap_err();
        assert!(err.to_string().contains("service.a.timeout"));
    }
}
