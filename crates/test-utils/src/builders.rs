#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use svcflow::config::{ConfigFile, RawConfigFile, RawServiceConfig};
use svcflow::model::ServiceRecord;
use svcflow::store::ServicePersistence;
use svcflow::types::{ProcessingLocation, ServiceId, ServiceState};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn with_service(mut self, label: &str, service: RawServiceConfig) -> Self {
        self.config.service.insert(label.to_string(), service);
        self
    }

    pub fn with_max_ready_capacity(mut self, capacity: usize) -> Self {
        self.config.engine.max_ready_capacity = capacity;
        self
    }

    pub fn with_processing_slots(mut self, slots: usize) -> Self {
        self.config.engine.processing_slots = slots;
        self
    }

    pub fn with_max_running(mut self, job_type: &str, limit: usize) -> Self {
        self.config
            .throttle
            .max_running
            .insert(job_type.to_string(), limit);
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `RawServiceConfig`.
pub struct ServiceConfigBuilder {
    service: RawServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            service: RawServiceConfig {
                cmd: cmd.to_string(),
                after: vec![],
                priority: None,
                timeout: None,
                job_type: None,
                processing_location: None,
                env: BTreeMap::new(),
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.service.after.push(dep.to_string());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.service.priority = Some(priority);
        self
    }

    pub fn timeout(mut self, duration: &str) -> Self {
        self.service.timeout = Some(duration.to_string());
        self
    }

    pub fn job_type(mut self, job_type: &str) -> Self {
        self.service.job_type = Some(job_type.to_string());
        self
    }

    pub fn location(mut self, location: ProcessingLocation) -> Self {
        self.service.processing_location = Some(location);
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.service.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> RawServiceConfig {
        self.service
    }
}

/// Builder for `ServiceRecord`s persisted straight into a store.
pub struct RecordBuilder {
    record: ServiceRecord,
}

impl RecordBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            record: ServiceRecord::new(name),
        }
    }

    pub fn state(mut self, state: ServiceState) -> Self {
        self.record.state = state;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.record.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: ServiceId) -> Self {
        self.record.dependencies.push(id);
        self
    }

    pub fn parent(mut self, id: ServiceId) -> Self {
        self.record.parent_id = Some(id);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.record.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ServiceRecord {
        self.record
    }

    /// Save into `store` and return the stored copy.
    pub fn save(self, store: &dyn ServicePersistence) -> ServiceRecord {
        let mut record = self.record;
        store.save(&mut record).expect("saving test record");
        record
    }
}
