#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use svcflow::computation::{ComputationScheduler, SchedulerOptions};
use svcflow::engine::{
    EngineOptions, ExecutionContext, ServiceDispatcher, ServiceEngine, ServiceProcessor,
    ServiceRegistry,
};
use svcflow::model::{ServiceArgs, ServiceRecord};
use svcflow::store::{InMemoryServiceStore, ServicePersistence};
use svcflow::types::{ServiceId, ServiceState};
use svcflow_test_utils::eventually;
use tokio::task::JoinHandle;

/// Engine + dispatcher + running scheduler over an in-memory store.
pub struct Harness {
    pub store: Arc<InMemoryServiceStore>,
    pub engine: Arc<ServiceEngine>,
    pub scheduler: ComputationScheduler,
    pub dispatcher: ServiceDispatcher,
    inspector: JoinHandle<()>,
}

impl Harness {
    /// `processors` receives the shared store so fakes can persist through it.
    pub fn new<F>(options: EngineOptions, processors: F) -> Self
    where
        F: FnOnce(Arc<dyn ServicePersistence>) -> Vec<Arc<dyn ServiceProcessor>>,
    {
        let store = Arc::new(InMemoryServiceStore::new());
        let dyn_store: Arc<dyn ServicePersistence> = store.clone();

        let mut registry = ServiceRegistry::new();
        for processor in processors(Arc::clone(&dyn_store)) {
            registry.register(processor);
        }

        let engine = Arc::new(ServiceEngine::new(dyn_store, registry, options));
        let scheduler = ComputationScheduler::new(SchedulerOptions {
            inspector_interval: Duration::from_millis(5),
            worker_pool_size: 4,
        });
        let inspector = scheduler.start();
        let dispatcher = ServiceDispatcher::new(Arc::clone(&engine), scheduler.clone())
            .with_dependency_poll(Duration::from_millis(5));

        Self {
            store,
            engine,
            scheduler,
            dispatcher,
            inspector,
        }
    }

    pub fn submit(&self, name: &str, context: ExecutionContext) -> ServiceRecord {
        self.engine
            .submit_single_service(name, ServiceArgs::default(), &context)
            .expect("submitting service")
    }

    pub fn record(&self, id: ServiceId) -> ServiceRecord {
        self.store
            .find_by_id(id)
            .expect("loading record")
            .expect("record exists")
    }

    pub fn state(&self, id: ServiceId) -> ServiceState {
        self.record(id).state
    }

    /// Keep dispatching until `id` is in `state`.
    pub async fn dispatch_until(&self, id: ServiceId, state: ServiceState) -> bool {
        eventually(|| {
            let _ = self.dispatcher.dispatch_services();
            self.state(id) == state
        })
        .await
    }

    pub async fn shutdown(self) {
        self.scheduler.shutdown();
        let _ = self.inspector.await;
    }
}

pub fn options(max_ready_capacity: usize, processing_slots: usize) -> EngineOptions {
    EngineOptions {
        max_ready_capacity,
        processing_slots,
        ..EngineOptions::default()
    }
}
