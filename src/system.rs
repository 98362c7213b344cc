//! Device-wide containerization context

use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use crate::manifest::PodManifest;
use crate::registry::{ServiceRegistry, ServiceSpec};
use crate::runtime::{ContainerRuntime, CAPACITY};
use crate::container::ContainerHandle;
use crate::Result;

pub const SYSTEM_NAMESPACE: &str = "system";

/// Manifest of the containers started at boot
pub const SYSTEM_MANIFEST_PATH: &str = "/ext/resources/containerization/system-pod.json";

/// Core services every device exposes
pub const SYSTEM_SERVICES: [&str; 4] = ["storage", "gui", "notification", "loader"];

/// Default heap budget for [`FixedHeap`]
pub const DEFAULT_HEAP_BYTES: u64 = 128 * 1024;

/// Heap usage as seen by health reporting
pub trait MemoryStats: Send + Sync {
    fn total_heap(&self) -> u64;

    fn free_heap(&self) -> u64;

    fn max_free_block(&self) -> u64;

    fn used_heap(&self) -> u64 {
        self.total_heap().saturating_sub(self.free_heap())
    }
}

/// Fixed heap budget shared by the firmware baseline and the containers.
///
/// Container usage is the runtime's per-container memory estimate. The heap
/// is not modelled as fragmented, so the largest block equals free memory.
pub struct FixedHeap {
    total: u64,
    baseline: u64,
    runtime: Arc<ContainerRuntime>,
}

impl FixedHeap {
    pub fn new(total: u64, runtime: Arc<ContainerRuntime>) -> Self {
        Self {
            total,
            baseline: 0,
            runtime,
        }
    }

    /// Memory taken by everything other than containers
    pub fn with_baseline(mut self, baseline: u64) -> Self {
        self.baseline = baseline;
        self
    }
}

impl MemoryStats for FixedHeap {
    fn total_heap(&self) -> u64 {
        self.total
    }

    fn free_heap(&self) -> u64 {
        self.total
            .saturating_sub(self.baseline)
            .saturating_sub(self.runtime.memory_estimate())
    }

    fn max_free_block(&self) -> u64 {
        self.free_heap()
    }
}

/// Marker registered for each core system service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemService {
    pub name: &'static str,
}

/// Runtime, registry and heap statistics of one device
pub struct Containerization {
    runtime: Arc<ContainerRuntime>,
    registry: Arc<ServiceRegistry>,
    memory: Arc<dyn MemoryStats>,
}

impl Containerization {
    /// Context with a [`FixedHeap`] of [`DEFAULT_HEAP_BYTES`]
    pub fn new(runtime: Arc<ContainerRuntime>, registry: Arc<ServiceRegistry>) -> Self {
        let memory = Arc::new(FixedHeap::new(DEFAULT_HEAP_BYTES, runtime.clone()));
        Self::with_memory(runtime, registry, memory)
    }

    pub fn with_memory(
        runtime: Arc<ContainerRuntime>,
        registry: Arc<ServiceRegistry>,
        memory: Arc<dyn MemoryStats>,
    ) -> Self {
        Self {
            runtime,
            registry,
            memory,
        }
    }

    pub fn runtime(&self) -> &Arc<ContainerRuntime> {
        &self.runtime
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn memory(&self) -> &dyn MemoryStats {
        self.memory.as_ref()
    }

    /// Register the core system services. Services that are already
    /// registered are left in place.
    pub fn init(&self) -> Result<()> {
        for name in SYSTEM_SERVICES {
            if self.registry.get_namespaced(SYSTEM_NAMESPACE, name).is_some() {
                continue;
            }
            let spec = ServiceSpec::new(format!("{}.{}", SYSTEM_NAMESPACE, name))
                .namespace(SYSTEM_NAMESPACE)
                .label("service", name)
                .label("type", "internal");
            let service: Arc<dyn Any + Send + Sync> = Arc::new(SystemService { name });
            self.registry.register_spec(spec, service)?;
        }
        tracing::info!(count = SYSTEM_SERVICES.len(), "System services registered");
        Ok(())
    }

    /// Start the containers of the system manifest at the default path
    pub fn start_system_containers(&self) -> Result<Vec<ContainerHandle>> {
        self.start_containers_from(SYSTEM_MANIFEST_PATH)
    }

    /// Start the containers of a manifest. A missing manifest is not an
    /// error and starts nothing.
    pub fn start_containers_from(&self, path: impl AsRef<Path>) -> Result<Vec<ContainerHandle>> {
        let path = path.as_ref();
        let store = self.runtime.store();
        if !store.file_exists(path) {
            tracing::info!(path = %path.display(), "No system containers manifest found");
            return Ok(Vec::new());
        }

        let manifest = PodManifest::load_from_file(store.as_ref(), path)?;
        match manifest.instantiate(&self.runtime) {
            Ok(handles) => {
                tracing::info!(count = handles.len(), "System containers started");
                Ok(handles)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start system containers");
                Err(e)
            }
        }
    }

    /// One-line summary: `Pods: <n>/8, Mem: <free>K, Blk: <block>K`
    pub fn stats_string(&self) -> String {
        format!(
            "Pods: {}/{}, Mem: {}K, Blk: {}K",
            self.runtime.get_count(),
            CAPACITY,
            self.memory.free_heap() / 1024,
            self.memory.max_free_block() / 1024
        )
    }
}
