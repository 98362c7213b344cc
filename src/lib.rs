//! MCU Kube
//!
//! A small Kubernetes-inspired container layer for constrained devices.
//! Applications run as "containers": resource-limited wrappers around a
//! launched image, tracked in a fixed table of slots and kept alive by a
//! periodic health/restart scheduler.
//!
//! # Key Features
//!
//! - **Fixed capacity** - At most 8 containers, no dynamic growth
//! - **Restart on crash** - Exponential-style backoff with a capped delay factor
//! - **Liveness probes** - Repeated probe failures force a restart
//! - **Pod manifests** - Declarative, all-or-nothing deployment of container groups
//! - **Service registry** - Namespaced, labeled lookup with selector scoring
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcu_kube::{ContainerConfig, ContainerRuntime, HostLauncher, LocalFileStore};
//!
//! let runtime = Arc::new(ContainerRuntime::new(
//!     Arc::new(HostLauncher::new()),
//!     Arc::new(LocalFileStore::new()),
//! ));
//!
//! let config = ContainerConfig::builder()
//!     .name("clock")
//!     .image("clock")
//!     .max_memory(4096)
//!     .restart_on_crash(true)
//!     .build();
//!
//! let handle = runtime.create(config)?;
//! runtime.start_container(handle)?;
//!
//! // One scheduler cycle: health check, restart policy, liveness probes
//! runtime.tick();
//!
//! runtime.stop_container(handle, false)?;
//! # Ok::<(), mcu_kube::Error>(())
//! ```

pub mod cli;
pub mod config;
pub mod container;
pub mod error;
pub mod format;
pub mod launcher;
pub mod manifest;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod system;

pub use config::{ContainerConfig, LivenessProbe, ProbeKind, ResourceLimits, RuntimeConfig};
pub use container::{ContainerHandle, ContainerInfo, ContainerState, ContainerStatus, Image};
pub use error::{Error, Result};
pub use launcher::{HostLauncher, ProcessLauncher};
pub use manifest::{PodContainerSpec, PodManifest};
pub use registry::{Selector, ServiceRegistry, ServiceSpec};
pub use runtime::{ContainerRuntime, CAPACITY};
pub use store::{FileStore, LocalFileStore};
pub use system::{Containerization, FixedHeap, MemoryStats};
