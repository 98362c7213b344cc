//! Pod manifests: declarative deployment of a group of containers
//!
//! A manifest is a key/value file:
//!
//! ```text
//! Filetype: Flipper Pod Manifest
//! Version: 1
//! Name: sensors
//! Namespace: default
//! ContainerCount: 2
//! Container0: thermo
//! Image0: /ext/apps/Tools/thermo.fap
//! Memory0: 8192
//! Container1: clock
//! Image1: clock
//! ```
//!
//! Instantiation is all-or-nothing: if any container of the pod cannot be
//! created or started, everything already done for the pod is undone.

use std::collections::HashSet;
use std::path::Path;
use crate::config::{
    ContainerConfig, LivenessProbe, ProbeKind, ResourceLimits, INSTANTIATE_DEFAULT_LIMITS,
    MANIFEST_DEFAULT_LIMITS,
};
use crate::container::{ContainerHandle, Image};
use crate::format::KeyValueFile;
use crate::runtime::{ContainerRuntime, CAPACITY};
use crate::store::FileStore;
use crate::{Error, Result};

pub const MANIFEST_FILETYPE: &str = "Flipper Pod Manifest";
pub const MANIFEST_VERSION: u32 = 1;

/// Memory limits below this are accepted with a warning
const MIN_SENSIBLE_MEMORY: u32 = 1024;

/// Volume mount declared by a container (not mounted by this runtime)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMountSpec {
    pub name: String,
    pub mount_path: String,
    pub read_only: bool,
}

/// Container spec within a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodContainerSpec {
    pub name: String,
    pub image: String,
    pub resources: ResourceLimits,
    pub restart_on_crash: bool,
    pub system_privileges: bool,
    pub health_check: Option<LivenessProbe>,
    pub volume_mounts: Vec<VolumeMountSpec>,
    pub args: Option<String>,
}

impl PodContainerSpec {
    /// Runtime config for this spec, with conservative limits for zero fields
    pub fn to_config(&self) -> ContainerConfig {
        ContainerConfig {
            name: self.name.clone(),
            image: self.image.clone(),
            resource_limits: self.resources.or_defaults(&INSTANTIATE_DEFAULT_LIMITS),
            restart_on_crash: self.restart_on_crash,
            system_container: self.system_privileges,
            liveness_probe: self.health_check.clone(),
            args: self.args.clone(),
        }
    }
}

/// A named group of containers deployed together
#[derive(Debug, Clone)]
pub struct PodManifest {
    name: String,
    namespace: String,
    containers: Vec<PodContainerSpec>,
}

impl PodManifest {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        containers: Vec<PodContainerSpec>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            containers,
        }
    }

    /// Load and parse a manifest file
    pub fn load_from_file(store: &dyn FileStore, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = store.open_key_value(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to open manifest");
            e
        })?;

        let manifest = Self::from_key_value(&file).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to load manifest");
            e
        })?;

        tracing::info!(
            pod = %manifest.name,
            namespace = %manifest.namespace,
            containers = manifest.containers.len(),
            "Loaded pod manifest"
        );
        Ok(manifest)
    }

    /// Build a manifest from an already parsed key/value file
    pub fn from_key_value(file: &KeyValueFile) -> Result<Self> {
        let (filetype, version) = file.read_header();
        if filetype != MANIFEST_FILETYPE || version != MANIFEST_VERSION {
            return Err(Error::manifest(
                file.path(),
                format!("invalid manifest format '{}' version {}", filetype, version),
            ));
        }

        let name = required(file, "Name")?;
        let namespace = required(file, "Namespace")?;

        let mut count = match file.read_u32("ContainerCount")? {
            Some(count) if count > 0 => count as usize,
            _ => return Err(Error::manifest(file.path(), "invalid container count")),
        };
        if count > CAPACITY {
            tracing::warn!(count, max = CAPACITY, "Container count exceeds maximum, truncating");
            count = CAPACITY;
        }

        let containers = (0..count)
            .map(|i| read_container(file, i))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name,
            namespace,
            containers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn containers(&self) -> &[PodContainerSpec] {
        &self.containers
    }

    /// Check that the manifest can be deployed: required fields are present,
    /// container names are unique and every external image exists.
    pub fn validate(&self, store: &dyn FileStore) -> Result<()> {
        if self.name.is_empty() || self.namespace.is_empty() {
            return Err(invalid("missing name or namespace".into()));
        }
        if self.containers.is_empty() {
            return Err(invalid(format!("pod {} defines no containers", self.name)));
        }

        let mut seen = HashSet::new();
        for (i, spec) in self.containers.iter().enumerate() {
            if spec.name.is_empty() {
                return Err(invalid(format!("container {}: missing name", i)));
            }
            if spec.image.is_empty() {
                return Err(invalid(format!("container {}: missing image", spec.name)));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(invalid(format!("container {}: duplicate name", spec.name)));
            }
            if let Some(path) = Image::parse(&spec.image).path() {
                if !store.file_exists(path) {
                    return Err(invalid(format!(
                        "container {}: image not found: {}",
                        spec.name,
                        path.display()
                    )));
                }
            }
            if spec.resources.max_memory > 0 && spec.resources.max_memory < MIN_SENSIBLE_MEMORY {
                tracing::warn!(
                    container = %spec.name,
                    max_memory = spec.resources.max_memory,
                    "Memory limit below 1KB"
                );
            }
        }
        Ok(())
    }

    /// Create and start every container of the pod, in manifest order.
    ///
    /// On any failure the containers started so far are force-stopped, the
    /// slots created for this pod are released and the error is returned.
    pub fn instantiate(&self, runtime: &ContainerRuntime) -> Result<Vec<ContainerHandle>> {
        self.validate(runtime.store().as_ref())?;

        let free = CAPACITY.saturating_sub(runtime.get_count());
        if self.containers.len() > free {
            return Err(Error::Capacity(format!(
                "pod {} needs {} containers, {} slots free",
                self.name,
                self.containers.len(),
                free
            )));
        }

        let mut created = Vec::with_capacity(self.containers.len());
        for spec in &self.containers {
            match runtime.create(spec.to_config()) {
                Ok(handle) => created.push(handle),
                Err(e) => {
                    tracing::error!(
                        pod = %self.name,
                        container = %spec.name,
                        error = %e,
                        "Failed to create container"
                    );
                    rollback(runtime, &created, 0);
                    return Err(e);
                }
            }
        }

        for (started, handle) in created.iter().enumerate() {
            if let Err(e) = runtime.start_container(*handle) {
                tracing::error!(pod = %self.name, error = %e, "Failed to start pod, rolling back");
                rollback(runtime, &created, started);
                return Err(e);
            }
        }

        tracing::info!(
            pod = %self.name,
            namespace = %self.namespace,
            containers = created.len(),
            "Pod started"
        );
        Ok(created)
    }
}

fn invalid(reason: String) -> Error {
    tracing::error!(reason = %reason, "Invalid manifest");
    Error::Validation(reason)
}

/// Undo a partial pod: stop the first `started` containers, then free every slot
fn rollback(runtime: &ContainerRuntime, created: &[ContainerHandle], started: usize) {
    for handle in &created[..started] {
        if let Err(e) = runtime.stop_container(*handle, true) {
            tracing::warn!(
                handle = %handle,
                error = %e,
                "Failed to stop container during rollback"
            );
        }
    }
    for handle in created {
        runtime.discard(*handle);
    }
}

fn required(file: &KeyValueFile, key: &str) -> Result<String> {
    match file.read_string(key) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(Error::manifest(file.path(), format!("missing {}", key))),
    }
}

fn read_container(file: &KeyValueFile, i: usize) -> Result<PodContainerSpec> {
    let key = |field: &str| format!("{}{}", field, i);

    let name = required(file, &key("Container"))?;
    let image = required(file, &key("Image"))?;

    let defaults = MANIFEST_DEFAULT_LIMITS;
    let resources = ResourceLimits {
        max_memory: file.read_u32(&key("Memory"))?.unwrap_or(defaults.max_memory),
        cpu_time_share: file.read_u32(&key("CPU"))?.unwrap_or(defaults.cpu_time_share),
        max_threads: file.read_u32(&key("Threads"))?.unwrap_or(defaults.max_threads),
    };

    Ok(PodContainerSpec {
        name,
        image,
        resources,
        restart_on_crash: file.read_bool(&key("RestartOnCrash"))?.unwrap_or(true),
        system_privileges: file.read_bool(&key("SystemPrivileges"))?.unwrap_or(false),
        health_check: read_health_check(file, i)?,
        volume_mounts: Vec::new(),
        args: file.read_string(&key("Args")).map(str::to_string),
    })
}

/// `HealthCheck{i}` is either `process` or a command line to run
fn read_health_check(file: &KeyValueFile, i: usize) -> Result<Option<LivenessProbe>> {
    let Some(check) = file.read_string(&format!("HealthCheck{}", i)) else {
        return Ok(None);
    };
    let kind = match check {
        "" | "none" => return Ok(None),
        "process" => ProbeKind::Process,
        command => ProbeKind::Command(command.to_string()),
    };

    let defaults = LivenessProbe::default();
    Ok(Some(LivenessProbe {
        kind,
        initial_delay: file
            .read_u32(&format!("HealthDelay{}", i))?
            .unwrap_or(defaults.initial_delay),
        period: file
            .read_u32(&format!("HealthPeriod{}", i))?
            .unwrap_or(defaults.period)
            .max(1),
        failure_threshold: file
            .read_u32(&format!("HealthFailures{}", i))?
            .unwrap_or(defaults.failure_threshold)
            .max(1),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use crate::container::ContainerState;
    use crate::launcher::MockProcessLauncher;
    use crate::store::LocalFileStore;

    const HEADER: &str = "Filetype: Flipper Pod Manifest\nVersion: 1\n";

    fn parse(body: &str) -> Result<PodManifest> {
        let file = KeyValueFile::parse("pod.txt", &format!("{}{}", HEADER, body))?;
        PodManifest::from_key_value(&file)
    }

    fn spec(name: &str, image: &str) -> PodContainerSpec {
        PodContainerSpec {
            name: name.into(),
            image: image.into(),
            resources: ResourceLimits::default(),
            restart_on_crash: true,
            system_privileges: false,
            health_check: None,
            volume_mounts: Vec::new(),
            args: None,
        }
    }

    fn runtime_with(launcher: MockProcessLauncher, temp: &TempDir) -> ContainerRuntime {
        ContainerRuntime::new(Arc::new(launcher), Arc::new(LocalFileStore::rooted(temp.path())))
    }

    #[test]
    fn test_load_defaults() {
        let manifest = parse(
            "Name: clocks\nNamespace: default\nContainerCount: 1\n\
             Container0: clock\nImage0: clock\n",
        )
        .unwrap();

        let spec = &manifest.containers()[0];
        assert_eq!(spec.resources, MANIFEST_DEFAULT_LIMITS);
        assert!(spec.restart_on_crash);
        assert!(!spec.system_privileges);
        assert!(spec.health_check.is_none());
        assert!(spec.volume_mounts.is_empty());
    }

    #[test]
    fn test_load_explicit_fields() {
        let manifest = parse(
            "Name: p\nNamespace: n\nContainerCount: 1\nContainer0: c\nImage0: clock\n\
             Memory0: 4096\nCPU0: 5\nThreads0: 2\nRestartOnCrash0: 0\nSystemPrivileges0: 1\n\
             Args0: --verbose\nHealthCheck0: process\nHealthPeriod0: 3\n",
        )
        .unwrap();

        let spec = &manifest.containers()[0];
        assert_eq!(spec.resources, ResourceLimits::new(4096, 5, 2));
        assert!(!spec.restart_on_crash);
        assert!(spec.system_privileges);
        assert_eq!(spec.args.as_deref(), Some("--verbose"));
        let probe = spec.health_check.as_ref().unwrap();
        assert_eq!(probe.kind, ProbeKind::Process);
        assert_eq!(probe.period, 3);
        assert_eq!(probe.failure_threshold, 3);
    }

    #[test]
    fn test_load_rejects_bad_header() {
        let text = "Filetype: Flipper Pod Manifest\nVersion: 2\nName: p\n";
        let file = KeyValueFile::parse("pod.txt", text).unwrap();
        assert!(PodManifest::from_key_value(&file).is_err());

        let text = "Filetype: Something Else\nVersion: 1\nName: p\n";
        let file = KeyValueFile::parse("pod.txt", text).unwrap();
        assert!(PodManifest::from_key_value(&file).is_err());
    }

    #[test]
    fn test_load_missing_required_fields() {
        assert!(parse("Namespace: n\nContainerCount: 1\nContainer0: c\nImage0: i\n").is_err());
        assert!(parse("Name: p\nContainerCount: 1\nContainer0: c\nImage0: i\n").is_err());
        assert!(parse("Name: p\nNamespace: n\nContainer0: c\nImage0: i\n").is_err());
        assert!(parse("Name: p\nNamespace: n\nContainerCount: 0\n").is_err());
        assert!(parse(
            "Name: p\nNamespace: n\nContainerCount: 2\nContainer0: c\nImage0: i\nContainer1: d\n"
        )
        .is_err());
    }

    #[test]
    fn test_load_truncates_to_capacity() {
        let mut body = String::from("Name: big\nNamespace: n\nContainerCount: 12\n");
        for i in 0..12 {
            body.push_str(&format!("Container{}: c{}\nImage{}: clock\n", i, i, i));
        }
        let manifest = parse(&body).unwrap();
        assert_eq!(manifest.containers().len(), CAPACITY);
        assert_eq!(manifest.containers()[7].name, "c7");
    }

    #[test]
    fn test_load_from_missing_file() {
        let temp = TempDir::new().unwrap();
        let store = LocalFileStore::rooted(temp.path());
        assert!(matches!(
            PodManifest::load_from_file(&store, "/ext/pod.txt").unwrap_err(),
            Error::Io(_)
        ));
    }

    #[test]
    fn test_validate() {
        let temp = TempDir::new().unwrap();
        let store = LocalFileStore::rooted(temp.path());

        let manifest = PodManifest::new("p", "n", vec![spec("a", "clock")]);
        assert!(manifest.validate(&store).is_ok());

        let manifest = PodManifest::new("p", "n", vec![]);
        assert!(manifest.validate(&store).is_err());

        let manifest = PodManifest::new("", "n", vec![spec("a", "clock")]);
        assert!(manifest.validate(&store).is_err());

        let manifest = PodManifest::new("p", "n", vec![spec("a", "clock"), spec("a", "clock")]);
        assert!(manifest.validate(&store).is_err());

        let manifest = PodManifest::new("p", "n", vec![spec("a", "/ext/apps/missing.fap")]);
        assert!(matches!(manifest.validate(&store).unwrap_err(), Error::Validation(_)));

        let mut low = spec("a", "clock");
        low.resources.max_memory = 100;
        assert!(PodManifest::new("p", "n", vec![low]).validate(&store).is_ok());
    }

    #[test]
    fn test_to_config_uses_instantiate_defaults() {
        let config = spec("a", "clock").to_config();
        assert_eq!(config.resource_limits, INSTANTIATE_DEFAULT_LIMITS);
    }

    #[test]
    fn test_instantiate_starts_all() {
        let temp = TempDir::new().unwrap();
        let mut launcher = MockProcessLauncher::new();
        launcher.expect_start().times(2).return_const(true);
        launcher.expect_stop().return_const(());
        let runtime = runtime_with(launcher, &temp);

        let manifest = PodManifest::new("p", "n", vec![spec("a", "clock"), spec("b", "notes")]);
        let handles = manifest.instantiate(&runtime).unwrap();

        assert_eq!(handles.len(), 2);
        for handle in handles {
            assert_eq!(runtime.info(handle).unwrap().status.state, ContainerState::Running);
        }
    }

    #[test]
    fn test_instantiate_rolls_back_on_start_failure() {
        let temp = TempDir::new().unwrap();
        let mut launcher = MockProcessLauncher::new();
        launcher
            .expect_start()
            .returning(|image, _| image.to_string() != "broken");
        launcher
            .expect_stop()
            .withf(|image, force| image.to_string() == "clock" && *force)
            .times(1)
            .return_const(());
        let runtime = runtime_with(launcher, &temp);

        let manifest = PodManifest::new(
            "p",
            "n",
            vec![spec("a", "clock"), spec("b", "broken"), spec("c", "notes")],
        );
        assert!(matches!(manifest.instantiate(&runtime).unwrap_err(), Error::LaunchFailed(_)));
        assert_eq!(runtime.get_count(), 0);
    }

    #[test]
    fn test_instantiate_rolls_back_on_create_failure() {
        let temp = TempDir::new().unwrap();
        let mut launcher = MockProcessLauncher::new();
        launcher.expect_start().never();
        let runtime = runtime_with(launcher, &temp);
        runtime.create(ContainerConfig::builder().name("b").image("clock").build()).unwrap();

        let manifest = PodManifest::new("p", "n", vec![spec("a", "clock"), spec("b", "clock")]);
        assert!(matches!(manifest.instantiate(&runtime).unwrap_err(), Error::AlreadyExists(_)));
        assert_eq!(runtime.get_count(), 1);
        assert!(runtime.find_by_name("a").is_none());
    }

    #[test]
    fn test_instantiate_checks_free_slots() {
        let temp = TempDir::new().unwrap();
        let mut launcher = MockProcessLauncher::new();
        launcher.expect_start().never();
        let runtime = runtime_with(launcher, &temp);
        for i in 0..7 {
            runtime
                .create(ContainerConfig::builder().name(format!("x{}", i)).image("clock").build())
                .unwrap();
        }

        let manifest = PodManifest::new("p", "n", vec![spec("a", "clock"), spec("b", "clock")]);
        assert!(manifest.instantiate(&runtime).unwrap_err().is_capacity_error());
        assert_eq!(runtime.get_count(), 7);
    }

    #[test]
    fn test_instantiate_invalid_manifest_creates_nothing() {
        let temp = TempDir::new().unwrap();
        let mut launcher = MockProcessLauncher::new();
        launcher.expect_start().never();
        let runtime = runtime_with(launcher, &temp);

        let manifest = PodManifest::new("p", "n", vec![spec("a", "/ext/apps/gone.fap")]);
        assert!(manifest.instantiate(&runtime).is_err());
        assert_eq!(runtime.get_count(), 0);
    }
}
