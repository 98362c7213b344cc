//! Individual container state

use std::fmt;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::config::{ContainerConfig, LivenessProbe};

/// Images containing this marker are external application packages
pub const EXTERNAL_IMAGE_MARKER: &str = ".fap";

/// What a container runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Image {
    /// Application compiled into the firmware, addressed by name
    BuiltIn(String),
    /// Application package on storage, addressed by path
    External(PathBuf),
}

impl Image {
    pub fn parse(image: &str) -> Self {
        if image.contains(EXTERNAL_IMAGE_MARKER) {
            Image::External(PathBuf::from(image))
        } else {
            Image::BuiltIn(image.to_string())
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Image::External(_))
    }

    /// Storage path for external images
    pub fn path(&self) -> Option<&Path> {
        match self {
            Image::External(path) => Some(path),
            Image::BuiltIn(_) => None,
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Image::BuiltIn(name) => write!(f, "{}", name),
            Image::External(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Lifecycle state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Pending,
    Running,
    Paused,
    Terminated,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Pending => write!(f, "Pending"),
            ContainerState::Running => write!(f, "Running"),
            ContainerState::Paused => write!(f, "Paused"),
            ContainerState::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Snapshot of a container's runtime status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub state: ContainerState,
    /// Seconds since the last successful start
    pub uptime: u32,
    pub restart_count: u32,
    /// Estimated memory use in bytes
    pub memory_used: u32,
    /// Estimated CPU use in percent
    pub cpu_usage: u32,
    pub liveness_failures: u32,
}

impl Default for ContainerStatus {
    fn default() -> Self {
        Self {
            state: ContainerState::Pending,
            uptime: 0,
            restart_count: 0,
            memory_used: 0,
            cpu_usage: 0,
            liveness_failures: 0,
        }
    }
}

/// Stable reference to a slot in the runtime's container table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerHandle(pub(crate) usize);

impl ContainerHandle {
    pub fn slot(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Information about a container
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub handle: ContainerHandle,
    pub config: ContainerConfig,
    pub status: ContainerStatus,
}

/// A container owned by one slot of the runtime
#[derive(Debug)]
pub(crate) struct Container {
    pub(crate) config: ContainerConfig,
    pub(crate) image: Image,
    pub(crate) status: ContainerStatus,
    /// Set by an explicit stop; the restart policy leaves such containers alone
    pub(crate) stopped_by_request: bool,
    /// Uptime at the last liveness probe evaluation
    pub(crate) last_probe_at: Option<u32>,
    /// Lifecycle token; every start, restart and stop issues a new one so
    /// work finished outside the table lock can tell it was superseded
    pub(crate) token: u64,
    /// A launch claimed under `token` is in flight
    pub(crate) starting: bool,
}

impl Container {
    pub(crate) fn new(config: ContainerConfig) -> Self {
        let image = Image::parse(&config.image);
        Self {
            config,
            image,
            status: ContainerStatus::default(),
            stopped_by_request: false,
            last_probe_at: None,
            token: 0,
            starting: false,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn state(&self) -> ContainerState {
        self.status.state
    }

    pub(crate) fn is_running(&self) -> bool {
        self.status.state == ContainerState::Running
    }

    pub(crate) fn mark_running(&mut self) {
        self.status.state = ContainerState::Running;
        self.status.uptime = 0;
        self.status.liveness_failures = 0;
        self.stopped_by_request = false;
        self.last_probe_at = None;
    }

    pub(crate) fn mark_terminated(&mut self) {
        self.status.state = ContainerState::Terminated;
        self.status.memory_used = 0;
        self.status.cpu_usage = 0;
    }

    /// Crude usage estimate: half of each configured limit
    pub(crate) fn refresh_usage_estimate(&mut self) {
        self.status.memory_used = self.config.resource_limits.max_memory / 2;
        self.status.cpu_usage = self.config.resource_limits.cpu_time_share / 2;
    }

    /// Whether the restart policy wants this container brought back
    pub(crate) fn awaits_restart(&self) -> bool {
        self.config.restart_on_crash
            && !self.stopped_by_request
            && !self.starting
            && self.status.state == ContainerState::Terminated
    }

    /// Liveness probe to evaluate this tick, honouring the initial delay and
    /// the probe period
    pub(crate) fn liveness_due(&self) -> Option<&LivenessProbe> {
        let probe = self.config.liveness_probe.as_ref()?;
        let uptime = self.status.uptime;
        if uptime < probe.initial_delay {
            return None;
        }
        match self.last_probe_at {
            Some(last) if uptime.saturating_sub(last) < probe.period => None,
            _ => Some(probe),
        }
    }

    pub(crate) fn info(&self, handle: ContainerHandle) -> ContainerInfo {
        ContainerInfo {
            handle,
            config: self.config.clone(),
            status: self.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_classification() {
        assert_eq!(Image::parse("clock"), Image::BuiltIn("clock".into()));
        let image = Image::parse("/ext/apps/Games/snake_game.fap");
        assert!(image.is_external());
        assert_eq!(image.path(), Some(Path::new("/ext/apps/Games/snake_game.fap")));
        assert_eq!(image.to_string(), "/ext/apps/Games/snake_game.fap");
    }

    #[test]
    fn test_container_state_display() {
        assert_eq!(ContainerState::Running.to_string(), "Running");
        assert_eq!(ContainerState::Terminated.to_string(), "Terminated");
    }

    #[test]
    fn test_container_new_is_pending() {
        let config = ContainerConfig::builder().name("clock").image("clock").build();
        let container = Container::new(config);
        assert_eq!(container.state(), ContainerState::Pending);
        assert_eq!(container.status.restart_count, 0);
        assert_eq!(container.status.uptime, 0);
        assert!(!container.awaits_restart());
    }

    #[test]
    fn test_restart_policy_respects_explicit_stop() {
        let config = ContainerConfig::builder().name("clock").image("clock").build();
        let mut container = Container::new(config);
        container.mark_running();
        container.mark_terminated();
        assert!(container.awaits_restart());

        container.stopped_by_request = true;
        assert!(!container.awaits_restart());

        container.mark_running();
        assert!(!container.stopped_by_request);

        container.mark_terminated();
        container.starting = true;
        assert!(!container.awaits_restart());
    }

    #[test]
    fn test_liveness_due_respects_delay_and_period() {
        let probe = LivenessProbe {
            initial_delay: 2,
            period: 3,
            ..LivenessProbe::default()
        };
        let config = ContainerConfig::builder()
            .name("clock")
            .image("clock")
            .liveness_probe(probe)
            .build();
        let mut container = Container::new(config);
        container.mark_running();

        container.status.uptime = 1;
        assert!(container.liveness_due().is_none());
        container.status.uptime = 2;
        assert!(container.liveness_due().is_some());

        container.last_probe_at = Some(2);
        container.status.uptime = 4;
        assert!(container.liveness_due().is_none());
        container.status.uptime = 5;
        assert!(container.liveness_due().is_some());
    }

    #[test]
    fn test_usage_estimate_is_half_of_limits() {
        let config = ContainerConfig::builder()
            .name("clock")
            .image("clock")
            .max_memory(8192)
            .cpu_time_share(10)
            .build();
        let mut container = Container::new(config);
        container.refresh_usage_estimate();
        assert_eq!(container.status.memory_used, 4096);
        assert_eq!(container.status.cpu_usage, 5);
    }
}
