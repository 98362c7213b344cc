//! Container and runtime configuration with builder pattern

use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Resource limits for a single container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum memory in bytes
    pub max_memory: u32,
    /// CPU time share in percent (0-100)
    pub cpu_time_share: u32,
    /// Maximum number of threads
    pub max_threads: u32,
}

impl ResourceLimits {
    pub const fn new(max_memory: u32, cpu_time_share: u32, max_threads: u32) -> Self {
        Self {
            max_memory,
            cpu_time_share,
            max_threads,
        }
    }

    /// Replace every zero field with the matching field of `defaults`
    pub fn or_defaults(self, defaults: &ResourceLimits) -> Self {
        Self {
            max_memory: non_zero_or(self.max_memory, defaults.max_memory),
            cpu_time_share: non_zero_or(self.cpu_time_share, defaults.cpu_time_share),
            max_threads: non_zero_or(self.max_threads, defaults.max_threads),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.max_memory > 0 && self.cpu_time_share > 0 && self.max_threads > 0
    }
}

fn non_zero_or(value: u32, fallback: u32) -> u32 {
    if value > 0 { value } else { fallback }
}

/// Limits substituted by `ContainerRuntime::create` for zero fields
pub const CREATE_DEFAULT_LIMITS: ResourceLimits = ResourceLimits::new(2 * 1024, 3, 1);

/// Limits substituted by pod instantiation when a spec still carries zeros
pub const INSTANTIATE_DEFAULT_LIMITS: ResourceLimits = ResourceLimits::new(8 * 1024, 10, 1);

/// Limits assumed for manifest entries that omit them
pub const MANIFEST_DEFAULT_LIMITS: ResourceLimits = ResourceLimits::new(32 * 1024, 50, 3);

/// How a liveness probe decides whether a container is healthy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeKind {
    /// Healthy while the backing process is alive
    Process,
    /// Healthy while the command exits successfully
    Command(String),
}

/// Periodic liveness probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessProbe {
    pub kind: ProbeKind,
    /// Seconds of uptime before the first evaluation
    pub initial_delay: u32,
    /// Seconds between evaluations
    pub period: u32,
    /// Consecutive failures that trigger a restart
    pub failure_threshold: u32,
}

impl Default for LivenessProbe {
    fn default() -> Self {
        Self {
            kind: ProbeKind::Process,
            initial_delay: 5,
            period: 10,
            failure_threshold: 3,
        }
    }
}

/// Immutable intent for one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub name: String,
    /// Built-in application name or external package path
    pub image: String,
    pub resource_limits: ResourceLimits,
    /// Auto-restart on abnormal termination
    pub restart_on_crash: bool,
    /// Has access to system resources
    pub system_container: bool,
    pub liveness_probe: Option<LivenessProbe>,
    /// Opaque argument payload handed to the launcher
    pub args: Option<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            image: String::new(),
            resource_limits: ResourceLimits::default(),
            restart_on_crash: true,
            system_container: false,
            liveness_probe: None,
            args: None,
        }
    }
}

impl ContainerConfig {
    pub fn builder() -> ContainerConfigBuilder {
        ContainerConfigBuilder::default()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::Error::Config("name cannot be empty".into()));
        }
        if self.image.is_empty() {
            return Err(crate::Error::Config(format!("container '{}' has no image", self.name)));
        }
        if self.resource_limits.cpu_time_share > 100 {
            return Err(crate::Error::Config(format!(
                "cpu_time_share must be 0-100, got {}",
                self.resource_limits.cpu_time_share
            )));
        }
        if let Some(probe) = &self.liveness_probe {
            if probe.period == 0 || probe.failure_threshold == 0 {
                return Err(crate::Error::Config(
                    "liveness probe period and failure_threshold must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ContainerConfigBuilder {
    config: ContainerConfig,
}

impl ContainerConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.config.image = image.into();
        self
    }

    pub fn max_memory(mut self, bytes: u32) -> Self {
        self.config.resource_limits.max_memory = bytes;
        self
    }

    pub fn cpu_time_share(mut self, percent: u32) -> Self {
        self.config.resource_limits.cpu_time_share = percent;
        self
    }

    pub fn max_threads(mut self, threads: u32) -> Self {
        self.config.resource_limits.max_threads = threads;
        self
    }

    pub fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.config.resource_limits = limits;
        self
    }

    pub fn restart_on_crash(mut self, restart: bool) -> Self {
        self.config.restart_on_crash = restart;
        self
    }

    pub fn system_container(mut self, system: bool) -> Self {
        self.config.system_container = system;
        self
    }

    pub fn liveness_probe(mut self, probe: LivenessProbe) -> Self {
        self.config.liveness_probe = Some(probe);
        self
    }

    pub fn args(mut self, args: impl Into<String>) -> Self {
        self.config.args = Some(args.into());
        self
    }

    pub fn build(self) -> ContainerConfig {
        self.config
    }

    pub fn build_validated(self) -> crate::Result<ContainerConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}

/// Tunables of the container runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Scheduler tick period in milliseconds
    pub tick_period_ms: u64,
    /// Ticks between usage estimate refreshes
    pub stats_interval_ticks: u32,
    /// Upper bound of the restart backoff factor
    pub backoff_cap: u32,
    /// Limits substituted for zero fields at creation time
    pub default_limits: ResourceLimits,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 1000,
            stats_interval_ticks: 10,
            backoff_cap: 5,
            default_limits: CREATE_DEFAULT_LIMITS,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.tick_period_ms == 0 {
            return Err(crate::Error::Config("tick_period_ms must be positive".into()));
        }
        if self.stats_interval_ticks == 0 {
            return Err(crate::Error::Config("stats_interval_ticks must be positive".into()));
        }
        if !self.default_limits.is_complete() {
            return Err(crate::Error::Config("default_limits must all be non-zero".into()));
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn tick_period_ms(mut self, ms: u64) -> Self {
        self.tick_period_ms = ms;
        self
    }

    pub fn stats_interval_ticks(mut self, ticks: u32) -> Self {
        self.stats_interval_ticks = ticks;
        self
    }

    pub fn backoff_cap(mut self, cap: u32) -> Self {
        self.backoff_cap = cap;
        self
    }

    pub fn default_limits(mut self, limits: ResourceLimits) -> Self {
        self.default_limits = limits;
        self
    }
}
