//! Container runtime: fixed slot table plus a periodic health/restart scheduler
//!
//! Every read or mutation of the slot table happens under a single mutex.
//! Foreground calls wait for the lock; the scheduler tick only tries once
//! and skips the whole cycle when the lock is contended.
//!
//! Launcher calls that can block (starts, liveness checks) never run under
//! the lock. They are claimed under the lock with a lifecycle token and their
//! outcome is applied afterwards only if no stop, restart or removal issued a
//! newer token in the meantime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use crate::config::{ContainerConfig, LivenessProbe, RuntimeConfig};
use crate::container::{
    Container, ContainerHandle, ContainerInfo, ContainerState, ContainerStatus, Image,
};
use crate::launcher::{self, ProcessLauncher};
use crate::store::FileStore;
use crate::{Error, Result};

/// Maximum number of concurrently defined containers
pub const CAPACITY: usize = 8;

#[derive(Default)]
struct SlotTable {
    slots: [Option<Container>; CAPACITY],
    count: usize,
}

impl SlotTable {
    fn get(&self, handle: ContainerHandle) -> Result<&Container> {
        self.slots
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::NotFound(handle.to_string()))
    }

    fn get_mut(&mut self, handle: ContainerHandle) -> Result<&mut Container> {
        self.slots
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::NotFound(handle.to_string()))
    }

    fn find(&self, name: &str) -> Option<ContainerHandle> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|c| c.name() == name))
            .map(ContainerHandle)
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    fn occupied(&self) -> impl Iterator<Item = (ContainerHandle, &Container)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|c| (ContainerHandle(i), c)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchReason {
    /// Explicit start through the API
    Start,
    /// Crash restart or restart after liveness failures
    Restart,
}

/// Launch claimed under the table lock, performed without it
struct Launch {
    handle: ContainerHandle,
    token: u64,
    image: Image,
    args: Option<String>,
    reason: LaunchReason,
}

/// Liveness check that was due at the time the tick held the lock
struct LivenessCheck {
    handle: ContainerHandle,
    token: u64,
    image: Image,
    probe: LivenessProbe,
}

/// Manages the containers of one device
pub struct ContainerRuntime {
    table: Mutex<SlotTable>,
    tokens: AtomicU64,
    launcher: Arc<dyn ProcessLauncher>,
    store: Arc<dyn FileStore>,
    config: RuntimeConfig,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerRuntime {
    /// Create a runtime with default settings and an empty slot table
    pub fn new(launcher: Arc<dyn ProcessLauncher>, store: Arc<dyn FileStore>) -> Self {
        Self {
            table: Mutex::new(SlotTable::default()),
            tokens: AtomicU64::new(0),
            launcher,
            store,
            config: RuntimeConfig::default(),
            scheduler: Mutex::new(None),
        }
    }

    /// Create a runtime with custom config
    pub fn with_config(
        config: RuntimeConfig,
        launcher: Arc<dyn ProcessLauncher>,
        store: Arc<dyn FileStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            table: Mutex::new(SlotTable::default()),
            tokens: AtomicU64::new(0),
            launcher,
            store,
            config,
            scheduler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    /// Arm the periodic scheduler on the current tokio runtime.
    ///
    /// Calling this again while the scheduler is running does nothing.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut scheduler = self.scheduler.lock();
        if scheduler.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Resource("scheduler requires a tokio runtime".into()))?;

        let runtime = Arc::downgrade(self);
        let period = self.config.tick_period();
        *scheduler = Some(handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(runtime) = runtime.upgrade() else {
                    break;
                };
                runtime.tick();
            }
        }));

        tracing::info!(period_ms = self.config.tick_period_ms, "Container scheduler started");
        Ok(())
    }

    pub fn is_scheduler_running(&self) -> bool {
        self.scheduler
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Create a new container (does not start it)
    pub fn create(&self, config: ContainerConfig) -> Result<ContainerHandle> {
        if let Err(e) = config.validate() {
            tracing::error!(error = %e, "Invalid container config");
            return Err(e);
        }
        self.check_image(&config.image)?;

        let mut table = self.table.lock();

        if table.count >= CAPACITY {
            tracing::error!(container = %config.name, "Max containers reached");
            return Err(Error::Capacity(format!(
                "maximum container limit ({}) reached",
                CAPACITY
            )));
        }

        if table.find(&config.name).is_some() {
            return Err(Error::AlreadyExists(config.name));
        }

        let slot = table
            .free_slot()
            .ok_or_else(|| Error::Capacity("no free container slot".into()))?;

        let mut config = config;
        config.resource_limits = config.resource_limits.or_defaults(&self.config.default_limits);

        tracing::info!(
            container = %config.name,
            image = %config.image,
            slot,
            max_memory = config.resource_limits.max_memory,
            "Container created"
        );

        table.slots[slot] = Some(Container::new(config));
        table.count += 1;
        Ok(ContainerHandle(slot))
    }

    /// Confirm an image can be launched; built-in images always can
    pub(crate) fn check_image(&self, image: &str) -> Result<()> {
        let image = Image::parse(image);
        match image.path() {
            Some(path) if !self.store.file_exists(path) => {
                tracing::error!(image = %image, "Image not found");
                Err(Error::Validation(format!("image not found: {}", image)))
            }
            _ => Ok(()),
        }
    }

    /// Start a container; a running container is left alone.
    ///
    /// If the container is stopped or removed while the launcher is still
    /// starting it, the new process is force-stopped and the start fails
    /// with [`Error::InvalidState`].
    pub fn start_container(&self, handle: ContainerHandle) -> Result<()> {
        let launch = {
            let mut table = self.table.lock();
            let container = table.get_mut(handle)?;
            match container.state() {
                ContainerState::Running => return Ok(()),
                ContainerState::Paused => {
                    return Err(Error::InvalidState {
                        current: ContainerState::Paused.to_string(),
                        expected: "Pending or Terminated".into(),
                    })
                }
                ContainerState::Pending | ContainerState::Terminated => {}
            }
            if container.starting {
                return Err(Error::InvalidState {
                    current: "Starting".into(),
                    expected: "Pending or Terminated".into(),
                });
            }
            self.claim_launch(handle, container, LaunchReason::Start)
        };

        self.run_launch(launch)
    }

    /// Stop a container. The restart policy will not bring it back until it
    /// is started again explicitly.
    pub fn stop_container(&self, handle: ContainerHandle, force: bool) -> Result<()> {
        let image = {
            let mut table = self.table.lock();
            let container = table.get_mut(handle)?;
            container.stopped_by_request = true;
            self.revoke(container);
            if container.state() == ContainerState::Terminated {
                return Ok(());
            }
            container.mark_terminated();
            tracing::info!(container = %container.name(), force, "Container stopped");
            container.image.clone()
        };

        self.launcher.stop(&image, force);
        Ok(())
    }

    /// Mark a running container as paused. No launcher call is made and the
    /// scheduler does not monitor paused containers.
    pub fn pause(&self, handle: ContainerHandle) -> Result<()> {
        self.transition(handle, ContainerState::Running, ContainerState::Paused)
    }

    /// Return a paused container to the running state
    pub fn resume(&self, handle: ContainerHandle) -> Result<()> {
        self.transition(handle, ContainerState::Paused, ContainerState::Running)
    }

    fn transition(
        &self,
        handle: ContainerHandle,
        from: ContainerState,
        to: ContainerState,
    ) -> Result<()> {
        let mut table = self.table.lock();
        let container = table.get_mut(handle)?;
        if container.state() != from {
            return Err(Error::InvalidState {
                current: container.state().to_string(),
                expected: from.to_string(),
            });
        }
        container.status.state = to;
        tracing::debug!(container = %container.name(), state = %to, "Container state changed");
        Ok(())
    }

    /// Fresh status: the health check runs before the snapshot is taken
    pub fn get_status(&self, handle: ContainerHandle) -> Result<ContainerStatus> {
        let mut table = self.table.lock();
        let container = table.get_mut(handle)?;
        self.check_health(container);
        Ok(container.status)
    }

    /// Number of occupied slots
    pub fn get_count(&self) -> usize {
        self.table.lock().count
    }

    pub fn find_by_name(&self, name: &str) -> Option<ContainerHandle> {
        self.table.lock().find(name)
    }

    pub fn info(&self, handle: ContainerHandle) -> Result<ContainerInfo> {
        let table = self.table.lock();
        Ok(table.get(handle)?.info(handle))
    }

    /// List all containers in slot order
    pub fn list(&self) -> Vec<ContainerInfo> {
        self.table
            .lock()
            .occupied()
            .map(|(handle, c)| c.info(handle))
            .collect()
    }

    /// Sum of the memory estimates of all containers
    pub fn memory_estimate(&self) -> u64 {
        self.table
            .lock()
            .occupied()
            .map(|(_, c)| u64::from(c.status.memory_used))
            .sum()
    }

    /// Free a slot created by a batch that is being rolled back
    pub(crate) fn discard(&self, handle: ContainerHandle) {
        let mut table = self.table.lock();
        if let Some(container) = table.slots.get_mut(handle.0).and_then(Option::take) {
            table.count -= 1;
            tracing::debug!(container = %container.name(), "Container discarded");
        }
    }

    /// One scheduler cycle. Returns false when the cycle was skipped because
    /// the slot table was busy.
    pub fn tick(&self) -> bool {
        let (launches, checks) = {
            let Some(mut table) = self.table.try_lock() else {
                tracing::debug!("Slot table busy, skipping scheduler tick");
                return false;
            };

            let mut launches = Vec::new();
            let mut checks = Vec::new();
            for (slot, entry) in table.slots.iter_mut().enumerate() {
                let Some(container) = entry else {
                    continue;
                };
                self.tick_container(ContainerHandle(slot), container, &mut launches, &mut checks);
            }
            (launches, checks)
        };

        for launch in launches {
            if let Err(e) = self.run_launch(launch) {
                tracing::debug!(error = %e, "Scheduled restart abandoned");
            }
        }

        for check in checks {
            let healthy = self.launcher.probe(&check.image, &check.probe.kind);
            if let Some(launch) = self.record_liveness(&check, healthy) {
                self.launcher.stop(&launch.image, true);
                if let Err(e) = self.run_launch(launch) {
                    tracing::debug!(error = %e, "Liveness restart abandoned");
                }
            }
        }
        true
    }

    fn tick_container(
        &self,
        handle: ContainerHandle,
        container: &mut Container,
        launches: &mut Vec<Launch>,
        checks: &mut Vec<LivenessCheck>,
    ) {
        if container.starting {
            return;
        }
        self.check_health(container);

        if container.is_running() {
            container.status.uptime = container.status.uptime.saturating_add(1);
            if container.status.uptime % self.config.stats_interval_ticks == 0 {
                container.refresh_usage_estimate();
            }
        } else if container.awaits_restart() {
            container.status.uptime = container.status.uptime.saturating_add(1);
        }

        if container.awaits_restart() {
            if self.restart_due(container) {
                launches.push(self.claim_launch(handle, container, LaunchReason::Restart));
            }
        } else if container.is_running() {
            if let Some(probe) = container.liveness_due().cloned() {
                container.last_probe_at = Some(container.status.uptime);
                checks.push(LivenessCheck {
                    handle,
                    token: container.token,
                    image: container.image.clone(),
                    probe,
                });
            }
        }
    }

    /// Restart with backoff: after `n` restarts the next attempt waits until
    /// uptime exceeds `min(n, cap)^2` seconds.
    fn restart_due(&self, container: &Container) -> bool {
        let restarts = container.status.restart_count;
        let delay_factor = restarts.min(self.config.backoff_cap);
        restarts == 0 || container.status.uptime > delay_factor.saturating_mul(delay_factor)
    }

    /// Apply a liveness result. Returns the restart to perform once the
    /// failure threshold is reached.
    fn record_liveness(&self, check: &LivenessCheck, healthy: bool) -> Option<Launch> {
        let mut table = self.table.lock();
        let container = table.get_mut(check.handle).ok()?;
        if container.token != check.token || !container.is_running() {
            return None;
        }
        if healthy {
            container.status.liveness_failures = 0;
            return None;
        }

        container.status.liveness_failures += 1;
        tracing::warn!(
            container = %container.name(),
            failures = container.status.liveness_failures,
            threshold = check.probe.failure_threshold,
            "Liveness probe failed"
        );
        if container.status.liveness_failures < check.probe.failure_threshold {
            return None;
        }

        tracing::warn!(
            container = %container.name(),
            "Restarting container after liveness failures"
        );
        container.mark_terminated();
        Some(self.claim_launch(check.handle, container, LaunchReason::Restart))
    }

    /// Lazily detect a running container whose application went away
    fn check_health(&self, container: &mut Container) {
        if !container.is_running() {
            return;
        }
        if !launcher::is_alive(self.launcher.as_ref(), &container.image) {
            container.mark_terminated();
            tracing::warn!(container = %container.name(), "Container application exited");
        }
    }

    fn issue_token(&self) -> u64 {
        self.tokens.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn claim_launch(
        &self,
        handle: ContainerHandle,
        container: &mut Container,
        reason: LaunchReason,
    ) -> Launch {
        container.token = self.issue_token();
        container.starting = true;
        Launch {
            handle,
            token: container.token,
            image: container.image.clone(),
            args: container.config.args.clone(),
            reason,
        }
    }

    /// Invalidate any launch or liveness check in flight for the container
    fn revoke(&self, container: &mut Container) {
        container.token = self.issue_token();
        container.starting = false;
    }

    fn run_launch(&self, launch: Launch) -> Result<()> {
        let started = self.launcher.start(&launch.image, launch.args.as_deref());
        self.finish_launch(&launch, started)
    }

    fn finish_launch(&self, launch: &Launch, started: bool) -> Result<()> {
        let mut table = self.table.lock();
        let current = match table.get(launch.handle) {
            Ok(c) if c.starting && c.token == launch.token => None,
            Ok(c) => Some(c.state().to_string()),
            Err(_) => Some("removed".to_string()),
        };
        if let Some(current) = current {
            drop(table);
            if started {
                self.launcher.stop(&launch.image, true);
            }
            tracing::warn!(
                slot = launch.handle.slot(),
                image = %launch.image,
                "Container was stopped while starting"
            );
            return Err(Error::InvalidState {
                current,
                expected: "Starting".into(),
            });
        }

        let container = table.get_mut(launch.handle)?;
        container.starting = false;
        match launch.reason {
            LaunchReason::Start if started => {
                container.mark_running();
                tracing::info!(
                    container = %container.name(),
                    image = %launch.image,
                    "Container started"
                );
                Ok(())
            }
            LaunchReason::Start => {
                tracing::error!(
                    container = %container.name(),
                    image = %launch.image,
                    "Failed to start container"
                );
                Err(Error::LaunchFailed(launch.image.to_string()))
            }
            LaunchReason::Restart => {
                container.status.restart_count += 1;
                container.status.liveness_failures = 0;
                if started {
                    container.mark_running();
                    tracing::info!(
                        container = %container.name(),
                        restart_count = container.status.restart_count,
                        "Container restarted"
                    );
                } else {
                    // Backoff is measured from the last attempt
                    container.status.uptime = 0;
                    tracing::warn!(
                        container = %container.name(),
                        restart_count = container.status.restart_count,
                        "Container restart failed"
                    );
                }
                Ok(())
            }
        }
    }

    /// Stop the scheduler and force-stop every live container
    pub fn shutdown(&self) {
        if let Some(task) = self.scheduler.lock().take() {
            task.abort();
            tracing::info!("Container scheduler stopped");
        }

        let live: Vec<Image> = {
            let mut table = self.table.lock();
            let mut live = Vec::new();
            for container in table.slots.iter_mut().flatten() {
                if matches!(container.state(), ContainerState::Running | ContainerState::Paused) {
                    live.push(container.image.clone());
                }
                if container.state() != ContainerState::Terminated {
                    container.mark_terminated();
                }
                container.stopped_by_request = true;
                self.revoke(container);
            }
            live
        };

        for image in &live {
            self.launcher.stop(image, true);
        }
    }
}

impl Drop for ContainerRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
