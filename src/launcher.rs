//! Process launcher seam
//!
//! The runtime never starts applications itself. It asks a [`ProcessLauncher`]
//! to start, stop and query the application behind each container.

use std::collections::HashMap;
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use crate::config::ProbeKind;
use crate::container::Image;

/// How long a graceful stop waits for the process before killing it
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Longest a command health check may run before it counts as failed
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Starts, stops and queries application images
#[cfg_attr(test, mockall::automock)]
pub trait ProcessLauncher: Send + Sync {
    /// Start an image, returning whether the launch succeeded
    fn start<'a>(&self, image: &Image, args: Option<&'a str>) -> bool;

    /// Ask the image to stop; `force` requests an immediate kill
    fn stop(&self, image: &Image, force: bool);

    /// Whether an external image is currently running
    fn is_app_running(&self, image: &Image) -> bool;

    /// Whether any built-in application holds the exclusive launcher lock
    fn is_locked(&self) -> bool;

    /// Evaluate a liveness probe against a running image
    fn probe(&self, image: &Image, kind: &ProbeKind) -> bool;
}

/// Best available liveness signal for an image.
///
/// Built-in applications are not tracked individually, so the exclusive
/// lock is the only signal for them.
pub fn is_alive(launcher: &dyn ProcessLauncher, image: &Image) -> bool {
    match image {
        Image::External(_) => launcher.is_app_running(image),
        Image::BuiltIn(_) => launcher.is_locked(),
    }
}

/// Launcher that runs images as host processes
///
/// External images are executed by path, built-in images by program name.
/// A graceful stop sends SIGTERM and waits up to the grace period before
/// killing; on platforms without signals every stop is a kill. Stopped
/// processes are always reaped.
pub struct HostLauncher {
    children: Mutex<HashMap<Image, Child>>,
    grace_period: Duration,
    check_timeout: Duration,
}

impl Default for HostLauncher {
    fn default() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            grace_period: STOP_GRACE_PERIOD,
            check_timeout: CHECK_TIMEOUT,
        }
    }
}

impl HostLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeouts(grace_period: Duration, check_timeout: Duration) -> Self {
        Self {
            grace_period,
            check_timeout,
            ..Self::default()
        }
    }

    fn command_for(image: &Image, args: Option<&str>) -> Command {
        let mut command = match image {
            Image::External(path) => Command::new(path),
            Image::BuiltIn(name) => Command::new(name),
        };
        if let Some(args) = args {
            command.args(args.split_whitespace());
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }

    fn child_alive(child: &mut Child) -> bool {
        matches!(child.try_wait(), Ok(None))
    }

    /// Poll until the child exits or `timeout` passes
    fn wait_for(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    #[cfg(unix)]
    fn terminate(child: &Child) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Ok(pid) = i32::try_from(child.id()) else {
            return false;
        };
        kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok()
    }

    #[cfg(not(unix))]
    fn terminate(_child: &Child) -> bool {
        false
    }

    /// Kill the child and wait for it so no zombie is left behind
    fn kill_and_reap(image: &Image, child: &mut Child) -> Option<ExitStatus> {
        if let Err(e) = child.kill() {
            tracing::debug!(image = %image, error = %e, "Kill failed, process already gone");
        }
        match child.wait() {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!(image = %image, error = %e, "Failed to reap process");
                None
            }
        }
    }

    fn stop_gracefully(&self, image: &Image, child: &mut Child) -> Option<ExitStatus> {
        if !Self::terminate(child) {
            return None;
        }
        match Self::wait_for(child, self.grace_period) {
            Ok(Some(status)) => Some(status),
            Ok(None) => {
                tracing::warn!(
                    image = %image,
                    grace_ms = self.grace_period.as_millis() as u64,
                    "Image ignored termination, killing"
                );
                None
            }
            Err(e) => {
                tracing::warn!(image = %image, error = %e, "Failed to wait for image");
                None
            }
        }
    }

    fn run_check(&self, image: &Image, command: &str) -> bool {
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return false;
        };
        let spawned = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(image = %image, command, error = %e, "Health check did not start");
                return false;
            }
        };

        match Self::wait_for(&mut child, self.check_timeout) {
            Ok(Some(status)) => status.success(),
            Ok(None) => {
                tracing::warn!(
                    image = %image,
                    command,
                    timeout_ms = self.check_timeout.as_millis() as u64,
                    "Health check timed out"
                );
                Self::kill_and_reap(image, &mut child);
                false
            }
            Err(e) => {
                tracing::warn!(image = %image, command, error = %e, "Health check failed");
                Self::kill_and_reap(image, &mut child);
                false
            }
        }
    }
}

impl ProcessLauncher for HostLauncher {
    fn start(&self, image: &Image, args: Option<&str>) -> bool {
        let mut children = self.children.lock();
        if let Some(child) = children.get_mut(image) {
            if Self::child_alive(child) {
                tracing::warn!(image = %image, "Image already running");
                return false;
            }
        }

        match Self::command_for(image, args).spawn() {
            Ok(child) => {
                tracing::info!(image = %image, pid = child.id(), "Image started");
                if let Some(mut previous) = children.insert(image.clone(), child) {
                    // Exited already; collect its status
                    if let Err(e) = previous.wait() {
                        tracing::warn!(image = %image, error = %e, "Failed to reap process");
                    }
                }
                true
            }
            Err(e) => {
                tracing::error!(image = %image, error = %e, "Failed to start image");
                false
            }
        }
    }

    fn stop(&self, image: &Image, force: bool) {
        let Some(mut child) = self.children.lock().remove(image) else {
            return;
        };

        let status = if force {
            None
        } else {
            self.stop_gracefully(image, &mut child)
        };
        let status = status.or_else(|| Self::kill_and_reap(image, &mut child));
        tracing::info!(image = %image, force, status = ?status, "Image stopped");
    }

    fn is_app_running(&self, image: &Image) -> bool {
        self.children
            .lock()
            .get_mut(image)
            .map(Self::child_alive)
            .unwrap_or(false)
    }

    fn is_locked(&self) -> bool {
        self.children
            .lock()
            .iter_mut()
            .any(|(image, child)| !image.is_external() && Self::child_alive(child))
    }

    fn probe(&self, image: &Image, kind: &ProbeKind) -> bool {
        match kind {
            ProbeKind::Process => is_alive(self, image),
            ProbeKind::Command(command) => self.run_check(image, command),
        }
    }
}
