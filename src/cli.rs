//! `kubectl`-style command shell
//!
//! Each line is a verb followed by its arguments, optionally prefixed with
//! `kubectl`. Output goes to any [`Write`] so the shell can serve a terminal
//! or a test buffer alike.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use crate::config::{ContainerConfig, ResourceLimits};
use crate::container::Image;
use crate::manifest::PodManifest;
use crate::runtime::CAPACITY;
use crate::system::Containerization;

/// Limits for containers started from the shell
pub const SHELL_START_LIMITS: ResourceLimits = ResourceLimits::new(4 * 1024, 5, 1);

const CRITICAL_FREE_BYTES: u64 = 4096;
const WARNING_FREE_BYTES: u64 = 8192;

type Handler = fn(&Shell, &str, &mut dyn Write) -> io::Result<()>;

/// Entry of the command table
#[derive(Clone, Copy)]
pub struct Command {
    pub usage: &'static str,
    pub description: &'static str,
    handler: Handler,
}

pub struct Shell {
    ctx: Arc<Containerization>,
    commands: BTreeMap<&'static str, Command>,
}

impl Shell {
    pub fn new(ctx: Arc<Containerization>) -> Self {
        let mut commands = BTreeMap::new();
        let mut add = |name: &'static str,
                       usage: &'static str,
                       description: &'static str,
                       handler: Handler| {
            commands.insert(
                name,
                Command {
                    usage,
                    description,
                    handler,
                },
            );
        };
        add("help", "kubectl help", "Show this help", Shell::help);
        add("start", "kubectl start <name> <image> [args]", "Start container", Shell::start);
        add("stop", "kubectl stop <name>", "Stop container", Shell::stop);
        add("list", "kubectl list", "List containers", Shell::list);
        add("apply", "kubectl apply <manifest>", "Apply manifest", Shell::apply);
        add("health", "kubectl health", "Check container runtime health", Shell::health);
        add("debug", "kubectl debug <name>", "Debug container", Shell::debug);

        Self { ctx, commands }
    }

    pub fn commands(&self) -> impl Iterator<Item = (&'static str, &Command)> {
        self.commands.iter().map(|(name, command)| (*name, command))
    }

    /// Run one command line
    pub fn execute(&self, line: &str, out: &mut dyn Write) -> io::Result<()> {
        let line = line.trim();
        let line = match line.strip_prefix("kubectl") {
            Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
                rest.trim_start()
            }
            _ => line,
        };

        let (verb, args) = split_word(line);
        if verb.is_empty() {
            return self.help("", out);
        }

        match self.commands.get(verb) {
            Some(command) => (command.handler)(self, args, out),
            None => {
                writeln!(out, "Unknown command: {}", verb)?;
                self.help("", out)
            }
        }
    }

    fn usage(&self, verb: &str, out: &mut dyn Write) -> io::Result<()> {
        if let Some(command) = self.commands.get(verb) {
            writeln!(out, "Usage: {}", command.usage)?;
        }
        Ok(())
    }

    fn help(&self, _args: &str, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Kubernetes-inspired Container Management")?;
        writeln!(out, "Usage:")?;
        for command in self.commands.values() {
            writeln!(out, "  {} - {}", command.usage, command.description)?;
        }
        Ok(())
    }

    fn start(&self, args: &str, out: &mut dyn Write) -> io::Result<()> {
        let (name, rest) = split_word(args);
        let (image, extra) = split_word(rest);
        if name.is_empty() || image.is_empty() {
            self.usage("start", out)?;
            return writeln!(out, "Example: kubectl start myapp /ext/apps/Games/snake_game.fap");
        }

        let runtime = self.ctx.runtime();
        if runtime.find_by_name(name).is_some() {
            return writeln!(out, "Container '{}' already exists", name);
        }
        if let Some(path) = Image::parse(image).path() {
            if !runtime.store().file_exists(path) {
                return writeln!(out, "FAP file not found: {}", image);
            }
        }

        let mut builder = ContainerConfig::builder()
            .name(name)
            .image(image)
            .resource_limits(SHELL_START_LIMITS)
            .restart_on_crash(true);
        if !extra.is_empty() {
            builder = builder.args(extra);
        }

        let handle = match runtime.create(builder.build()) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::debug!(error = %e, "Shell create failed");
                return writeln!(out, "Failed to create container '{}'", name);
            }
        };
        match runtime.start_container(handle) {
            Ok(()) => writeln!(out, "Container '{}' started successfully", name),
            Err(_) => writeln!(out, "Failed to start container '{}'", name),
        }
    }

    fn stop(&self, args: &str, out: &mut dyn Write) -> io::Result<()> {
        let name = args.trim();
        if name.is_empty() {
            return self.usage("stop", out);
        }

        let runtime = self.ctx.runtime();
        let Some(handle) = runtime.find_by_name(name) else {
            return writeln!(out, "Container '{}' not found", name);
        };
        writeln!(out, "Stopping container '{}'...", name)?;
        if let Err(e) = runtime.stop_container(handle, false) {
            tracing::warn!(container = name, error = %e, "Stop failed");
        }
        writeln!(out, "Container stopped")
    }

    fn list(&self, _args: &str, out: &mut dyn Write) -> io::Result<()> {
        let count = self.ctx.runtime().get_count();
        writeln!(out, "CONTAINERS: {}/{}", count, CAPACITY)?;
        if count == 0 {
            return writeln!(out, "No containers running");
        }
        writeln!(out, "{} container(s) running", count)?;
        writeln!(out, "Use kubectl health for status")
    }

    fn apply(&self, args: &str, out: &mut dyn Write) -> io::Result<()> {
        let (path, _) = split_word(args);
        if path.is_empty() {
            return self.usage("apply", out);
        }

        let runtime = self.ctx.runtime();
        let store = runtime.store();
        if !store.file_exists(Path::new(path)) {
            return writeln!(out, "Manifest not found: {}", path);
        }

        writeln!(out, "Loading manifest...")?;
        let manifest = match PodManifest::load_from_file(store.as_ref(), path) {
            Ok(manifest) => manifest,
            Err(_) => return writeln!(out, "Failed to load manifest"),
        };

        writeln!(out, "Validating...")?;
        match manifest.instantiate(runtime) {
            Ok(handles) => {
                writeln!(out, "Applied manifest: {}", path)?;
                writeln!(out, "Created {} container(s)", handles.len())
            }
            Err(_) => writeln!(out, "Failed: verify FAP files exist"),
        }
    }

    fn health(&self, _args: &str, out: &mut dyn Write) -> io::Result<()> {
        let count = self.ctx.runtime().get_count();
        let memory = self.ctx.memory();
        let total = memory.total_heap();
        let free = memory.free_heap();
        let used = memory.used_heap();

        writeln!(out, "Containers: {}/{}", count, CAPACITY)?;
        writeln!(
            out,
            "Memory: {} KB used, {} KB free (total: {} KB)",
            used / 1024,
            free / 1024,
            total / 1024
        )?;
        writeln!(out, "Largest block: {} KB", memory.max_free_block() / 1024)?;

        let status = if count >= CAPACITY {
            "MAX CONTAINERS REACHED"
        } else if free < CRITICAL_FREE_BYTES {
            "CRITICAL - Low memory"
        } else if free < WARNING_FREE_BYTES {
            "WARNING - Memory pressure"
        } else {
            "OK - Healthy"
        };
        writeln!(out, "Status: {}", status)?;

        if count > 0 {
            writeln!(out)?;
            writeln!(out, "Use 'kubectl list' for container details")?;
        }
        Ok(())
    }

    fn debug(&self, args: &str, out: &mut dyn Write) -> io::Result<()> {
        let name = args.trim();
        if name.is_empty() {
            return self.usage("debug", out);
        }

        let runtime = self.ctx.runtime();
        let info = match runtime.find_by_name(name).map(|handle| {
            runtime
                .get_status(handle)
                .and_then(|_| runtime.info(handle))
        }) {
            Some(Ok(info)) => info,
            _ => return writeln!(out, "Container '{}' not found", name),
        };

        let limits = info.config.resource_limits;
        writeln!(out, "Container Debug: {}", info.config.name)?;
        writeln!(out, "-------------------")?;
        writeln!(out, "Image: {}", info.config.image)?;
        writeln!(out, "State: {}", info.status.state)?;
        writeln!(out, "Uptime: {}s", info.status.uptime)?;
        writeln!(out, "Restarts: {}", info.status.restart_count)?;
        writeln!(out, "Memory limit: {} bytes", limits.max_memory)?;
        writeln!(out, "CPU share: {}%", limits.cpu_time_share)?;
        writeln!(out, "Max threads: {}", limits.max_threads)?;
        writeln!(out, "Restart policy: {}", yes_no(info.config.restart_on_crash))?;
        writeln!(out, "System privileges: {}", yes_no(info.config.system_container))
    }
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (input, ""),
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}
