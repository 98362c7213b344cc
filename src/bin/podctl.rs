//! podctl - container shell for the MCU Kube runtime

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use clap::{Parser, Subcommand};
use mcu_kube::cli::Shell;
use mcu_kube::system::DEFAULT_HEAP_BYTES;
use mcu_kube::{
    Containerization, ContainerRuntime, FileStore, FixedHeap, HostLauncher, LocalFileStore,
    PodManifest, Result, RuntimeConfig, ServiceRegistry,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "podctl")]
#[command(about = "Kubernetes-inspired container management for constrained devices")]
#[command(version)]
struct Cli {
    /// Runtime config (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory that device paths such as /ext/apps resolve against
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Heap budget in KB used for memory reporting
    #[arg(long, global = true, default_value_t = DEFAULT_HEAP_BYTES / 1024)]
    heap_kb: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read kubectl commands from stdin while the scheduler runs
    Shell {
        /// Skip starting the system manifest
        #[arg(long)]
        no_system: bool,
    },
    /// Check a pod manifest without starting anything
    Validate {
        /// Manifest path
        manifest: PathBuf,
    },
    /// Print the one-line stats summary
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mcu_kube=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_json_file(path)?,
        None => RuntimeConfig::default(),
    };
    let store: Arc<dyn FileStore> = match &cli.root {
        Some(root) => Arc::new(LocalFileStore::rooted(root)),
        None => Arc::new(LocalFileStore::new()),
    };

    match cli.command.unwrap_or(Commands::Shell { no_system: false }) {
        Commands::Shell { no_system } => {
            let ctx = build_context(config, store, cli.heap_kb)?;
            cmd_shell(ctx, !no_system).await?;
        }
        Commands::Validate { manifest } => {
            cmd_validate(store.as_ref(), &manifest)?;
        }
        Commands::Stats => {
            let ctx = build_context(config, store, cli.heap_kb)?;
            println!("{}", ctx.stats_string());
        }
    }

    Ok(())
}

fn build_context(
    config: RuntimeConfig,
    store: Arc<dyn FileStore>,
    heap_kb: u64,
) -> Result<Arc<Containerization>> {
    let runtime = Arc::new(ContainerRuntime::with_config(
        config,
        Arc::new(HostLauncher::new()),
        store,
    )?);
    let heap = Arc::new(FixedHeap::new(heap_kb * 1024, runtime.clone()));
    Ok(Arc::new(Containerization::with_memory(
        runtime,
        Arc::new(ServiceRegistry::new()),
        heap,
    )))
}

async fn cmd_shell(ctx: Arc<Containerization>, system: bool) -> Result<()> {
    ctx.init()?;
    if system {
        if let Err(e) = ctx.start_system_containers() {
            eprintln!("System containers failed: {}", e);
        }
    }
    ctx.runtime().start()?;

    let shell = Shell::new(ctx.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    prompt()?;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "exit" || line == "quit" {
            break;
        }
        if !line.is_empty() {
            let mut stdout = std::io::stdout().lock();
            shell.execute(line, &mut stdout)?;
        }
        prompt()?;
    }

    println!("{}", ctx.stats_string());
    ctx.runtime().shutdown();
    Ok(())
}

fn prompt() -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    write!(stdout, ">: ")?;
    stdout.flush()?;
    Ok(())
}

fn cmd_validate(store: &dyn FileStore, path: &Path) -> Result<()> {
    println!("Validating manifest '{}'...", path.display());

    let manifest = PodManifest::load_from_file(store, path)?;
    manifest.validate(store)?;

    println!("Pod: {}/{}", manifest.namespace(), manifest.name());
    println!("{:<16} {:<40} {:>8} {:>5} {:>8}", "NAME", "IMAGE", "MEMORY", "CPU", "THREADS");
    println!("{}", "-".repeat(81));
    for spec in manifest.containers() {
        println!(
            "{:<16} {:<40} {:>8} {:>4}% {:>8}",
            spec.name,
            spec.image,
            spec.resources.max_memory,
            spec.resources.cpu_time_share,
            spec.resources.max_threads
        );
    }
    println!("Manifest is valid");
    Ok(())
}
