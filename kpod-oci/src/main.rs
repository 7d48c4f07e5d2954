use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kpod_oci::spec::Spec;
use kpod_oci::{CgroupManager, Container, ContainerConfig, Runtime, RuntimeConfig, WorkloadTrust};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kpod-oci")]
#[command(about = "Drive a single container through the OCI lifecycle", long_about = None)]
struct Cli {
    /// Trusted OCI runtime binary
    #[arg(long, default_value = "/usr/bin/runc")]
    runtime: PathBuf,

    /// Runtime binary for untrusted workloads
    #[arg(long)]
    runtime_untrusted: Option<PathBuf>,

    /// Default workload trust (anything but "trusted" means untrusted)
    #[arg(long, default_value = "trusted")]
    default_workload_trust: String,

    /// Monitor binary
    #[arg(long, default_value = "/usr/libexec/crio/conmon")]
    monitor: PathBuf,

    /// Extra KEY=VALUE environment for the monitor (repeatable)
    #[arg(long = "monitor-env")]
    monitor_env: Vec<String>,

    /// Cgroup manager: cgroupfs or systemd
    #[arg(long, default_value = "cgroupfs")]
    cgroup_manager: CgroupManager,

    /// Mount point of the cgroup hierarchy
    #[arg(long, default_value = "/sys/fs/cgroup")]
    cgroup_root: PathBuf,

    /// Directory for exit notification files
    #[arg(long, default_value = kpod_oci::config::CONTAINER_EXITS_DIR)]
    exits_dir: PathBuf,

    /// Directory for attach sockets
    #[arg(long, default_value = kpod_oci::config::CONTAINER_ATTACH_SOCKET_DIR)]
    attach_socket_dir: PathBuf,

    /// Maximum container log size in bytes (negative = unlimited)
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    log_size_max: i64,

    /// Do not use pivot_root
    #[arg(long)]
    no_pivot: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ContainerArgs {
    /// Container ID
    id: String,

    /// Bundle directory containing config.json
    #[arg(short, long, default_value = ".")]
    bundle: PathBuf,

    /// State directory (default: the bundle)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Container log file (default: <bundle>/container.log)
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Cgroup parent (slice name with systemd)
    #[arg(long, default_value = "")]
    cgroup_parent: String,

    /// Allocate a terminal
    #[arg(short, long)]
    terminal: bool,

    /// Keep stdin open
    #[arg(short = 'i', long)]
    stdin: bool,

    /// Mark the container untrusted
    #[arg(long)]
    untrusted: bool,

    #[arg(long)]
    privileged: bool,

    /// Stop signal, e.g. SIGQUIT or 3
    #[arg(long, default_value = "")]
    stop_signal: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a container through the monitor
    Create(ContainerArgs),

    /// Start a created container
    Start(ContainerArgs),

    /// Stop a container (Ctrl-C abandons the graceful wait)
    Stop {
        #[command(flatten)]
        container: ContainerArgs,

        /// Seconds to wait after the stop signal before killing (0 = kill now)
        #[arg(long, default_value = "10")]
        timeout: i64,
    },

    /// Run a command in a container and wait for it
    Exec {
        #[command(flatten)]
        container: ContainerArgs,

        /// Timeout in seconds (0 = none)
        #[arg(long, default_value = "0")]
        timeout: i64,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Refresh and print the container state
    State(ContainerArgs),

    /// Pause a container
    Pause(ContainerArgs),

    /// Resume a paused container
    Resume(ContainerArgs),

    /// Delete a container and release its monitor cgroup
    Delete(ContainerArgs),

    /// Print the runtime name and version
    Version,
}

impl Cli {
    fn runtime_config(&self) -> RuntimeConfig {
        let defaults = RuntimeConfig::default();
        RuntimeConfig {
            runtime_path: self.runtime.clone(),
            runtime_untrusted_path: self.runtime_untrusted.clone(),
            default_workload_trust: WorkloadTrust::from(self.default_workload_trust.as_str()),
            monitor_path: self.monitor.clone(),
            monitor_env: if self.monitor_env.is_empty() {
                defaults.monitor_env
            } else {
                self.monitor_env.clone()
            },
            cgroup_manager: self.cgroup_manager,
            exits_dir: self.exits_dir.clone(),
            attach_socket_dir: self.attach_socket_dir.clone(),
            log_size_max: self.log_size_max,
            no_pivot: self.no_pivot,
            cgroup_root: self.cgroup_root.clone(),
            ..defaults
        }
    }
}

async fn load_container(args: &ContainerArgs) -> Result<Container> {
    let spec = if args.bundle.join("config.json").exists() {
        Spec::load(&args.bundle)
            .await
            .with_context(|| format!("failed to load {}/config.json", args.bundle.display()))?
    } else {
        Spec::default()
    };
    let dir = args.dir.clone().unwrap_or_else(|| args.bundle.clone());
    tokio::fs::create_dir_all(&dir).await?;

    Ok(Container::new(ContainerConfig {
        id: args.id.clone(),
        name: args.id.clone(),
        log_path: args
            .log_path
            .clone()
            .unwrap_or_else(|| args.bundle.join("container.log")),
        bundle_path: args.bundle.clone(),
        dir,
        terminal: args.terminal,
        stdin: args.stdin,
        trusted: !args.untrusted,
        privileged: args.privileged,
        stop_signal: args.stop_signal.clone(),
        spec,
        ..Default::default()
    }))
}

/// Load the container and its persisted state, if any.
async fn open(runtime: &Runtime, args: &ContainerArgs) -> Result<Container> {
    let container = load_container(args).await?;
    if container.state_path().exists() {
        runtime.state_from_disk(&container).await?;
    } else {
        debug!(container_id = %args.id, "No saved state");
    }
    Ok(container)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kpod_oci=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = Runtime::new(cli.runtime_config())?;

    match &cli.command {
        Commands::Create(args) => {
            let container = load_container(args).await?;
            runtime.create_container(&container, &args.cgroup_parent).await?;
            container.to_disk().await?;
        }
        Commands::Start(args) => {
            let container = open(&runtime, args).await?;
            if let Err(e) = runtime.start_container(&container).await {
                runtime.set_start_failed(&container, &e).await;
                container.to_disk().await?;
                return Err(e.into());
            }
            runtime.state_to_disk(&container).await?;
        }
        Commands::Stop { container: args, timeout } => {
            let container = open(&runtime, args).await?;
            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, abandoning stop");
                    on_ctrl_c.cancel();
                }
            });
            runtime.stop_container(&container, *timeout, &cancel).await?;
            runtime.state_to_disk(&container).await?;
        }
        Commands::Exec {
            container: args,
            timeout,
            command,
        } => {
            let container = open(&runtime, args).await?;
            let resp = runtime.exec_sync(&container, command, *timeout).await?;
            std::io::stdout().write_all(&resp.stdout)?;
            std::io::stderr().write_all(&resp.stderr)?;
            if resp.exit_code != 0 {
                std::process::exit(resp.exit_code);
            }
        }
        Commands::State(args) => {
            let container = open(&runtime, args).await?;
            runtime.update_status(&container).await?;
            container.to_disk().await?;
            let state = runtime.container_status(&container).await;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Pause(args) => {
            let container = open(&runtime, args).await?;
            runtime.pause_container(&container).await?;
            runtime.state_to_disk(&container).await?;
        }
        Commands::Resume(args) => {
            let container = open(&runtime, args).await?;
            runtime.unpause_container(&container).await?;
            runtime.state_to_disk(&container).await?;
        }
        Commands::Delete(args) => {
            let container = open(&runtime, args).await?;
            runtime.delete_container(&container).await?;
            if let Err(e) = runtime
                .release_monitor_cgroup(&container, &args.cgroup_parent)
                .await
            {
                warn!(container_id = %args.id, error = %e, "Failed to release monitor cgroup");
            }
            match tokio::fs::remove_file(container.state_path()).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            info!(container_id = %args.id, "Container deleted");
        }
        Commands::Version => {
            let version = runtime.version().await?;
            println!("{} {}", runtime.name(), version);
        }
    }

    Ok(())
}
