//! The runtime supervisor.
//!
//! [`Runtime`] holds configuration only. Every operation that touches a
//! container's state takes that container's op lock for its duration, so
//! one `Runtime` can be shared between tasks working on different
//! containers.

mod create;
mod exec;
mod status;
mod stop;

use std::fmt::Display;
use std::path::Path;
use std::process::Output;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::cgroup::{self, MonitorCgroup};
use crate::config::{CgroupManager, RuntimeConfig, WorkloadTrust};
use crate::container::Container;
use crate::error::{Error, Result};
use crate::process::{CommandSpec, ProcessLauncher, StdioMode, SystemLauncher};
use crate::state::{ContainerState, ContainerStatus};

pub use exec::{ExecSyncResponse, parse_log};

/// Supervisor for containers run through an OCI runtime and a monitor.
#[derive(Debug, Clone)]
pub struct Runtime {
    config: RuntimeConfig,
    launcher: Arc<dyn ProcessLauncher>,
}

impl Runtime {
    /// Runtime that launches real processes.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_launcher(config, Arc::new(SystemLauncher))
    }

    /// Runtime that launches processes through `launcher`.
    pub fn with_launcher(config: RuntimeConfig, launcher: Arc<dyn ProcessLauncher>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, launcher })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// File name of the trusted runtime binary.
    pub fn name(&self) -> String {
        self.config
            .runtime_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Version reported by the trusted runtime binary.
    pub async fn version(&self) -> Result<String> {
        let cmd = CommandSpec::new(&self.config.runtime_path)
            .arg("-v")
            .captured();
        let output = self
            .launcher
            .output(cmd)
            .await
            .map_err(|source| Error::Spawn {
                id: String::new(),
                program: self.config.runtime_path.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(command_failed("", "-v", &output));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().last())
            .unwrap_or_default();
        Ok(version.to_string())
    }

    /// Select the runtime binary for a container.
    ///
    /// An untrusted container gets the untrusted runtime unless it is
    /// privileged. A trusted container gets the trusted runtime when the
    /// default trust is `trusted`, when it is privileged, or when no
    /// untrusted runtime is configured.
    pub fn path(&self, container: &Container) -> &Path {
        let trusted = self.config.runtime_path.as_path();
        let untrusted = self.config.runtime_untrusted_path.as_deref();

        if !container.trusted() {
            if container.privileged() {
                warn!(
                    container_id = %container.id(),
                    "Privileged container is untrusted, running it with the trusted runtime"
                );
                return trusted;
            }
            return untrusted.unwrap_or(trusted);
        }

        if self.config.default_workload_trust == WorkloadTrust::Trusted || container.privileged() {
            return trusted;
        }
        untrusted.unwrap_or(trusted)
    }

    /// Start a created container.
    pub async fn start_container(&self, container: &Container) -> Result<()> {
        let mut state = container.lock().await;
        info!(container_id = %container.id(), "Starting container");
        self.run_runtime(container, &["start", container.id()], StdioMode::Inherit)
            .await?;
        state.started = Some(Utc::now());
        Ok(())
    }

    pub async fn pause_container(&self, container: &Container) -> Result<()> {
        let _state = container.lock().await;
        info!(container_id = %container.id(), "Pausing container");
        self.run_runtime(container, &["pause", container.id()], StdioMode::Piped)
            .await?;
        Ok(())
    }

    pub async fn unpause_container(&self, container: &Container) -> Result<()> {
        let _state = container.lock().await;
        info!(container_id = %container.id(), "Resuming container");
        self.run_runtime(container, &["resume", container.id()], StdioMode::Piped)
            .await?;
        Ok(())
    }

    /// Remove the container from the runtime, killing it if needed.
    pub async fn delete_container(&self, container: &Container) -> Result<()> {
        let _state = container.lock().await;
        info!(container_id = %container.id(), "Deleting container");
        self.run_runtime(
            container,
            &["delete", "--force", container.id()],
            StdioMode::Piped,
        )
        .await?;
        Ok(())
    }

    /// Record that the container failed to start.
    pub async fn set_start_failed(&self, container: &Container, err: &dyn Display) {
        let mut state = container.lock().await;
        state.started = Some(state.created);
        state.finished = Some(state.created);
        state.status = ContainerStatus::Stopped;
        state.error = err.to_string();
        error!(container_id = %container.id(), error = %state.error, "Container failed to start");
    }

    /// Lock-guarded snapshot of the container state.
    pub async fn container_status(&self, container: &Container) -> ContainerState {
        container.state().await
    }

    pub fn runtime_ready(&self) -> bool {
        true
    }

    pub fn network_ready(&self) -> bool {
        true
    }

    /// Refresh the state from the runtime and persist it.
    pub async fn state_to_disk(&self, container: &Container) -> Result<()> {
        if let Err(e) = self.update_status(container).await {
            warn!(container_id = %container.id(), error = %e, "Failed to refresh status before saving");
        }
        container.to_disk().await
    }

    /// Load persisted state and refresh it from the runtime.
    pub async fn state_from_disk(&self, container: &Container) -> Result<()> {
        container.from_disk().await?;
        if let Err(e) = self.update_status(container).await {
            warn!(container_id = %container.id(), error = %e, "Failed to refresh status after loading");
        }
        Ok(())
    }

    /// Where the monitor of `container` was placed for `cgroup_parent`.
    pub async fn monitor_cgroup(&self, container: &Container, cgroup_parent: &str) -> Result<MonitorCgroup> {
        Ok(match self.config.cgroup_manager {
            CgroupManager::Systemd => MonitorCgroup::Scope {
                unit: cgroup::scope_unit(container.id()),
                slice: cgroup_parent.to_string(),
            },
            CgroupManager::Cgroupfs => MonitorCgroup::Paths(cgroup::cgroupfs_paths(
                &self.config.cgroup_root,
                cgroup_parent,
                container.id(),
            )
            .await?),
        })
    }

    /// Remove the cgroup the monitor was placed in at create time.
    ///
    /// Call after the container is deleted and its monitor has exited.
    pub async fn release_monitor_cgroup(&self, container: &Container, cgroup_parent: &str) -> Result<()> {
        let cgroup = self.monitor_cgroup(container, cgroup_parent).await?;
        cgroup::release(self.launcher.as_ref(), container.id(), &cgroup).await
    }

    /// Run a runtime subcommand against the runtime selected for `container`.
    ///
    /// With [`StdioMode::Piped`] stdout and stderr are captured and stderr
    /// ends up in the error; otherwise they go to our own stdio.
    async fn run_runtime(&self, container: &Container, args: &[&str], stdio: StdioMode) -> Result<Output> {
        let program = self.path(container).to_path_buf();
        let mut cmd = CommandSpec::new(&program).args(args.iter().copied());
        cmd = match stdio {
            StdioMode::Piped => cmd.captured(),
            mode => cmd.stdin(mode).stdout(mode).stderr(mode),
        };
        debug!(container_id = %container.id(), cmd = %cmd.display(), "Running runtime command");

        let output = self
            .launcher
            .output(cmd)
            .await
            .map_err(|source| Error::Spawn {
                id: container.id().to_string(),
                program,
                source,
            })?;
        if !output.status.success() {
            return Err(command_failed(container.id(), args.join(" "), &output));
        }
        Ok(output)
    }
}

fn command_failed(id: &str, command: impl Into<String>, output: &Output) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let reason = if stderr.trim().is_empty() {
        output.status.to_string()
    } else {
        format!("{}: {}", output.status, stderr.trim())
    };
    Error::RuntimeCommand {
        id: id.to_string(),
        command: command.into(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerConfig;
    use std::path::PathBuf;

    fn runtime(trust: WorkloadTrust, untrusted: Option<&str>) -> Runtime {
        Runtime::new(RuntimeConfig {
            runtime_path: "/usr/bin/runc".into(),
            runtime_untrusted_path: untrusted.map(PathBuf::from),
            default_workload_trust: trust,
            ..Default::default()
        })
        .unwrap()
    }

    fn container(trusted: bool, privileged: bool) -> Container {
        Container::new(ContainerConfig {
            id: "c1".into(),
            trusted,
            privileged,
            ..Default::default()
        })
    }

    #[test]
    fn path_selection_matrix() {
        const TRUSTED: &str = "/usr/bin/runc";
        const UNTRUSTED: &str = "/usr/bin/kata";

        // (container trusted, privileged, default trust, untrusted configured, expected)
        let cases = [
            (false, true, WorkloadTrust::Trusted, true, TRUSTED),
            (false, true, WorkloadTrust::Trusted, false, TRUSTED),
            (false, true, WorkloadTrust::Untrusted, true, TRUSTED),
            (false, true, WorkloadTrust::Untrusted, false, TRUSTED),
            (false, false, WorkloadTrust::Trusted, true, UNTRUSTED),
            (false, false, WorkloadTrust::Trusted, false, TRUSTED),
            (false, false, WorkloadTrust::Untrusted, true, UNTRUSTED),
            (false, false, WorkloadTrust::Untrusted, false, TRUSTED),
            (true, true, WorkloadTrust::Trusted, true, TRUSTED),
            (true, true, WorkloadTrust::Trusted, false, TRUSTED),
            (true, true, WorkloadTrust::Untrusted, true, TRUSTED),
            (true, true, WorkloadTrust::Untrusted, false, TRUSTED),
            (true, false, WorkloadTrust::Trusted, true, TRUSTED),
            (true, false, WorkloadTrust::Trusted, false, TRUSTED),
            (true, false, WorkloadTrust::Untrusted, true, UNTRUSTED),
            (true, false, WorkloadTrust::Untrusted, false, TRUSTED),
        ];

        for (trusted, privileged, trust, has_untrusted, expected) in cases {
            let rt = runtime(trust, has_untrusted.then_some(UNTRUSTED));
            let c = container(trusted, privileged);
            assert_eq!(
                rt.path(&c),
                Path::new(expected),
                "trusted={trusted} privileged={privileged} trust={trust} untrusted={has_untrusted}"
            );
        }
    }

    #[test]
    fn name_is_binary_file_name() {
        let rt = runtime(WorkloadTrust::Trusted, None);
        assert_eq!(rt.name(), "runc");
    }

    #[tokio::test]
    async fn start_failure_is_recorded() {
        let rt = runtime(WorkloadTrust::Trusted, None);
        let c = container(true, false);
        rt.set_start_failed(&c, &"exec format error").await;

        let state = rt.container_status(&c).await;
        assert_eq!(state.status, ContainerStatus::Stopped);
        assert_eq!(state.started, Some(state.created));
        assert_eq!(state.finished, Some(state.created));
        assert_eq!(state.error, "exec format error");
    }

    #[tokio::test]
    async fn monitor_cgroup_for_systemd() {
        let rt = Runtime::new(RuntimeConfig {
            cgroup_manager: CgroupManager::Systemd,
            ..Default::default()
        })
        .unwrap();
        let c = container(true, false);
        assert_eq!(
            rt.monitor_cgroup(&c, "kubepods.slice").await.unwrap(),
            MonitorCgroup::Scope {
                unit: "kpod-monitor-c1.scope".into(),
                slice: "kubepods.slice".into(),
            }
        );
    }
}
