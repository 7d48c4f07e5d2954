//! Container creation through the monitor.

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::Runtime;
use crate::cgroup;
use crate::config::CgroupManager;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::pipe::{StartPipe, StartSignal, SyncPipe};
use crate::process::{CommandSpec, SpawnedProcess, StdioMode};

/// First message on the sync pipe after a create.
#[derive(Debug, Deserialize)]
struct SyncInfo {
    pid: i32,
    #[serde(default)]
    message: Option<String>,
}

impl Runtime {
    /// Create the container by launching a monitor for it.
    ///
    /// The monitor is placed into the cgroup derived from `cgroup_parent`
    /// before it is allowed to fork the container. Once the monitor is up
    /// any failure removes the half-created container again.
    pub async fn create_container(&self, container: &Container, cgroup_parent: &str) -> Result<()> {
        let id = container.id();
        let pipe_err = |what: &'static str| {
            move |source: std::io::Error| Error::Pipe {
                id: id.to_string(),
                what,
                source,
            }
        };

        let mut sync = SyncPipe::new().map_err(pipe_err("sync pipe"))?;
        let mut start = StartPipe::new().map_err(pipe_err("start pipe"))?;
        let sync_child = sync.take_child().map_err(pipe_err("sync pipe"))?;
        let start_child = start.take_child().map_err(pipe_err("start pipe"))?;

        let args = self.monitor_create_args(container);
        let mut env = self.config.monitor_env.clone();
        env.push("_OCI_SYNCPIPE=3".into());
        env.push("_OCI_STARTPIPE=4".into());

        let cmd = CommandSpec::new(&self.config.monitor_path)
            .args(args)
            .env_exact(env)
            .current_dir(container.bundle_path())
            .inherit_fd(sync_child)
            .inherit_fd(start_child)
            .process_group()
            .stdin(StdioMode::Inherit)
            .stdout(StdioMode::Inherit)
            .stderr(if container.terminal() {
                StdioMode::Piped
            } else {
                StdioMode::Inherit
            });
        debug!(container_id = %id, cmd = %cmd.display(), "Running monitor");

        // Dropping the CommandSpec inside spawn closes our copies of the child ends.
        let monitor = self
            .launcher
            .spawn(cmd)
            .await
            .map_err(|source| Error::Spawn {
                id: id.to_string(),
                program: self.config.monitor_path.clone(),
                source,
            })?;

        if let Some(pid) = monitor.id() {
            if let Err(e) = cgroup::place_monitor(
                self.launcher.as_ref(),
                self.config.cgroup_manager,
                &self.config.cgroup_root,
                cgroup_parent,
                id,
                pid,
            )
            .await
            {
                warn!(
                    container_id = %id,
                    cgroup_manager = %self.config.cgroup_manager,
                    cgroup_parent = %cgroup_parent,
                    error = %e,
                    "Failed to move monitor into sandbox cgroup"
                );
            }
        }

        let result = self.release_monitor(container, start, monitor, sync).await;

        match result {
            Ok(pid) => {
                container.lock().await.pid = pid;
                info!(container_id = %id, pid, "Container created");
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = self.delete_container(container).await {
                    warn!(container_id = %id, error = %cleanup, "Failed to clean up after create failure");
                }
                Err(e)
            }
        }
    }

    /// Let the monitor fork the container and collect the PID it reports.
    async fn release_monitor(
        &self,
        container: &Container,
        start: StartPipe,
        monitor: Box<dyn SpawnedProcess>,
        sync: SyncPipe,
    ) -> Result<i32> {
        let id = container.id();
        start.send(StartSignal).map_err(|source| Error::Pipe {
            id: id.to_string(),
            what: "start pipe",
            source,
        })?;

        let output = monitor.wait().await.map_err(|source| Error::Spawn {
            id: id.to_string(),
            program: self.config.monitor_path.clone(),
            source,
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CreateFailed {
                id: id.to_string(),
                message: format!("monitor exited with {}: {}", output.status, stderr.trim()),
            });
        }

        self.wait_for_pid(container, sync).await
    }

    /// Wait for the monitor to report the container PID.
    async fn wait_for_pid(&self, container: &Container, sync: SyncPipe) -> Result<i32> {
        let id = container.id();
        let timeout = self.config.create_timeout;

        let message = match tokio::time::timeout(timeout, sync.read_message::<SyncInfo>()).await {
            Err(_) => {
                error!(container_id = %id, ?timeout, "Container creation timed out");
                return Err(Error::CreateTimeout {
                    id: id.to_string(),
                    timeout,
                });
            }
            Ok(Err(e)) => {
                return Err(Error::Protocol {
                    id: id.to_string(),
                    reason: format!("error reading container (probably exited) json message: {e}"),
                });
            }
            Ok(Ok(None)) => {
                return Err(Error::Protocol {
                    id: id.to_string(),
                    reason: "sync pipe closed without a pid".into(),
                });
            }
            Ok(Ok(Some(info))) => info,
        };

        debug!(container_id = %id, pid = message.pid, "Received container pid");
        if message.pid == -1 {
            let message = message
                .message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "container create failed".into());
            error!(container_id = %id, %message, "Container creation error");
            return Err(Error::CreateFailed {
                id: id.to_string(),
                message,
            });
        }
        Ok(message.pid)
    }

    fn monitor_create_args(&self, container: &Container) -> Vec<String> {
        let id = container.id().to_string();
        let bundle = container.bundle_path();
        let mut args: Vec<String> = Vec::new();

        if self.config.cgroup_manager == CgroupManager::Systemd {
            args.push("-s".into());
        }
        args.extend([
            "-c".into(),
            id.clone(),
            "-u".into(),
            id,
            "-r".into(),
            self.path(container).display().to_string(),
            "-b".into(),
            bundle.display().to_string(),
            "-p".into(),
            bundle.join("pidfile").display().to_string(),
            "-l".into(),
            container.log_path().display().to_string(),
            "--exit-dir".into(),
            self.config.exits_dir.display().to_string(),
            "--socket-dir-path".into(),
            self.config.attach_socket_dir.display().to_string(),
        ]);
        if self.config.log_size_max >= 0 {
            args.push("--log-size-max".into());
            args.push(self.config.log_size_max.to_string());
        }
        if self.config.no_pivot {
            args.push("--no-pivot".into());
        }
        if container.terminal() {
            args.push("-t".into());
        } else if container.stdin() {
            args.push("-i".into());
        }
        args
    }
}
