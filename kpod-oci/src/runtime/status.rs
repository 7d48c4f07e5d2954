//! Refreshing container state from the runtime.

use std::io;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::Runtime;
use crate::backoff::EXIT_FILE_BACKOFF;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::process::CommandSpec;
use crate::state::{
    ContainerState, ContainerStatus, EXIT_CODE_RUNTIME_UNREACHABLE, EXIT_CODE_UNKNOWN,
    RuntimeStateReport,
};

/// Marker the monitor leaves in the bundle when the container was OOM killed.
const OOM_FILE: &str = "oom";

impl Runtime {
    /// Refresh the container state from the runtime's `state` report.
    ///
    /// If the runtime cannot report on the container at all, the container
    /// is recorded as stopped with exit code 255 and no error is returned.
    pub async fn update_status(&self, container: &Container) -> Result<()> {
        let mut state = container.lock().await;
        let id = container.id();

        let cmd = CommandSpec::new(self.path(container))
            .args(["state", id])
            .captured();
        let output = match self.launcher.output(cmd).await {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                debug!(
                    container_id = %id,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Runtime state failed, marking container stopped"
                );
                mark_unreachable(&mut state);
                return Ok(());
            }
            Err(e) => {
                debug!(container_id = %id, error = %e, "Runtime state failed, marking container stopped");
                mark_unreachable(&mut state);
                return Ok(());
            }
        };

        let report: RuntimeStateReport =
            serde_json::from_slice(&output.stdout).map_err(|source| Error::StatusDecode {
                id: id.to_string(),
                source,
            })?;
        state.merge_report(report);

        if state.status != ContainerStatus::Stopped {
            return Ok(());
        }

        let exit_file = self.config.exits_dir.join(id);
        let exit_path = exit_file.as_path();
        let present = move || async move { tokio::fs::try_exists(exit_path).await.unwrap_or(false) };
        match EXIT_FILE_BACKOFF.retry(present).await {
            Ok(_) => {
                let exit_err = |reason: String| Error::ExitFile {
                    id: id.to_string(),
                    reason,
                };
                let meta = tokio::fs::metadata(&exit_file)
                    .await
                    .map_err(|e| exit_err(format!("failed to stat exit file: {e}")))?;
                let contents = tokio::fs::read_to_string(&exit_file)
                    .await
                    .map_err(|e| exit_err(format!("failed to read exit file: {e}")))?;
                let code = contents
                    .trim()
                    .parse::<i32>()
                    .map_err(|e| exit_err(format!("status code conversion failed: {e}")))?;

                state.finished = Some(finished_time(&meta));
                state.exit_code = code;
            }
            Err(e) => {
                warn!(container_id = %id, path = %exit_file.display(), error = %e, "Failed to find container exit file");
                state.exit_code = EXIT_CODE_UNKNOWN;
                if state.finished.is_none() {
                    state.finished = Some(Utc::now());
                }
            }
        }

        if tokio::fs::try_exists(container.bundle_path().join(OOM_FILE))
            .await
            .unwrap_or(false)
        {
            state.oom_killed = true;
        }
        Ok(())
    }
}

fn mark_unreachable(state: &mut ContainerState) {
    state.mark_stopped(Utc::now());
    state.exit_code = EXIT_CODE_RUNTIME_UNREACHABLE;
}

fn finished_time(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_: io::Error| Utc::now())
}
