//! Stopping a container: graceful signal, then SIGKILL.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Runtime;
use crate::backoff::{Backoff, STOP_POLL_INTERVAL};
use crate::container::Container;
use crate::error::{Error, Result};
use crate::process::{ProcessLauncher, StdioMode, process_exists};

/// How a bounded wait for the container process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Exited,
    Cancelled,
    TimedOut,
}

impl Runtime {
    /// Stop the container, giving it `timeout_secs` to exit on its stop
    /// signal before it is killed.
    ///
    /// A timeout of zero or less skips the stop signal. Cancelling `cancel`
    /// during the graceful phase abandons the stop without escalating to
    /// SIGKILL; the container keeps running.
    pub async fn stop_container(
        &self,
        container: &Container,
        timeout_secs: i64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut state = container.lock().await;
        let id = container.id();
        let pid = state.pid;

        if !process_exists(self.launcher.as_ref(), pid) {
            debug!(container_id = %id, pid, "Container process already gone");
            state.mark_stopped(Utc::now());
            return Ok(());
        }

        if timeout_secs > 0 {
            let signal = container.stop_signal_name();
            info!(container_id = %id, pid, signal, timeout_secs, "Stopping container");
            self.run_runtime(container, &["kill", id, signal], StdioMode::Inherit)
                .await?;

            let timeout = Duration::from_secs(timeout_secs.unsigned_abs());
            match wait_stop(self.launcher.clone(), pid, timeout, cancel).await {
                WaitOutcome::Exited => {
                    state.mark_stopped(Utc::now());
                    info!(container_id = %id, "Container stopped");
                    return Ok(());
                }
                WaitOutcome::Cancelled => {
                    warn!(container_id = %id, "Stop cancelled during graceful wait, not killing");
                    return Err(Error::Cancelled { id: id.to_string() });
                }
                WaitOutcome::TimedOut => {
                    warn!(container_id = %id, ?timeout, "Stop container timed out, killing");
                }
            }
        }

        info!(container_id = %id, pid, "Killing container");
        self.run_runtime(container, &["kill", "--all", id, "KILL"], StdioMode::Inherit)
            .await?;

        let kill_timeout = self.config.kill_timeout;
        // The kill is already sent; cancelling now would only leave stale state.
        match wait_stop(self.launcher.clone(), pid, kill_timeout, &CancellationToken::new()).await {
            WaitOutcome::Exited => {
                state.mark_stopped(Utc::now());
                info!(container_id = %id, "Container killed");
                Ok(())
            }
            WaitOutcome::Cancelled | WaitOutcome::TimedOut => Err(Error::StopTimeout {
                id: id.to_string(),
                timeout: kill_timeout,
            }),
        }
    }
}

/// Poll `pid` until it is gone, the deadline passes or `cancel` fires.
///
/// The poller runs on its own task and reports through `done`; it is
/// stopped through a separate token so the two paths never race on the
/// same channel. The token is cancelled on drop, so a caller that gives up
/// on this future takes the poller down with it.
async fn wait_stop(
    launcher: Arc<dyn ProcessLauncher>,
    pid: i32,
    timeout: Duration,
    cancel: &CancellationToken,
) -> WaitOutcome {
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let control = CancellationToken::new();
    let poller_control = control.clone();
    let stop_poller = control.drop_guard();

    let poller = tokio::spawn(async move {
        let schedule = Backoff::polling(STOP_POLL_INTERVAL, timeout);
        let gone = schedule.retry(|| std::future::ready(!process_exists(launcher.as_ref(), pid)));
        tokio::select! {
            _ = poller_control.cancelled() => {}
            res = gone => {
                if res.is_ok() {
                    let _ = done_tx.send(());
                }
            }
        }
    });

    let outcome = tokio::select! {
        res = done_rx => match res {
            Ok(()) => WaitOutcome::Exited,
            // Poller gave up without seeing the process exit.
            Err(_) => WaitOutcome::TimedOut,
        },
        _ = cancel.cancelled() => WaitOutcome::Cancelled,
        _ = tokio::time::sleep(timeout) => WaitOutcome::TimedOut,
    };

    drop(stop_poller);
    let _ = poller.await;
    outcome
}
