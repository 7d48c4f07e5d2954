//! Synchronous exec through the monitor.

use std::io::Write;
use std::path::Path;

use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::Runtime;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::pipe::SyncPipe;
use crate::process::{CommandSpec, StdioMode};

/// Output of a finished exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSyncResponse {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Message the monitor sends once the exec'd process exited.
#[derive(Debug, Deserialize)]
struct ExitCodeInfo {
    exit_code: i32,
    #[serde(default)]
    message: Option<String>,
}

impl Runtime {
    /// Run `command` inside the container and collect its output.
    ///
    /// A non-zero exit of the command is a normal result. Errors are only
    /// returned when the monitor could not run it at all.
    pub async fn exec_sync(
        &self,
        container: &Container,
        command: &[String],
        timeout_secs: i64,
    ) -> Result<ExecSyncResponse> {
        let id = container.id();
        let setup_err = |what: &'static str| {
            move |source: std::io::Error| Error::Pipe {
                id: id.to_string(),
                what,
                source,
            }
        };

        let mut sync = SyncPipe::new().map_err(setup_err("sync pipe"))?;
        let sync_child = sync.take_child().map_err(setup_err("sync pipe"))?;
        let pid_file = tempfile::Builder::new()
            .prefix("pidfile")
            .tempfile()
            .map_err(setup_err("pid file"))?;
        let log_file = tempfile::Builder::new()
            .prefix(&format!("kpod-log-{id}"))
            .tempfile()
            .map_err(setup_err("log file"))?;
        let process_file = self
            .write_exec_process(container, command)
            .map_err(setup_err("exec process spec"))?;

        let mut args = vec![
            "-c".to_string(),
            id.to_string(),
            "-r".into(),
            self.path(container).display().to_string(),
            "-p".into(),
            path_arg(pid_file.path()),
            "-e".into(),
        ];
        if container.terminal() {
            args.push("-t".into());
        }
        if timeout_secs > 0 {
            args.push("-T".into());
            args.push(timeout_secs.to_string());
        }
        args.extend([
            "-l".into(),
            path_arg(log_file.path()),
            "--socket-dir-path".into(),
            self.config.attach_socket_dir.display().to_string(),
            "--exec-process-spec".into(),
            path_arg(process_file.path()),
        ]);

        let mut env = self.config.monitor_env.clone();
        env.push("_OCI_SYNCPIPE=3".into());

        let cmd = CommandSpec::new(&self.config.monitor_path)
            .args(args)
            .env_exact(env)
            .inherit_fd(sync_child)
            .stdin(StdioMode::Null)
            .stdout(StdioMode::Piped)
            .stderr(StdioMode::Piped);
        debug!(container_id = %id, cmd = %cmd.display(), "Running exec monitor");

        let exec_err = |reason: String, stdout: &[u8], stderr: &[u8], exit_code: i32| Error::ExecSync {
            id: id.to_string(),
            reason,
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
            exit_code,
        };

        let monitor = self
            .launcher
            .spawn(cmd)
            .await
            .map_err(|e| exec_err(format!("failed to spawn monitor: {e}"), &[], &[], -1))?;
        let output = monitor
            .wait()
            .await
            .map_err(|e| exec_err(format!("failed to wait for monitor: {e}"), &[], &[], -1))?;
        if !output.status.success() {
            return Err(exec_err(
                format!("monitor exited with {}", output.status),
                &output.stdout,
                &output.stderr,
                output.status.code().unwrap_or(-1),
            ));
        }

        let info = match sync.read_message::<ExitCodeInfo>().await {
            Ok(Some(info)) => info,
            Ok(None) => {
                return Err(exec_err(
                    "monitor closed the sync pipe without an exit code".into(),
                    &output.stdout,
                    &output.stderr,
                    -1,
                ));
            }
            Err(e) => {
                return Err(exec_err(e.to_string(), &output.stdout, &output.stderr, -1));
            }
        };
        let message = info.message.unwrap_or_default();
        info!(container_id = %id, exit_code = info.exit_code, %message, "Received container exit code");

        if info.exit_code == -1 {
            return Err(exec_err(message, &output.stdout, &output.stderr, -1));
        }

        let log = tokio::fs::read(log_file.path())
            .await
            .map_err(|e| exec_err(format!("failed to read exec log: {e}"), &output.stdout, &output.stderr, -1))?;
        let (stdout, stderr) = parse_log(&log);
        Ok(ExecSyncResponse {
            stdout,
            stderr,
            exit_code: info.exit_code,
        })
    }

    /// Temporary file holding the process spec for the exec.
    fn write_exec_process(&self, container: &Container, command: &[String]) -> std::io::Result<NamedTempFile> {
        let process = container
            .process()
            .for_exec(command, &self.config.monitor_env);
        let mut file = tempfile::Builder::new().prefix("exec-process").tempfile()?;
        serde_json::to_writer(&mut file, &process)?;
        file.flush()?;
        Ok(file)
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// Split a monitor log into stdout and stderr.
///
/// Each entry is `<timestamp> <stream> <content>` where content includes
/// the trailing newline, if any. Malformed entries and unknown streams are
/// skipped.
pub fn parse_log(log: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    for line in log.split_inclusive(|&b| b == b'\n') {
        let mut parts = line.splitn(3, |&b| b == b' ');
        let (Some(_timestamp), Some(stream), Some(content)) = (parts.next(), parts.next(), parts.next())
        else {
            warn!(line = %String::from_utf8_lossy(line), "Hit invalid log format");
            continue;
        };

        match stream {
            b"stdout" => stdout.extend_from_slice(content),
            b"stderr" => stderr.extend_from_slice(content),
            other => {
                warn!(
                    stream = %String::from_utf8_lossy(other),
                    line = %String::from_utf8_lossy(line),
                    "Hit invalid log format, unknown stream"
                );
            }
        }
    }

    (stdout, stderr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demux_routes_known_streams() {
        let log = b"2024-01-01T00:00:00Z stdout hello\n\
2024-01-01T00:00:01Z stderr oops\n\
2024-01-01T00:00:02Z stdin ignored\n\
2024-01-01T00:00:03Z stdout world\n\
garbage\n\
2024-01-01T00:00:04Z stderr no newline";

        let (stdout, stderr) = parse_log(log);
        assert_eq!(stdout, b"hello\nworld\n");
        assert_eq!(stderr, b"oops\nno newline");
    }

    #[test]
    fn content_keeps_inner_spaces() {
        let (stdout, stderr) = parse_log(b"ts stdout a b  c\n");
        assert_eq!(stdout, b"a b  c\n");
        assert!(stderr.is_empty());
    }

    #[test]
    fn empty_log() {
        assert_eq!(parse_log(b""), (Vec::new(), Vec::new()));
    }
}
