//! Launching the monitor and runtime binaries.
//!
//! The lifecycle protocols never touch `tokio::process` directly; they go
//! through [`ProcessLauncher`] so they can be driven by a scripted launcher
//! in tests.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

/// First descriptor number used for inherited fds; 0-2 are stdio.
pub const FIRST_INHERITED_FD: RawFd = 3;

/// Upper bound on fds handed to one child.
const MAX_INHERITED_FDS: usize = 8;

/// How a standard stream of the child is wired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdioMode {
    #[default]
    Inherit,
    Null,
    Piped,
}

impl From<StdioMode> for Stdio {
    fn from(mode: StdioMode) -> Self {
        match mode {
            StdioMode::Inherit => Stdio::inherit(),
            StdioMode::Null => Stdio::null(),
            StdioMode::Piped => Stdio::piped(),
        }
    }
}

/// A command to run, plus the descriptors it inherits.
///
/// Descriptors in `fds` are installed in the child as 3, 4, ... in order.
/// They are closed in the parent once the `CommandSpec` is dropped.
#[derive(Debug, Default)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Replace the parent environment with `env` instead of extending it.
    pub clear_env: bool,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub fds: Vec<OwnedFd>,
    pub new_process_group: bool,
    pub stdin: StdioMode,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
}

impl CommandSpec {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Use exactly these `KEY=VALUE` entries as the environment.
    pub fn env_exact<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.clear_env = true;
        self.env = entries
            .into_iter()
            .filter_map(|kv| {
                kv.as_ref()
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn inherit_fd(mut self, fd: OwnedFd) -> Self {
        self.fds.push(fd);
        self
    }

    pub fn process_group(mut self) -> Self {
        self.new_process_group = true;
        self
    }

    pub fn stdin(mut self, mode: StdioMode) -> Self {
        self.stdin = mode;
        self
    }

    pub fn stdout(mut self, mode: StdioMode) -> Self {
        self.stdout = mode;
        self
    }

    pub fn stderr(mut self, mode: StdioMode) -> Self {
        self.stderr = mode;
        self
    }

    /// Capture stdout and stderr, no stdin.
    pub fn captured(self) -> Self {
        self.stdin(StdioMode::Null)
            .stdout(StdioMode::Piped)
            .stderr(StdioMode::Piped)
    }

    /// Human readable command line for logs and errors.
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// A started child process.
#[async_trait]
pub trait SpawnedProcess: Send {
    /// PID, if the child has not been reaped yet.
    fn id(&self) -> Option<u32>;

    /// Wait for exit. Streams that were not piped come back empty.
    async fn wait(self: Box<Self>) -> io::Result<Output>;
}

/// Capability to start processes and probe PIDs.
#[async_trait]
pub trait ProcessLauncher: Send + Sync + fmt::Debug {
    async fn spawn(&self, spec: CommandSpec) -> io::Result<Box<dyn SpawnedProcess>>;

    /// Run to completion.
    async fn output(&self, spec: CommandSpec) -> io::Result<Output> {
        self.spawn(spec).await?.wait().await
    }

    /// Send `signal` to `pid`; `None` only checks that the process exists.
    fn signal(&self, pid: i32, signal: Option<Signal>) -> nix::Result<()>;
}

/// Whether `pid` refers to a live process.
///
/// Only ESRCH counts as gone; a PID we may not signal still exists.
pub fn process_exists(launcher: &dyn ProcessLauncher, pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    !matches!(launcher.signal(pid, None), Err(Errno::ESRCH))
}

/// Launcher backed by real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

struct SystemProcess {
    child: Child,
}

#[async_trait]
impl SpawnedProcess for SystemProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(self: Box<Self>) -> io::Result<Output> {
        self.child.wait_with_output().await
    }
}

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    async fn spawn(&self, spec: CommandSpec) -> io::Result<Box<dyn SpawnedProcess>> {
        if spec.fds.len() > MAX_INHERITED_FDS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("too many inherited fds: {}", spec.fds.len()),
            ));
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if spec.clear_env {
            cmd.env_clear();
        }
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::from(spec.stdin))
            .stdout(Stdio::from(spec.stdout))
            .stderr(Stdio::from(spec.stderr));
        if spec.new_process_group {
            cmd.process_group(0);
        }

        if !spec.fds.is_empty() {
            let raw: Vec<RawFd> = spec.fds.iter().map(|fd| fd.as_raw_fd()).collect();
            // SAFETY: install_fds only calls fcntl and dup2, both
            // async-signal-safe, and does not allocate.
            unsafe {
                cmd.pre_exec(move || install_fds(&raw));
            }
        }

        let child = cmd.spawn()?;
        // The child holds its own copies now.
        drop(spec.fds);
        Ok(Box::new(SystemProcess { child }))
    }

    fn signal(&self, pid: i32, signal: Option<Signal>) -> nix::Result<()> {
        kill(Pid::from_raw(pid), signal)
    }
}

/// Install `fds` as 3, 4, ... in the forked child.
///
/// Sources are first moved above the target range so that installing one
/// never clobbers another that is still pending.
fn install_fds(fds: &[RawFd]) -> io::Result<()> {
    let floor = FIRST_INHERITED_FD + fds.len() as RawFd;
    let mut staged = [-1 as RawFd; MAX_INHERITED_FDS];
    for (slot, &fd) in staged.iter_mut().zip(fds) {
        let moved = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, floor) };
        if moved < 0 {
            return Err(io::Error::last_os_error());
        }
        *slot = moved;
    }
    for (target, &fd) in (FIRST_INHERITED_FD..).zip(&staged[..fds.len()]) {
        // dup2 clears FD_CLOEXEC on the target.
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_exact_splits_entries() {
        let spec = CommandSpec::new("/bin/true").env_exact(["A=1", "B=x=y", "broken"]);
        assert!(spec.clear_env);
        assert_eq!(
            spec.env,
            vec![("A".into(), "1".into()), ("B".into(), "x=y".into())]
        );
    }

    #[test]
    fn display_joins_args() {
        let spec = CommandSpec::new("/usr/bin/runc").args(["kill", "abc", "TERM"]);
        assert_eq!(spec.display(), "/usr/bin/runc kill abc TERM");
    }

    #[test]
    fn non_positive_pid_never_exists() {
        let launcher = SystemLauncher;
        assert!(!process_exists(&launcher, 0));
        assert!(!process_exists(&launcher, -1));
        assert!(process_exists(&launcher, std::process::id() as i32));
    }

    #[tokio::test]
    async fn inherited_fd_reaches_child() {
        let (read, write) = nix::unistd::pipe().unwrap();
        let spec = CommandSpec::new("/bin/sh")
            .args(["-c", "echo hello >&3"])
            .inherit_fd(write)
            .stdout(StdioMode::Null);
        let child = SystemLauncher.spawn(spec).await.unwrap();
        let out = child.wait().await.unwrap();
        assert!(out.status.success());

        let mut buf = String::new();
        use std::io::Read;
        std::fs::File::from(read).read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "hello\n");
    }
}
