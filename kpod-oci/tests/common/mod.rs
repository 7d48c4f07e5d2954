//! Test helpers for kpod-oci integration tests.
//!
//! `FakeLauncher` stands in for the OS: it records runtime subcommands,
//! answers liveness probes from a script and plays the monitor's side of
//! the pipe protocol.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kpod_oci::process::{CommandSpec, ProcessLauncher, SpawnedProcess};
use kpod_oci::{Container, ContainerConfig, Runtime, RuntimeConfig};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use tempfile::TempDir;

/// PID the fake hands out for every monitor.
pub const MONITOR_PID: u32 = 31337;

/// PID of the fake container process.
pub const CONTAINER_PID: i32 = 4242;

/// What the next monitor spawn does.
#[derive(Debug, Clone)]
pub enum MonitorScript {
    /// Wait for the start signal, write `reply` to the sync pipe, exit 0.
    Reply(String),
    /// Exit 0 but keep the sync pipe open without ever writing.
    Silent,
    /// Exit with `code` without writing anything.
    Exit(i32),
    /// Exec mode: write `log` to the `-l` file, `reply` to the sync pipe.
    Exec {
        log: String,
        reply: Option<String>,
        status: i32,
    },
}

/// A recorded monitor spawn.
#[derive(Debug, Clone)]
pub struct SpawnRecord {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub fds: usize,
    pub new_process_group: bool,
    /// Contents of `--exec-process-spec`, read while the file still existed.
    pub exec_process: Option<String>,
}

impl SpawnRecord {
    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        let pos = self.args.iter().position(|a| a == flag)?;
        self.args.get(pos + 1).map(String::as_str)
    }

    pub fn has_env(&self, key: &str, value: &str) -> bool {
        self.env.iter().any(|(k, v)| k == key && v == value)
    }

    pub fn env_key(&self, key: &str) -> bool {
        self.env.iter().any(|(k, _)| k == key)
    }
}

/// A recorded runtime (or systemd) command run to completion.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    monitor: Option<MonitorScript>,
    spawn_fails: bool,
    spawns: Vec<SpawnRecord>,
    commands: Vec<CommandRecord>,
    probes: usize,
    signals: Vec<(i32, Signal)>,
    alive: bool,
    dies_on_stop_signal: bool,
    dies_on_kill_all: bool,
    state_output: Option<String>,
    failing: HashSet<String>,
    // Pipe ends of scripted monitors, kept open for the fake's lifetime.
    held: Vec<OwnedFd>,
}

#[derive(Debug, Default)]
pub struct FakeLauncher {
    inner: Mutex<Inner>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn set_monitor(&self, script: MonitorScript) {
        self.inner().monitor = Some(script);
    }

    pub fn fail_spawn(&self) {
        self.inner().spawn_fails = true;
    }

    pub fn set_alive(&self, alive: bool) {
        self.inner().alive = alive;
    }

    pub fn die_on_stop_signal(&self) {
        self.inner().dies_on_stop_signal = true;
    }

    pub fn die_on_kill_all(&self) {
        self.inner().dies_on_kill_all = true;
    }

    /// Stdout of `state`; `None` makes the subcommand fail.
    pub fn set_state_output(&self, json: Option<&str>) {
        self.inner().state_output = json.map(str::to_string);
    }

    /// Make the runtime subcommand `name` exit 1.
    pub fn fail_command(&self, name: &str) {
        self.inner().failing.insert(name.to_string());
    }

    pub fn spawns(&self) -> Vec<SpawnRecord> {
        self.inner().spawns.clone()
    }

    pub fn commands(&self) -> Vec<CommandRecord> {
        self.inner().commands.clone()
    }

    /// Argument lists of all completed commands.
    pub fn argv(&self) -> Vec<Vec<String>> {
        self.inner()
            .commands
            .iter()
            .map(|c| c.args.clone())
            .collect()
    }

    /// How many completed commands had exactly `args`.
    pub fn count(&self, args: &[&str]) -> usize {
        self.inner()
            .commands
            .iter()
            .filter(|c| c.args == args)
            .count()
    }

    pub fn probes(&self) -> usize {
        self.inner().probes
    }

    pub fn signals(&self) -> Vec<(i32, Signal)> {
        self.inner().signals.clone()
    }
}

struct FakeProcess {
    output: Output,
}

#[async_trait]
impl SpawnedProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(MONITOR_PID)
    }

    async fn wait(self: Box<Self>) -> io::Result<Output> {
        Ok(self.output)
    }
}

pub fn exit_status(code: i32) -> ExitStatus {
    ExitStatus::from_raw(code << 8)
}

fn output(code: i32, stdout: &str, stderr: &str) -> Output {
    Output {
        status: exit_status(code),
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

fn write_fd(fd: OwnedFd, data: &[u8]) {
    let mut file = std::fs::File::from(fd);
    let _ = file.write_all(data);
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(&self, spec: CommandSpec) -> io::Result<Box<dyn SpawnedProcess>> {
        let mut inner = self.inner();
        if inner.spawn_fails {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }

        let mut record = SpawnRecord {
            program: spec.program.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            cwd: spec.cwd.clone(),
            fds: spec.fds.len(),
            new_process_group: spec.new_process_group,
            exec_process: None,
        };
        record.exec_process = record
            .arg_after("--exec-process-spec")
            .and_then(|p| std::fs::read_to_string(p).ok());
        let log_path = record.arg_after("-l").map(PathBuf::from);
        inner.spawns.push(record);

        let mut fds = spec.fds.into_iter();
        let sync = fds.next();
        let start = fds.next();

        let script = inner
            .monitor
            .clone()
            .unwrap_or(MonitorScript::Reply(format!(r#"{{"pid": {CONTAINER_PID}}}"#)));
        let status = match script {
            MonitorScript::Reply(reply) => {
                std::thread::spawn(move || {
                    if let Some(start) = start {
                        let mut byte = [0u8; 1];
                        let _ = std::fs::File::from(start).read(&mut byte);
                    }
                    if let Some(sync) = sync {
                        write_fd(sync, reply.as_bytes());
                    }
                });
                0
            }
            MonitorScript::Silent => {
                inner.held.extend(sync);
                inner.held.extend(start);
                0
            }
            MonitorScript::Exit(code) => {
                // Keep the start pipe readable so the start signal does not hit EPIPE.
                inner.held.extend(start);
                code
            }
            MonitorScript::Exec { log, reply, status } => {
                if let Some(path) = log_path {
                    std::fs::write(path, log)?;
                }
                if let (Some(sync), Some(reply)) = (sync, reply) {
                    write_fd(sync, reply.as_bytes());
                }
                status
            }
        };

        Ok(Box::new(FakeProcess {
            output: output(status, "", if status == 0 { "" } else { "monitor failed" }),
        }))
    }

    async fn output(&self, spec: CommandSpec) -> io::Result<Output> {
        let mut inner = self.inner();
        inner.commands.push(CommandRecord {
            program: spec.program.clone(),
            args: spec.args.clone(),
        });

        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        let sub = args.first().copied().unwrap_or_default();
        if inner.failing.contains(sub) {
            return Ok(output(1, "", &format!("{sub} failed: boom")));
        }

        match args.as_slice() {
            ["-v"] => Ok(output(0, "runc version 1.1.12\ncommit: v1.1.12-0\n", "")),
            ["state", _] => match &inner.state_output {
                Some(json) => Ok(output(0, json, "")),
                None => Ok(output(1, "", "container does not exist")),
            },
            ["kill", "--all", _, _] => {
                if inner.dies_on_kill_all {
                    inner.alive = false;
                }
                Ok(output(0, "", ""))
            }
            ["kill", _, _] => {
                if inner.dies_on_stop_signal {
                    inner.alive = false;
                }
                Ok(output(0, "", ""))
            }
            _ => Ok(output(0, "", "")),
        }
    }

    fn signal(&self, pid: i32, signal: Option<Signal>) -> nix::Result<()> {
        let mut inner = self.inner();
        match signal {
            None => inner.probes += 1,
            Some(sig) => inner.signals.push((pid, sig)),
        }
        if inner.alive { Ok(()) } else { Err(Errno::ESRCH) }
    }
}

/// A runtime wired to a [`FakeLauncher`] inside a scratch directory.
pub struct Harness {
    pub dir: TempDir,
    pub launcher: Arc<FakeLauncher>,
    pub runtime: Runtime,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut RuntimeConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        for sub in ["bundle", "state", "exits", "cgroup", "attach"] {
            std::fs::create_dir(dir.path().join(sub)).unwrap();
        }

        let mut config = RuntimeConfig {
            runtime_path: "/usr/bin/runc".into(),
            monitor_path: "/usr/libexec/kpod/monitor".into(),
            monitor_env: vec!["PATH=/usr/bin:/bin".into()],
            exits_dir: dir.path().join("exits"),
            attach_socket_dir: dir.path().join("attach"),
            cgroup_root: dir.path().join("cgroup"),
            create_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        tweak(&mut config);

        let launcher = FakeLauncher::new();
        let runtime = Runtime::with_launcher(config, launcher.clone()).unwrap();
        Self {
            dir,
            launcher,
            runtime,
        }
    }

    pub fn bundle(&self) -> PathBuf {
        self.dir.path().join("bundle")
    }

    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn container(&self, id: &str) -> Container {
        self.container_with(id, |_| {})
    }

    pub fn container_with(&self, id: &str, tweak: impl FnOnce(&mut ContainerConfig)) -> Container {
        let mut config = ContainerConfig {
            id: id.into(),
            name: format!("{id}-name"),
            bundle_path: self.bundle(),
            dir: self.path("state"),
            log_path: self.path("bundle/container.log"),
            trusted: true,
            ..Default::default()
        };
        tweak(&mut config);
        Container::new(config)
    }

    /// A container whose process is running as [`CONTAINER_PID`].
    pub async fn running_container(&self, id: &str) -> Container {
        let c = self.container(id);
        let mut state = c.state().await;
        state.pid = CONTAINER_PID;
        state.status = kpod_oci::ContainerStatus::Running;
        state.started = Some(state.created);
        c.restore_state(state).await;
        self.launcher.set_alive(true);
        c
    }
}
