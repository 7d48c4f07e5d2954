//! The in-memory container record.
//!
//! Everything except the state is fixed at construction. The state sits
//! behind the container's op lock; lifecycle operations in
//! [`crate::runtime`] hold that lock for their whole duration, so two
//! operations on the same container never interleave.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::Result;
use crate::spec::{Process, Spec};
use crate::state::ContainerState;

/// Signal used when the configured stop signal is empty or unknown.
pub const DEFAULT_STOP_SIGNAL: Signal = Signal::SIGTERM;

const STATE_FILE: &str = "state.json";

/// Logical name and attempt counter assigned by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMetadata {
    pub name: String,
    pub attempt: u32,
}

/// A bind mount handed to the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerVolume {
    pub container_path: String,
    pub host_path: String,
    pub readonly: bool,
}

/// Everything needed to construct a [`Container`].
///
/// Built by the request layer after it validated the incoming request.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub id: String,
    pub name: String,
    /// Id of the owning sandbox.
    pub sandbox: String,
    /// Runtime bundle; lives on tmpfs and is gone after a reboot.
    pub bundle_path: PathBuf,
    /// Persistent directory holding `state.json`.
    pub dir: PathBuf,
    pub log_path: PathBuf,
    pub mount_point: PathBuf,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// Annotations for internal use only, never shown to clients.
    pub internal_annotations: HashMap<String, String>,
    pub image: String,
    pub image_name: String,
    pub image_ref: String,
    pub metadata: ContainerMetadata,
    pub terminal: bool,
    pub stdin: bool,
    pub stdin_once: bool,
    pub privileged: bool,
    pub trusted: bool,
    /// Raw stop signal as given by the user, e.g. `SIGQUIT`, `int` or `9`.
    pub stop_signal: String,
    pub spec: Spec,
    pub volumes: Vec<ContainerVolume>,
    /// Network namespace path; `None` means the PID's own namespace.
    pub netns: Option<PathBuf>,
    /// Creation time; `None` means now.
    pub created: Option<DateTime<Utc>>,
}

/// A container managed by the runtime supervisor.
#[derive(Debug)]
pub struct Container {
    id: String,
    name: String,
    sandbox: String,
    bundle_path: PathBuf,
    dir: PathBuf,
    log_path: PathBuf,
    mount_point: PathBuf,
    labels: HashMap<String, String>,
    annotations: HashMap<String, String>,
    internal_annotations: HashMap<String, String>,
    image: String,
    image_name: String,
    image_ref: String,
    metadata: ContainerMetadata,
    terminal: bool,
    stdin: bool,
    stdin_once: bool,
    privileged: bool,
    trusted: bool,
    stop_signal: String,
    spec: Spec,
    volumes: Vec<ContainerVolume>,
    netns: Option<PathBuf>,
    created: DateTime<Utc>,
    state: Mutex<ContainerState>,
}

impl Container {
    pub fn new(config: ContainerConfig) -> Self {
        let created = config.created.unwrap_or_else(Utc::now);
        let state = ContainerState::new(
            config.id.clone(),
            config.bundle_path.to_string_lossy(),
            created,
        );
        Self {
            id: config.id,
            name: config.name,
            sandbox: config.sandbox,
            bundle_path: config.bundle_path,
            dir: config.dir,
            log_path: config.log_path,
            mount_point: config.mount_point,
            labels: config.labels,
            annotations: config.annotations,
            internal_annotations: config.internal_annotations,
            image: config.image,
            image_name: config.image_name,
            image_ref: config.image_ref,
            metadata: config.metadata,
            terminal: config.terminal,
            stdin: config.stdin,
            stdin_once: config.stdin_once,
            privileged: config.privileged,
            trusted: config.trusted,
            stop_signal: config.stop_signal,
            spec: config.spec,
            volumes: config.volumes,
            netns: config.netns,
            created,
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sandbox(&self) -> &str {
        &self.sandbox
    }

    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.annotations
    }

    pub fn internal_annotations(&self) -> &HashMap<String, String> {
        &self.internal_annotations
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    pub fn image_ref(&self) -> &str {
        &self.image_ref
    }

    pub fn metadata(&self) -> &ContainerMetadata {
        &self.metadata
    }

    pub fn terminal(&self) -> bool {
        self.terminal
    }

    pub fn stdin(&self) -> bool {
        self.stdin
    }

    pub fn stdin_once(&self) -> bool {
        self.stdin_once
    }

    pub fn privileged(&self) -> bool {
        self.privileged
    }

    pub fn trusted(&self) -> bool {
        self.trusted
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    /// Process section of `config.json`, empty if there is none.
    pub fn process(&self) -> Process {
        self.spec.process.clone().unwrap_or_default()
    }

    pub fn volumes(&self) -> &[ContainerVolume] {
        &self.volumes
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created
    }

    /// Resolved stop signal.
    pub fn stop_signal(&self) -> Signal {
        resolve_stop_signal(&self.stop_signal)
    }

    /// Stop signal in the form the runtime's `kill` subcommand takes (`TERM`).
    pub fn stop_signal_name(&self) -> &'static str {
        signal_name(self.stop_signal())
    }

    /// Path of the network namespace the container lives in.
    pub async fn netns_path(&self) -> PathBuf {
        match &self.netns {
            Some(path) => path.clone(),
            None => {
                let pid = self.state.lock().await.pid;
                PathBuf::from(format!("/proc/{pid}/ns/net"))
            }
        }
    }

    /// Snapshot of the current state.
    pub async fn state(&self) -> ContainerState {
        self.state.lock().await.clone()
    }

    /// Replace the state wholesale.
    ///
    /// Used when reloading from disk and by test doubles.
    pub async fn restore_state(&self, state: ContainerState) {
        *self.state.lock().await = state;
    }

    /// Acquire the op lock.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock().await
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Write the state to `state.json`, replacing the old file atomically.
    pub async fn to_disk(&self) -> Result<()> {
        let state = self.state.lock().await;
        let mut data = serde_json::to_vec(&*state)?;
        data.push(b'\n');

        let path = self.state_path();
        let tmp = self.dir.join(format!(".{STATE_FILE}.tmp"));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(container_id = %self.id, path = %path.display(), "State written to disk");
        Ok(())
    }

    /// Load the state from `state.json`.
    pub async fn from_disk(&self) -> Result<()> {
        let data = tokio::fs::read(self.state_path()).await?;
        let state: ContainerState = serde_json::from_slice(&data)?;
        self.restore_state(state).await;
        Ok(())
    }
}

/// Resolve a user-supplied stop signal, falling back to SIGTERM.
pub fn resolve_stop_signal(raw: &str) -> Signal {
    let raw = raw.trim();
    if raw.is_empty() {
        return DEFAULT_STOP_SIGNAL;
    }
    if let Ok(num) = raw.parse::<i32>() {
        return Signal::try_from(num).unwrap_or(DEFAULT_STOP_SIGNAL);
    }
    let upper = raw.to_ascii_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    Signal::from_str(&format!("SIG{name}")).unwrap_or(DEFAULT_STOP_SIGNAL)
}

/// Signal name without the `SIG` prefix.
pub fn signal_name(signal: Signal) -> &'static str {
    let name = signal.as_str();
    name.strip_prefix("SIG").unwrap_or(name)
}
