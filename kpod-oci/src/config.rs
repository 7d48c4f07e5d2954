//! Runtime-wide configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

/// How long the monitor has to report the container PID.
pub const CONTAINER_CREATE_TIMEOUT: Duration = Duration::from_secs(240);

/// How long we wait for a container to die after SIGKILL.
pub const KILL_CONTAINER_TIMEOUT: Duration = Duration::from_secs(120);

/// Default directory for exit notification files.
pub const CONTAINER_EXITS_DIR: &str = "/var/run/crio/exits";

/// Default directory for attach sockets.
pub const CONTAINER_ATTACH_SOCKET_DIR: &str = "/var/run/crio";

/// Cgroup manager used to place the monitor process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupManager {
    #[default]
    Cgroupfs,
    Systemd,
}

impl fmt::Display for CgroupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cgroupfs => write!(f, "cgroupfs"),
            Self::Systemd => write!(f, "systemd"),
        }
    }
}

impl FromStr for CgroupManager {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cgroupfs" => Ok(Self::Cgroupfs),
            "systemd" => Ok(Self::Systemd),
            other => Err(Error::InvalidConfig(format!(
                "unknown cgroup manager '{other}' (expected cgroupfs or systemd)"
            ))),
        }
    }
}

/// Runtime-wide default trust for workloads.
///
/// Only the literal `trusted` selects [`WorkloadTrust::Trusted`]; any other
/// value is treated as untrusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum WorkloadTrust {
    #[default]
    Trusted,
    Untrusted,
}

impl From<String> for WorkloadTrust {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<&str> for WorkloadTrust {
    fn from(s: &str) -> Self {
        if s == "trusted" {
            Self::Trusted
        } else {
            Self::Untrusted
        }
    }
}

impl fmt::Display for WorkloadTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trusted => write!(f, "trusted"),
            Self::Untrusted => write!(f, "untrusted"),
        }
    }
}

/// Configuration for the runtime supervisor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Path to the trusted OCI runtime binary.
    pub runtime_path: PathBuf,
    /// Path to the runtime used for untrusted workloads.
    pub runtime_untrusted_path: Option<PathBuf>,
    /// Trust applied to workloads by default.
    pub default_workload_trust: WorkloadTrust,
    /// Path to the monitor binary.
    pub monitor_path: PathBuf,
    /// Extra `KEY=VALUE` environment for the monitor.
    pub monitor_env: Vec<String>,
    pub cgroup_manager: CgroupManager,
    /// Where the monitor writes exit notification files.
    pub exits_dir: PathBuf,
    /// Where the monitor creates attach sockets.
    pub attach_socket_dir: PathBuf,
    /// Maximum container log size, negative means unlimited.
    pub log_size_max: i64,
    pub no_pivot: bool,
    /// Mount point of the cgroup hierarchy.
    pub cgroup_root: PathBuf,
    #[serde(with = "duration_secs")]
    pub create_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub kill_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_path: PathBuf::from("/usr/bin/runc"),
            runtime_untrusted_path: None,
            default_workload_trust: WorkloadTrust::Trusted,
            monitor_path: PathBuf::from("/usr/libexec/crio/conmon"),
            monitor_env: vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into()],
            cgroup_manager: CgroupManager::Cgroupfs,
            exits_dir: PathBuf::from(CONTAINER_EXITS_DIR),
            attach_socket_dir: PathBuf::from(CONTAINER_ATTACH_SOCKET_DIR),
            log_size_max: -1,
            no_pivot: false,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            create_timeout: CONTAINER_CREATE_TIMEOUT,
            kill_timeout: KILL_CONTAINER_TIMEOUT,
        }
    }
}

impl RuntimeConfig {
    /// Check the configuration for values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.runtime_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("runtime path must be set".into()));
        }
        if self.monitor_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("monitor path must be set".into()));
        }
        if let Some(bad) = self.monitor_env.iter().find(|kv| !kv.contains('=')) {
            return Err(Error::InvalidConfig(format!(
                "monitor env entry '{bad}' is not KEY=VALUE"
            )));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
