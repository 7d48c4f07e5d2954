//! Container state as persisted to `state.json` and reported by the runtime.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exit code recorded when the runtime cannot be reached.
pub const EXIT_CODE_RUNTIME_UNREACHABLE: i32 = 255;

/// Exit code recorded when the exit file never showed up.
pub const EXIT_CODE_UNKNOWN: i32 = -1;

/// OCI process status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    #[default]
    Created,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Full state of a container.
///
/// The OCI part (`oci_version` through `annotations`) mirrors what the
/// runtime's `state` subcommand prints; the rest is tracked by us.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    #[serde(default)]
    pub oci_version: String,
    #[serde(default)]
    pub id: String,
    pub status: ContainerStatus,
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub bundle: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default, rename = "oomKilled")]
    pub oom_killed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ContainerState {
    /// Fresh state for a container constructed at `created`.
    pub fn new(id: impl Into<String>, bundle: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            oci_version: String::new(),
            id: id.into(),
            status: ContainerStatus::Created,
            pid: 0,
            bundle: bundle.into(),
            annotations: HashMap::new(),
            created,
            started: None,
            finished: None,
            exit_code: 0,
            oom_killed: false,
            error: String::new(),
        }
    }

    /// Mark the process as gone at `at`.
    pub fn mark_stopped(&mut self, at: DateTime<Utc>) {
        self.status = ContainerStatus::Stopped;
        self.finished = Some(at);
    }

    /// Overwrite the fields present in a runtime state report.
    pub fn merge_report(&mut self, report: RuntimeStateReport) {
        if let Some(v) = report.oci_version {
            self.oci_version = v;
        }
        if let Some(v) = report.id {
            self.id = v;
        }
        if let Some(v) = report.status {
            self.status = v;
        }
        if let Some(v) = report.pid {
            self.pid = v;
        }
        if let Some(v) = report.bundle {
            self.bundle = v;
        }
        if let Some(v) = report.annotations {
            self.annotations = v;
        }
        if let Some(v) = report.created {
            self.created = v;
        }
    }
}

/// Output of the runtime's `state` subcommand.
///
/// Every field is optional so that decoding only touches what the runtime
/// actually printed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStateReport {
    pub oci_version: Option<String>,
    pub id: Option<String>,
    pub status: Option<ContainerStatus>,
    pub pid: Option<i32>,
    pub bundle: Option<String>,
    pub annotations: Option<HashMap<String, String>>,
    pub created: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(status: ContainerStatus) -> ContainerState {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut state = ContainerState::new("abc", "/run/bundle/abc", created);
        state.status = status;
        state
    }

    #[test]
    fn round_trip_all_statuses() {
        for status in [
            ContainerStatus::Created,
            ContainerStatus::Running,
            ContainerStatus::Paused,
            ContainerStatus::Stopped,
        ] {
            let mut state = sample(status);
            if status == ContainerStatus::Stopped {
                state.started = Some(state.created + chrono::Duration::seconds(1));
                state.finished = Some(state.created + chrono::Duration::milliseconds(2500));
                state.exit_code = 137;
                state.oom_killed = true;
            }
            let json = serde_json::to_string(&state).unwrap();
            let decoded: ContainerState = serde_json::from_str(&json).unwrap();
            assert_eq!(decoded, state, "status {status}");
        }
    }

    #[test]
    fn zero_timestamps_are_omitted() {
        let json = serde_json::to_value(sample(ContainerStatus::Created)).unwrap();
        assert!(json.get("started").is_none());
        assert!(json.get("finished").is_none());
        assert_eq!(json["status"], "created");
    }

    #[test]
    fn merge_keeps_tracked_fields() {
        let mut state = sample(ContainerStatus::Running);
        state.started = Some(state.created);
        state.exit_code = 3;

        let report: RuntimeStateReport = serde_json::from_str(
            r#"{"ociVersion":"1.0.2","id":"abc","status":"stopped","pid":0,"bundle":"/b","rootfs":"/b/rootfs","owner":""}"#,
        )
        .unwrap();
        state.merge_report(report);

        assert_eq!(state.status, ContainerStatus::Stopped);
        assert_eq!(state.oci_version, "1.0.2");
        assert_eq!(state.bundle, "/b");
        assert_eq!(state.started, Some(state.created));
        assert_eq!(state.exit_code, 3);
    }

    #[test]
    fn mark_stopped_sets_finished() {
        let mut state = sample(ContainerStatus::Running);
        let now = Utc::now();
        state.mark_stopped(now);
        assert_eq!(state.status, ContainerStatus::Stopped);
        assert_eq!(state.finished, Some(now));
    }
}
