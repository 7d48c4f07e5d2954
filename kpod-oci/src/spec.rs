//! The parts of the OCI runtime spec (`config.json`) the core reads.
//!
//! Unknown fields are kept in `extra` so a spec survives a round trip
//! through these types untouched.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// OCI runtime spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub oci_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Process section of `config.json`, also the payload of `--exec-process-spec`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(
        default,
        rename = "additionalGids",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub additional_gids: Vec<u32>,
}

impl Spec {
    /// Load `config.json` from a bundle directory.
    pub async fn load(bundle: &Path) -> Result<Self> {
        let data = tokio::fs::read(bundle.join("config.json")).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}

impl Process {
    /// Process spec for an exec: same user, cwd and env as the container,
    /// the given command and the extra monitor environment appended.
    pub fn for_exec(&self, command: &[String], extra_env: &[String]) -> Self {
        let mut process = self.clone();
        process.args = command.to_vec();
        process.env.extend(extra_env.iter().cloned());
        process
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_survive() {
        let raw = r#"{
            "ociVersion": "1.0.2",
            "process": {
                "terminal": false,
                "user": {"uid": 0, "gid": 0},
                "args": ["sh"],
                "env": ["PATH=/bin"],
                "cwd": "/",
                "capabilities": {"bounding": ["CAP_KILL"]}
            },
            "root": {"path": "rootfs", "readonly": true},
            "hostname": "box"
        }"#;
        let spec: Spec = serde_json::from_str(raw).unwrap();
        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back["root"]["readonly"], true);
        assert_eq!(back["process"]["capabilities"]["bounding"][0], "CAP_KILL");
        assert_eq!(back["hostname"], "box");
    }

    #[test]
    fn exec_process_replaces_args_and_appends_env() {
        let process = Process {
            args: vec!["nginx".into()],
            env: vec!["PATH=/bin".into()],
            cwd: "/srv".into(),
            ..Default::default()
        };
        let exec = process.for_exec(&["ls".into(), "-l".into()], &["FOO=bar".into()]);
        assert_eq!(exec.args, vec!["ls", "-l"]);
        assert_eq!(exec.env, vec!["PATH=/bin", "FOO=bar"]);
        assert_eq!(exec.cwd, "/srv");
    }
}
