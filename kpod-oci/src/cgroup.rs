//! Placing the monitor process into the sandbox cgroup.
//!
//! Placement happens between spawning the monitor and releasing it through
//! the start pipe, so the container process it forks inherits the cgroup.
//! The cgroup outlives the monitor; whoever deletes the container releases
//! it with [`release`].

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::CgroupManager;
use crate::error::{Error, Result};
use crate::process::{CommandSpec, ProcessLauncher};

/// Name prefix of monitor cgroups and scope units.
pub const MONITOR_CGROUP_PREFIX: &str = "kpod-monitor";

const BUSCTL: &str = "busctl";
const SYSTEMCTL: &str = "systemctl";

/// Where a monitor was placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCgroup {
    /// A systemd transient scope unit.
    Scope { unit: String, slice: String },
    /// cgroupfs directories, one per mounted hierarchy.
    Paths(Vec<PathBuf>),
}

/// Systemd scope unit name for a container's monitor.
pub fn scope_unit(id: &str) -> String {
    format!("{MONITOR_CGROUP_PREFIX}-{id}.scope")
}

/// cpuset files a v1 cpuset cgroup needs before it accepts tasks.
const CPUSET_FILES: [&str; 2] = ["cpuset.cpus", "cpuset.mems"];

async fn is_unified(root: &Path) -> io::Result<bool> {
    tokio::fs::try_exists(root.join("cgroup.controllers")).await
}

/// cgroupfs directories for a container's monitor under `root`.
///
/// On the unified hierarchy this is a single directory; on v1 there is one
/// per mounted controller. Symlinked controllers (`cpu -> cpu,cpuacct`)
/// are skipped since they alias a real directory.
pub async fn cgroupfs_paths(root: &Path, parent: &str, id: &str) -> io::Result<Vec<PathBuf>> {
    let leaf = format!("{MONITOR_CGROUP_PREFIX}-{id}");
    let parent = parent.trim_start_matches('/');

    if is_unified(root).await? {
        return Ok(vec![root.join(parent).join(leaf)]);
    }

    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        paths.push(entry.path().join(parent).join(&leaf));
    }
    paths.sort();
    Ok(paths)
}

/// Move `pid` into the monitor cgroup for container `id`.
///
/// With cgroupfs every hierarchy is attempted; a controller that rejects
/// the PID does not keep the monitor out of the others. The error lists
/// every controller that failed.
pub async fn place_monitor(
    launcher: &dyn ProcessLauncher,
    manager: CgroupManager,
    cgroup_root: &Path,
    cgroup_parent: &str,
    id: &str,
    pid: u32,
) -> Result<MonitorCgroup> {
    match manager {
        CgroupManager::Systemd => {
            let unit = scope_unit(id);
            info!(container_id = %id, pid, slice = %cgroup_parent, unit = %unit, "Running monitor under systemd scope");
            start_transient_scope(launcher, id, &unit, cgroup_parent, pid).await?;
            Ok(MonitorCgroup::Scope {
                unit,
                slice: cgroup_parent.to_string(),
            })
        }
        CgroupManager::Cgroupfs => {
            let unified = is_unified(cgroup_root).await?;
            let paths = cgroupfs_paths(cgroup_root, cgroup_parent, id).await?;

            let mut failures = Vec::new();
            for path in &paths {
                match join_cgroup(cgroup_root, path, unified, pid).await {
                    Ok(()) => debug!(container_id = %id, pid, path = %path.display(), "Monitor joined cgroup"),
                    Err(e) => {
                        warn!(container_id = %id, pid, path = %path.display(), error = %e, "Monitor failed to join cgroup");
                        failures.push(format!("{}: {e}", path.display()));
                    }
                }
            }
            if !failures.is_empty() {
                return Err(Error::Cgroup {
                    id: id.to_string(),
                    reason: format!(
                        "joined {} of {} cgroups, failed: {}",
                        paths.len() - failures.len(),
                        paths.len(),
                        failures.join("; ")
                    ),
                });
            }
            Ok(MonitorCgroup::Paths(paths))
        }
    }
}

async fn join_cgroup(root: &Path, path: &Path, unified: bool, pid: u32) -> io::Result<()> {
    tokio::fs::create_dir_all(path).await?;
    if !unified && controller_of(root, path).is_some_and(|c| c.split(',').any(|c| c == "cpuset")) {
        inherit_cpuset(root, path).await?;
    }
    tokio::fs::write(path.join("cgroup.procs"), pid.to_string()).await
}

/// Name of the v1 hierarchy directory `path` lives in.
fn controller_of<'a>(root: &Path, path: &'a Path) -> Option<&'a str> {
    path.strip_prefix(root).ok()?.components().next()?.as_os_str().to_str()
}

/// Fill empty `cpuset.cpus`/`cpuset.mems` from the parent on every level
/// between the hierarchy root and `leaf`, top down.
async fn inherit_cpuset(root: &Path, leaf: &Path) -> io::Result<()> {
    let Some(controller) = controller_of(root, leaf) else {
        return Ok(());
    };
    let mut parent = root.join(controller);
    let Ok(rel) = leaf.strip_prefix(&parent) else {
        return Ok(());
    };
    for component in rel.components() {
        let dir = parent.join(component);
        for file in CPUSET_FILES {
            if !read_trimmed(&dir.join(file)).await?.is_empty() {
                continue;
            }
            let inherited = read_trimmed(&parent.join(file)).await?;
            if !inherited.is_empty() {
                tokio::fs::write(dir.join(file), inherited).await?;
            }
        }
        parent = dir;
    }
    Ok(())
}

/// File contents without surrounding whitespace; a missing file reads as empty.
async fn read_trimmed(path: &Path) -> io::Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(s.trim().to_string()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

async fn start_transient_scope(
    launcher: &dyn ProcessLauncher,
    id: &str,
    unit: &str,
    slice: &str,
    pid: u32,
) -> Result<()> {
    let mut props: Vec<String> = vec!["PIDs".into(), "au".into(), "1".into(), pid.to_string()];
    if !slice.is_empty() {
        props.extend(["Slice".into(), "s".into(), slice.to_string()]);
    }
    props.extend(["Delegate".into(), "b".into(), "true".into()]);
    let count = if slice.is_empty() { 2 } else { 3 };

    let cmd = CommandSpec::new(BUSCTL)
        .args([
            "call",
            "org.freedesktop.systemd1",
            "/org/freedesktop/systemd1",
            "org.freedesktop.systemd1.Manager",
            "StartTransientUnit",
            "ssa(sv)a(sa(sv))",
            unit,
            "replace",
        ])
        .arg(count.to_string())
        .args(props)
        .arg("0")
        .captured();
    run_checked(launcher, id, cmd).await
}

/// Undo [`place_monitor`]. Already removed cgroups are not an error.
pub async fn release(launcher: &dyn ProcessLauncher, id: &str, cgroup: &MonitorCgroup) -> Result<()> {
    match cgroup {
        MonitorCgroup::Scope { unit, .. } => {
            let cmd = CommandSpec::new(SYSTEMCTL).args(["stop", unit]).captured();
            run_checked(launcher, id, cmd).await
        }
        MonitorCgroup::Paths(paths) => {
            for path in paths {
                match tokio::fs::remove_dir(path).await {
                    Ok(()) => debug!(container_id = %id, path = %path.display(), "Removed monitor cgroup"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        }
    }
}

async fn run_checked(launcher: &dyn ProcessLauncher, id: &str, cmd: CommandSpec) -> Result<()> {
    let command = cmd.display();
    let program = cmd.program.clone();
    let output = launcher.output(cmd).await.map_err(|source| Error::Spawn {
        id: id.to_string(),
        program,
        source,
    })?;
    if !output.status.success() {
        return Err(Error::RuntimeCommand {
            id: id.to_string(),
            command,
            reason: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}
