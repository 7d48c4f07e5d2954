//! kpod-oci - container lifecycle core.
//!
//! Drives containers through create, start, stop, exec, status, pause,
//! resume and delete by talking to two external programs: an OCI runtime
//! binary (runc-like) and a small per-container monitor that forks the
//! container and reports back over pipes.
//!
//! ## Architecture
//!
//! - **Runtime**: stateless supervisor, one per daemon
//! - **Container**: the record of one container; its state sits behind an
//!   op lock that serializes lifecycle operations on it
//! - **ProcessLauncher**: the seam to the OS; tests swap in a scripted one
//!
//! ## Create handshake
//!
//! The monitor gets a sync pipe (fd 3) and a start pipe (fd 4). We move it
//! into the sandbox cgroup, release it with a start signal, and then wait
//! for it to report the container PID on the sync pipe.

pub mod backoff;
pub mod cgroup;
pub mod config;
pub mod container;
pub mod error;
pub mod pipe;
pub mod process;
pub mod runtime;
pub mod spec;
pub mod state;
pub mod store;

pub use config::{CgroupManager, RuntimeConfig, WorkloadTrust};
pub use container::{Container, ContainerConfig, ContainerMetadata, ContainerVolume};
pub use error::{Error, Result};
pub use runtime::{ExecSyncResponse, Runtime};
pub use state::{ContainerState, ContainerStatus};
pub use store::ContainerStore;
