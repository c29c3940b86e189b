//! The cluster collaborator: one data directory and the server running on it.
//!
//! [`Cluster`] is the seam the orchestrator drives. [`PgCluster`] implements
//! it with `initdb` and `pg_ctl` from a discovered [`Installation`].
//!
//! [`Installation`]: crate::installation::Installation

mod pg;
mod readiness;
mod tool;

use std::{
    io,
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};

pub use pg::PgCluster;
use thiserror::Error;

use crate::{
    connection::{AdminConnection, ConnectionError},
    database::DatabaseName,
    exit_hooks::ExitAction,
    settings::ServerSettings,
};

/// Prefix of every cluster directory name.
pub const CLUSTER_DIR_PREFIX: &str = "py_unittest_postgresql_cluster_";

/// Directory name for the cluster of `suite` in process `pid`.
///
/// Including the process id keeps concurrent test processes on one host
/// apart; the suite name keeps suites within a process apart.
#[must_use]
pub fn cluster_dir_name(pid: u32, suite: &str) -> String {
    format!("{CLUSTER_DIR_PREFIX}{pid}_{suite}")
}

/// Parameters for creating a data directory.
#[derive(Debug, Clone, Copy)]
pub struct InitOptions<'a> {
    /// Name of the bootstrap superuser.
    pub user: &'a str,
    /// Server-side character encoding.
    pub encoding: &'a str,
}

/// Lifecycle of a cluster as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// No data directory.
    Uninitialized,
    /// Data directory exists; the server has not run under this handle.
    Initialized,
    /// The server accepts connections.
    Running,
    /// Data directory exists; the server ran earlier and is now down.
    Stopped,
}

/// Failure of a cluster control operation.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A toolchain binary could not be launched or waited on.
    #[error("failed to run {tool}: {source}")]
    Spawn {
        /// Binary name.
        tool: String,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// A toolchain binary exited unsuccessfully.
    #[error("{tool} failed for {path} ({status}): {stderr}")]
    Tool {
        /// Binary name.
        tool: String,
        /// Cluster directory.
        path: PathBuf,
        /// Exit status description.
        status: ExitStatus,
        /// Trimmed standard error of the binary.
        stderr: String,
    },
    /// A toolchain binary ran past its deadline and was killed.
    #[error("{tool} did not finish within {timeout:?}")]
    ToolTimeout {
        /// Binary name.
        tool: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// Filesystem access to the cluster directory failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The server did not report ready in time.
    #[error("cluster at {path} did not become ready within {timeout:?}")]
    StartTimeout {
        /// Cluster directory.
        path: PathBuf,
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// `start` was called before a port was configured.
    #[error("cluster at {path} has no port configured")]
    MissingPort {
        /// Cluster directory.
        path: PathBuf,
    },
    /// A connection to the cluster could not be opened.
    #[error("connecting to cluster at {path} failed: {source}")]
    Connect {
        /// Cluster directory.
        path: PathBuf,
        /// Client error.
        source: ConnectionError,
    },
}

impl ClusterError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One provisioned data directory and the server process that uses it.
pub trait Cluster {
    /// Connection type returned by [`connect`](Self::connect).
    type Connection: AdminConnection;

    /// Directory identifying this cluster.
    fn path(&self) -> &Path;

    /// Encoding chosen at [`init`](Self::init), if it has run.
    fn encoding(&self) -> Option<&str>;

    /// Settings merged so far.
    fn settings(&self) -> &ServerSettings;

    /// Whether a data directory exists at [`path`](Self::path).
    fn initialized(&self) -> bool;

    /// Whether a server process is running on the data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be determined.
    fn running(&self) -> Result<bool, ClusterError>;

    /// Creates the data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be initialised.
    fn init(&mut self, options: &InitOptions<'_>) -> Result<(), ClusterError>;

    /// Merges `settings` into the persisted configuration; set keys win.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    fn configure(&mut self, settings: &ServerSettings) -> Result<(), ClusterError>;

    /// Launches the server without waiting for it to accept connections.
    ///
    /// # Errors
    ///
    /// Returns an error if no port is configured or the launch fails.
    fn start(&mut self) -> Result<(), ClusterError>;

    /// Blocks until the server accepts connections or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::StartTimeout`] when the deadline passes.
    fn wait_until_started(&mut self, timeout: Duration) -> Result<(), ClusterError>;

    /// Stops the server if it is running.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be stopped.
    fn stop(&mut self) -> Result<(), ClusterError>;

    /// Stops the server if needed and removes the data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    fn drop_cluster(&mut self) -> Result<(), ClusterError>;

    /// A detached action equivalent to [`drop_cluster`](Self::drop_cluster),
    /// suitable for running at process exit.
    fn cleanup_action(&self) -> ExitAction;

    /// Opens a connection as `user` to `database`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached.
    fn connect(&self, user: &str, database: &DatabaseName) -> Result<Self::Connection, ClusterError>;
}
