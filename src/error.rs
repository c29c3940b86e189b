//! Errors surfaced by the orchestrator.

use std::{fmt, io, path::PathBuf};

use thiserror::Error;

use crate::{cluster::ClusterError, config::ConfigError, connection::ConnectionError};

/// Conditions that make provisioning impossible. Never retried.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// No usable `pg_config` was found.
    #[error("cannot find 'default' pg_config")]
    NoInstallation,
    /// Every probed port was unavailable.
    #[error("failed to find a port for the test cluster")]
    PortsExhausted,
}

/// Step of first-time bootstrap that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    /// Creating the data directory.
    Init,
    /// Probing for a free port.
    ProbePort,
    /// Writing server settings.
    Configure,
    /// Launching the server.
    Start,
    /// Waiting for the server to accept connections.
    WaitReady,
    /// Opening the administrative connection.
    Connect,
    /// Checking for or creating the test database.
    EnsureDatabase,
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::ProbePort => "port probe",
            Self::Configure => "configure",
            Self::Start => "start",
            Self::WaitReady => "readiness wait",
            Self::Connect => "connect",
            Self::EnsureDatabase => "test database setup",
        })
    }
}

/// Underlying failure of a bootstrap step.
#[derive(Debug, Error)]
pub enum BootstrapCause {
    /// Cluster control failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    /// A query on the administrative connection failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// The port probe hit a bind error that is not retried.
    #[error(transparent)]
    Probe(#[from] io::Error),
}

/// Errors returned by [`ClusterOrchestrator`](crate::ClusterOrchestrator).
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Provisioning cannot proceed.
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    /// Harness configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// First-time bootstrap failed; the cluster was rolled back.
    #[error("bootstrapping cluster at {path} failed during {step}: {source}")]
    Bootstrap {
        /// Cluster directory.
        path: PathBuf,
        /// Step that failed.
        step: BootstrapStep,
        /// Underlying failure.
        source: BootstrapCause,
    },
    /// Rollback after a failed bootstrap could not drop the cluster.
    #[error("rollback of {path} after a failed bootstrap also failed: {rollback}")]
    RollbackFailed {
        /// Cluster directory.
        path: PathBuf,
        /// The failure that triggered rollback.
        #[source]
        cause: Box<HarnessError>,
        /// The failure raised while dropping the cluster.
        rollback: ClusterError,
    },
    /// A previously initialised cluster could not be started again. The
    /// directory is left in place.
    #[error("restarting cluster at {path} failed: {source}")]
    ReuseStart {
        /// Cluster directory.
        path: PathBuf,
        /// Underlying failure.
        source: ClusterError,
    },
    /// A data directory left by an earlier run could not be removed.
    #[error("removing stale cluster at {path} failed: {source}")]
    StaleCluster {
        /// Cluster directory.
        path: PathBuf,
        /// Underlying failure.
        source: ClusterError,
    },
    /// The per-run connection could not be opened.
    #[error("connecting to cluster at {path} failed: {source}")]
    Connect {
        /// Cluster directory.
        path: PathBuf,
        /// Underlying failure.
        source: ClusterError,
    },
    /// Explicit teardown failed.
    #[error("tearing down cluster at {path} failed: {source}")]
    Teardown {
        /// Cluster directory.
        path: PathBuf,
        /// Underlying failure.
        source: ClusterError,
    },
}

impl HarnessError {
    /// The error that started the failure chain, looking through rollback
    /// wrappers.
    #[must_use]
    pub fn primary(&self) -> &Self {
        match self {
            Self::RollbackFailed { cause, .. } => cause.primary(),
            other => other,
        }
    }

    /// Returns `true` when provisioning was impossible.
    #[must_use]
    pub fn is_provisioning(&self) -> bool { matches!(self.primary(), Self::Provisioning(_)) }

    /// Returns `true` when no installation could be found.
    #[must_use]
    pub fn is_missing_installation(&self) -> bool {
        matches!(self.primary(), Self::Provisioning(ProvisioningError::NoInstallation))
    }

    /// The failed bootstrap step, if this is a bootstrap failure.
    #[must_use]
    pub fn bootstrap_step(&self) -> Option<BootstrapStep> {
        match self.primary() {
            Self::Bootstrap { step, .. } => Some(*step),
            _ => None,
        }
    }
}
