//! Lifecycle orchestration for one suite's cluster.
//!
//! [`ClusterOrchestrator::ensure_ready`] takes a cluster from whatever state it
//! is in to "running with a `test` database". First-time bootstrap is
//! transactional: any failure drops the data directory again before the error
//! is returned. Restarting a cluster that bootstrapped earlier in this process
//! is not; a failed restart leaves the directory for inspection.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tracing::{error, info, warn};

use crate::{
    cluster::{Cluster, ClusterError, ClusterState, InitOptions},
    database::{DatabaseName, ensure_database},
    error::{BootstrapCause, BootstrapStep, HarnessError, ProvisioningError},
    exit_hooks::{ExitHooks, HookId},
    port::{PortProbe, PortSource},
    settings::ServerSettings,
};

/// Superuser created by bootstrap and used for every connection.
pub const ADMIN_USER: &str = "test";

/// Server encoding of every test cluster.
pub const CLUSTER_ENCODING: &str = "utf-8";

/// How long to wait for a starting server by default.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);

/// What [`ClusterOrchestrator::ensure_ready`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A fresh data directory was created and started.
    Bootstrapped,
    /// An existing data directory was started again.
    Restarted,
    /// The server was already running.
    AlreadyRunning,
}

/// Owns one cluster and drives it through its lifecycle.
#[derive(Debug)]
pub struct ClusterOrchestrator<C, P = PortProbe> {
    cluster: C,
    probe: P,
    hooks: Arc<ExitHooks>,
    obligation: Option<HookId>,
    bootstrapped: bool,
    has_run: bool,
    start_timeout: Duration,
}

fn bootstrap_failed<E>(path: &Path, step: BootstrapStep) -> impl FnOnce(E) -> HarnessError + '_
where
    E: Into<BootstrapCause>,
{
    move |e| HarnessError::Bootstrap {
        path: path.to_path_buf(),
        step,
        source: e.into(),
    }
}

fn reuse_failed(path: &Path) -> impl Fn(ClusterError) -> HarnessError + '_ {
    move |source| HarnessError::ReuseStart {
        path: path.to_path_buf(),
        source,
    }
}

impl<C: Cluster, P: PortSource> ClusterOrchestrator<C, P> {
    /// Takes ownership of `cluster`. Cleanup obligations go to `hooks`.
    pub fn new(cluster: C, probe: P, hooks: Arc<ExitHooks>) -> Self {
        Self {
            cluster,
            probe,
            hooks,
            obligation: None,
            bootstrapped: false,
            has_run: false,
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }

    /// Overrides how long a start may take before it is reported as failed.
    #[must_use]
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// The managed cluster.
    pub const fn cluster(&self) -> &C { &self.cluster }

    /// The registered cleanup obligation, if any.
    pub const fn obligation(&self) -> Option<HookId> { self.obligation }

    fn path(&self) -> PathBuf { self.cluster.path().to_path_buf() }

    /// Current lifecycle state of the cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the server status cannot be queried.
    pub fn state(&self) -> Result<ClusterState, ClusterError> {
        if !self.cluster.initialized() {
            return Ok(ClusterState::Uninitialized);
        }
        if self.cluster.running()? {
            return Ok(ClusterState::Running);
        }
        Ok(if self.has_run {
            ClusterState::Stopped
        } else {
            ClusterState::Initialized
        })
    }

    /// Makes sure the cluster exists, runs, and has a `test` database.
    ///
    /// A data directory this orchestrator did not create is treated as debris
    /// from an earlier process and dropped first.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::Provisioning`] when no port could be found;
    /// - [`HarnessError::Bootstrap`] when a bootstrap step fails;
    /// - [`HarnessError::RollbackFailed`] when, in addition, the cluster could
    ///   not be dropped afterwards;
    /// - [`HarnessError::ReuseStart`] when restarting an existing cluster fails;
    /// - [`HarnessError::StaleCluster`] when leftover data cannot be removed.
    pub fn ensure_ready(&mut self) -> Result<Readiness, HarnessError> {
        if !self.bootstrapped && self.cluster.initialized() {
            let path = self.path();
            warn!(path = %path.display(), "dropping cluster left by an earlier run");
            self.cluster
                .drop_cluster()
                .map_err(|source| HarnessError::StaleCluster { path, source })?;
        }
        if !self.cluster.initialized() {
            self.bootstrap()?;
            return Ok(Readiness::Bootstrapped);
        }
        self.restart_if_needed()
    }

    fn bootstrap(&mut self) -> Result<(), HarnessError> {
        info!(path = %self.cluster.path().display(), "bootstrapping test cluster");
        match self.bootstrap_steps() {
            Ok(()) => {
                self.bootstrapped = true;
                self.has_run = true;
                Ok(())
            }
            Err(cause) => Err(self.roll_back(cause)),
        }
    }

    fn bootstrap_steps(&mut self) -> Result<(), HarnessError> {
        let path = self.path();
        let options = InitOptions {
            user: ADMIN_USER,
            encoding: CLUSTER_ENCODING,
        };
        self.cluster
            .init(&options)
            .map_err(bootstrap_failed(&path, BootstrapStep::Init))?;
        self.register_obligation();

        let port = self
            .probe
            .find_port()
            .map_err(bootstrap_failed(&path, BootstrapStep::ProbePort))?
            .ok_or(ProvisioningError::PortsExhausted)?;
        self.cluster
            .configure(&ServerSettings::for_test_cluster(port))
            .map_err(bootstrap_failed(&path, BootstrapStep::Configure))?;
        self.cluster
            .start()
            .map_err(bootstrap_failed(&path, BootstrapStep::Start))?;
        self.cluster
            .wait_until_started(self.start_timeout)
            .map_err(bootstrap_failed(&path, BootstrapStep::WaitReady))?;

        let mut admin = self
            .cluster
            .connect(ADMIN_USER, &DatabaseName::template1())
            .map_err(bootstrap_failed(&path, BootstrapStep::Connect))?;
        let created = ensure_database(&mut admin, &DatabaseName::test())
            .map_err(bootstrap_failed(&path, BootstrapStep::EnsureDatabase))?;
        drop(admin);
        info!(path = %path.display(), port, created, "initialized test database");
        Ok(())
    }

    fn register_obligation(&mut self) {
        if let Some(previous) = self.obligation.take() {
            self.hooks.cancel(previous);
        }
        self.obligation = Some(self.hooks.register(self.cluster.cleanup_action()));
    }

    /// Drops the half-built cluster and hands back the error to report.
    ///
    /// The exit obligation is cancelled only once the drop succeeded; if it
    /// failed the obligation gets another attempt at exit.
    fn roll_back(&mut self, cause: HarnessError) -> HarnessError {
        let path = self.path();
        warn!(path = %path.display(), error = %cause, "bootstrap failed; rolling back");
        match self.cluster.drop_cluster() {
            Ok(()) => {
                if let Some(id) = self.obligation.take() {
                    self.hooks.cancel(id);
                }
                cause
            }
            Err(rollback) => {
                error!(path = %path.display(), error = %rollback, "rollback failed");
                HarnessError::RollbackFailed {
                    path,
                    cause: Box::new(cause),
                    rollback,
                }
            }
        }
    }

    fn restart_if_needed(&mut self) -> Result<Readiness, HarnessError> {
        let path = self.path();
        let state = self.state().map_err(reuse_failed(&path))?;
        if state == ClusterState::Running {
            return Ok(Readiness::AlreadyRunning);
        }
        info!(path = %path.display(), ?state, "restarting test cluster");
        self.cluster.start().map_err(reuse_failed(&path))?;
        self.cluster
            .wait_until_started(self.start_timeout)
            .map_err(reuse_failed(&path))?;
        self.has_run = true;
        Ok(Readiness::Restarted)
    }

    /// Opens a connection to the `test` database as the admin user.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Connect`] if the server cannot be reached.
    pub fn connect(&self) -> Result<C::Connection, HarnessError> {
        self.cluster
            .connect(ADMIN_USER, &DatabaseName::test())
            .map_err(|source| HarnessError::Connect {
                path: self.path(),
                source,
            })
    }

    /// Ensures readiness, then runs `body` with a connection that is closed
    /// when `body` returns or unwinds.
    ///
    /// # Errors
    ///
    /// Returns any error from [`ensure_ready`](Self::ensure_ready) or
    /// [`connect`](Self::connect); `body` itself is not run in that case.
    pub fn run<F, R>(&mut self, body: F) -> Result<R, HarnessError>
    where
        F: FnOnce(&mut C::Connection) -> R,
    {
        self.ensure_ready()?;
        let mut connection = self.connect()?;
        let outcome = body(&mut connection);
        drop(connection);
        Ok(outcome)
    }

    /// Stops and drops the cluster now and cancels the exit obligation.
    ///
    /// A later [`ensure_ready`](Self::ensure_ready) bootstraps from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Teardown`] if the cluster cannot be dropped;
    /// the obligation then stays registered.
    pub fn teardown(&mut self) -> Result<(), HarnessError> {
        self.cluster
            .drop_cluster()
            .map_err(|source| HarnessError::Teardown {
                path: self.path(),
                source,
            })?;
        if let Some(id) = self.obligation.take() {
            self.hooks.cancel(id);
        }
        self.bootstrapped = false;
        self.has_run = false;
        info!(path = %self.cluster.path().display(), "tore down test cluster");
        Ok(())
    }
}
