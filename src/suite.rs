//! Process-wide clusters keyed by test suite.
//!
//! Each suite gets one cluster per process, created on first use and dropped
//! at process exit unless torn down earlier.

use std::{
    any::type_name,
    collections::HashMap,
    io::{self, Write},
    process,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use tracing::debug;

use crate::{
    cluster::{PgCluster, cluster_dir_name},
    config::HarnessConfig,
    connection::PgConnection,
    error::{HarnessError, ProvisioningError},
    exit_hooks::process_hooks,
    installation::{INSTALLATION_ENV, Installation},
    orchestrator::ClusterOrchestrator,
    port::PortProbe,
};

/// The orchestrator used for real suites.
pub type SuiteCluster = ClusterOrchestrator<PgCluster, PortProbe>;

type Registry = Mutex<HashMap<String, Arc<Mutex<SuiteCluster>>>>;

static SUITES: OnceLock<Registry> = OnceLock::new();

/// Suite name for type `T`: its unqualified name without generic arguments.
#[must_use]
pub fn suite_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Writes the diagnostic shown when no installation can be found.
///
/// # Errors
///
/// Returns any error from writing to `out`.
pub fn write_missing_installation(out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "ERROR: cannot find 'default' pg_config")?;
    writeln!(
        out,
        "HINT: set the {INSTALLATION_ENV} environment variable to the `pg_config` path"
    )
}

/// Discovers the installation without ending the process.
///
/// # Errors
///
/// Returns [`ProvisioningError::NoInstallation`] when no usable `pg_config`
/// is found.
pub fn try_installation() -> Result<Installation, HarnessError> {
    Installation::discover().ok_or_else(|| ProvisioningError::NoInstallation.into())
}

/// Returns the discovered installation or ends the process with status 1.
///
/// Nothing is written to the filesystem before the process exits.
#[must_use]
pub fn require_installation() -> Installation {
    try_installation().unwrap_or_else(|err| {
        debug!(error = %err, missing = err.is_missing_installation(), "no installation");
        if let Err(e) = write_missing_installation(&mut io::stderr().lock()) {
            debug!(error = %e, "could not report missing installation");
        }
        process::exit(1)
    })
}

/// Builds an orchestrator for `suite` under the configured cluster root.
#[must_use]
pub fn provision(suite: &str, installation: Installation, config: &HarnessConfig) -> SuiteCluster {
    let path = config
        .cluster_root
        .join(cluster_dir_name(process::id(), suite));
    let cluster = PgCluster::new(path, Arc::new(installation))
        .with_connect_timeout(config.connect_timeout());
    ClusterOrchestrator::new(cluster, PortProbe::new(), process_hooks())
        .with_start_timeout(config.start_timeout())
}

/// The shared orchestrator for `suite`, created on first use.
///
/// The process exits with status 1 if no installation can be found.
///
/// # Errors
///
/// Returns [`HarnessError::Config`] if the configuration is malformed.
pub fn suite_cluster(suite: &str) -> Result<Arc<Mutex<SuiteCluster>>, HarnessError> {
    let registry = SUITES.get_or_init(Registry::default);
    let mut suites = registry.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = suites.get(suite) {
        return Ok(Arc::clone(existing));
    }
    let config = HarnessConfig::load()?;
    let installation = require_installation();
    debug!(suite, version = installation.version(), "provisioning suite cluster");
    let cluster = Arc::new(Mutex::new(provision(suite, installation, &config)));
    suites.insert(suite.to_owned(), Arc::clone(&cluster));
    Ok(cluster)
}

/// Ensures the suite's cluster is ready and runs `body` with a connection
/// to its `test` database.
///
/// # Errors
///
/// Returns any error from provisioning, readiness, or connecting.
pub fn with_suite_cluster<F, R>(suite: &str, body: F) -> Result<R, HarnessError>
where
    F: FnOnce(&mut PgConnection) -> R,
{
    let cluster = suite_cluster(suite)?;
    let mut guard = cluster.lock().unwrap_or_else(PoisonError::into_inner);
    guard.run(body)
}
