//! Disposable `PostgreSQL` clusters for test suites.
//!
//! Each test suite gets its own cluster: a data directory created with
//! `initdb` under a free port, started with `pg_ctl`, and holding a `test`
//! database. [`ClusterOrchestrator::ensure_ready`] brings a cluster to that
//! state idempotently, rolling back a half-built directory when first-time
//! bootstrap fails. A cleanup obligation registered with [`ExitHooks`] drops
//! the cluster when the process exits unless it was torn down earlier.
//!
//! Suites normally go through [`with_suite_cluster`], which shares one
//! cluster per suite name across the process:
//!
//! ```no_run
//! use pg_test_cluster::with_suite_cluster;
//!
//! let answer = with_suite_cluster("DriverTests", |conn| {
//!     conn.query_one("select 1 + 1", &[]).map(|row| row.get::<_, i32>(0))
//! })
//! .expect("cluster is ready")
//! .expect("query succeeds");
//! assert_eq!(answer, 2);
//! ```

pub mod cli;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod database;
pub mod dsn;
pub mod error;
pub mod exit_hooks;
pub mod installation;
pub mod orchestrator;
pub mod port;
pub mod settings;
pub mod suite;

pub use cluster::{Cluster, ClusterError, ClusterState, PgCluster};
pub use config::HarnessConfig;
pub use connection::{AdminConnection, ConnectionError, PgConnection};
pub use database::DatabaseName;
pub use dsn::{Dsn, DsnError};
pub use error::{BootstrapStep, HarnessError, ProvisioningError};
pub use exit_hooks::{ExitHooks, HookId, process_hooks};
pub use installation::Installation;
pub use orchestrator::{ClusterOrchestrator, Readiness};
pub use port::{PortProbe, PortSource};
pub use settings::ServerSettings;
pub use suite::{suite_cluster, suite_name, try_installation, with_suite_cluster};
