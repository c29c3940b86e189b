//! Command-line entry point for provisioning a cluster by hand.
//!
//! `pg-test-cluster` brings up the same cluster a test suite would get,
//! prints the DSN of its `test` database, and drops it again.

use std::io::{BufRead, Write};

use anyhow::Context as _;
use clap::Parser;

use crate::{
    cluster::PgCluster,
    config::HarnessConfig,
    database::DatabaseName,
    orchestrator::ADMIN_USER,
    suite::{provision, require_installation},
};

/// Arguments accepted by `pg-test-cluster`.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Cli {
    /// Suite name used in the cluster directory name.
    #[arg(long, default_value = "cli")]
    pub suite: String,
    /// Keep the cluster running until a line is read from stdin.
    #[arg(long)]
    pub hold: bool,
}

/// Provisions a cluster, reports its DSN on `out`, and tears it down.
///
/// Exits the process with status 1 if no installation can be found.
///
/// # Errors
///
/// Returns an error if configuration, bootstrap, or teardown fails.
pub fn run(cli: &Cli, input: &mut impl BufRead, out: &mut impl Write) -> anyhow::Result<()> {
    let config = HarnessConfig::load()?;
    let installation = require_installation();
    let mut orchestrator = provision(&cli.suite, installation, &config);
    orchestrator
        .ensure_ready()
        .with_context(|| format!("provisioning cluster for suite {}", cli.suite))?;

    let cluster: &PgCluster = orchestrator.cluster();
    let dsn = cluster.dsn(ADMIN_USER, &DatabaseName::test())?;
    writeln!(out, "{dsn}")?;
    out.flush()?;
    if cli.hold {
        let mut line = String::new();
        input.read_line(&mut line).context("waiting for release on stdin")?;
    }
    orchestrator.teardown()?;
    Ok(())
}
