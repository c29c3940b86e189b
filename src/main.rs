//! Provisions a disposable `PostgreSQL` cluster and prints its DSN.
//!
//! Logs go to stderr and are filtered by `RUST_LOG` (default `warn`). The
//! binary exits with status `0` on success and `1` on error.

use std::{io, process::exit};

use clap::Parser;
use pg_test_cluster::cli::{Cli, run};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[expect(clippy::print_stderr, reason = "top-level error report")]
fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(e) = run(&cli, &mut io::stdin().lock(), &mut io::stdout().lock()) {
        eprintln!("pg-test-cluster: {e:#}");
        exit(1);
    }
}
