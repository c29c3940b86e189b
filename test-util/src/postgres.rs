//! Gating for tests that drive a real `PostgreSQL` toolchain.

use nix::unistd::geteuid;
use pg_test_cluster::Installation;
use tracing::warn;

/// Returns the local installation, or `None` when these tests cannot run
/// here.
///
/// `initdb` refuses to run as root, and CI images may lack `pg_config`
/// entirely; both cases skip rather than fail.
#[must_use]
pub fn installation_or_skip() -> Option<Installation> {
    if geteuid().is_root() {
        warn!("skipping test: initdb cannot run as root");
        return None;
    }
    let installation = Installation::discover();
    if installation.is_none() {
        warn!("skipping test: no pg_config found");
    }
    installation
}
