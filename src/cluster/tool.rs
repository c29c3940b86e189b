//! Running toolchain binaries under a deadline.

use std::{
    path::Path,
    process::{Command, Output, Stdio},
    time::Duration,
};

use tracing::{debug, warn};
use wait_timeout::ChildExt;

use super::ClusterError;

/// Runs `cmd` to completion and returns its captured output.
///
/// The exit status is not checked here; see [`ensure_success`]. Tools are
/// expected to print little: output beyond the pipe buffer stalls the child
/// until the deadline kills it.
pub(super) fn run(mut cmd: Command, tool: &str, timeout: Duration) -> Result<Output, ClusterError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    debug!(?cmd, "running toolchain binary");
    let spawn_err = |source: std::io::Error| ClusterError::Spawn {
        tool: tool.to_owned(),
        source,
    };
    let mut child = cmd.spawn().map_err(spawn_err)?;
    match child.wait_timeout(timeout).map_err(spawn_err)? {
        Some(_) => child.wait_with_output().map_err(spawn_err),
        None => {
            warn!(tool, ?timeout, "toolchain binary timed out; killing it");
            if let Err(e) = child.kill() {
                warn!(tool, error = %e, "failed to kill timed out binary");
            }
            if let Err(e) = child.wait() {
                warn!(tool, error = %e, "failed to reap timed out binary");
            }
            Err(ClusterError::ToolTimeout {
                tool: tool.to_owned(),
                timeout,
            })
        }
    }
}

/// Converts an unsuccessful exit into [`ClusterError::Tool`].
pub(super) fn ensure_success(output: &Output, tool: &str, path: &Path) -> Result<(), ClusterError> {
    if output.status.success() {
        return Ok(());
    }
    Err(ClusterError::Tool {
        tool: tool.to_owned(),
        path: path.to_path_buf(),
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    })
}
