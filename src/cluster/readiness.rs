//! Readiness checks for a starting server.

use std::{
    fs,
    net::{TcpStream, ToSocketAddrs},
    path::Path,
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal,
    unistd::Pid,
};
use tracing::warn;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Line of `postmaster.pid` holding the postmaster status.
const PM_STATUS_LINE: usize = 7;

/// Waits until the postmaster reports `ready` and `port` accepts TCP
/// connections. Returns `false` if `timeout` elapses first.
pub(super) fn wait_until_ready(pid_file: &Path, port: u16, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if pid_file_reports_ready(pid_file) && is_listening(port) {
            return true;
        }
        if start.elapsed() >= timeout {
            warn!(port, ?timeout, "server did not become ready before timeout");
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn pid_file_reports_ready(pid_file: &Path) -> bool {
    fs::read_to_string(pid_file).is_ok_and(|contents| {
        contents
            .lines()
            .nth(PM_STATUS_LINE)
            .is_some_and(|status| status.trim() == "ready")
    })
}

/// Postmaster pid from the first line of `postmaster.pid`.
pub(super) fn postmaster_pid(pid_file: &Path) -> Option<Pid> {
    let contents = fs::read_to_string(pid_file).ok()?;
    let raw: i32 = contents.lines().next()?.trim().parse().ok()?;
    (raw > 0).then_some(Pid::from_raw(raw))
}

/// Whether `pid` names a live process, including one owned by another user.
pub(super) fn process_alive(pid: Pid) -> bool { matches!(signal::kill(pid, None), Ok(()) | Err(Errno::EPERM)) }

fn is_listening(port: u16) -> bool {
    ("localhost", port)
        .to_socket_addrs()
        .is_ok_and(|mut addrs| addrs.any(|addr| TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok()))
}
