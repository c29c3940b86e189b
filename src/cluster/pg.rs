//! [`Cluster`] backed by `initdb` and `pg_ctl`.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use nix::sys::signal::{self, Signal};
use tracing::{debug, error, info, warn};

use super::{Cluster, ClusterError, InitOptions, readiness, tool};
use crate::{
    connection::{ConnectionError, PgConnection},
    database::DatabaseName,
    dsn::Dsn,
    exit_hooks::ExitAction,
    installation::Installation,
    settings::{ServerSettings, merge_conf},
};

const INITDB_TIMEOUT: Duration = Duration::from_secs(120);
const PG_CTL_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_secs(5);
const KILL_POLL: Duration = Duration::from_millis(50);

/// A cluster whose data directory lives at a fixed path on this host.
#[derive(Debug, Clone)]
pub struct PgCluster {
    path: PathBuf,
    installation: Arc<Installation>,
    settings: ServerSettings,
    encoding: Option<String>,
    connect_timeout: Duration,
}

impl PgCluster {
    /// Creates a handle; nothing touches the filesystem until [`Cluster::init`].
    pub fn new(path: impl Into<PathBuf>, installation: Arc<Installation>) -> Self {
        Self {
            path: path.into(),
            installation,
            settings: ServerSettings::default(),
            encoding: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the client connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The toolchain this cluster runs.
    #[must_use]
    pub fn installation(&self) -> &Installation { &self.installation }

    /// Connection string for `user` on `database`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::MissingPort`] before a port is configured.
    pub fn dsn(&self, user: &str, database: &DatabaseName) -> Result<Dsn, ClusterError> {
        let port = self.port()?;
        Ok(Dsn::default()
            .with("host", "localhost")
            .with("port", port.to_string())
            .with("user", user)
            .with("dbname", database.as_ref()))
    }

    /// Server log written by `pg_ctl start`.
    #[must_use]
    pub fn log_file(&self) -> PathBuf { self.path.join("server.log") }

    fn port(&self) -> Result<u16, ClusterError> {
        self.settings.port.ok_or_else(|| ClusterError::MissingPort {
            path: self.path.clone(),
        })
    }

    fn pg_ctl(&self) -> Command {
        let mut cmd = Command::new(self.installation.binary("pg_ctl"));
        cmd.arg("-D").arg(&self.path);
        cmd
    }

    fn pid_file(&self) -> PathBuf { self.path.join("postmaster.pid") }

    /// Immediate shutdown, then `SIGKILL` to the postmaster if that fails too.
    fn force_stop(&self) {
        let mut cmd = self.pg_ctl();
        cmd.args(["stop", "-m", "immediate", "-w", "-s"]);
        let immediate = tool::run(cmd, "pg_ctl", PG_CTL_TIMEOUT)
            .and_then(|output| tool::ensure_success(&output, "pg_ctl", &self.path));
        let Err(e) = immediate else {
            return;
        };
        let Some(pid) = readiness::postmaster_pid(&self.pid_file()) else {
            warn!(path = %self.path.display(), error = %e, "immediate shutdown failed; no postmaster pid");
            return;
        };
        warn!(path = %self.path.display(), %pid, error = %e, "immediate shutdown failed; killing postmaster");
        if let Err(errno) = signal::kill(pid, Signal::SIGKILL) {
            warn!(%pid, error = %errno, "failed to kill postmaster");
            return;
        }
        let deadline = Instant::now() + KILL_GRACE;
        while readiness::process_alive(pid) && Instant::now() < deadline {
            thread::sleep(KILL_POLL);
        }
    }

    /// Whether a server still holds the data directory. Falls back to the
    /// pid file when `pg_ctl` itself cannot run.
    fn still_running(&self) -> bool {
        match self.running() {
            Ok(up) => up,
            Err(e) => {
                debug!(error = %e, "pg_ctl status failed; checking the pid file");
                readiness::postmaster_pid(&self.pid_file()).is_some_and(readiness::process_alive)
            }
        }
    }
}

impl Cluster for PgCluster {
    type Connection = PgConnection;

    fn path(&self) -> &Path { &self.path }

    fn encoding(&self) -> Option<&str> { self.encoding.as_deref() }

    fn settings(&self) -> &ServerSettings { &self.settings }

    fn initialized(&self) -> bool { self.path.is_dir() }

    fn running(&self) -> Result<bool, ClusterError> {
        if !self.initialized() {
            return Ok(false);
        }
        let mut cmd = self.pg_ctl();
        cmd.arg("status");
        let output = tool::run(cmd, "pg_ctl", PG_CTL_TIMEOUT)?;
        Ok(output.status.success())
    }

    fn init(&mut self, options: &InitOptions<'_>) -> Result<(), ClusterError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ClusterError::io(parent, e))?;
        }
        info!(path = %self.path.display(), user = options.user, "initialising cluster");
        let mut cmd = Command::new(self.installation.binary("initdb"));
        cmd.arg("-D")
            .arg(&self.path)
            .args(["-U", options.user, "-E", options.encoding, "-A", "trust"]);
        let output = tool::run(cmd, "initdb", INITDB_TIMEOUT)?;
        debug!(stdout = %String::from_utf8_lossy(&output.stdout), "initdb finished");
        tool::ensure_success(&output, "initdb", &self.path)?;
        self.encoding = Some(options.encoding.to_owned());
        // Clients connect over TCP; no Unix socket means no socket path length
        // limit and no system socket directory the invoking user may not own.
        self.settings.unix_socket_directories = Some(String::new());
        Ok(())
    }

    fn configure(&mut self, settings: &ServerSettings) -> Result<(), ClusterError> {
        let mut merged = self.settings.clone();
        merged.merge(settings);
        let conf = self.path.join("postgresql.conf");
        let existing = match fs::read_to_string(&conf) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(ClusterError::io(&conf, e)),
        };
        fs::write(&conf, merge_conf(&existing, &merged.entries()))
            .map_err(|e| ClusterError::io(&conf, e))?;
        self.settings = merged;
        Ok(())
    }

    fn start(&mut self) -> Result<(), ClusterError> {
        let port = self.port()?;
        info!(path = %self.path.display(), port, "starting cluster");
        let mut cmd = self.pg_ctl();
        cmd.args(["start", "-W", "-s", "-l"]).arg(self.log_file());
        let output = tool::run(cmd, "pg_ctl", PG_CTL_TIMEOUT)?;
        tool::ensure_success(&output, "pg_ctl", &self.path)
    }

    fn wait_until_started(&mut self, timeout: Duration) -> Result<(), ClusterError> {
        let port = self.port()?;
        if readiness::wait_until_ready(&self.pid_file(), port, timeout) {
            return Ok(());
        }
        warn!(log = %self.log_file().display(), "see the server log for startup errors");
        Err(ClusterError::StartTimeout {
            path: self.path.clone(),
            timeout,
        })
    }

    fn stop(&mut self) -> Result<(), ClusterError> {
        if !self.running()? {
            return Ok(());
        }
        info!(path = %self.path.display(), "stopping cluster");
        let mut cmd = self.pg_ctl();
        cmd.args(["stop", "-m", "fast", "-w", "-s"]);
        let output = tool::run(cmd, "pg_ctl", PG_CTL_TIMEOUT)?;
        tool::ensure_success(&output, "pg_ctl", &self.path)
    }

    fn drop_cluster(&mut self) -> Result<(), ClusterError> {
        if let Err(e) = self.stop() {
            warn!(path = %self.path.display(), error = %e, "fast shutdown failed; escalating");
            self.force_stop();
            if self.still_running() {
                error!(path = %self.path.display(), "server survived shutdown; keeping data directory");
                return Err(e);
            }
        }
        remove_data_dir(&self.path)
    }

    fn cleanup_action(&self) -> ExitAction {
        let mut cluster = self.clone();
        Box::new(move || {
            if let Err(e) = cluster.drop_cluster() {
                error!(path = %cluster.path.display(), error = %e, "exit cleanup failed");
            }
        })
    }

    fn connect(&self, user: &str, database: &DatabaseName) -> Result<PgConnection, ClusterError> {
        let connect_err = |source: ConnectionError| ClusterError::Connect {
            path: self.path.clone(),
            source,
        };
        let mut config: postgres::Config = self
            .dsn(user, database)?
            .to_string()
            .parse()
            .map_err(|e: postgres::Error| connect_err(e.into()))?;
        config.connect_timeout(self.connect_timeout);
        PgConnection::open(&config).map_err(connect_err)
    }
}

fn remove_data_dir(path: &Path) -> Result<(), ClusterError> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            info!(path = %path.display(), "dropped cluster");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ClusterError::io(path, e)),
    }
}
