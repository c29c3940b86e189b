//! A [`Cluster`] that keeps its server in memory.
//!
//! The data directory is real, so tests can check that rollback and cleanup
//! leave nothing behind; everything else (server process, catalog,
//! connections) is simulated and recorded in state shared with
//! [`FakeControls`].

use std::{
    collections::{BTreeSet, HashSet},
    fs,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use pg_test_cluster::{
    AdminConnection,
    Cluster,
    ClusterError,
    ConnectionError,
    DatabaseName,
    ServerSettings,
    cluster::InitOptions,
    exit_hooks::ExitAction,
};

/// Operations recorded by the fake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// [`Cluster::init`].
    Init,
    /// [`Cluster::configure`].
    Configure,
    /// [`Cluster::start`].
    Start,
    /// [`Cluster::wait_until_started`].
    WaitUntilStarted,
    /// [`Cluster::stop`].
    Stop,
    /// [`Cluster::drop_cluster`] or the exit cleanup action.
    Drop,
    /// [`Cluster::connect`].
    Connect,
    /// [`AdminConnection::database_exists`].
    DatabaseExists,
    /// [`AdminConnection::create_database`].
    CreateDatabase,
}

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// `init` fails before creating the directory.
    Init,
    /// `configure` fails.
    Configure,
    /// `start` fails and the server stays down.
    Start,
    /// `wait_until_started` times out.
    WaitUntilStarted,
    /// `running` cannot determine the status.
    Status,
    /// `connect` fails.
    Connect,
    /// The existence check fails.
    DatabaseExists,
    /// Another client creates the database first.
    LoseCreateRace,
    /// Dropping fails and leaves the directory in place.
    Drop,
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<Op>,
    faults: HashSet<FailPoint>,
    running: bool,
    databases: BTreeSet<String>,
    open_connections: usize,
    closed_connections: usize,
}

type Shared = Arc<Mutex<FakeState>>;

fn lock(shared: &Shared) -> MutexGuard<'_, FakeState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn injected(path: &Path) -> ClusterError {
    ClusterError::Io {
        path: path.to_path_buf(),
        source: io::Error::other("injected failure"),
    }
}

/// In-memory cluster rooted at a real directory.
#[derive(Debug)]
pub struct FakeCluster {
    path: PathBuf,
    encoding: Option<String>,
    settings: ServerSettings,
    shared: Shared,
}

/// Handle for inspecting and steering a [`FakeCluster`] after it was moved
/// into an orchestrator.
#[derive(Debug, Clone)]
pub struct FakeControls {
    shared: Shared,
}

impl FakeCluster {
    /// Creates a fake whose data directory will live at `path`.
    pub fn new(path: impl Into<PathBuf>) -> (Self, FakeControls) {
        let shared = Shared::default();
        let cluster = Self {
            path: path.into(),
            encoding: None,
            settings: ServerSettings::default(),
            shared: Arc::clone(&shared),
        };
        (cluster, FakeControls { shared })
    }

    fn record(&self, op: Op, fault: Option<FailPoint>) -> Result<MutexGuard<'_, FakeState>, ClusterError> {
        let mut state = lock(&self.shared);
        state.calls.push(op);
        if fault.is_some_and(|f| state.faults.contains(&f)) {
            return Err(injected(&self.path));
        }
        Ok(state)
    }
}

fn remove_dir(shared: &Shared, path: &Path) -> Result<(), ClusterError> {
    let mut state = lock(shared);
    state.calls.push(Op::Drop);
    if state.faults.contains(&FailPoint::Drop) {
        return Err(injected(path));
    }
    state.running = false;
    state.databases.clear();
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ClusterError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

impl Cluster for FakeCluster {
    type Connection = FakeConnection;

    fn path(&self) -> &Path { &self.path }

    fn encoding(&self) -> Option<&str> { self.encoding.as_deref() }

    fn settings(&self) -> &ServerSettings { &self.settings }

    fn initialized(&self) -> bool { self.path.is_dir() }

    fn running(&self) -> Result<bool, ClusterError> {
        let state = lock(&self.shared);
        if state.faults.contains(&FailPoint::Status) {
            return Err(injected(&self.path));
        }
        Ok(state.running)
    }

    fn init(&mut self, options: &InitOptions<'_>) -> Result<(), ClusterError> {
        {
            let mut state = self.record(Op::Init, Some(FailPoint::Init))?;
            state.databases = ["postgres", "template0", "template1"]
                .into_iter()
                .map(str::to_owned)
                .collect();
        }
        fs::create_dir_all(&self.path).map_err(|source| ClusterError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.encoding = Some(options.encoding.to_owned());
        Ok(())
    }

    fn configure(&mut self, settings: &ServerSettings) -> Result<(), ClusterError> {
        drop(self.record(Op::Configure, Some(FailPoint::Configure))?);
        self.settings.merge(settings);
        Ok(())
    }

    fn start(&mut self) -> Result<(), ClusterError> {
        let mut state = self.record(Op::Start, Some(FailPoint::Start))?;
        if self.settings.port.is_none() {
            return Err(ClusterError::MissingPort {
                path: self.path.clone(),
            });
        }
        state.running = true;
        Ok(())
    }

    fn wait_until_started(&mut self, timeout: Duration) -> Result<(), ClusterError> {
        let mut state = lock(&self.shared);
        state.calls.push(Op::WaitUntilStarted);
        if state.faults.contains(&FailPoint::WaitUntilStarted) || !state.running {
            return Err(ClusterError::StartTimeout {
                path: self.path.clone(),
                timeout,
            });
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ClusterError> {
        let mut state = self.record(Op::Stop, None)?;
        state.running = false;
        Ok(())
    }

    fn drop_cluster(&mut self) -> Result<(), ClusterError> { remove_dir(&self.shared, &self.path) }

    fn cleanup_action(&self) -> ExitAction {
        let shared = Arc::clone(&self.shared);
        let path = self.path.clone();
        Box::new(move || {
            if let Err(e) = remove_dir(&shared, &path) {
                tracing::error!(path = %path.display(), error = %e, "fake exit cleanup failed");
            }
        })
    }

    fn connect(&self, _user: &str, database: &DatabaseName) -> Result<FakeConnection, ClusterError> {
        let mut state = self.record(Op::Connect, Some(FailPoint::Connect))?;
        if !state.running {
            return Err(ClusterError::Connect {
                path: self.path.clone(),
                source: ConnectionError::Backend("server is not running".to_owned()),
            });
        }
        state.open_connections += 1;
        Ok(FakeConnection {
            shared: Arc::clone(&self.shared),
            database: database.to_string(),
        })
    }
}

impl FakeControls {
    /// Makes `point` fail until [`heal`](Self::heal) is called.
    pub fn fail(&self, point: FailPoint) { lock(&self.shared).faults.insert(point); }

    /// Stops `point` from failing.
    pub fn heal(&self, point: FailPoint) { lock(&self.shared).faults.remove(&point); }

    /// Simulates the server going away behind the orchestrator's back.
    pub fn crash(&self) { lock(&self.shared).running = false; }

    /// Whether the simulated server is up.
    #[must_use]
    pub fn is_running(&self) -> bool { lock(&self.shared).running }

    /// Every recorded operation, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<Op> { lock(&self.shared).calls.clone() }

    /// How many times `op` was recorded.
    #[must_use]
    pub fn count(&self, op: Op) -> usize {
        lock(&self.shared).calls.iter().filter(|c| **c == op).count()
    }

    /// Whether the simulated catalog contains `name`.
    #[must_use]
    pub fn has_database(&self, name: &str) -> bool { lock(&self.shared).databases.contains(name) }

    /// Connections handed out and not yet dropped.
    #[must_use]
    pub fn open_connections(&self) -> usize { lock(&self.shared).open_connections }

    /// Connections dropped so far.
    #[must_use]
    pub fn closed_connections(&self) -> usize { lock(&self.shared).closed_connections }
}

/// Connection to a [`FakeCluster`]; counts itself closed when dropped.
#[derive(Debug)]
pub struct FakeConnection {
    shared: Shared,
    database: String,
}

impl FakeConnection {
    /// Database this connection was opened on.
    #[must_use]
    pub fn database(&self) -> &str { &self.database }
}

impl AdminConnection for FakeConnection {
    fn database_exists(&mut self, name: &DatabaseName) -> Result<bool, ConnectionError> {
        let mut state = lock(&self.shared);
        state.calls.push(Op::DatabaseExists);
        if state.faults.contains(&FailPoint::DatabaseExists) {
            return Err(ConnectionError::Backend("injected failure".to_owned()));
        }
        Ok(state.databases.contains(name.as_ref()))
    }

    fn create_database(&mut self, name: &DatabaseName) -> Result<(), ConnectionError> {
        let mut state = lock(&self.shared);
        state.calls.push(Op::CreateDatabase);
        let lost_race = state.faults.contains(&FailPoint::LoseCreateRace);
        if !state.databases.insert(name.to_string()) || lost_race {
            return Err(ConnectionError::DuplicateDatabase(name.to_string()));
        }
        Ok(())
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        let mut state = lock(&self.shared);
        state.open_connections = state.open_connections.saturating_sub(1);
        state.closed_connections += 1;
    }
}
