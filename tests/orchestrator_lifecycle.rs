//! Orchestrator lifecycle against an in-memory cluster.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
};

use pg_test_cluster::{
    BootstrapStep,
    Cluster,
    ClusterOrchestrator,
    ClusterState,
    ExitHooks,
    HarnessError,
    PortProbe,
    PortSource,
    ProvisioningError,
    Readiness,
    port::MAX_ATTEMPTS,
};
use rand::{SeedableRng, rngs::StdRng};
use rstest::{fixture, rstest};
use tempfile::TempDir;
use test_util::{
    AnyError,
    BrokenProbe,
    FailPoint,
    FakeCluster,
    FakeControls,
    FixedPort,
    Op,
    ScriptedBinder,
};

const PORT: u16 = 45432;

struct Harness<P> {
    _root: TempDir,
    path: PathBuf,
    hooks: Arc<ExitHooks>,
    controls: FakeControls,
    orchestrator: ClusterOrchestrator<FakeCluster, P>,
}

fn harness_with<P: PortSource>(probe: P) -> Harness<P> {
    let root = tempfile::tempdir().expect("tempdir");
    let path = root.path().join("py_unittest_postgresql_cluster_1_Lifecycle");
    let (cluster, controls) = FakeCluster::new(&path);
    let hooks = Arc::new(ExitHooks::new());
    let orchestrator = ClusterOrchestrator::new(cluster, probe, Arc::clone(&hooks));
    Harness {
        _root: root,
        path,
        hooks,
        controls,
        orchestrator,
    }
}

#[fixture]
fn harness() -> Harness<FixedPort> { harness_with(FixedPort(PORT)) }

#[rstest]
fn first_call_bootstraps_in_order(mut harness: Harness<FixedPort>) -> Result<(), AnyError> {
    assert_eq!(harness.orchestrator.state()?, ClusterState::Uninitialized);
    assert_eq!(harness.orchestrator.ensure_ready()?, Readiness::Bootstrapped);

    assert_eq!(
        harness.controls.calls(),
        [
            Op::Init,
            Op::Configure,
            Op::Start,
            Op::WaitUntilStarted,
            Op::Connect,
            Op::DatabaseExists,
            Op::CreateDatabase,
        ]
    );
    assert!(harness.path.is_dir());
    assert!(harness.controls.has_database("test"));
    assert_eq!(harness.controls.open_connections(), 0);
    assert_eq!(harness.orchestrator.state()?, ClusterState::Running);

    let settings = harness.orchestrator.cluster().settings();
    assert_eq!(settings.port, Some(PORT));
    assert_eq!(settings.max_connections, Some(16));
    assert_eq!(settings.log_min_messages.as_deref(), Some("FATAL"));
    assert_eq!(harness.orchestrator.cluster().encoding(), Some("utf-8"));

    let obligation = harness.orchestrator.obligation().expect("obligation registered");
    assert!(harness.hooks.is_registered(obligation));
    Ok(())
}

#[rstest]
fn repeated_calls_reuse_the_running_cluster() -> Result<(), AnyError> {
    let binder = ScriptedBinder::new([]);
    let probe = PortProbe::with_parts(binder.clone(), StdRng::seed_from_u64(3));
    let mut harness = harness_with(probe);

    harness.orchestrator.ensure_ready()?;
    let obligation = harness.orchestrator.obligation();
    let port = harness.orchestrator.cluster().settings().port;
    assert!(port.is_some());
    for _ in 0..3 {
        assert_eq!(harness.orchestrator.ensure_ready()?, Readiness::AlreadyRunning);
    }
    harness.controls.crash();
    assert_eq!(harness.orchestrator.ensure_ready()?, Readiness::Restarted);

    assert_eq!(binder.attempts(), 1);
    assert_eq!(harness.orchestrator.cluster().settings().port, port);
    assert_eq!(harness.controls.count(Op::Init), 1);
    assert_eq!(harness.controls.count(Op::Configure), 1);
    assert_eq!(harness.hooks.len(), 1);
    assert_eq!(harness.orchestrator.obligation(), obligation);
    Ok(())
}

#[rstest]
fn stopped_cluster_is_restarted_not_reinitialised(mut harness: Harness<FixedPort>) -> Result<(), AnyError> {
    harness.orchestrator.ensure_ready()?;
    harness.controls.crash();
    assert_eq!(harness.orchestrator.state()?, ClusterState::Stopped);

    assert_eq!(harness.orchestrator.ensure_ready()?, Readiness::Restarted);
    assert_eq!(harness.controls.count(Op::Init), 1);
    assert_eq!(harness.controls.count(Op::Start), 2);
    assert_eq!(harness.controls.count(Op::Drop), 0);
    assert_eq!(harness.hooks.len(), 1);
    Ok(())
}

#[rstest]
#[case(FailPoint::Init, BootstrapStep::Init)]
#[case(FailPoint::Configure, BootstrapStep::Configure)]
#[case(FailPoint::Start, BootstrapStep::Start)]
#[case(FailPoint::WaitUntilStarted, BootstrapStep::WaitReady)]
#[case(FailPoint::Connect, BootstrapStep::Connect)]
#[case(FailPoint::DatabaseExists, BootstrapStep::EnsureDatabase)]
fn failed_bootstrap_rolls_back(
    mut harness: Harness<FixedPort>,
    #[case] fault: FailPoint,
    #[case] step: BootstrapStep,
) {
    harness.controls.fail(fault);
    let err = harness.orchestrator.ensure_ready().expect_err("bootstrap fails");

    assert_eq!(err.bootstrap_step(), Some(step));
    assert!(matches!(err, HarnessError::Bootstrap { .. }));
    assert!(!harness.path.exists());
    assert!(harness.hooks.is_empty());
    assert_eq!(harness.orchestrator.obligation(), None);
    assert_eq!(harness.controls.count(Op::Drop), 1);

    // Exit must not drop the directory a second time.
    assert_eq!(harness.hooks.run_all(), 0);
    assert_eq!(harness.controls.count(Op::Drop), 1);
}

#[rstest]
fn retry_after_rollback_bootstraps_from_scratch(mut harness: Harness<FixedPort>) -> Result<(), AnyError> {
    harness.controls.fail(FailPoint::DatabaseExists);
    assert!(harness.orchestrator.ensure_ready().is_err());
    harness.controls.heal(FailPoint::DatabaseExists);

    assert_eq!(harness.orchestrator.ensure_ready()?, Readiness::Bootstrapped);
    assert_eq!(harness.controls.count(Op::Init), 2);
    assert_eq!(harness.hooks.len(), 1);
    Ok(())
}

#[rstest]
fn exhausted_ports_leave_nothing_behind() {
    let binder = ScriptedBinder::always(io::ErrorKind::AddrInUse);
    let probe = PortProbe::with_parts(binder.clone(), StdRng::seed_from_u64(7));
    let mut harness = harness_with(probe);

    let err = harness.orchestrator.ensure_ready().expect_err("no port");

    assert!(matches!(
        err,
        HarnessError::Provisioning(ProvisioningError::PortsExhausted)
    ));
    assert!(err.is_provisioning());
    assert_eq!(binder.attempts(), usize::try_from(MAX_ATTEMPTS).expect("fits"));
    assert_eq!(harness.controls.count(Op::Configure), 0);
    assert!(!harness.path.exists());
    assert!(harness.hooks.is_empty());
}

#[rstest]
fn probe_succeeds_after_retryable_failures() -> Result<(), AnyError> {
    let binder = ScriptedBinder::new([
        Some(io::ErrorKind::AddrInUse),
        Some(io::ErrorKind::PermissionDenied),
        None,
    ]);
    let probe = PortProbe::with_parts(binder.clone(), StdRng::seed_from_u64(11));
    let mut harness = harness_with(probe);

    assert_eq!(harness.orchestrator.ensure_ready()?, Readiness::Bootstrapped);
    assert_eq!(binder.attempts(), 3);
    let port = harness.orchestrator.cluster().settings().port.expect("port set");
    assert!((1024..51024).contains(&port));
    Ok(())
}

#[rstest]
fn unexpected_bind_error_is_a_bootstrap_failure() {
    let mut harness = harness_with(BrokenProbe(io::ErrorKind::AddrNotAvailable));
    let err = harness.orchestrator.ensure_ready().expect_err("probe fails");
    assert_eq!(err.bootstrap_step(), Some(BootstrapStep::ProbePort));
    assert!(!harness.path.exists());
    assert!(harness.hooks.is_empty());
}

#[rstest]
fn failed_restart_keeps_the_directory(mut harness: Harness<FixedPort>) -> Result<(), AnyError> {
    harness.orchestrator.ensure_ready()?;
    harness.controls.crash();
    harness.controls.fail(FailPoint::Start);

    let err = harness.orchestrator.ensure_ready().expect_err("restart fails");
    assert!(matches!(err, HarnessError::ReuseStart { .. }));
    assert!(harness.path.is_dir());
    assert_eq!(harness.controls.count(Op::Drop), 0);
    assert_eq!(harness.hooks.len(), 1);

    harness.controls.heal(FailPoint::Start);
    assert_eq!(harness.orchestrator.ensure_ready()?, Readiness::Restarted);
    Ok(())
}

#[rstest]
fn failed_rollback_is_reported_and_left_to_exit(mut harness: Harness<FixedPort>) {
    harness.controls.fail(FailPoint::DatabaseExists);
    harness.controls.fail(FailPoint::Drop);

    let err = harness.orchestrator.ensure_ready().expect_err("bootstrap fails");
    assert!(matches!(err, HarnessError::RollbackFailed { .. }));
    assert_eq!(err.bootstrap_step(), Some(BootstrapStep::EnsureDatabase));
    assert!(harness.path.is_dir());
    assert_eq!(harness.hooks.len(), 1);

    harness.controls.heal(FailPoint::Drop);
    assert_eq!(harness.hooks.run_all(), 1);
    assert!(!harness.path.exists());
    assert_eq!(harness.controls.count(Op::Drop), 2);
}

#[rstest]
fn leftover_directory_is_replaced(mut harness: Harness<FixedPort>) -> Result<(), AnyError> {
    std::fs::create_dir_all(&harness.path)?;
    std::fs::write(harness.path.join("PG_VERSION"), "15\n")?;

    assert_eq!(harness.orchestrator.ensure_ready()?, Readiness::Bootstrapped);
    let calls = harness.controls.calls();
    assert_eq!(calls.first(), Some(&Op::Drop));
    assert_eq!(calls.get(1), Some(&Op::Init));
    assert!(!harness.path.join("PG_VERSION").exists());
    Ok(())
}

#[rstest]
fn concurrent_creator_counts_as_success(mut harness: Harness<FixedPort>) -> Result<(), AnyError> {
    harness.controls.fail(FailPoint::LoseCreateRace);
    assert_eq!(harness.orchestrator.ensure_ready()?, Readiness::Bootstrapped);
    assert!(harness.controls.has_database("test"));
    Ok(())
}

#[rstest]
fn run_hands_out_a_test_database_connection(mut harness: Harness<FixedPort>) -> Result<(), AnyError> {
    let database = harness.orchestrator.run(|conn| conn.database().to_owned())?;
    assert_eq!(database, "test");
    assert_eq!(harness.controls.open_connections(), 0);
    // One administrative connection during bootstrap, one for the run.
    assert_eq!(harness.controls.closed_connections(), 2);
    Ok(())
}

#[rstest]
fn run_releases_the_connection_when_the_body_panics(mut harness: Harness<FixedPort>) {
    let orchestrator = &mut harness.orchestrator;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        orchestrator.run::<_, ()>(|_conn| panic!("test body failed"))
    }));
    assert!(outcome.is_err());
    assert_eq!(harness.controls.open_connections(), 0);
    assert_eq!(harness.controls.closed_connections(), 2);
}

#[rstest]
fn run_skips_the_body_when_connect_fails(mut harness: Harness<FixedPort>) -> Result<(), AnyError> {
    harness.orchestrator.ensure_ready()?;
    harness.controls.fail(FailPoint::Connect);

    let mut ran = false;
    let err = harness
        .orchestrator
        .run(|_conn| ran = true)
        .expect_err("connect fails");
    assert!(matches!(err, HarnessError::Connect { .. }));
    assert!(!ran);
    Ok(())
}

#[rstest]
fn teardown_cancels_the_exit_drop(mut harness: Harness<FixedPort>) -> Result<(), AnyError> {
    harness.orchestrator.ensure_ready()?;
    harness.orchestrator.teardown()?;

    assert!(!harness.path.exists());
    assert!(harness.hooks.is_empty());
    assert_eq!(harness.hooks.run_all(), 0);
    assert_eq!(harness.controls.count(Op::Drop), 1);
    assert_eq!(harness.orchestrator.state()?, ClusterState::Uninitialized);

    assert_eq!(harness.orchestrator.ensure_ready()?, Readiness::Bootstrapped);
    assert_eq!(harness.hooks.len(), 1);
    Ok(())
}

#[rstest]
fn exit_hooks_drop_the_cluster(mut harness: Harness<FixedPort>) -> Result<(), AnyError> {
    harness.orchestrator.ensure_ready()?;
    assert_eq!(harness.hooks.run_all(), 1);
    assert!(!harness.path.exists());
    assert!(!harness.controls.is_running());
    assert_eq!(harness.hooks.run_all(), 0);
    Ok(())
}
