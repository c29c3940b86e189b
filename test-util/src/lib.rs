//! Utilities for integration tests.
//!
//! The `test-util` crate provides in-memory stand-ins for the collaborators
//! of [`ClusterOrchestrator`](pg_test_cluster::ClusterOrchestrator) and helpers
//! for tests that need a real `PostgreSQL` toolchain.

pub mod fake_cluster;
pub mod ports;
pub mod postgres;

pub use fake_cluster::{FailPoint, FakeCluster, FakeConnection, FakeControls, Op};
pub use ports::{BrokenProbe, FixedPort, NoFreePorts, ScriptedBinder};

/// Error type used by test helpers.
pub type AnyError = anyhow::Error;
