//! Port sources with predictable answers.

use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use pg_test_cluster::{PortSource, port::PortBinder};

/// Always hands out the same port.
#[derive(Debug, Clone, Copy)]
pub struct FixedPort(pub u16);

impl PortSource for FixedPort {
    fn find_port(&mut self) -> io::Result<Option<u16>> { Ok(Some(self.0)) }
}

/// Behaves like a probe whose every candidate was taken.
#[derive(Debug, Clone, Copy)]
pub struct NoFreePorts;

impl PortSource for NoFreePorts {
    fn find_port(&mut self) -> io::Result<Option<u16>> { Ok(None) }
}

/// Fails every probe with the given error kind.
#[derive(Debug, Clone, Copy)]
pub struct BrokenProbe(pub io::ErrorKind);

impl PortSource for BrokenProbe {
    fn find_port(&mut self) -> io::Result<Option<u16>> { Err(self.0.into()) }
}

/// Binder that replays scripted outcomes, then repeats a fallback.
///
/// `None` in the script means the bind succeeds. Clones share the attempt
/// counter, so a clone kept by the test observes a binder moved into a probe.
#[derive(Debug, Clone)]
pub struct ScriptedBinder {
    script: VecDeque<Option<io::ErrorKind>>,
    fallback: Option<io::ErrorKind>,
    attempts: Arc<AtomicUsize>,
}

impl ScriptedBinder {
    /// Replays `script`; afterwards every bind succeeds.
    pub fn new(script: impl IntoIterator<Item = Option<io::ErrorKind>>) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback: None,
            attempts: Arc::default(),
        }
    }

    /// Fails every bind with `kind`.
    #[must_use]
    pub fn always(kind: io::ErrorKind) -> Self {
        Self {
            script: VecDeque::new(),
            fallback: Some(kind),
            attempts: Arc::default(),
        }
    }

    /// Binds attempted so far across all clones.
    #[must_use]
    pub fn attempts(&self) -> usize { self.attempts.load(Ordering::SeqCst) }
}

impl PortBinder for ScriptedBinder {
    fn probe(&mut self, _port: u16) -> io::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script.pop_front().unwrap_or(self.fallback) {
            None => Ok(()),
            Some(kind) => Err(kind.into()),
        }
    }
}
