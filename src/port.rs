//! Random TCP port probing for test clusters.
//!
//! A probe binds a listener on `localhost`, releases it straight away, and
//! reports the port. Nothing holds the port between the probe and the moment
//! the server binds it, so another process on the host may claim it first.
//! Callers accept that window; the probe is best effort.

use std::{io, net::TcpListener, ops::Range};

use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::debug;

/// Candidate ports are drawn from this half-open range.
pub const PORT_RANGE: Range<u16> = 1024..51024;

/// Number of candidates tried before [`PortProbe`] gives up.
pub const MAX_ATTEMPTS: u32 = 1024;

/// Supplies a port for a cluster that is about to be configured.
pub trait PortSource {
    /// Returns a port believed to be free, or `None` when none was found.
    ///
    /// # Errors
    ///
    /// Returns bind failures that are not worth retrying.
    fn find_port(&mut self) -> io::Result<Option<u16>>;
}

/// Performs a single transient bind.
pub trait PortBinder {
    /// Binds `port` on `localhost` and releases it before returning.
    ///
    /// # Errors
    ///
    /// Returns the bind error unchanged.
    fn probe(&mut self, port: u16) -> io::Result<()>;
}

/// Binds real TCP listeners.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpBinder;

impl PortBinder for TcpBinder {
    fn probe(&mut self, port: u16) -> io::Result<()> {
        let listener = TcpListener::bind(("localhost", port))?;
        drop(listener);
        Ok(())
    }
}

/// Bind failures that mean "try another candidate".
///
/// Anything else is handed back to the caller.
#[must_use]
pub const fn is_retryable(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied | io::ErrorKind::Interrupted
    )
}

/// Draws random candidates from [`PORT_RANGE`] until one binds.
#[derive(Debug)]
pub struct PortProbe<B = TcpBinder, R = StdRng> {
    binder: B,
    rng: R,
}

impl PortProbe {
    /// Creates a probe over real sockets seeded from OS entropy.
    #[must_use]
    pub fn new() -> Self { Self::with_parts(TcpBinder, StdRng::from_entropy()) }
}

impl Default for PortProbe {
    fn default() -> Self { Self::new() }
}

impl<B, R> PortProbe<B, R> {
    /// Creates a probe from an explicit binder and random source.
    pub const fn with_parts(binder: B, rng: R) -> Self { Self { binder, rng } }

    /// Returns the binder, mostly so tests can inspect recorded attempts.
    pub const fn binder(&self) -> &B { &self.binder }
}

impl<B: PortBinder, R: Rng> PortSource for PortProbe<B, R> {
    fn find_port(&mut self) -> io::Result<Option<u16>> {
        for attempt in 1..=MAX_ATTEMPTS {
            let candidate = self.rng.gen_range(PORT_RANGE);
            match self.binder.probe(candidate) {
                Ok(()) => {
                    debug!(port = candidate, attempt, "probed free port");
                    return Ok(Some(candidate));
                }
                Err(e) if is_retryable(e.kind()) => {
                    debug!(port = candidate, attempt, error = %e, "port unavailable");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    #[derive(Default)]
    struct Scripted {
        outcomes: VecDeque<io::ErrorKind>,
        fallback: Option<io::ErrorKind>,
        tried: Vec<u16>,
    }

    impl PortBinder for Scripted {
        fn probe(&mut self, port: u16) -> io::Result<()> {
            self.tried.push(port);
            match self.outcomes.pop_front().or(self.fallback) {
                Some(kind) => Err(io::Error::from(kind)),
                None => Ok(()),
            }
        }
    }

    fn probe_with(binder: Scripted) -> PortProbe<Scripted, StdRng> {
        PortProbe::with_parts(binder, StdRng::seed_from_u64(7))
    }

    #[rstest]
    #[case(io::ErrorKind::AddrInUse)]
    #[case(io::ErrorKind::PermissionDenied)]
    #[case(io::ErrorKind::Interrupted)]
    fn retryable_failures_move_to_next_candidate(#[case] kind: io::ErrorKind) {
        let mut probe = probe_with(Scripted {
            outcomes: VecDeque::from([kind, kind]),
            ..Scripted::default()
        });
        let port = probe.find_port().expect("probe should not fail");
        let tried = &probe.binder().tried;
        assert_eq!(tried.len(), 3);
        assert_eq!(port, tried.last().copied());
    }

    #[rstest]
    fn exhausted_budget_returns_none() {
        let mut probe = probe_with(Scripted {
            fallback: Some(io::ErrorKind::AddrInUse),
            ..Scripted::default()
        });
        let port = probe.find_port().expect("retryable errors are swallowed");
        assert_eq!(port, None);
        assert_eq!(probe.binder().tried.len(), 1024);
    }

    #[rstest]
    fn other_bind_errors_are_propagated() {
        let mut probe = probe_with(Scripted {
            outcomes: VecDeque::from([io::ErrorKind::AddrNotAvailable]),
            ..Scripted::default()
        });
        let err = probe.find_port().expect_err("unlisted kinds must not be retried");
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
        assert_eq!(probe.binder().tried.len(), 1);
    }

    #[rstest]
    fn real_sockets_yield_a_port_in_range() {
        let port = PortProbe::new()
            .find_port()
            .expect("probing localhost should not fail")
            .expect("some port in range should be free");
        assert!(PORT_RANGE.contains(&port));
    }

    proptest! {
        #[test]
        fn candidates_stay_in_range(seed in any::<u64>()) {
            let mut probe = PortProbe::with_parts(Scripted::default(), StdRng::seed_from_u64(seed));
            let port = probe.find_port().expect("scripted binder always succeeds");
            prop_assert!(port.is_some_and(|p| PORT_RANGE.contains(&p)));
        }
    }
}
