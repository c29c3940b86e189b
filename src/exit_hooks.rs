//! Deferred actions that run once when the process exits.
//!
//! [`ExitHooks`] is an explicit list of pending actions. Registration returns
//! a [`HookId`] that can cancel the action later; draining the list runs each
//! remaining action exactly once, newest first. The process-wide instance from
//! [`process_hooks`] is drained by a single `atexit` trampoline, so it fires on
//! normal returns from `main`, on `std::process::exit`, and after a panic on the
//! main thread unwinds out of `main`.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        OnceLock,
        PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{debug, error, warn};

/// A deferred, no-argument action.
pub type ExitAction = Box<dyn FnOnce() + Send + 'static>;

/// Identifies one registered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// An ordered list of pending exit actions.
#[derive(Default)]
pub struct ExitHooks {
    pending: Mutex<Vec<(HookId, ExitAction)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for ExitHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitHooks")
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

impl ExitHooks {
    /// Creates an empty hook list.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Vec<(HookId, ExitAction)>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `action` and returns the handle that cancels it.
    pub fn register<F>(&self, action: F) -> HookId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Box::new(action)));
        debug!(hook = id.0, "registered exit hook");
        id
    }

    /// Removes a pending action without running it.
    ///
    /// Returns `false` when the action already ran or was cancelled.
    pub fn cancel(&self, id: HookId) -> bool {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|(hook, _)| *hook != id);
        let removed = pending.len() != before;
        if removed {
            debug!(hook = id.0, "cancelled exit hook");
        }
        removed
    }

    /// Reports whether `id` is still waiting to run.
    #[must_use]
    pub fn is_registered(&self, id: HookId) -> bool {
        self.lock().iter().any(|(hook, _)| *hook == id)
    }

    /// Number of pending actions.
    #[must_use]
    pub fn len(&self) -> usize { self.lock().len() }

    /// Returns `true` when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Runs every pending action once, newest first, and returns how many ran.
    ///
    /// The list is emptied before any action runs, so an action that
    /// registers or cancels hooks does not deadlock. A panicking action is
    /// logged and the remaining actions still run.
    pub fn run_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.lock());
        let count = drained.len();
        for (id, action) in drained.into_iter().rev() {
            if panic::catch_unwind(AssertUnwindSafe(action)).is_err() {
                error!(hook = id.0, "exit hook panicked");
            }
        }
        count
    }
}

static PROCESS_HOOKS: OnceLock<Arc<ExitHooks>> = OnceLock::new();

extern "C" fn run_process_hooks() {
    if let Some(hooks) = PROCESS_HOOKS.get() {
        hooks.run_all();
    }
}

/// Returns the hook list drained when this process exits.
///
/// The first call installs the `atexit` trampoline.
pub fn process_hooks() -> Arc<ExitHooks> {
    let hooks = PROCESS_HOOKS.get_or_init(|| {
        // SAFETY: `run_process_hooks` is a plain `extern "C"` function that
        // never unwinds: every action runs under `catch_unwind`.
        let rc = unsafe { nix::libc::atexit(run_process_hooks) };
        if rc != 0 {
            warn!(rc, "atexit registration failed; exit hooks will not run");
        }
        Arc::new(ExitHooks::new())
    });
    Arc::clone(hooks)
}
