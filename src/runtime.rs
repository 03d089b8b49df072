//! Process-wide foreign runtime handle.
//!
//! Embedded interpreters generally forbid parallel execution of their code, so
//! every interaction with a foreign module (import, instantiation, reload,
//! processing, event forwarding) runs inside [`ForeignRuntime::with_exclusive_access`].
//! The closure receives an [`ExclusiveScope`] token; all loader and processor
//! methods require that token, which makes a foreign call outside a held scope
//! a compile error rather than a data race.
//!
//! The runtime is initialised once per process on first use and lives until
//! process exit; it is never re-initialised or torn down per processor.
//! Backends that need their own interpreter start-up hook into it through
//! [`ForeignRuntime::ensure_initialized`].

use once_cell::sync::OnceCell;
use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::info;

static RUNTIME: OnceCell<ForeignRuntime> = OnceCell::new();

/// The single process-wide foreign runtime.
#[derive(Debug)]
pub struct ForeignRuntime {
    lock: Mutex<()>,
    started: Instant,
}

/// Proof that the caller holds the global execution lock.
///
/// Not `Send`: a scope is only valid on the thread that acquired it.
pub struct ExclusiveScope<'a> {
    _guard: MutexGuard<'a, ()>,
    _not_send: PhantomData<*const ()>,
}

impl std::fmt::Debug for ExclusiveScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExclusiveScope")
    }
}

impl ForeignRuntime {
    /// Returns the process-wide runtime, initialising it on first use.
    pub fn global() -> &'static ForeignRuntime {
        RUNTIME.get_or_init(|| {
            info!("Initializing foreign runtime");
            ForeignRuntime {
                lock: Mutex::new(()),
                started: Instant::now(),
            }
        })
    }

    /// Runs a backend initialiser exactly once for the process lifetime.
    ///
    /// `cell` belongs to the backend; the initialiser runs under the
    /// exclusive lock so it cannot race a foreign call from another thread.
    pub fn ensure_initialized<T, E>(
        &self,
        cell: &'static OnceCell<T>,
        init: impl FnOnce(&ExclusiveScope<'_>) -> Result<T, E>,
    ) -> Result<&'static T, E> {
        if let Some(value) = cell.get() {
            return Ok(value);
        }
        self.with_exclusive_access(|scope| cell.get_or_try_init(|| init(scope)))
    }

    /// Acquires the global execution lock, runs `f`, and releases the lock on
    /// every exit path including unwinding.
    ///
    /// Must not be called from inside `f`; the lock is not re-entrant.
    pub fn with_exclusive_access<R>(&self, f: impl FnOnce(&ExclusiveScope<'_>) -> R) -> R {
        // A panic inside a previous scope poisons the mutex but leaves no
        // shared state behind it, so the lock stays usable.
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let scope = ExclusiveScope {
            _guard: guard,
            _not_send: PhantomData,
        };
        f(&scope)
    }

    /// Time since the runtime was first initialised.
    pub fn uptime(&self) -> std::time::Duration {
        self.started.elapsed()
    }
}
