//! Cooperative handling of SIGINT and SIGTERM.
//!
//! Signals only flip a [CancellationToken]. Running steps observe the token,
//! terminate their child process and unwind; the [SignalGuard] then releases
//! the repository lock exactly once.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::SigId;

use crate::backends::SnapshotRepository;

/// Exit status of a process terminated by a repeated interrupt.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Process-wide request to stop the run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Owns the signal registrations of a run and the release of the
/// repository lock.
pub struct SignalGuard {
    token: CancellationToken,
    released: AtomicBool,
    registrations: Vec<SigId>,
}

impl SignalGuard {
    /// Registers SIGINT and SIGTERM.
    ///
    /// The first signal cancels the token; a second one while shutting down
    /// terminates the process immediately.
    pub fn install() -> io::Result<Self> {
        let token = CancellationToken::default();
        let mut registrations = Vec::new();
        for signal in [SIGINT, SIGTERM] {
            registrations.push(signal_hook::flag::register_conditional_shutdown(
                signal,
                INTERRUPTED_EXIT_CODE,
                Arc::clone(&token.0),
            )?);
            registrations.push(signal_hook::flag::register(signal, Arc::clone(&token.0))?);
        }
        log::trace!(target: "signal", "Installed handlers for SIGINT and SIGTERM");

        Ok(Self {
            token,
            released: AtomicBool::new(false),
            registrations,
        })
    }

    /// A guard that isn't connected to any signal.
    pub fn detached() -> Self {
        Self {
            token: CancellationToken::default(),
            released: AtomicBool::new(false),
            registrations: Vec::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Releases the lock on `repository`. Later calls do nothing.
    pub fn release(&self, repository: &dyn SnapshotRepository) {
        if self.released.swap(true, Ordering::SeqCst) {
            log::trace!(target: "signal", "Repository lock already released");
            return;
        }

        log::info!(target: "signal", "Releasing repository lock");
        if let Err(e) = repository.unlock() {
            log::error!(target: "signal", "Releasing the repository lock failed: {e}");
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for id in self.registrations.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::path::Path;

    use super::*;
    use crate::backends::RepoError;
    use crate::pipeline::StepContext;
    use crate::util::retention::RetentionPolicy;

    #[derive(Default)]
    struct CountingRepository {
        unlocks: Cell<usize>,
    }

    impl SnapshotRepository for CountingRepository {
        fn put(&self, _: &Path, _: &str, _: &StepContext) -> Result<(), RepoError> {
            Ok(())
        }

        fn prune(&self, _: &RetentionPolicy, _: &StepContext) -> Result<(), RepoError> {
            Ok(())
        }

        fn restore(&self, _: &str, _: &Path, _: &StepContext) -> Result<(), RepoError> {
            Ok(())
        }

        fn unlock(&self) -> Result<(), RepoError> {
            self.unlocks.set(self.unlocks.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn release_unlocks_once() {
        let guard = SignalGuard::detached();
        let repository = CountingRepository::default();

        guard.release(&repository);
        guard.release(&repository);

        assert_eq!(repository.unlocks.get(), 1);
    }

    #[test]
    fn token_clones_share_state() {
        let guard = SignalGuard::detached();
        let token = guard.token().clone();
        assert!(!guard.is_interrupted());

        token.cancel();

        assert!(guard.is_interrupted());
    }

    #[test]
    fn sigterm_cancels_the_token() {
        let guard = SignalGuard::install().unwrap();

        signal_hook::low_level::raise(SIGTERM).unwrap();

        assert!(guard.is_interrupted());
    }
}
