//! One invocation from precondition check to report.

use std::path::PathBuf;

use chrono::Local;

use crate::backends::{backup_steps, restore_steps, SnapshotRepository};
use crate::config::BackupConfig;
use crate::mount::MountGuard;
use crate::notify::Notifier;
use crate::pipeline::{Pipeline, RunResult, RunStatus, Step, StepRunner};
use crate::signal::{SignalGuard, INTERRUPTED_EXIT_CODE};

/// Name under which a failed mount check is reported.
pub const VERIFY_MOUNT_STEP: &str = "verify-mount";

/// Final state of an invocation, mapped to the process exit code.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The steps ran, successfully or not.
    Finished(RunResult),
    /// The backup destination wasn't mounted, no step ran.
    MountFailed(RunResult),
    /// A test report was sent.
    Notified(RunResult),
}

impl RunOutcome {
    pub fn result(&self) -> &RunResult {
        match self {
            Self::Finished(result) | Self::MountFailed(result) | Self::Notified(result) => result,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Notified(_) => 0,
            Self::MountFailed(_) => 3,
            Self::Finished(result) if result.interrupted => INTERRUPTED_EXIT_CODE as u8,
            Self::Finished(result) if result.is_success() => 0,
            Self::Finished(_) => 1,
        }
    }
}

/// Drives the backup and restore flows against one configuration.
pub struct BackupRun<'a> {
    config: &'a BackupConfig,
    repository: &'a dyn SnapshotRepository,
    notifier: &'a Notifier,
    signals: &'a SignalGuard,
    mounts: MountGuard,
    dry_run: bool,
}

impl<'a> BackupRun<'a> {
    pub fn new(
        config: &'a BackupConfig,
        repository: &'a dyn SnapshotRepository,
        notifier: &'a Notifier,
        signals: &'a SignalGuard,
    ) -> Self {
        Self {
            config,
            repository,
            notifier,
            signals,
            mounts: MountGuard::default(),
            dry_run: false,
        }
    }

    pub fn mount_guard(mut self, mounts: MountGuard) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Dumps, mirrors, snapshots and prunes, then reports the result.
    ///
    /// Interrupted runs release the repository lock but send no report.
    pub fn backup(&self) -> RunOutcome {
        if let Err(e) = self.mounts.verify_destination(&self.config.destination) {
            log::error!(target: "orchestrator", "Refusing to back up: {e}");
            let result = RunResult::precondition_failed(VERIFY_MOUNT_STEP);
            self.report(&result);
            return RunOutcome::MountFailed(result);
        }

        self.release_stale_locks();
        let steps = backup_steps(self.config, self.repository);
        let mut result = self.execute(&steps);

        self.observe_interrupt(&mut result);
        if result.interrupted {
            log::warn!(target: "orchestrator", "Backup was interrupted, no report is sent");
        } else {
            self.report(&result);
            // a signal during delivery still fails the run
            self.observe_interrupt(&mut result);
        }
        RunOutcome::Finished(result)
    }

    /// Restores the latest snapshot of every tag into a fresh staging
    /// directory below the backup root.
    pub fn restore(&self) -> RunOutcome {
        if let Err(e) = self.mounts.verify_destination(&self.config.destination) {
            log::error!(target: "orchestrator", "Refusing to restore: {e}");
            return RunOutcome::MountFailed(RunResult::precondition_failed(VERIFY_MOUNT_STEP));
        }

        self.release_stale_locks();
        let staging = self.staging_dir();
        log::info!(target: "orchestrator", "Restoring into {}", staging.display());
        let steps = restore_steps(self.repository, &staging);
        let mut result = self.execute(&steps);
        self.observe_interrupt(&mut result);

        if result.is_success() && !self.dry_run {
            log::info!(target: "orchestrator", "Restored snapshots to {}", staging.display());
        }
        RunOutcome::Finished(result)
    }

    fn staging_dir(&self) -> PathBuf {
        let timestamp = Local::now().format("%Y%m%d-%H%M%S");
        self.config
            .destination
            .backup_root
            .join(format!("restore-{timestamp}"))
    }

    fn release_stale_locks(&self) {
        if self.dry_run {
            log::info!(target: "orchestrator", "dry-run: skipping release of stale locks");
            return;
        }
        if let Err(e) = self.repository.unlock() {
            log::warn!(target: "orchestrator", "Releasing stale locks failed: {e}");
        }
    }

    fn execute(&self, steps: &[Step]) -> RunResult {
        let redactor = self.config.redactor();
        let cancel = self.signals.token();
        let runner = StepRunner::new(&self.config.timeouts, &redactor, cancel).dry_run(self.dry_run);
        let result = Pipeline::new(runner, cancel).execute(steps);

        // a step that failed or was killed may have left its lock behind
        if !result.is_success() && !self.dry_run {
            self.signals.release(self.repository);
        }
        result
    }

    /// Marks `result` as interrupted if a signal arrived after the last
    /// step, releasing the repository lock.
    fn observe_interrupt(&self, result: &mut RunResult) {
        if result.interrupted || !self.signals.is_interrupted() {
            return;
        }
        log::warn!(target: "orchestrator", "Interrupted after the last step");
        result.interrupted = true;
        result.overall_status = RunStatus::Failure;
        if !self.dry_run {
            self.signals.release(self.repository);
        }
    }

    fn report(&self, result: &RunResult) {
        if self.dry_run {
            let mail = self.notifier.compose(result);
            log::info!(target: "orchestrator", "dry-run: not sending report \"{}\"", mail.subject);
            return;
        }
        self.notifier.report(result);
    }
}

/// Sends a report of a fabricated run without touching any data.
pub fn test_notification(notifier: &Notifier, status: RunStatus) -> RunOutcome {
    log::info!(target: "orchestrator", "Sending a test {status} report");
    let result = RunResult::synthetic(status);
    notifier.report(&result);
    RunOutcome::Notified(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(status: RunStatus, interrupted: bool) -> RunOutcome {
        let mut result = RunResult::synthetic(status);
        result.synthetic = false;
        result.interrupted = interrupted;
        RunOutcome::Finished(result)
    }

    #[test]
    fn exit_codes() {
        assert_eq!(finished(RunStatus::Success, false).exit_code(), 0);
        assert_eq!(finished(RunStatus::Failure, false).exit_code(), 1);
        assert_eq!(finished(RunStatus::Failure, true).exit_code(), 130);
        assert_eq!(
            RunOutcome::MountFailed(RunResult::precondition_failed(VERIFY_MOUNT_STEP)).exit_code(),
            3
        );
        assert_eq!(
            RunOutcome::Notified(RunResult::synthetic(RunStatus::Failure)).exit_code(),
            0
        );
    }
}
