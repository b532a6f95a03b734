//! Sequential execution of backup steps with typed outcomes.
//!
//! A [Pipeline] runs [Step]s in their declared order through a [StepRunner]
//! and folds the resulting [StepOutcome]s into a [RunResult]. The pipeline is
//! the only place that decides whether a failure halts the run: a failed
//! critical step stops everything after it, a failed non-critical step is
//! recorded and the run continues.

use std::fmt;

use chrono::{DateTime, Local};
use derive_more::{Display, Error};

mod process;
mod runner;

pub use process::{BoundedBuffer, ProcessOutput, Stdout};
pub use runner::{StepContext, StepRunner};

use crate::signal::CancellationToken;

/// Category of a [Step]. Selects the wall-clock budget of the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum StepKind {
    /// A local command, e.g. the database dump.
    #[display("command")]
    Command,
    /// A file transfer, e.g. mirroring a directory tree.
    #[display("transfer")]
    Transfer,
    /// Storing an artifact in the snapshot repository.
    #[display("snapshot-put")]
    SnapshotPut,
    /// Removing snapshots by retention policy.
    #[display("snapshot-prune")]
    SnapshotPrune,
}

impl StepKind {
    /// Repository operations always halt the run on failure.
    pub fn is_repository(&self) -> bool {
        matches!(self, Self::SnapshotPut | Self::SnapshotPrune)
    }
}

/// Reason of a failed step.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum StepError {
    /// The step exceeded its wall-clock budget and was terminated.
    #[display("timeout")]
    Timeout,
    /// The run was cancelled while the step was in flight.
    #[display("interrupted")]
    Interrupted,
    /// The external program couldn't be started.
    #[display("could not start {program}: {error}")]
    Spawn { program: String, error: String },
    /// The external program exited unsuccessfully.
    #[display("{program} exited with {status}")]
    Exit { program: String, status: String },
    /// Reading or writing local files failed.
    #[display("{_0}")]
    Io(#[error(ignore)] String),
    /// The snapshot repository rejected the operation.
    #[display("repository: {_0}")]
    Repository(#[error(ignore)] String),
    #[display("{_0}")]
    Other(#[error(ignore)] String),
}

impl From<std::io::Error> for StepError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Work performed by a [Step].
///
/// Implementations run external tools through [StepContext::run_process] so
/// the runner's timeout, cancellation and output capture apply. An action
/// must not leave a half-written artifact at its canonical location.
pub trait StepAction {
    fn execute(&self, ctx: &StepContext) -> Result<(), StepError>;

    /// Human readable description of what [execute](Self::execute) would do.
    ///
    /// Logged instead of executing on a dry run.
    fn describe(&self) -> String;
}

/// A named unit of work in a [Pipeline].
pub struct Step<'a> {
    name: String,
    kind: StepKind,
    critical: bool,
    action: Box<dyn StepAction + 'a>,
}

impl<'a> Step<'a> {
    /// Create a critical step.
    pub fn new(name: impl Into<String>, kind: StepKind, action: impl StepAction + 'a) -> Self {
        Self {
            name: name.into(),
            kind,
            critical: true,
            action: Box::new(action),
        }
    }

    /// Let the run continue if this step fails.
    ///
    /// Has no effect on repository steps.
    pub fn non_critical(mut self) -> Self {
        if self.kind.is_repository() {
            log::warn!(target: "pipeline", "Repository step {} stays critical", self.name);
        } else {
            self.critical = false;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub(crate) fn action(&self) -> &dyn StepAction {
        self.action.as_ref()
    }
}

impl fmt::Debug for Step<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Failed(StepError),
    /// Not executed, e.g. on a dry run.
    Skipped,
}

/// Record of one executed [Step].
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_name: String,
    pub kind: StepKind,
    pub critical: bool,
    pub status: StepStatus,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    /// Tail of the step's stdout and stderr with credentials masked.
    pub captured_output: String,
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, StepStatus::Failed(_))
    }

    /// A failure that halts the run.
    pub fn is_critical_failure(&self) -> bool {
        self.critical && self.is_failed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RunStatus {
    #[display("success")]
    Success,
    #[display("failure")]
    Failure,
}

/// Aggregated result of one invocation.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub started_at: DateTime<Local>,
    pub overall_status: RunStatus,
    /// Outcomes in execution order.
    pub outcomes: Vec<StepOutcome>,
    /// Name of the first critical step that failed.
    pub failed_step: Option<String>,
    /// The run was cancelled by a signal.
    pub interrupted: bool,
    /// Fabricated to exercise the notifier, no step was run.
    pub synthetic: bool,
}

impl RunResult {
    /// A result that never ran a step, for testing the report delivery.
    pub fn synthetic(status: RunStatus) -> Self {
        let failed_step = match status {
            RunStatus::Success => None,
            RunStatus::Failure => Some("Test notification".to_string()),
        };
        Self {
            started_at: Local::now(),
            overall_status: status,
            outcomes: Vec::new(),
            failed_step,
            interrupted: false,
            synthetic: true,
        }
    }

    /// A run that was refused before the first step.
    pub fn precondition_failed(check: impl Into<String>) -> Self {
        Self {
            started_at: Local::now(),
            overall_status: RunStatus::Failure,
            outcomes: Vec::new(),
            failed_step: Some(check.into()),
            interrupted: false,
            synthetic: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.overall_status == RunStatus::Success
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Backup run started {}: {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.overall_status
        )?;
        for outcome in &self.outcomes {
            let elapsed = outcome.ended_at - outcome.started_at;
            let status = match &outcome.status {
                StepStatus::Succeeded => "ok".to_string(),
                StepStatus::Skipped => "skipped".to_string(),
                StepStatus::Failed(reason) if outcome.critical => format!("FAILED ({reason})"),
                StepStatus::Failed(reason) => format!("failed, ignored ({reason})"),
            };
            writeln!(
                f,
                "  {:<20} {:>6}s  {status}",
                outcome.step_name,
                elapsed.num_seconds()
            )?;
        }
        if let Some(step) = &self.failed_step {
            writeln!(f, "Failed step: {step}")?;
        }
        if self.interrupted {
            writeln!(f, "Run was interrupted")?;
        }
        Ok(())
    }
}

/// Runs steps in order and applies the fail-fast rule.
pub struct Pipeline<'a> {
    runner: StepRunner<'a>,
    cancel: &'a CancellationToken,
}

impl<'a> Pipeline<'a> {
    pub fn new(runner: StepRunner<'a>, cancel: &'a CancellationToken) -> Self {
        Self { runner, cancel }
    }

    pub fn execute(&self, steps: &[Step]) -> RunResult {
        let started_at = Local::now();
        let mut outcomes = Vec::with_capacity(steps.len());
        let mut failed_step = None;
        let mut interrupted = false;

        for (idx, step) in steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::warn!(target: "pipeline", "Cancelled before step {}", step.name());
                interrupted = true;
                break;
            }

            log::info!(target: "pipeline", "[{}/{}] {}", idx + 1, steps.len(), step.name());
            let outcome = self.runner.run(step);

            match &outcome.status {
                StepStatus::Succeeded => {
                    log::info!(target: "pipeline", "Step {} succeeded", outcome.step_name)
                }
                StepStatus::Skipped => {
                    log::info!(target: "pipeline", "Step {} skipped", outcome.step_name)
                }
                StepStatus::Failed(reason) if outcome.critical => {
                    log::error!(target: "pipeline", "Step {} failed: {reason}", outcome.step_name)
                }
                StepStatus::Failed(reason) => {
                    log::warn!(target: "pipeline", "Non-critical step {} failed: {reason}", outcome.step_name)
                }
            }

            interrupted = outcome.status == StepStatus::Failed(StepError::Interrupted);
            let halt = outcome.is_critical_failure();
            if halt && failed_step.is_none() {
                failed_step = Some(outcome.step_name.clone());
            }
            outcomes.push(outcome);

            if halt {
                log::warn!(
                    target: "pipeline",
                    "Skipping {} remaining step(s)",
                    steps.len() - idx - 1
                );
                break;
            }
            if interrupted {
                break;
            }
        }

        let overall_status = if failed_step.is_some() || interrupted {
            RunStatus::Failure
        } else {
            RunStatus::Success
        };

        RunResult {
            started_at,
            overall_status,
            outcomes,
            failed_step,
            interrupted,
            synthetic: false,
        }
    }
}
