use std::cell::RefCell;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;

use super::process::{self, BoundedBuffer, ProcessOutput, Stdout};
use super::{Step, StepError, StepOutcome, StepStatus};
use crate::config::TimeoutConfig;
use crate::signal::CancellationToken;
use crate::util::secret::Redactor;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Budget used when the configured one doesn't fit into an [Instant].
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Execution environment of a single step.
///
/// Carries the step's deadline, the run's cancellation token and the buffer
/// collecting the output of every process the step starts.
pub struct StepContext<'a> {
    step_name: &'a str,
    deadline: Instant,
    cancel: &'a CancellationToken,
    output: RefCell<BoundedBuffer>,
    max_output: usize,
}

impl<'a> StepContext<'a> {
    pub fn new(
        step_name: &'a str,
        timeout: Duration,
        cancel: &'a CancellationToken,
        max_output: usize,
    ) -> Self {
        Self {
            step_name,
            deadline: deadline_after(timeout),
            cancel,
            output: RefCell::new(BoundedBuffer::new(max_output)),
            max_output,
        }
    }

    pub fn step_name(&self) -> &str {
        self.step_name
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left until the step's deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Appends a line to the captured output.
    pub fn note(&self, line: &str) {
        let mut output = self.output.borrow_mut();
        output.push(line.as_bytes());
        output.push(b"\n");
    }

    /// Runs `cmd` to completion within the step's budget.
    ///
    /// The process is killed when the deadline passes or the run is
    /// cancelled. Its stderr, and stdout unless redirected, end up in the
    /// step's captured output.
    pub fn run_process(&self, cmd: &mut Command, stdout: Stdout) -> Result<ProcessOutput, StepError> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        log::debug!(target: "pipeline::runner", "{}: running {program}", self.step_name);

        let mut output = process::run(cmd, stdout, self.max_output, || self.should_abort())?;
        self.output
            .borrow_mut()
            .append(std::mem::take(&mut output.captured));
        match output.failure.take() {
            Some(reason) => Err(reason),
            // a signal delivered to the whole process group kills the child first
            None if self.is_cancelled() && !output.status.success() => Err(StepError::Interrupted),
            None => Ok(output),
        }
    }

    /// Sleeps for `duration` unless cancelled or out of budget first.
    pub fn sleep(&self, duration: Duration) -> Result<(), StepError> {
        let wake_up = Instant::now() + duration;
        loop {
            if let Some(reason) = self.should_abort() {
                return Err(reason);
            }
            let now = Instant::now();
            if now >= wake_up {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL.min(wake_up - now));
        }
    }

    fn should_abort(&self) -> Option<StepError> {
        if self.is_cancelled() {
            Some(StepError::Interrupted)
        } else if Instant::now() >= self.deadline {
            Some(StepError::Timeout)
        } else {
            None
        }
    }

    fn into_output(self) -> String {
        self.output.into_inner().into_string()
    }
}

/// Executes a [Step] and classifies its outcome.
///
/// The runner performs no cleanup of partial artifacts, that is up to the
/// step's action.
pub struct StepRunner<'a> {
    timeouts: &'a TimeoutConfig,
    redactor: &'a Redactor,
    cancel: &'a CancellationToken,
    dry_run: bool,
}

impl<'a> StepRunner<'a> {
    pub fn new(
        timeouts: &'a TimeoutConfig,
        redactor: &'a Redactor,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            timeouts,
            redactor,
            cancel,
            dry_run: false,
        }
    }

    /// Skip every step, logging what it would do.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn run(&self, step: &Step) -> StepOutcome {
        let started_at = Local::now();
        let timeout = self.timeouts.for_kind(step.kind());
        let ctx = StepContext::new(step.name(), timeout, self.cancel, self.timeouts.max_output_bytes);
        log::debug!(
            target: "pipeline::runner",
            "Step {} ({}) with a budget of {}s",
            step.name(),
            step.kind(),
            timeout.as_secs()
        );

        let status = if self.dry_run {
            let description = step.action().describe();
            log::info!(target: "pipeline::runner", "dry-run: {description}");
            ctx.note(&format!("dry-run: {description}"));
            StepStatus::Skipped
        } else {
            match step.action().execute(&ctx) {
                Ok(()) => StepStatus::Succeeded,
                Err(reason) => StepStatus::Failed(reason),
            }
        };

        let captured_output = self.redactor.redact(&ctx.into_output());
        if !captured_output.is_empty() {
            log::trace!(target: "pipeline::runner", "{}:\n{captured_output}", step.name());
        }

        StepOutcome {
            step_name: step.name().to_string(),
            kind: step.kind(),
            critical: step.is_critical(),
            status,
            started_at,
            ended_at: Local::now(),
            captured_output,
        }
    }
}
