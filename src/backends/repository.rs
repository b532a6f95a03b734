//! Contract of the snapshot repository and the steps built on it.

use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

use crate::pipeline::{StepAction, StepContext, StepError};
use crate::util::retention::RetentionPolicy;

/// A content addressed, append-only store of tagged snapshots.
///
/// Operations are invoked strictly one after another; the repository's
/// exclusive lock is never contended from within a run.
pub trait SnapshotRepository {
    /// Stores `path` as a new snapshot tagged `tag`.
    ///
    /// Either the snapshot is committed completely or not at all.
    fn put(&self, path: &Path, tag: &str, ctx: &StepContext) -> Result<(), RepoError>;

    /// Removes the snapshots `policy` doesn't keep.
    fn prune(&self, policy: &RetentionPolicy, ctx: &StepContext) -> Result<(), RepoError>;

    /// Restores the latest snapshot tagged `tag` below `target`.
    fn restore(&self, tag: &str, target: &Path, ctx: &StepContext) -> Result<(), RepoError>;

    /// Releases stale locks, including the ones of an interrupted run.
    fn unlock(&self) -> Result<(), RepoError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Display, Error, From)]
/// Errors of [SnapshotRepository] operations.
pub enum RepoError {
    /// Another process holds the repository lock, even after a retry.
    #[display("repository is locked by another process")]
    Locked,
    /// The repository tool couldn't be run to completion.
    #[from]
    Process(StepError),
    /// The repository tool reported an error.
    #[display("restic {operation} exited with {status}")]
    Exit { operation: String, status: String },
    /// A snapshot was created without some of the source files.
    #[display("snapshot of {} is incomplete, some files could not be read", _0.display())]
    Incomplete(#[error(ignore)] PathBuf),
    /// Output of the repository tool couldn't be understood.
    #[display("unexpected restic output: {_0}")]
    InvalidOutput(#[error(ignore)] String),
    /// More snapshots survived pruning than the policy keeps.
    #[display("group {group} holds {found} snapshots, the retention policy keeps {expected}")]
    RetentionViolated {
        group: String,
        found: usize,
        expected: usize,
    },
}

impl From<RepoError> for StepError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::Process(e) => e,
            other => StepError::Repository(other.to_string()),
        }
    }
}

/// Stores an artifact of the run in the repository.
pub struct PutSnapshot<'a> {
    repository: &'a dyn SnapshotRepository,
    path: PathBuf,
    tag: &'static str,
}

impl<'a> PutSnapshot<'a> {
    pub fn new(repository: &'a dyn SnapshotRepository, path: PathBuf, tag: &'static str) -> Self {
        Self {
            repository,
            path,
            tag,
        }
    }
}

impl StepAction for PutSnapshot<'_> {
    fn execute(&self, ctx: &StepContext) -> Result<(), StepError> {
        log::info!(target: "backend::repository", "Snapshot {} as {}", self.path.display(), self.tag);
        self.repository.put(&self.path, self.tag, ctx)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("snapshot {} tagged {}", self.path.display(), self.tag)
    }
}

/// Applies the retention policy to the repository.
pub struct PruneSnapshots<'a> {
    repository: &'a dyn SnapshotRepository,
    policy: RetentionPolicy,
}

impl<'a> PruneSnapshots<'a> {
    pub fn new(repository: &'a dyn SnapshotRepository, policy: RetentionPolicy) -> Self {
        Self { repository, policy }
    }
}

impl StepAction for PruneSnapshots<'_> {
    fn execute(&self, ctx: &StepContext) -> Result<(), StepError> {
        log::info!(target: "backend::repository", "Prune snapshots: {}", self.policy.forget_args().join(" "));
        self.repository.prune(&self.policy, ctx)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("prune snapshots with {}", self.policy.forget_args().join(" "))
    }
}

/// Restores the latest snapshot of a tag into a staging directory.
pub struct RestoreSnapshot<'a> {
    repository: &'a dyn SnapshotRepository,
    tag: &'static str,
    target: PathBuf,
}

impl<'a> RestoreSnapshot<'a> {
    pub fn new(repository: &'a dyn SnapshotRepository, tag: &'static str, target: PathBuf) -> Self {
        Self {
            repository,
            tag,
            target,
        }
    }
}

impl StepAction for RestoreSnapshot<'_> {
    fn execute(&self, ctx: &StepContext) -> Result<(), StepError> {
        if self.target.exists() {
            return Err(StepError::Io(format!(
                "restore target {} already exists",
                self.target.display()
            )));
        }
        log::info!(target: "backend::repository", "Restore latest {} to {}", self.tag, self.target.display());
        self.repository.restore(self.tag, &self.target, ctx)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("restore latest {} to {}", self.tag, self.target.display())
    }
}
