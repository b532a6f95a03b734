//! [SnapshotRepository] backed by the [restic](https://restic.net) CLI.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};

use super::repository::{RepoError, SnapshotRepository};
use crate::config::RepositoryConfig;
use crate::pipeline::{ProcessOutput, StepContext, Stdout};
use crate::signal::CancellationToken;
use crate::util::retention::RetentionPolicy;

/// Exit code of restic if the repository lock couldn't be acquired.
const EXIT_LOCK_FAILED: i32 = 11;
/// Exit code of `restic backup` if some source files couldn't be read.
const EXIT_INCOMPLETE_SNAPSHOT: i32 = 3;

const UNLOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const UNLOCK_MAX_OUTPUT: usize = 16 * 1024;

/// Snapshot as listed by `restic snapshots --json`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub time: DateTime<FixedOffset>,
    pub hostname: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

/// A restic repository accessed with a password file.
#[derive(Debug, Clone)]
pub struct ResticRepository {
    command: String,
    location: String,
    password_file: PathBuf,
    lock_retry_delay: Duration,
}

impl ResticRepository {
    pub fn from_config(config: &RepositoryConfig) -> Self {
        Self {
            command: config.command.clone(),
            location: config.location.clone(),
            password_file: config.password_file.clone(),
            lock_retry_delay: config.lock_retry_delay(),
        }
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg(subcommand)
            .arg("--repo")
            .arg(&self.location)
            .arg("--password-file")
            .arg(&self.password_file);
        cmd
    }

    /// Runs the command built by `build`, retrying once if the repository
    /// is locked.
    fn run_locked(
        &self,
        operation: &str,
        build: impl Fn() -> Command,
        stdout: Stdout,
        ctx: &StepContext,
    ) -> Result<ProcessOutput, RepoError> {
        let output = ctx.run_process(&mut build(), stdout.clone())?;
        if !is_lock_failure(&output) {
            return Ok(output);
        }

        log::warn!(
            target: "backend::restic",
            "Repository is locked, retrying {operation} in {}s",
            self.lock_retry_delay.as_secs()
        );
        ctx.sleep(self.lock_retry_delay)?;

        let output = ctx.run_process(&mut build(), stdout)?;
        if is_lock_failure(&output) {
            log::error!(target: "backend::restic", "Repository is still locked, giving up on {operation}");
            return Err(RepoError::Locked);
        }
        Ok(output)
    }

    /// Lists all snapshots in the repository.
    pub fn snapshots(&self, ctx: &StepContext) -> Result<Vec<SnapshotInfo>, RepoError> {
        let output = self.run_locked(
            "snapshots",
            || {
                let mut cmd = self.command("snapshots");
                cmd.arg("--json");
                cmd
            },
            Stdout::Collect,
            ctx,
        )?;
        expect_success("snapshots", &output)?;

        // empty repositories are listed as `null` by older restic versions
        let snapshots: Option<Vec<SnapshotInfo>> = serde_json::from_str(&output.stdout)
            .map_err(|e| RepoError::InvalidOutput(e.to_string()))?;
        Ok(snapshots.unwrap_or_default())
    }
}

impl SnapshotRepository for ResticRepository {
    fn put(&self, path: &Path, tag: &str, ctx: &StepContext) -> Result<(), RepoError> {
        log::debug!(target: "backend::restic", "restic backup {} --tag {tag}", path.display());
        let output = self.run_locked(
            "backup",
            || {
                let mut cmd = self.command("backup");
                cmd.arg(path).arg("--tag").arg(tag);
                cmd
            },
            Stdout::Capture,
            ctx,
        )?;

        match output.status.code() {
            Some(EXIT_INCOMPLETE_SNAPSHOT) => Err(RepoError::Incomplete(path.to_path_buf())),
            _ => expect_success("backup", &output),
        }
    }

    fn prune(&self, policy: &RetentionPolicy, ctx: &StepContext) -> Result<(), RepoError> {
        let forget_args = policy.forget_args();
        log::debug!(target: "backend::restic", "restic forget --prune {}", forget_args.join(" "));
        let output = self.run_locked(
            "forget",
            || {
                let mut cmd = self.command("forget");
                cmd.arg("--prune")
                    .arg("--group-by")
                    .arg("host,tags")
                    .args(&forget_args);
                cmd
            },
            Stdout::Capture,
            ctx,
        )?;
        expect_success("forget", &output)?;

        let snapshots = self.snapshots(ctx)?;
        verify_retention(&snapshots, policy)
    }

    fn restore(&self, tag: &str, target: &Path, ctx: &StepContext) -> Result<(), RepoError> {
        let output = self.run_locked(
            "restore",
            || {
                let mut cmd = self.command("restore");
                cmd.arg("latest")
                    .arg("--tag")
                    .arg(tag)
                    .arg("--target")
                    .arg(target);
                cmd
            },
            Stdout::Capture,
            ctx,
        )?;
        expect_success("restore", &output)
    }

    fn unlock(&self) -> Result<(), RepoError> {
        // runs even after cancellation
        let cancel = CancellationToken::default();
        let ctx = StepContext::new("unlock", UNLOCK_TIMEOUT, &cancel, UNLOCK_MAX_OUTPUT);
        let output = ctx.run_process(&mut self.command("unlock"), Stdout::Capture)?;
        expect_success("unlock", &output)?;
        log::debug!(target: "backend::restic", "Released stale locks of {}", self.location);
        Ok(())
    }
}

fn is_lock_failure(output: &ProcessOutput) -> bool {
    !output.status.success()
        && (output.status.code() == Some(EXIT_LOCK_FAILED)
            || output.stderr.contains("repository is already locked"))
}

fn expect_success(operation: &str, output: &ProcessOutput) -> Result<(), RepoError> {
    if output.status.success() {
        return Ok(());
    }
    if !output.stderr.is_empty() {
        log::warn!(target: "backend::restic", "{}", output.stderr.trim_end());
    }
    Err(RepoError::Exit {
        operation: operation.to_string(),
        status: output.status.to_string(),
    })
}

/// Checks that every (host, tags) group holds only snapshots `policy` keeps.
pub fn verify_retention(
    snapshots: &[SnapshotInfo],
    policy: &RetentionPolicy,
) -> Result<(), RepoError> {
    let mut groups: BTreeMap<String, Vec<_>> = BTreeMap::new();
    for snapshot in snapshots {
        let mut tags = snapshot.tags.clone();
        tags.sort();
        let group = format!("{} [{}]", snapshot.hostname, tags.join(","));
        groups.entry(group).or_default().push(snapshot.time.naive_local());
    }

    for (group, times) in groups {
        let expected = policy.retained(&times).len();
        log::trace!(target: "backend::restic", "Group {group}: {} snapshot(s), {expected} kept by policy", times.len());
        if times.len() > expected {
            return Err(RepoError::RetentionViolated {
                group,
                found: times.len(),
                expected,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshots_json(days: impl Iterator<Item = u32>, tag: &str) -> String {
        let entries: Vec<_> = days
            .map(|day| {
                format!(
                    r#"{{"time":"2026-03-{day:02}T02:00:05.123456789+01:00","tree":"ab","paths":["/mnt/backup/acme/webui"],"hostname":"cloud","username":"root","tags":["{tag}"],"id":"{day:064}","short_id":"{day:08}"}}"#
                )
            })
            .collect();
        format!("[{}]", entries.join(","))
    }

    fn policy(keep_daily: usize) -> RetentionPolicy {
        RetentionPolicy {
            keep_daily,
            ..Default::default()
        }
    }

    #[test]
    fn parses_snapshot_listing() {
        let snapshots: Vec<SnapshotInfo> =
            serde_json::from_str(&snapshots_json(1..=2, "webui-backup")).unwrap();

        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].hostname, "cloud");
        assert_eq!(snapshots[0].tags, ["webui-backup"]);
        assert_eq!(snapshots[1].time.naive_local().to_string(), "2026-03-02 02:00:05.123456789");
    }

    #[test]
    fn ten_dailies_violate_keep_seven() {
        let snapshots: Vec<SnapshotInfo> =
            serde_json::from_str(&snapshots_json(1..=10, "data-backup")).unwrap();

        let err = verify_retention(&snapshots, &policy(7)).unwrap_err();

        assert_eq!(
            err,
            RepoError::RetentionViolated {
                group: "cloud [data-backup]".to_string(),
                found: 10,
                expected: 7,
            }
        );
    }

    #[test]
    fn groups_are_checked_separately() {
        let mut snapshots: Vec<SnapshotInfo> =
            serde_json::from_str(&snapshots_json(4..=10, "data-backup")).unwrap();
        snapshots.extend(
            serde_json::from_str::<Vec<SnapshotInfo>>(&snapshots_json(1..=7, "webui-backup")).unwrap(),
        );

        assert_eq!(verify_retention(&snapshots, &policy(7)), Ok(()));
    }

    fn fake_restic(dir: &Path, script: &str) -> ResticRepository {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-restic");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        ResticRepository {
            command: path.to_string_lossy().into_owned(),
            location: dir.join("repo").to_string_lossy().into_owned(),
            password_file: dir.join("pw"),
            lock_retry_delay: Duration::from_millis(10),
        }
    }

    fn put(repository: &ResticRepository) -> Result<(), RepoError> {
        let cancel = CancellationToken::default();
        let ctx = StepContext::new("snapshot", Duration::from_secs(30), &cancel, 4096);
        repository.put(Path::new("/srv/data"), "data-backup", &ctx)
    }

    #[test]
    fn lock_is_retried_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("attempted");
        let repository = fake_restic(
            dir.path(),
            &format!(
                "if [ ! -e {0} ]; then touch {0}; echo 'repository is already locked by PID 42' >&2; exit 1; fi",
                marker.display()
            ),
        );

        assert_eq!(put(&repository), Ok(()));
        assert!(marker.exists());
    }

    #[test]
    fn persistent_lock_fails() {
        let dir = tempfile::tempdir().unwrap();
        let repository = fake_restic(dir.path(), "exit 11");

        assert_eq!(put(&repository), Err(RepoError::Locked));
    }

    #[test]
    fn unreadable_files_make_an_incomplete_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let repository = fake_restic(dir.path(), "exit 3");

        assert_eq!(
            put(&repository),
            Err(RepoError::Incomplete(PathBuf::from("/srv/data")))
        );
    }

    #[test]
    fn missing_restic_is_a_process_error() {
        let repository = ResticRepository {
            command: "/nonexistent/restic".to_string(),
            location: "/tmp/repo".to_string(),
            password_file: "/tmp/pw".into(),
            lock_retry_delay: Duration::ZERO,
        };

        assert!(matches!(repository.unlock(), Err(RepoError::Process(_))));
    }
}
