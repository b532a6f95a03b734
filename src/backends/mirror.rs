//! Mirrors a directory tree into the backup destination using `rsync`.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use crate::pipeline::{StepAction, StepContext, StepError, Stdout};

/// Keeps `destination` an exact copy of `source`.
#[derive(Debug, Clone)]
pub struct Mirror {
    source: PathBuf,
    destination: PathBuf,
    program: String,
}

impl Mirror {
    pub fn new(source: PathBuf, destination: PathBuf, program: impl Into<String>) -> Self {
        Self {
            source,
            destination,
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-ah")
            .arg("--delete")
            .arg("--stats")
            .arg(&self.source)
            .arg(&self.destination);
        cmd
    }
}

impl StepAction for Mirror {
    fn execute(&self, ctx: &StepContext) -> Result<(), StepError> {
        if !self.source.is_dir() {
            return Err(StepError::Io(format!(
                "source {} is not a directory",
                self.source.display()
            )));
        }
        log::info!(
            target: "backend::mirror",
            "Sync {} to {}",
            self.source.display(),
            self.destination.display()
        );

        fs::create_dir_all(&self.destination)?;
        let output = ctx.run_process(&mut self.command(), Stdout::Capture)?;

        // a partial mirror must never be snapshotted, vanished files included
        if !output.status.success() {
            return Err(StepError::Exit {
                program: self.program.clone(),
                status: output.status.to_string(),
            });
        }
        log::info!(target: "backend::mirror", "Finished sync of {}", self.source.display());

        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "{} -ah --delete {} {}",
            self.program,
            self.source.display(),
            self.destination.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use super::*;
    use crate::config::TimeoutConfig;
    use crate::pipeline::{Step, StepKind, StepRunner, StepStatus};
    use crate::signal::CancellationToken;
    use crate::util::secret::Redactor;

    fn fake_rsync(dir: &Path, exit_code: i32) -> String {
        let path = dir.join("fake-rsync");
        fs::write(&path, format!("#!/bin/sh\necho \"synced $4 -> $5\"\nexit {exit_code}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn run(mirror: Mirror) -> (StepStatus, String) {
        let timeouts = TimeoutConfig::default();
        let redactor = Redactor::default();
        let cancel = CancellationToken::default();
        let step = Step::new("mirror", StepKind::Transfer, mirror);
        let outcome = StepRunner::new(&timeouts, &redactor, &cancel).run(&step);
        (outcome.status, outcome.captured_output)
    }

    #[test]
    fn successful_sync() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        fs::create_dir(&source).unwrap();
        let destination = dir.path().join("dest");
        let mirror = Mirror::new(source.clone(), destination.clone(), fake_rsync(dir.path(), 0));

        let (status, output) = run(mirror);

        assert_eq!(status, StepStatus::Succeeded);
        assert!(destination.is_dir());
        assert_eq!(
            output,
            format!("synced {} -> {}\n", source.display(), destination.display())
        );
    }

    #[test]
    fn vanished_files_fail_the_sync() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        fs::create_dir(&source).unwrap();
        let mirror = Mirror::new(source, dir.path().join("dest"), fake_rsync(dir.path(), 24));

        let (status, _) = run(mirror);

        assert!(matches!(
            status,
            StepStatus::Failed(StepError::Exit { ref status, .. }) if status.contains("24")
        ));
    }

    #[test]
    fn transfer_error_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        fs::create_dir(&source).unwrap();
        let mirror = Mirror::new(source, dir.path().join("dest"), fake_rsync(dir.path(), 11));

        let (status, _) = run(mirror);

        assert!(matches!(status, StepStatus::Failed(StepError::Exit { .. })));
    }

    #[test]
    fn missing_source_fails_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Mirror::new(
            dir.path().join("missing"),
            dir.path().join("dest"),
            "/nonexistent/rsync",
        );

        let (status, _) = run(mirror);

        assert!(matches!(status, StepStatus::Failed(StepError::Io(_))));
        assert!(!dir.path().join("dest").exists());
    }
}
