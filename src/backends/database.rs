//! Implements the dump of the Nextcloud database using [DatabaseDump].

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::DatabaseConfig;
use crate::pipeline::{StepAction, StepContext, StepError, Stdout};

const DB_DUMP_FILE: &str = "nextcloud_db_backup.sql";

/// Dumps the database into a single file below `dump_dest`.
///
/// The dump is written next to its final location and renamed only after
/// the dump tool exited successfully, so the canonical file is always a
/// complete dump.
pub struct DatabaseDump<'a> {
    config: &'a DatabaseConfig,
    dump_dest: PathBuf,
}

impl<'a> DatabaseDump<'a> {
    pub fn new(config: &'a DatabaseConfig, dump_dest: PathBuf) -> Self {
        if dump_dest.is_relative() {
            log::warn!(target: "backend::database", "dump_dest is relative: {}", dump_dest.display());
        }

        Self { config, dump_dest }
    }

    /// Canonical location of the dump.
    pub fn dump_file(&self) -> PathBuf {
        let file_name = if self.config.compress {
            format!("{DB_DUMP_FILE}.gz")
        } else {
            DB_DUMP_FILE.to_string()
        };
        self.dump_dest.join(file_name)
    }

    fn partial_file(&self) -> PathBuf {
        let mut partial = self.dump_file().into_os_string();
        partial.push(".partial");
        partial.into()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.dump_command);
        cmd.arg("--opt") // sensible dump defaults
            .arg("--single-transaction")
            .arg(format!("--user={}", self.config.user));
        if let Some(host) = &self.config.host {
            cmd.arg(format!("--host={host}"));
        }
        cmd.arg(&self.config.name);
        // keeps the password out of the process list
        cmd.env("MYSQL_PWD", self.config.password.expose());
        cmd
    }
}

impl StepAction for DatabaseDump<'_> {
    fn execute(&self, ctx: &StepContext) -> Result<(), StepError> {
        log::info!(target: "backend::database", "Create database dump of: {}", self.config.name);
        log::trace!(target: "backend::database", "Using dbuser '{}' for backup", self.config.user);

        fs::create_dir_all(&self.dump_dest)?;
        let dump_file = self.dump_file();
        let partial_file = self.partial_file();
        if partial_file.exists() {
            log::warn!(target: "backend::database", "Removing leftover partial dump {}", partial_file.display());
            fs::remove_file(&partial_file)?;
        }

        log::debug!(target: "backend::database", "Save database dump at: {}", dump_file.display());
        let stdout = Stdout::File {
            path: partial_file.clone(),
            compress: self.config.compress,
        };
        let output = match ctx.run_process(&mut self.command(), stdout) {
            Ok(output) => output,
            Err(e) => {
                discard(&partial_file);
                return Err(e);
            }
        };
        if !output.status.success() {
            discard(&partial_file);
            return Err(StepError::Exit {
                program: self.config.dump_command.clone(),
                status: output.status.to_string(),
            });
        }

        if let Err(e) = fs::rename(&partial_file, &dump_file) {
            discard(&partial_file);
            return Err(e.into());
        }
        log::info!(target: "backend::database", "Finished database dump");

        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "{} {} > {}",
            self.config.dump_command,
            self.config.name,
            self.dump_file().display()
        )
    }
}

fn discard(partial_file: &Path) {
    if let Err(e) = fs::remove_file(partial_file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!(target: "backend::database", "Removing partial dump {} failed: {e}", partial_file.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::config::TimeoutConfig;
    use crate::pipeline::{Step, StepKind, StepRunner, StepStatus};
    use crate::signal::CancellationToken;
    use crate::util::secret::{Redactor, Secret};

    /// Writes an executable stand-in for the dump tool.
    fn fake_dump_tool(dir: &Path, script: &str) -> String {
        let path = dir.join("fake-dump");
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn config(dump_command: String) -> DatabaseConfig {
        DatabaseConfig {
            password: Secret::new("dbsecret"),
            dump_command,
            ..Default::default()
        }
    }

    fn run(config: &DatabaseConfig, dest: PathBuf) -> (StepStatus, String) {
        let timeouts = TimeoutConfig::default();
        let redactor = Redactor::new([config.password.clone()]);
        let cancel = CancellationToken::default();
        let step = Step::new("dump-database", StepKind::Command, DatabaseDump::new(config, dest));
        let outcome = StepRunner::new(&timeouts, &redactor, &cancel).run(&step);
        (outcome.status, outcome.captured_output)
    }

    #[test]
    fn successful_dump_is_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_dump_tool(dir.path(), r#"echo "-- dump of $4 with $MYSQL_PWD""#);
        let config = config(tool);
        let dest = dir.path().join("database");

        let (status, _) = run(&config, dest.clone());

        assert_eq!(status, StepStatus::Succeeded);
        let dump = fs::read_to_string(dest.join(DB_DUMP_FILE)).unwrap();
        assert_eq!(dump, "-- dump of nextcloud with dbsecret\n");
        assert!(!dest.join("nextcloud_db_backup.sql.partial").exists());
    }

    #[test]
    fn failed_dump_keeps_previous_dump() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_dump_tool(dir.path(), "echo partial; echo \"access denied for $MYSQL_PWD\" >&2; exit 2");
        let config = config(tool);
        let dest = dir.path().join("database");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join(DB_DUMP_FILE), "previous").unwrap();

        let (status, output) = run(&config, dest.clone());

        assert!(matches!(status, StepStatus::Failed(StepError::Exit { .. })));
        assert_eq!(fs::read_to_string(dest.join(DB_DUMP_FILE)).unwrap(), "previous");
        assert!(!dest.join("nextcloud_db_backup.sql.partial").exists());
        assert_eq!(output, "access denied for ***\n");
    }

    #[test]
    fn compressed_dump_name() {
        let config = DatabaseConfig {
            compress: true,
            ..Default::default()
        };
        let dump = DatabaseDump::new(&config, "/mnt/backup/database".into());

        assert_eq!(
            dump.dump_file(),
            PathBuf::from("/mnt/backup/database/nextcloud_db_backup.sql.gz")
        );
        assert_eq!(
            dump.partial_file(),
            PathBuf::from("/mnt/backup/database/nextcloud_db_backup.sql.gz.partial")
        );
    }
}
