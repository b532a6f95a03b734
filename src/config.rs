//! Configuration of a backup run, read once from a TOML file.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::pipeline::StepKind;
use crate::util::retention::{EmptyRetentionPolicy, RetentionPolicy};
use crate::util::secret::{Redactor, Secret};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nc-restic-backup/config.toml";

/// Complete configuration of one backup target.
///
/// Constructed once at startup and passed by reference to every component.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BackupConfig {
    /// Identifies the backed up instance in reports.
    pub customer_name: String,
    pub database: DatabaseConfig,
    pub sources: SourcesConfig,
    pub destination: DestinationConfig,
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    pub smtp: SmtpConfig,
    pub notification: NotificationConfig,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub user: String,
    pub password: Secret,
    /// Database host; the dump tool's default socket is used if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Dump binary, e.g. `mysqldump` or `mariadb-dump`.
    #[serde(default = "default_dump_command")]
    pub dump_command: String,
    /// Gzip the dump. Hurts deduplication in the repository.
    #[serde(default)]
    pub compress: bool,
}

fn default_dump_command() -> String {
    "mysqldump".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "nextcloud".to_string(),
            user: "nextcloud".to_string(),
            password: Secret::default(),
            host: None,
            dump_command: default_dump_command(),
            compress: false,
        }
    }
}

/// Trees mirrored into the backup destination.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SourcesConfig {
    /// Nextcloud web root.
    pub webui: PathBuf,
    /// Nextcloud data directory.
    pub data: PathBuf,
    /// rsync binary.
    #[serde(default = "default_rsync_command")]
    pub rsync_command: String,
}

fn default_rsync_command() -> String {
    "rsync".to_string()
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            webui: "/var/www/nextcloud".into(),
            data: "/var/nextcloud-data".into(),
            rsync_command: default_rsync_command(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DestinationConfig {
    /// Mount point that has to be mounted before anything is written.
    pub mount_point: PathBuf,
    /// Backup root below the mount point.
    pub backup_root: PathBuf,
    /// Expected filesystem type of the mount, e.g. `cifs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_fstype: Option<String>,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            mount_point: "/mnt/backup".into(),
            backup_root: "/mnt/backup/nextcloud".into(),
            expected_fstype: None,
        }
    }
}

impl DestinationConfig {
    pub fn webui_dir(&self) -> PathBuf {
        self.backup_root.join("webui")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.backup_root.join("data")
    }

    pub fn database_dir(&self) -> PathBuf {
        self.backup_root.join("database")
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RepositoryConfig {
    /// Repository location as understood by `restic --repo`.
    pub location: String,
    /// File holding the repository password.
    pub password_file: PathBuf,
    /// restic binary.
    #[serde(default = "default_restic_command")]
    pub command: String,
    /// Delay before the single retry of a repository lock.
    #[serde(default = "default_lock_retry_delay")]
    pub lock_retry_delay_secs: u64,
}

fn default_restic_command() -> String {
    "restic".to_string()
}

fn default_lock_retry_delay() -> u64 {
    30
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            location: "/mnt/backup/restic".to_string(),
            password_file: "/etc/nc-restic-backup/restic-password".into(),
            command: default_restic_command(),
            lock_retry_delay_secs: default_lock_retry_delay(),
        }
    }
}

impl RepositoryConfig {
    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_secs(self.lock_retry_delay_secs)
    }
}

/// Wall-clock budget per step kind and the size limit for captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub command_secs: u64,
    pub transfer_secs: u64,
    pub snapshot_put_secs: u64,
    pub snapshot_prune_secs: u64,
    /// Bytes of stdout/stderr kept per step.
    pub max_output_bytes: usize,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_secs: 2 * 60 * 60,
            transfer_secs: 12 * 60 * 60,
            snapshot_put_secs: 12 * 60 * 60,
            snapshot_prune_secs: 4 * 60 * 60,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// Longest accepted step budget.
const MAX_STEP_SECS: u64 = 30 * 24 * 60 * 60;

impl TimeoutConfig {
    /// Every budget has to be between one second and thirty days.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let budgets = [
            ("command_secs", self.command_secs),
            ("transfer_secs", self.transfer_secs),
            ("snapshot_put_secs", self.snapshot_put_secs),
            ("snapshot_prune_secs", self.snapshot_prune_secs),
        ];
        for (name, secs) in budgets {
            if !(1..=MAX_STEP_SECS).contains(&secs) {
                return Err(ConfigError::Invalid(format!(
                    "timeouts.{name} = {secs} is out of range 1..={MAX_STEP_SECS}"
                )));
            }
        }
        Ok(())
    }

    pub fn for_kind(&self, kind: StepKind) -> Duration {
        let secs = match kind {
            StepKind::Command => self.command_secs,
            StepKind::Transfer => self.transfer_secs,
            StepKind::SnapshotPut => self.snapshot_put_secs,
            StepKind::SnapshotPrune => self.snapshot_prune_secs,
        };
        Duration::from_secs(secs)
    }
}

/// How the SMTP session is encrypted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    /// Plain connection upgraded with STARTTLS (port 587).
    #[default]
    StartTls,
    /// Implicit TLS (port 465).
    Wrapper,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: Secret,
    #[serde(default)]
    pub tls: SmtpTls,
    pub from: String,
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_timeout() -> u64 {
    60
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "smtp.example.com".to_string(),
            port: default_smtp_port(),
            username: "backup@example.com".to_string(),
            password: Secret::default(),
            tls: SmtpTls::default(),
            from: "backup@example.com".to_string(),
            timeout_secs: default_smtp_timeout(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NotificationConfig {
    /// Comma separated list of report recipients.
    pub recipients: String,
    /// Relative paths are resolved against the directory of the config file.
    pub success_template: PathBuf,
    pub failure_template: PathBuf,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            recipients: "admin@example.com".to_string(),
            success_template: "email_success_template".into(),
            failure_template: "email_failure_template".into(),
        }
    }
}

impl NotificationConfig {
    /// Individual addresses of [recipients](Self::recipients).
    pub fn recipient_list(&self) -> Vec<&str> {
        self.recipients
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .collect()
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors on loading the [BackupConfig].
pub enum ConfigError {
    /// The file could not be read.
    #[display("Reading the config file {} failed: {_1}", _0.display())]
    Read(#[error(not(source))] PathBuf, #[error(source)] io::Error),
    /// The file is no valid TOML or misses fields.
    #[display("Parsing the config file failed: {_0}")]
    #[from]
    Parse(toml::de::Error),
    /// No config existed, a default one was written.
    #[display("Wrote a default config to {}, edit it and run again", _0.display())]
    DefaultWritten(#[error(ignore)] PathBuf),
    #[display("Invalid retention policy: {_0}")]
    #[from]
    Retention(EmptyRetentionPolicy),
    /// A semantic check failed.
    #[display("Invalid config: {_0}")]
    Invalid(#[error(ignore)] String),
}

impl BackupConfig {
    /// Reads and validates the configuration at `path`.
    ///
    /// If `path` doesn't exist a default configuration is written there and
    /// [ConfigError::DefaultWritten] is returned.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_str = match std::fs::read_to_string(path) {
            Ok(config_str) => config_str,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    target: "config",
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let config_str = toml::to_string_pretty(&BackupConfig::default())
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                std::fs::write(path, config_str)
                    .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
                return Err(ConfigError::DefaultWritten(path.to_path_buf()));
            }
            Err(e) => return Err(ConfigError::Read(path.to_path_buf(), e)),
        };

        let mut config: BackupConfig = toml::from_str(&config_str)?;
        if let Some(config_dir) = path.parent() {
            config.resolve_relative_to(config_dir);
        }
        config.validate()?;
        Ok(config)
    }

    fn resolve_relative_to(&mut self, dir: &Path) {
        let notification = &mut self.notification;
        for template in [
            &mut notification.success_template,
            &mut notification.failure_template,
        ] {
            if template.is_relative() {
                *template = dir.join(&*template);
            }
        }
    }

    /// Semantic checks that TOML deserialization can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retention.validate()?;
        self.timeouts.validate()?;

        let destination = &self.destination;
        if !destination.mount_point.is_absolute() || !destination.backup_root.is_absolute() {
            return Err(ConfigError::Invalid(
                "mount_point and backup_root have to be absolute paths".to_string(),
            ));
        }
        if !destination.backup_root.starts_with(&destination.mount_point)
            || destination.backup_root == destination.mount_point
        {
            return Err(ConfigError::Invalid(format!(
                "backup_root {} has to be a subdirectory of mount_point {}",
                destination.backup_root.display(),
                destination.mount_point.display()
            )));
        }
        if self.notification.recipient_list().is_empty() {
            return Err(ConfigError::Invalid("no report recipients".to_string()));
        }
        if self.customer_name.trim().is_empty() {
            return Err(ConfigError::Invalid("customer_name is empty".to_string()));
        }
        Ok(())
    }

    /// Redactor for every credential in the configuration.
    pub fn redactor(&self) -> Redactor {
        Redactor::new([self.database.password.clone(), self.smtp.password.clone()])
    }
}
