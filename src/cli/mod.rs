use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use derive_more::{Display, Error};
use log::LevelFilter;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Configuration file. A default one is written if it doesn't exist.
    #[arg(long, env = "NC_BACKUP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Simulative backup run.
    #[arg(long)]
    pub dry_run: bool,

    /// What to do: `-restore`, `-test-success` or `-test-failure`. Backs up
    /// if omitted.
    #[arg(value_name = "MODE", allow_hyphen_values = true)]
    pub mode: Option<Mode>,
}

impl Cli {
    pub fn mode(&self) -> Mode {
        self.mode.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum Mode {
    /// Back up the Nextcloud database, web root and data. (Default)
    #[default]
    #[display("backup")]
    Backup,
    /// Restore the latest snapshots into a staging directory.
    #[display("-restore")]
    Restore,
    /// Send a success report of a fabricated run.
    #[display("-test-success")]
    TestSuccess,
    /// Send a failure report of a fabricated run.
    #[display("-test-failure")]
    TestFailure,
}

#[derive(Debug, Display, Error)]
#[display("Unknown mode {_0:?}, expected one of -restore, -test-success or -test-failure")]
pub struct UnknownMode(#[error(ignore)] String);

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "-restore" => Ok(Self::Restore),
            "-test-success" => Ok(Self::TestSuccess),
            "-test-failure" => Ok(Self::TestFailure),
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn no_mode_backs_up() {
        let cli = Cli::try_parse_from(["nc-restic-backup", "--config", "/tmp/c.toml"]).unwrap();

        assert_eq!(cli.mode(), Mode::Backup);
        assert_eq!(cli.config, PathBuf::from("/tmp/c.toml"));
        assert!(!cli.dry_run);
    }

    #[test]
    fn dash_modes_are_positional() {
        let cli = Cli::try_parse_from(["nc-restic-backup", "--dry-run", "-restore"]).unwrap();
        assert_eq!(cli.mode(), Mode::Restore);
        assert!(cli.dry_run);

        let cli = Cli::try_parse_from(["nc-restic-backup", "-test-failure"]).unwrap();
        assert_eq!(cli.mode(), Mode::TestFailure);
    }

    #[test]
    fn unknown_mode_is_a_usage_error() {
        assert!(Cli::try_parse_from(["nc-restic-backup", "-bogus"]).is_err());
        assert!(Cli::try_parse_from(["nc-restic-backup", "restore"]).is_err());
    }
}
