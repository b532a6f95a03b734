use std::process::ExitCode;

use clap::Parser;
use nc_backup_lib::backends::ResticRepository;
use nc_backup_lib::cli::{Cli, Mode};
use nc_backup_lib::config::{BackupConfig, ConfigError};
use nc_backup_lib::notify::{Notifier, SmtpMailer};
use nc_backup_lib::orchestrator::{self, BackupRun, RunOutcome};
use nc_backup_lib::pipeline::RunStatus;
use nc_backup_lib::signal::SignalGuard;

/// Exit status on configuration and usage errors.
const CONFIG_ERROR: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mode = cli.mode();

    // init logger, progress is logged on info
    let mut env_logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }

    let config = match BackupConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e @ ConfigError::DefaultWritten(_)) => {
            log::warn!("{e}");
            return ExitCode::from(CONFIG_ERROR);
        }
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(CONFIG_ERROR);
        }
    };

    let notifier = match SmtpMailer::from_config(&config.smtp, &config.notification)
        .and_then(|mailer| Notifier::new(&config, Box::new(mailer)))
    {
        Ok(notifier) => notifier,
        Err(e) => {
            log::error!(target: "notify", "Setting up the email report failed: {e}");
            return ExitCode::from(CONFIG_ERROR);
        }
    };

    let outcome = match mode {
        Mode::TestSuccess => orchestrator::test_notification(&notifier, RunStatus::Success),
        Mode::TestFailure => orchestrator::test_notification(&notifier, RunStatus::Failure),
        Mode::Backup | Mode::Restore => {
            let signals = match SignalGuard::install() {
                Ok(signals) => signals,
                Err(e) => {
                    log::error!(target: "signal", "Installing signal handlers failed: {e}");
                    return ExitCode::FAILURE;
                }
            };

            if cli.dry_run {
                log::warn!("Running in dry-run mode");
            }
            let repository = ResticRepository::from_config(&config.repository);
            let run = BackupRun::new(&config, &repository, &notifier, &signals).dry_run(cli.dry_run);
            match mode {
                Mode::Restore => run.restore(),
                _ => run.backup(),
            }
        }
    };

    if !matches!(outcome, RunOutcome::Notified(_)) {
        print!("{}", outcome.result());
    }
    ExitCode::from(outcome.exit_code())
}
