//! Email report of a run.
//!
//! The [Notifier] picks the success or failure template by the run's
//! status, renders it and hands the mail to a [MailTransport]. Reports are
//! best effort: [Notifier::report] logs delivery failures and never lets
//! them influence the outcome of the run.

mod smtp;
pub mod template;

use std::path::PathBuf;

use derive_more::{Display, Error, From};

pub use smtp::SmtpMailer;
pub use template::{Placeholders, Template, TemplateError};

use crate::config::BackupConfig;
use crate::pipeline::{RunResult, RunStatus};

/// A rendered report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub subject: String,
    pub body: String,
}

/// Delivers a [Mail] to the configured recipients.
pub trait MailTransport {
    fn send(&self, mail: &Mail) -> Result<(), NotifyError>;
}

#[derive(Debug, Display, Error, From)]
/// Errors on building or delivering a report.
pub enum NotifyError {
    #[from]
    Template(TemplateError),
    /// A sender or recipient address is malformed.
    #[display("Invalid email address {address:?}: {reason}")]
    Address { address: String, reason: String },
    /// The mail couldn't be assembled.
    #[display("Building the email failed: {_0}")]
    Build(#[error(ignore)] String),
    /// The SMTP server refused the mail or couldn't be reached.
    #[display("Sending the email failed: {_0}")]
    Transport(#[error(ignore)] String),
}

/// Renders and sends reports of a [RunResult].
pub struct Notifier {
    transport: Box<dyn MailTransport>,
    success: Template,
    failure: Template,
    customer_name: String,
    backup_dir: PathBuf,
}

impl Notifier {
    /// Loads and validates both templates.
    pub fn new(config: &BackupConfig, transport: Box<dyn MailTransport>) -> Result<Self, NotifyError> {
        let success = Template::load(&config.notification.success_template)?;
        let failure = Template::load(&config.notification.failure_template)?;

        Ok(Self::with_templates(config, transport, success, failure))
    }

    pub fn with_templates(
        config: &BackupConfig,
        transport: Box<dyn MailTransport>,
        success: Template,
        failure: Template,
    ) -> Self {
        Self {
            transport,
            success,
            failure,
            customer_name: config.customer_name.clone(),
            backup_dir: config.destination.backup_root.clone(),
        }
    }

    /// Renders the report of `result`.
    pub fn compose(&self, result: &RunResult) -> Mail {
        let customer = &self.customer_name;
        let (template, subject) = match (result.overall_status, result.synthetic) {
            (RunStatus::Success, false) => (
                &self.success,
                format!("🔹 Success: {customer} Nextcloud Backup Completed - [Backup Summary]"),
            ),
            (RunStatus::Failure, false) => (
                &self.failure,
                format!("🔻 Alert: {customer} Nextcloud Backup Failed - Immediate Attention Required"),
            ),
            (RunStatus::Success, true) => (
                &self.success,
                format!("Test: {customer} Nextcloud Backup Success"),
            ),
            (RunStatus::Failure, true) => (
                &self.failure,
                format!("Test: {customer} Nextcloud Backup Failure"),
            ),
        };

        let values = Placeholders {
            date: result.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            backup_dir: self.backup_dir.display().to_string(),
            step: result.failed_step.clone().unwrap_or_default(),
            customer_name: customer.clone(),
        };

        Mail {
            subject,
            body: template.render(&values),
        }
    }

    /// Sends the report of `result`.
    pub fn notify(&self, result: &RunResult) -> Result<(), NotifyError> {
        let mail = self.compose(result);
        log::debug!(target: "notify", "Sending report: {}", mail.subject);
        self.transport.send(&mail)
    }

    /// Sends the report of `result`, logging instead of returning failures.
    pub fn report(&self, result: &RunResult) {
        match self.notify(result) {
            Ok(()) => log::info!(target: "notify", "Notification email sent"),
            Err(e) => log::error!(target: "notify", "Failed to send email notification: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[derive(Clone, Default)]
    struct Outbox(Rc<RefCell<Vec<Mail>>>);

    impl MailTransport for Outbox {
        fn send(&self, mail: &Mail) -> Result<(), NotifyError> {
            self.0.borrow_mut().push(mail.clone());
            Ok(())
        }
    }

    struct Unreachable;

    impl MailTransport for Unreachable {
        fn send(&self, _mail: &Mail) -> Result<(), NotifyError> {
            Err(NotifyError::Transport("connection refused".to_string()))
        }
    }

    fn notifier(transport: Box<dyn MailTransport>) -> Notifier {
        let mut config = BackupConfig::default();
        config.customer_name = "ACME".to_string();
        Notifier::with_templates(
            &config,
            transport,
            "OK {customer_name} {backup_dir}".parse().unwrap(),
            "FAILED at {step} on {date}".parse().unwrap(),
        )
    }

    #[test]
    fn failure_uses_failure_template() {
        let outbox = Outbox::default();
        let notifier = notifier(Box::new(outbox.clone()));
        let result = RunResult::precondition_failed("verify-mount");

        notifier.report(&result);

        let sent = outbox.0.borrow();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.starts_with("🔻 Alert: ACME"));
        assert!(sent[0].body.starts_with("FAILED at verify-mount on "));
    }

    #[test]
    fn success_has_empty_step() {
        let notifier = notifier(Box::new(Outbox::default()));
        let mut result = RunResult::synthetic(RunStatus::Success);
        result.synthetic = false;

        let mail = notifier.compose(&result);

        assert!(mail.subject.starts_with("🔹 Success: ACME"));
        assert_eq!(mail.body, "OK ACME /mnt/backup/nextcloud");
    }

    #[test]
    fn synthetic_results_get_test_subjects() {
        let notifier = notifier(Box::new(Outbox::default()));

        let mail = notifier.compose(&RunResult::synthetic(RunStatus::Failure));

        assert_eq!(mail.subject, "Test: ACME Nextcloud Backup Failure");
        assert!(mail.body.starts_with("FAILED at Test notification"));
    }

    #[test]
    fn delivery_failure_is_swallowed() {
        let notifier = notifier(Box::new(Unreachable));
        let result = RunResult::precondition_failed("verify-mount");

        assert!(notifier.notify(&result).is_err());
        notifier.report(&result);
        assert_eq!(result.overall_status, RunStatus::Failure);
    }

    #[test]
    fn missing_template_file_fails_construction() {
        let mut config = BackupConfig::default();
        config.notification.success_template = "/nonexistent/success".into();

        let err = Notifier::new(&config, Box::new(Outbox::default())).err().unwrap();

        assert!(matches!(err, NotifyError::Template(TemplateError::Read(..))));
    }
}
