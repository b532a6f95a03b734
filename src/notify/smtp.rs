//! Delivery of reports over authenticated SMTP.

use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use super::{Mail, MailTransport, NotifyError};
use crate::config::{NotificationConfig, SmtpConfig, SmtpTls};

/// [MailTransport] using an SMTP relay.
pub struct SmtpMailer {
    transport: SmtpTransport,
    from: Mailbox,
    recipients: Vec<Mailbox>,
}

fn mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address.parse().map_err(|e: lettre::address::AddressError| NotifyError::Address {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

impl SmtpMailer {
    /// Connects lazily, so construction only fails on malformed settings.
    pub fn from_config(smtp: &SmtpConfig, notification: &NotificationConfig) -> Result<Self, NotifyError> {
        let from = mailbox(&smtp.from)?;
        let recipients = notification
            .recipient_list()
            .into_iter()
            .map(mailbox)
            .collect::<Result<Vec<_>, _>>()?;

        let builder = match smtp.tls {
            SmtpTls::StartTls => SmtpTransport::starttls_relay(&smtp.host),
            SmtpTls::Wrapper => SmtpTransport::relay(&smtp.host),
        }
        .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let transport = builder
            .port(smtp.port)
            .credentials(Credentials::new(
                smtp.username.clone(),
                smtp.password.expose().to_string(),
            ))
            .timeout(Some(Duration::from_secs(smtp.timeout_secs)))
            .build();
        log::debug!(
            target: "notify",
            "SMTP relay {}:{} ({:?}) for {} recipient(s)",
            smtp.host,
            smtp.port,
            smtp.tls,
            recipients.len()
        );

        Ok(Self {
            transport,
            from,
            recipients,
        })
    }

    fn message(&self, mail: &Mail) -> Result<Message, NotifyError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(mail.subject.as_str())
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }

        builder
            .body(mail.body.clone())
            .map_err(|e| NotifyError::Build(e.to_string()))
    }
}

impl MailTransport for SmtpMailer {
    fn send(&self, mail: &Mail) -> Result<(), NotifyError> {
        let message = self.message(mail)?;
        self.transport
            .send(&message)
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(())
    }
}
