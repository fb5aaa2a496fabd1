//! Outbound email.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::config::SmtpConfig;
use crate::error::ServerError;

const OUTBOX_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl OutgoingMail {
    pub fn password_reset(to: &str, link: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: "Reset your password".to_string(),
            text: format!(
                "Reset your password using this link:\n\n{link}\n\nIf you didn't request this, ignore."
            ),
            html: format!(
                "<p>Reset your password using this link:</p><p><a href=\"{link}\">Reset password</a></p>"
            ),
        }
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> Result<(), ServerError>;
}

/// Records mail through `tracing` instead of delivering it. Bodies are not
/// logged because reset links are credentials.
pub struct LogMailer {
    from: String,
    sent: Mutex<Vec<OutgoingMail>>,
}

impl LogMailer {
    pub fn new(smtp: &SmtpConfig) -> Self {
        Self {
            from: smtp.from.clone(),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// The most recent mail handed to this mailer.
    pub fn outbox(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<(), ServerError> {
        info!(from = %self.from, to = %mail.to, subject = %mail.subject, "Mail queued");
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        if sent.len() >= OUTBOX_LIMIT {
            sent.remove(0);
        }
        sent.push(mail);
        Ok(())
    }
}
