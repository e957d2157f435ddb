use crate::config::MailConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

pub const VERIFICATION_SUBJECT: &str = "Handwriting App - Email Verification Code";
pub const RESET_SUBJECT: &str = "Handwriting App - Password Reset Request";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub text: String,
}

impl OutgoingMail {
    pub fn verification_code(to: &str, code: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: VERIFICATION_SUBJECT.to_string(),
            text: format!(
                "Your verification code is: {code}\n\nThis code will expire in 5 minutes."
            ),
        }
    }

    pub fn password_reset(to: &str, frontend_url: &str, token: &str) -> Self {
        let link = format!(
            "{}/reset-password?token={}",
            frontend_url.trim_end_matches('/'),
            token
        );
        Self {
            to: to.to_string(),
            subject: RESET_SUBJECT.to_string(),
            text: format!(
                "You requested a password reset.\n\nOpen this link to choose a new password:\n{link}\n\nThe link expires in 1 hour. If you did not request this, ignore this email."
            ),
        }
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> Result<()>;
}

/// Transactional mail over an HTTPS API with a bearer key.
#[derive(Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    config: MailConfig,
}

#[derive(Serialize)]
struct MailPayload<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

impl HttpMailer {
    pub fn new(config: MailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<()> {
        self.client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&MailPayload {
                from: &self.config.from,
                to: &mail.to,
                subject: &mail.subject,
                text: &mail.text,
            })
            .send()
            .await
            .context("mail request failed")?
            .error_for_status()
            .context("mail provider rejected message")?;
        tracing::info!("Sent \"{}\" to {}", mail.subject, mail.to);
        Ok(())
    }
}

/// Development fallback: the message is written to the log instead of sent.
#[derive(Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<()> {
        tracing::warn!(
            "Mail delivery not configured; would send \"{}\" to {}:\n{}",
            mail.subject,
            mail.to,
            mail.text
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_mail_links_to_frontend() {
        let mail = OutgoingMail::password_reset("a@b.c", "https://app.example/", "abc123");
        assert_eq!(mail.subject, RESET_SUBJECT);
        assert!(mail
            .text
            .contains("https://app.example/reset-password?token=abc123"));
    }

    #[test]
    fn verification_mail_carries_code() {
        let mail = OutgoingMail::verification_code("a@b.c", "123456");
        assert_eq!(mail.subject, VERIFICATION_SUBJECT);
        assert!(mail.text.contains("123456"));
    }

    #[tokio::test]
    async fn log_mailer_always_succeeds() {
        let mail = OutgoingMail::verification_code("a@b.c", "000000");
        assert!(LogMailer.send(mail).await.is_ok());
    }
}
