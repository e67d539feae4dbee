//! Critical-alert channel.
//!
//! Replacement successes and failures, and the "no healthy nodes" condition,
//! go out over SMTP when credentials are configured. Delivery failures are
//! logged and swallowed; alerting must never take the control plane down.

use async_trait::async_trait;
use flotilla_core::config::{AlertConfig, SMTP_PASSWORD_ENV};
use flotilla_core::ops::Notifier;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{error, info, warn};

pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpNotifier {
    /// Build from config; the password comes from the environment so it
    /// never lands in the config file.
    pub fn from_config(config: &AlertConfig) -> anyhow::Result<Self> {
        let password = std::env::var(SMTP_PASSWORD_ENV)
            .map_err(|_| anyhow::anyhow!("{} not set", SMTP_PASSWORD_ENV))?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?
            .port(config.smtp_port)
            .credentials(Credentials::new(config.from.clone(), password))
            .build();
        Ok(Self {
            transport,
            from: config.from.parse()?,
            to: config.to.parse()?,
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, subject: &str, body: &str) {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(format!("[flotilla] {}", subject))
            .body(body.to_string());

        let message = match message {
            Ok(m) => m,
            Err(e) => {
                error!("building alert email '{}': {}", subject, e);
                return;
            }
        };

        match self.transport.send(message).await {
            Ok(_) => info!("alert sent: {}", subject),
            Err(e) => warn!("could not deliver alert '{}': {}", subject, e),
        }
    }
}

/// Fallback when SMTP is unconfigured: alerts land in the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, subject: &str, body: &str) {
        warn!("ALERT: {} — {}", subject, body);
    }
}
