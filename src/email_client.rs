use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::env;

#[derive(Debug, Clone)]
struct SmtpSettings {
    server: String,
    username: String,
    password: String,
    from: String,
    to: String,
}

/// Operator alerts over SMTP. Without `SMTP_SERVER`/`EMAIL_TO` in the
/// environment every send is logged and dropped.
#[derive(Debug, Clone)]
pub struct EmailClient {
    settings: Option<SmtpSettings>,
}

impl Default for EmailClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailClient {
    pub fn new() -> Self {
        let var = |key: &str| env::var(key).ok().filter(|v| !v.trim().is_empty());
        let settings = match (var("SMTP_SERVER"), var("EMAIL_TO")) {
            (Some(server), Some(to)) => {
                let username = var("SMTP_USERNAME").unwrap_or_default();
                Some(SmtpSettings {
                    from: var("EMAIL_FROM").unwrap_or_else(|| username.clone()),
                    password: var("SMTP_PASSWORD").unwrap_or_default(),
                    server,
                    username,
                    to,
                })
            }
            _ => None,
        };
        Self { settings }
    }

    pub fn is_configured(&self) -> bool {
        self.settings.is_some()
    }

    /// Best effort. Failures are logged, never returned.
    pub fn send(&self, subject: &str, body: &str) {
        let Some(settings) = &self.settings else {
            log::debug!("[EMAIL] not configured, dropping '{}'", subject);
            return;
        };
        if let Err(err) = Self::deliver(settings, subject, body) {
            log::error!("[EMAIL] failed to send '{}': {}", subject, err);
        }
    }

    fn deliver(settings: &SmtpSettings, subject: &str, body: &str) -> anyhow::Result<()> {
        let email = Message::builder()
            .from(settings.from.parse()?)
            .to(settings.to.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;
        let mut builder = SmtpTransport::relay(&settings.server)?;
        if !settings.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ));
        }
        builder.build().send(&email)?;
        Ok(())
    }
}
