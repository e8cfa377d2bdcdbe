use crate::email_client::EmailClient;
use once_cell::sync::Lazy;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MIN_INTERVAL: Duration = Duration::from_secs(600);

static RATE_LIMIT_NOTIFIER: Lazy<RateLimitNotifier> = Lazy::new(RateLimitNotifier::new);

/// Emails the operator when the exchange throttles us, at most once per
/// ten minutes.
pub fn notify_rate_limit(context: &str, detail: &str) {
    RATE_LIMIT_NOTIFIER.notify(context, detail);
}

struct RateLimitNotifier {
    agent_name: String,
    last_sent: Mutex<Option<Instant>>,
}

impl RateLimitNotifier {
    fn new() -> Self {
        let agent_name = std::env::var("AGENT_NAME").unwrap_or_default();
        Self {
            agent_name,
            last_sent: Mutex::new(None),
        }
    }

    fn notify(&self, context: &str, detail: &str) {
        {
            let mut last = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
            if last.map(|t| t.elapsed() < MIN_INTERVAL).unwrap_or(false) {
                log::warn!("[RateLimit] {} throttled again: {}", context, detail);
                return;
            }
            *last = Some(Instant::now());
        }
        let subject = if self.agent_name.is_empty() {
            format!("[RateLimit] {}", context)
        } else {
            format!("[{}] Rate limit - {}", self.agent_name, context)
        };
        let body = format!(
            "Exchange throttled requests while {}.\nDetail: {}",
            context, detail
        );

        EmailClient::new().send(&subject, &body);
        log::warn!(
            "[RateLimit] notification sent for '{}' (detail: {})",
            context,
            detail
        );
    }
}
