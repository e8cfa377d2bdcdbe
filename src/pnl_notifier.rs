use rust_decimal::Decimal;

use crate::email_client::EmailClient;

pub fn notify_profit(agent: Option<&str>, pair_key: &str, unrealized_pnl: Decimal) {
    let subject = match agent {
        Some(agent) => format!("[{}] Profit alert {}", agent, pair_key),
        None => format!("[cointrade] Profit alert {}", pair_key),
    };
    let body = format!(
        "Open pair {} shows unrealized PnL of {} USDT.",
        pair_key,
        unrealized_pnl.round_dp(4)
    );
    EmailClient::new().send(&subject, &body);
    log::info!("[PNL] profit alert for {} at {}", pair_key, unrealized_pnl.round_dp(4));
}

pub fn notify_startup_close_failure(agent: Option<&str>, summary: &str, detail: &str) {
    let subject = match agent {
        Some(agent) => format!("[{}] Startup close failed", agent),
        None => "[cointrade] Startup close failed".to_string(),
    };
    let body = format!(
        "Positions left open after startup reconciliation: {}\nLast error: {}",
        summary, detail
    );
    EmailClient::new().send(&subject, &body);
}
