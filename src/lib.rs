pub mod ports {
    pub mod execution;
    pub mod market_data;
    pub mod paper;
    pub mod replay;
}
pub mod config;
pub mod email_client;
pub mod error;
pub mod logging;
pub mod pairtrade;
pub mod pnl_notifier;
pub mod rate_limit_notifier;
pub mod stats;
pub mod trade;

#[cfg(test)]
pub(crate) mod testkit;
