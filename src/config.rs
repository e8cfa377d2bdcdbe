use std::env;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_BINANCE_REST_ENDPOINT: &str = "https://fapi.binance.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Dry,
    RealTrade,
}

impl RunMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            RunMode::Dry
        } else {
            RunMode::RealTrade
        }
    }
}

#[derive(Clone)]
pub struct BinanceConfig {
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
}

impl fmt::Debug for BinanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinanceConfig")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"***")
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn mask(value: &str) -> String {
    if value.len() <= 4 {
        return "***".to_string();
    }
    format!("{}***", &value[..4])
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingVar(String),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
    #[error("failed to read config file {path}: {reason}")]
    File { path: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Credentials are only required for live trading. Dry runs read public
/// endpoints and trade against a paper book.
pub fn get_binance_config_from_env(
    mode: RunMode,
    rest_endpoint: Option<&str>,
) -> Result<BinanceConfig, ConfigError> {
    let base_url = rest_endpoint
        .map(str::to_string)
        .or_else(|| env::var("REST_ENDPOINT").ok())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BINANCE_REST_ENDPOINT.to_string())
        .trim_end_matches('/')
        .to_string();

    let read = |key: &str| -> Result<String, ConfigError> {
        env::var(key)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingVar(key.to_string()))
    };

    let (api_key, api_secret) = match mode {
        RunMode::RealTrade => (read("BINANCE_API_KEY")?, read("BINANCE_API_SECRET")?),
        RunMode::Dry => (
            read("BINANCE_API_KEY").unwrap_or_default(),
            read("BINANCE_API_SECRET").unwrap_or_default(),
        ),
    };

    Ok(BinanceConfig {
        api_key,
        api_secret,
        base_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_masks_secrets() {
        let cfg = BinanceConfig {
            api_key: "abcdefgh".into(),
            api_secret: "topsecret".into(),
            base_url: DEFAULT_BINANCE_REST_ENDPOINT.into(),
        };
        let printed = format!("{:?}", cfg);
        assert!(printed.contains("abcd***"));
        assert!(!printed.contains("topsecret"));
    }

    #[test]
    fn explicit_endpoint_wins_and_is_trimmed() {
        let cfg = get_binance_config_from_env(RunMode::Dry, Some("https://example.test/")).unwrap();
        assert_eq!(cfg.base_url, "https://example.test");
    }
}
