use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::state_machine::TradingParams;
use crate::config::ConfigError;
use crate::ports::market_data::Timeframe;

const DEFAULT_EXCHANGE: &str = "binance";
const DEFAULT_TIMEFRAME: Timeframe = Timeframe::H1;
const DEFAULT_LOOKBACK_DAYS: u32 = 20;
const DEFAULT_MIN_QUOTE_VOLUME_24H: f64 = 200_000_000.0;
const DEFAULT_ZSCORE_WINDOW: usize = 20;
const DEFAULT_MAX_CANDIDATES: usize = 50;
const DEFAULT_ZSCORE_THRESHOLD: f64 = -1.5;
const DEFAULT_TP_BUFFER: f64 = 0.0002;
const DEFAULT_POSITION_SIZE: Decimal = dec!(50);
const DEFAULT_LEVERAGE: u32 = 10;
const DEFAULT_STOP_LOSS_PERCENT: f64 = 0.03;
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 3600;
const DEFAULT_SCAN_OFFSET_SECS: u64 = 60;
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 180;
const DEFAULT_RATE_LIMIT_DELAY_MS: u64 = 100;
const DEFAULT_DATA_DIR: &str = "cointrade_data";
const DEFAULT_FORCE_CLOSE_ON_STARTUP: bool = true;
const DEFAULT_STARTUP_FORCE_CLOSE_ATTEMPTS: u32 = 3;
const DEFAULT_STARTUP_FORCE_CLOSE_WAIT_SECS: u64 = 3;
const DEFAULT_PROFIT_ALERT_USD: Decimal = dec!(1);
const DEFAULT_EQUITY_USD: Decimal = dec!(10000);
const DEFAULT_DATA_DUMP_FILE: &str = "cointrade_dump.jsonl";

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub(crate) enum StringOrVec {
    String(String),
    Vec(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        let items = match self {
            StringOrVec::String(value) => value.split(',').map(str::to_string).collect(),
            StringOrVec::Vec(values) => values,
        };
        normalize_symbols(items)
    }
}

fn normalize_symbols(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = items
        .into_iter()
        .map(|item| item.trim().to_uppercase())
        .filter(|item| !item.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct PairTradeYaml {
    exchange: Option<String>,
    rest_endpoint: Option<String>,
    dry_run: Option<bool>,
    agent_name: Option<String>,
    timeframe: Option<String>,
    lookback_days: Option<u32>,
    universe_symbols: Option<StringOrVec>,
    min_quote_volume_24h: Option<f64>,
    zscore_window: Option<usize>,
    max_candidates: Option<usize>,
    zscore_threshold: Option<f64>,
    tp_buffer: Option<f64>,
    position_size: Option<Decimal>,
    leverage: Option<u32>,
    stop_loss_percent: Option<f64>,
    scan_interval_secs: Option<u64>,
    scan_offset_secs: Option<u64>,
    monitor_interval_secs: Option<u64>,
    rate_limit_delay_ms: Option<u64>,
    data_dir: Option<String>,
    backtest_file: Option<String>,
    force_close_on_startup: Option<bool>,
    startup_force_close_attempts: Option<u32>,
    startup_force_close_wait_secs: Option<u64>,
    half_life_exit: Option<bool>,
    profit_alert_usd: Option<Decimal>,
    equity_usd_fallback: Option<Decimal>,
    enable_data_dump: Option<bool>,
    data_dump_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PairTradeConfig {
    pub exchange: String,
    pub rest_endpoint: Option<String>,
    pub dry_run: bool,
    pub agent_name: Option<String>,
    pub timeframe: Timeframe,
    pub lookback_days: u32,
    /// Empty means discover by 24h quote volume.
    pub universe_symbols: Vec<String>,
    pub min_quote_volume_24h: f64,
    pub zscore_window: usize,
    pub max_candidates: usize,
    pub zscore_threshold: f64,
    pub tp_buffer: f64,
    pub position_size: Decimal,
    pub leverage: u32,
    pub stop_loss_percent: f64,
    pub scan_interval_secs: u64,
    pub scan_offset_secs: u64,
    pub monitor_interval_secs: u64,
    pub rate_limit_delay_ms: u64,
    pub data_dir: PathBuf,
    pub backtest_file: Option<String>,
    pub force_close_on_startup: bool,
    pub startup_force_close_attempts: u32,
    pub startup_force_close_wait_secs: u64,
    pub half_life_exit: bool,
    pub profit_alert_usd: Decimal,
    pub equity_usd_fallback: Decimal,
    pub enable_data_dump: bool,
    pub data_dump_file: Option<String>,
}

impl Default for PairTradeConfig {
    fn default() -> Self {
        Self::from_yaml(PairTradeYaml::default())
    }
}

impl PairTradeConfig {
    /// YAML from `COINTRADE_CONFIG` when set, then environment overrides.
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("COINTRADE_CONFIG")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let mut cfg = match config_path {
            Some(path) => Self::from_yaml_path(path)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .map_err(|e| ConfigError::File {
                path: path_ref.display().to_string(),
                reason: e.to_string(),
            })?;
        let yaml: PairTradeYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse cointrade config {}", path_ref.display()))?;
        Ok(Self::from_yaml(yaml))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let yaml: PairTradeYaml =
            serde_yaml::from_str(text).context("failed to parse cointrade config")?;
        Ok(Self::from_yaml(yaml))
    }

    fn from_yaml(yaml: PairTradeYaml) -> Self {
        let timeframe = yaml
            .timeframe
            .as_deref()
            .and_then(|tf| match tf.parse() {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    log::warn!("[CONFIG] {}; using {}", err, DEFAULT_TIMEFRAME);
                    None
                }
            })
            .unwrap_or(DEFAULT_TIMEFRAME);
        PairTradeConfig {
            exchange: yaml
                .exchange
                .unwrap_or_else(|| DEFAULT_EXCHANGE.to_string())
                .to_lowercase(),
            rest_endpoint: yaml.rest_endpoint.filter(|v| !v.trim().is_empty()),
            dry_run: yaml.dry_run.unwrap_or(true),
            agent_name: yaml.agent_name,
            timeframe,
            lookback_days: yaml.lookback_days.unwrap_or(DEFAULT_LOOKBACK_DAYS),
            universe_symbols: yaml
                .universe_symbols
                .map(StringOrVec::into_vec)
                .unwrap_or_default(),
            min_quote_volume_24h: yaml
                .min_quote_volume_24h
                .unwrap_or(DEFAULT_MIN_QUOTE_VOLUME_24H),
            zscore_window: yaml.zscore_window.unwrap_or(DEFAULT_ZSCORE_WINDOW),
            max_candidates: yaml.max_candidates.unwrap_or(DEFAULT_MAX_CANDIDATES),
            zscore_threshold: yaml.zscore_threshold.unwrap_or(DEFAULT_ZSCORE_THRESHOLD),
            tp_buffer: yaml.tp_buffer.unwrap_or(DEFAULT_TP_BUFFER),
            position_size: yaml.position_size.unwrap_or(DEFAULT_POSITION_SIZE),
            leverage: yaml.leverage.unwrap_or(DEFAULT_LEVERAGE),
            stop_loss_percent: yaml.stop_loss_percent.unwrap_or(DEFAULT_STOP_LOSS_PERCENT),
            scan_interval_secs: yaml
                .scan_interval_secs
                .unwrap_or(DEFAULT_SCAN_INTERVAL_SECS),
            scan_offset_secs: yaml.scan_offset_secs.unwrap_or(DEFAULT_SCAN_OFFSET_SECS),
            monitor_interval_secs: yaml
                .monitor_interval_secs
                .unwrap_or(DEFAULT_MONITOR_INTERVAL_SECS),
            rate_limit_delay_ms: yaml
                .rate_limit_delay_ms
                .unwrap_or(DEFAULT_RATE_LIMIT_DELAY_MS),
            data_dir: PathBuf::from(
                yaml.data_dir
                    .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            ),
            backtest_file: yaml.backtest_file,
            force_close_on_startup: yaml
                .force_close_on_startup
                .unwrap_or(DEFAULT_FORCE_CLOSE_ON_STARTUP),
            startup_force_close_attempts: yaml
                .startup_force_close_attempts
                .unwrap_or(DEFAULT_STARTUP_FORCE_CLOSE_ATTEMPTS),
            startup_force_close_wait_secs: yaml
                .startup_force_close_wait_secs
                .unwrap_or(DEFAULT_STARTUP_FORCE_CLOSE_WAIT_SECS),
            half_life_exit: yaml.half_life_exit.unwrap_or(false),
            profit_alert_usd: yaml.profit_alert_usd.unwrap_or(DEFAULT_PROFIT_ALERT_USD),
            equity_usd_fallback: yaml.equity_usd_fallback.unwrap_or(DEFAULT_EQUITY_USD),
            enable_data_dump: yaml.enable_data_dump.unwrap_or(false),
            data_dump_file: yaml.data_dump_file,
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = env_string("EXCHANGE") {
            self.exchange = value.to_lowercase();
        }
        if let Some(value) = env_string("REST_ENDPOINT") {
            self.rest_endpoint = Some(value);
        }
        if let Some(value) = env_string("DRY_RUN") {
            self.dry_run = value.to_lowercase() == "true";
        }
        if let Some(value) = env_string("AGENT_NAME") {
            self.agent_name = Some(value);
        }
        if let Some(value) = env_string("TIMEFRAME") {
            self.timeframe = value
                .parse()
                .map_err(|reason: String| ConfigError::invalid("TIMEFRAME", reason))?;
        }
        override_parsed("LOOKBACK_DAYS", &mut self.lookback_days)?;
        if let Some(value) = env_string("UNIVERSE_SYMBOLS") {
            self.universe_symbols = StringOrVec::String(value).into_vec();
        }
        override_parsed("MIN_QUOTE_VOLUME_24H", &mut self.min_quote_volume_24h)?;
        override_parsed("ZSCORE_WINDOW", &mut self.zscore_window)?;
        override_parsed("MAX_CANDIDATES", &mut self.max_candidates)?;
        override_parsed("ZSCORE_THRESHOLD", &mut self.zscore_threshold)?;
        override_parsed("TP_BUFFER", &mut self.tp_buffer)?;
        override_parsed("POSITION_SIZE", &mut self.position_size)?;
        override_parsed("LEVERAGE", &mut self.leverage)?;
        override_parsed("STOP_LOSS_PERCENT", &mut self.stop_loss_percent)?;
        override_parsed("SCAN_INTERVAL_SECS", &mut self.scan_interval_secs)?;
        override_parsed("SCAN_OFFSET_SECS", &mut self.scan_offset_secs)?;
        override_parsed("MONITOR_INTERVAL_SECS", &mut self.monitor_interval_secs)?;
        override_parsed("RATE_LIMIT_DELAY_MS", &mut self.rate_limit_delay_ms)?;
        if let Some(value) = env_string("DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(value) = env_string("BACKTEST_FILE") {
            self.backtest_file = Some(value);
        }
        override_bool("FORCE_CLOSE_ON_STARTUP", &mut self.force_close_on_startup);
        override_parsed(
            "STARTUP_FORCE_CLOSE_ATTEMPTS",
            &mut self.startup_force_close_attempts,
        )?;
        override_parsed(
            "STARTUP_FORCE_CLOSE_WAIT_SECS",
            &mut self.startup_force_close_wait_secs,
        )?;
        override_bool("HALF_LIFE_EXIT", &mut self.half_life_exit);
        override_parsed("PROFIT_ALERT_USD", &mut self.profit_alert_usd)?;
        override_parsed("EQUITY_USD_FALLBACK", &mut self.equity_usd_fallback)?;
        override_bool("ENABLE_DATA_DUMP", &mut self.enable_data_dump);
        if let Some(value) = env_string("DATA_DUMP_FILE") {
            self.data_dump_file = Some(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zscore_window < 3 {
            return Err(ConfigError::invalid("zscore_window", "must be at least 3"));
        }
        if self.max_candidates == 0 {
            return Err(ConfigError::invalid("max_candidates", "must be positive"));
        }
        if self.position_size <= Decimal::ZERO {
            return Err(ConfigError::invalid("position_size", "must be positive"));
        }
        if self.leverage == 0 {
            return Err(ConfigError::invalid("leverage", "must be positive"));
        }
        if !self.zscore_threshold.is_finite() || self.zscore_threshold >= 0.0 {
            return Err(ConfigError::invalid(
                "zscore_threshold",
                "must be a negative number",
            ));
        }
        if !self.tp_buffer.is_finite() || self.tp_buffer < 0.0 {
            return Err(ConfigError::invalid("tp_buffer", "must not be negative"));
        }
        if !(self.stop_loss_percent > 0.0 && self.stop_loss_percent <= 1.0) {
            return Err(ConfigError::invalid(
                "stop_loss_percent",
                "must be within (0, 1]",
            ));
        }
        if self.scan_interval_secs == 0 || self.monitor_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "scan_interval_secs/monitor_interval_secs",
                "must be positive",
            ));
        }
        if self.lookback_days == 0 {
            return Err(ConfigError::invalid("lookback_days", "must be positive"));
        }
        match self.exchange.as_str() {
            "binance" => {}
            "replay" => {
                if self.backtest_file.is_none() {
                    return Err(ConfigError::invalid(
                        "backtest_file",
                        "required when exchange is replay",
                    ));
                }
            }
            other => {
                return Err(ConfigError::invalid(
                    "exchange",
                    format!("unsupported exchange '{}'", other),
                ))
            }
        }
        Ok(())
    }

    pub fn is_replay(&self) -> bool {
        self.exchange == "replay"
    }

    pub fn trading_params(&self) -> TradingParams {
        TradingParams {
            zscore_threshold: self.zscore_threshold,
            tp_buffer: self.tp_buffer,
            position_size: self.position_size,
            leverage: self.leverage,
            stop_loss_percent: self.stop_loss_percent,
            half_life_exit: self.half_life_exit,
            bar_ms: self.timeframe.duration_ms(),
            profit_alert_usd: self.profit_alert_usd,
        }
    }

    pub fn lookback_ms(&self) -> i64 {
        i64::from(self.lookback_days) * 86_400_000
    }

    pub fn data_dump_path(&self) -> PathBuf {
        match &self.data_dump_file {
            Some(file) => PathBuf::from(file),
            None => self.data_dir.join(DEFAULT_DATA_DUMP_FILE),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn override_parsed<T>(key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = env_string(key) {
        *slot = value
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string()))?;
    }
    Ok(())
}

fn override_bool(key: &str, slot: &mut bool) {
    if let Some(value) = env_string(key) {
        *slot = value.to_lowercase() == "true";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design_values() {
        let cfg = PairTradeConfig::default();
        assert_eq!(cfg.exchange, "binance");
        assert!(cfg.dry_run);
        assert_eq!(cfg.timeframe, Timeframe::H1);
        assert_eq!(cfg.zscore_window, 20);
        assert_eq!(cfg.max_candidates, 50);
        assert_eq!(cfg.zscore_threshold, -1.5);
        assert_eq!(cfg.tp_buffer, 0.0002);
        assert_eq!(cfg.position_size, dec!(50));
        assert_eq!(cfg.leverage, 10);
        assert_eq!(cfg.stop_loss_percent, 0.03);
        assert!(cfg.universe_symbols.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn yaml_accepts_symbol_list_or_comma_string() {
        let cfg = PairTradeConfig::from_yaml_str(
            "universe_symbols: \"btcusdt, ETHUSDT,,ethusdt\"\ntimeframe: 4h\nposition_size: 25.5\n",
        )
        .unwrap();
        assert_eq!(cfg.universe_symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.timeframe, Timeframe::H4);
        assert_eq!(cfg.position_size, dec!(25.5));

        let cfg = PairTradeConfig::from_yaml_str("universe_symbols:\n  - SOLUSDT\n  - ADAUSDT\n")
            .unwrap();
        assert_eq!(cfg.universe_symbols, vec!["ADAUSDT", "SOLUSDT"]);
    }

    #[test]
    fn validate_rejects_nonsense() {
        let mut cfg = PairTradeConfig::default();
        cfg.zscore_threshold = 0.5;
        assert!(cfg.validate().is_err());

        let mut cfg = PairTradeConfig::default();
        cfg.zscore_window = 2;
        assert!(cfg.validate().is_err());

        let mut cfg = PairTradeConfig::default();
        cfg.exchange = "replay".into();
        assert!(cfg.validate().is_err());
        cfg.backtest_file = Some("dump.jsonl".into());
        assert!(cfg.validate().is_ok());

        let mut cfg = PairTradeConfig::default();
        cfg.position_size = Decimal::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn trading_params_follow_timeframe() {
        let cfg = PairTradeConfig::from_yaml_str("timeframe: 15m\nhalf_life_exit: true\n").unwrap();
        let params = cfg.trading_params();
        assert_eq!(params.bar_ms, 900_000);
        assert!(params.half_life_exit);
    }
}
