use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::binance::BinanceFuturesClient;
use crate::config::{get_binance_config_from_env, RunMode};
use crate::pairtrade::PairTradeConfig;
use crate::ports::execution::ExecutionGateway;
use crate::ports::market_data::MarketDataSource;
use crate::ports::replay::ReplayConnector;

/// The collaborators selected by `exchange`. Replay hands out the same
/// connector for both seams and keeps a handle so the engine can advance it.
pub struct ConnectorBox {
    pub market_data: Arc<dyn MarketDataSource>,
    pub gateway: Arc<dyn ExecutionGateway>,
    pub replay: Option<Arc<ReplayConnector>>,
}

impl ConnectorBox {
    pub fn create(cfg: &PairTradeConfig) -> Result<Self> {
        match cfg.exchange.as_str() {
            "binance" => {
                let run_mode = RunMode::from_dry_run(cfg.dry_run);
                let binance_config =
                    get_binance_config_from_env(run_mode, cfg.rest_endpoint.as_deref())?;
                log::info!(
                    "[CONFIG] binance endpoint={} mode={:?}",
                    binance_config.base_url,
                    run_mode
                );
                let client = Arc::new(
                    BinanceFuturesClient::new(
                        binance_config,
                        run_mode,
                        Duration::from_millis(cfg.rate_limit_delay_ms),
                        cfg.equity_usd_fallback,
                    )
                    .context("failed to build binance client")?,
                );
                Ok(Self {
                    market_data: client.clone(),
                    gateway: client,
                    replay: None,
                })
            }
            "replay" => {
                let file = cfg
                    .backtest_file
                    .as_deref()
                    .context("replay exchange requires backtest_file")?;
                let replay = Arc::new(
                    ReplayConnector::new(Path::new(file), cfg.equity_usd_fallback)
                        .with_context(|| format!("failed to load replay file {}", file))?,
                );
                log::info!("[REPLAY] loaded {} bars from {}", replay.len(), file);
                Ok(Self {
                    market_data: replay.clone(),
                    gateway: replay.clone(),
                    replay: Some(replay),
                })
            }
            other => bail!("unsupported exchange: {}", other),
        }
    }
}
