use anyhow::Context;
use cointrade::logging::{init_logging, ENGINE_LOG_FILTER};
use cointrade::pairtrade::{PairTradeConfig, PairTradeEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(ENGINE_LOG_FILTER);

    let git_hash = option_env!("COINTRADE_GIT_HASH").unwrap_or("unknown");
    log::info!("cointrade git: {}", git_hash);
    log::info!("Starting pair-trade loop...");
    let cfg = PairTradeConfig::from_env_or_yaml().context("invalid cointrade config")?;
    let mut engine = PairTradeEngine::new(cfg)
        .await
        .context("failed to initialize pair trade engine")?;
    engine.run().await
}
