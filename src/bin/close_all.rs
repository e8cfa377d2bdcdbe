use anyhow::{bail, Context};
use cointrade::logging::init_logging;
use cointrade::pairtrade::PairTradeConfig;
use cointrade::ports::execution::format_positions_summary;
use cointrade::trade::execution::{close_all_positions, open_exposure, ConnectorBox};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("info");

    let cfg = PairTradeConfig::from_env_or_yaml().context("invalid cointrade config")?;
    if cfg.is_replay() {
        bail!("close-all needs a live exchange, got exchange=replay");
    }
    let connectors = ConnectorBox::create(&cfg)?;
    let gateway = connectors.gateway.as_ref();

    let positions = gateway
        .get_open_positions()
        .await
        .context("failed to query open positions")?;
    log::info!("[CLOSE] open positions: {}", format_positions_summary(&positions));
    if positions.is_empty() {
        return Ok(());
    }

    let results = close_all_positions(gateway)
        .await
        .context("close-all did not complete")?;
    log::info!("[CLOSE] submitted {} reduce-only orders", results.len());

    let left = open_exposure(gateway).await?;
    if !left.is_zero() {
        bail!("exposure still open after close-all: {}", left);
    }
    log::info!("[CLOSE] all positions closed");
    Ok(())
}
