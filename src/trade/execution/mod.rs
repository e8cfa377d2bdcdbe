pub mod binance;
pub mod connector_box;

use rust_decimal::Decimal;

use crate::ports::execution::{ExecutionGateway, GatewayError, OrderResult};

pub use connector_box::ConnectorBox;

/// Flattens every open position with reduce-only market orders. Every leg is
/// attempted; the first failure is returned after the sweep.
pub async fn close_all_positions(
    gateway: &dyn ExecutionGateway,
) -> Result<Vec<OrderResult>, GatewayError> {
    let positions = gateway.get_open_positions().await?;
    let mut results = Vec::new();
    let mut first_error: Option<GatewayError> = None;
    for position in positions.iter().filter(|p| !p.is_flat()) {
        let side = position.closing_side();
        let qty = position.size.abs();
        match gateway
            .submit_market_order(&position.symbol, side, qty, true)
            .await
        {
            Ok(result) => {
                log::info!(
                    "[CLOSE] {} {} qty={} filled={}",
                    side,
                    position.symbol,
                    qty,
                    result.filled_quantity
                );
                results.push(result);
            }
            Err(GatewayError::ReduceOnlyRejected(detail)) => {
                log::warn!("[CLOSE] {} already flat ({})", position.symbol, detail);
            }
            Err(err) => {
                log::error!("[CLOSE] {} close failed: {}", position.symbol, err);
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(results),
    }
}

/// Total absolute size still open, used to confirm a sweep.
pub async fn open_exposure(gateway: &dyn ExecutionGateway) -> Result<Decimal, GatewayError> {
    Ok(gateway
        .get_open_positions()
        .await?
        .iter()
        .map(|p| p.size.abs())
        .sum())
}
