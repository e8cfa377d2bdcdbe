use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
    New,
    Rejected,
}

impl OrderStatus {
    pub fn from_exchange(status: &str) -> Self {
        match status {
            "FILLED" => OrderStatus::Filled,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "NEW" => OrderStatus::New,
            _ => OrderStatus::Rejected,
        }
    }
}

/// Exchange acknowledgement of a market order. `filled_quantity` is what the
/// venue reports and may be smaller than the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub id: String,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_price: Option<Decimal>,
}

/// Signed position as reported by the venue. Positive size is long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub size: Decimal,
    pub entry_price: Option<Decimal>,
    pub unrealized_pnl: Decimal,
}

impl PositionSnapshot {
    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }

    /// Side of the order that flattens this position.
    pub fn closing_side(&self) -> OrderSide {
        if self.size.is_sign_negative() {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("reduce-only order rejected: {0}")]
    ReduceOnlyRejected(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("order rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self, GatewayError::InsufficientFunds(_))
    }
}

#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn get_available_margin(&self) -> Result<Decimal, GatewayError>;

    async fn get_last_price(&self, symbol: &str) -> Result<Decimal, GatewayError>;

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderResult, GatewayError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError>;

    /// Non-flat positions only.
    async fn get_open_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError>;
}

pub fn format_positions_summary(positions: &[PositionSnapshot]) -> String {
    if positions.is_empty() {
        return "none".to_string();
    }
    positions
        .iter()
        .map(|position| {
            let side = match position.size.cmp(&Decimal::ZERO) {
                Ordering::Greater => "LONG",
                Ordering::Less => "SHORT",
                Ordering::Equal => "FLAT",
            };
            let entry = position
                .entry_price
                .map(|price| price.to_string())
                .unwrap_or_else(|| "n/a".to_string());
            format!(
                "{} {} size={} entry={} upnl={}",
                position.symbol,
                side,
                position.size.abs(),
                entry,
                position.unrealized_pnl.round_dp(4)
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn closing_side_is_opposite_of_exposure() {
        let long = PositionSnapshot {
            symbol: "AAAUSDT".into(),
            size: dec!(1.5),
            entry_price: Some(dec!(10)),
            unrealized_pnl: Decimal::ZERO,
        };
        let short = PositionSnapshot {
            size: dec!(-2),
            ..long.clone()
        };
        assert_eq!(long.closing_side(), OrderSide::Sell);
        assert_eq!(short.closing_side(), OrderSide::Buy);
    }

    #[test]
    fn summary_lists_each_leg() {
        let positions = vec![
            PositionSnapshot {
                symbol: "AAAUSDT".into(),
                size: dec!(0.5),
                entry_price: Some(dec!(100)),
                unrealized_pnl: dec!(1.25),
            },
            PositionSnapshot {
                symbol: "BBBUSDT".into(),
                size: dec!(-2),
                entry_price: None,
                unrealized_pnl: dec!(-0.5),
            },
        ];
        assert_eq!(
            format_positions_summary(&positions),
            "AAAUSDT LONG size=0.5 entry=100 upnl=1.25, BBBUSDT SHORT size=2 entry=n/a upnl=-0.5"
        );
        assert_eq!(format_positions_summary(&[]), "none");
    }
}
