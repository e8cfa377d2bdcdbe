use rust_decimal::Decimal;
use thiserror::Error;

use crate::config::ConfigError;
use crate::ports::execution::GatewayError;
use crate::ports::market_data::MarketDataError;
use crate::stats::StatsError;

/// Failure classes of one orchestration cycle. Only `Configuration` is fatal.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("data error for {context}: {reason}")]
    Data { context: String, reason: String },
    #[error("insufficient margin: available {available}, required {required}")]
    Margin { available: Decimal, required: Decimal },
    #[error("execution error: {0}")]
    Execution(#[from] GatewayError),
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl EngineError {
    pub fn data(context: impl Into<String>, reason: impl ToString) -> Self {
        EngineError::Data {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }
}

impl From<StatsError> for EngineError {
    fn from(err: StatsError) -> Self {
        EngineError::data("statistics", err)
    }
}

impl From<MarketDataError> for EngineError {
    fn from(err: MarketDataError) -> Self {
        EngineError::data("market data", err)
    }
}
