//! Single-position trading lifecycle: NONE -> OPEN -> CLOSING -> NONE.
//!
//! The machine owns the only `Position`. Entry is never evaluated while a
//! position exists, which keeps at most one pair open by construction.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::signal::{rolling_zscore, spread_series, PairSignal};
use crate::error::EngineError;
use crate::ports::execution::{ExecutionGateway, GatewayError, OrderResult, OrderSide};
use crate::ports::market_data::{MarketDataSource, PriceSeries, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    None,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionState::None => "NONE",
            PositionState::Open => "OPEN",
            PositionState::Closing => "CLOSING",
            PositionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    HalfLifeElapsed,
    EntryLegFailed,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::HalfLifeElapsed => "half_life_elapsed",
            ExitReason::EntryLegFailed => "entry_leg_failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradingParams {
    pub zscore_threshold: f64,
    pub tp_buffer: f64,
    /// Notional per leg in quote currency.
    pub position_size: Decimal,
    pub leverage: u32,
    pub stop_loss_percent: f64,
    pub half_life_exit: bool,
    /// Sampling interval, used to turn a half-life into a holding time.
    pub bar_ms: i64,
    pub profit_alert_usd: Decimal,
}

impl TradingParams {
    pub fn required_margin(&self) -> Decimal {
        self.position_size * Decimal::TWO
    }

    pub fn stop_loss_usd(&self) -> f64 {
        self.stop_loss_percent * 2.0 * self.position_size.to_f64().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub pair_key: String,
    pub symbol_a: String,
    pub symbol_b: String,
    pub hedge_ratio: f64,
    pub long_symbol: String,
    pub short_symbol: String,
    /// Filled quantities still held on each leg.
    pub long_qty: Decimal,
    pub short_qty: Decimal,
    pub entry_time_ms: i64,
    pub entry_zscore: f64,
    pub entry_mean_zscore: f64,
    pub half_life: Option<f64>,
    pub state: PositionState,
    pub close_reason: Option<ExitReason>,
    pub last_zscore: Option<f64>,
    pub last_unrealized_pnl: Decimal,
    pub profit_alert_sent: bool,
}

impl Position {
    fn legs(&self) -> [(&str, OrderSide, Decimal); 2] {
        [
            (self.long_symbol.as_str(), OrderSide::Sell, self.long_qty),
            (self.short_symbol.as_str(), OrderSide::Buy, self.short_qty),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorInputs {
    pub current_zscore: Option<f64>,
    pub unrealized_pnl: Decimal,
    pub now_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorDecision {
    Hold,
    Close(ExitReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    /// A position already exists.
    NotFlat,
    NoCandidate,
    BelowThreshold { pair_key: String, zscore: f64 },
    Opened { pair_key: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    NothingToClose,
    Closed(Position),
}

pub struct TradingStateMachine {
    params: TradingParams,
    position: Option<Position>,
}

impl TradingStateMachine {
    pub fn new(params: TradingParams) -> Self {
        Self {
            params,
            position: None,
        }
    }

    pub fn params(&self) -> &TradingParams {
        &self.params
    }

    pub fn state(&self) -> PositionState {
        self.position
            .as_ref()
            .map(|p| p.state)
            .unwrap_or(PositionState::None)
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn position_mut(&mut self) -> Option<&mut Position> {
        self.position.as_mut()
    }

    /// Actionable signal with the most negative current z-score.
    pub fn select_entry<'a>(&self, signals: &'a [PairSignal]) -> Option<&'a PairSignal> {
        signals
            .iter()
            .filter(|s| s.is_actionable())
            .min_by(|x, y| {
                let zx = x.current_zscore().unwrap_or(f64::INFINITY);
                let zy = y.current_zscore().unwrap_or(f64::INFINITY);
                zx.partial_cmp(&zy)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| y.candidate.zero_crossings.cmp(&x.candidate.zero_crossings))
                    .then_with(|| x.key().cmp(&y.key()))
            })
    }

    pub async fn evaluate_entry(
        &mut self,
        signals: &[PairSignal],
        gateway: &dyn ExecutionGateway,
        now_ms: i64,
    ) -> Result<EntryOutcome, EngineError> {
        if self.position.is_some() {
            return Ok(EntryOutcome::NotFlat);
        }
        let best = match self.select_entry(signals) {
            Some(signal) => signal,
            None => return Ok(EntryOutcome::NoCandidate),
        };
        let key = best.key();
        let (zscore, mean_zscore) = match (best.current_zscore(), best.stats.mean_zscore) {
            (Some(z), Some(m)) => (z, m),
            _ => return Ok(EntryOutcome::NoCandidate),
        };
        if !(zscore < self.params.zscore_threshold) {
            return Ok(EntryOutcome::BelowThreshold {
                pair_key: key,
                zscore,
            });
        }

        let available = gateway.get_available_margin().await?;
        let required = self.params.required_margin();
        if available < required {
            return Err(EngineError::Margin {
                available,
                required,
            });
        }

        // Negative z: A is cheap relative to B.
        let candidate = &best.candidate;
        let long_symbol = candidate.symbol_a.clone();
        let short_symbol = candidate.symbol_b.clone();

        for symbol in [&long_symbol, &short_symbol] {
            gateway.set_leverage(symbol, self.params.leverage).await?;
        }
        let long_price = gateway.get_last_price(&long_symbol).await?;
        let short_price = gateway.get_last_price(&short_symbol).await?;
        if long_price <= Decimal::ZERO || short_price <= Decimal::ZERO {
            return Err(EngineError::data(
                key,
                format!("invalid prices long={} short={}", long_price, short_price),
            ));
        }
        let long_target = self.params.position_size / long_price;
        let short_target = self.params.position_size / short_price;
        log::info!(
            "[ENTRY] {} z={:.4} mean_z={:.4} long {} qty={} @ {} short {} qty={} @ {}",
            key,
            zscore,
            mean_zscore,
            long_symbol,
            long_target,
            long_price,
            short_symbol,
            short_target,
            short_price
        );

        let long_qty = match gateway
            .submit_market_order(&long_symbol, OrderSide::Buy, long_target, false)
            .await
        {
            Ok(result) => reconcile_fill(gateway, &long_symbol, &result).await,
            Err(err) => {
                log::warn!("[ENTRY] {} long leg {} failed: {}", key, long_symbol, err);
                return Err(err.into());
            }
        };
        if long_qty.is_zero() {
            return Err(GatewayError::Rejected(format!(
                "long leg {} reported no fill",
                long_symbol
            ))
            .into());
        }

        let mut position = Position {
            pair_key: key.clone(),
            symbol_a: candidate.symbol_a.clone(),
            symbol_b: candidate.symbol_b.clone(),
            hedge_ratio: candidate.hedge_ratio,
            long_symbol: long_symbol.clone(),
            short_symbol: short_symbol.clone(),
            long_qty,
            short_qty: Decimal::ZERO,
            entry_time_ms: now_ms,
            entry_zscore: zscore,
            entry_mean_zscore: mean_zscore,
            half_life: best.stats.half_life,
            state: PositionState::Open,
            close_reason: None,
            last_zscore: Some(zscore),
            last_unrealized_pnl: Decimal::ZERO,
            profit_alert_sent: false,
        };

        let short_result = gateway
            .submit_market_order(&short_symbol, OrderSide::Sell, short_target, false)
            .await;
        let short_qty = match short_result {
            Ok(result) => reconcile_fill(gateway, &short_symbol, &result).await,
            Err(err) => {
                log::error!(
                    "[ENTRY] {} short leg {} failed: {}; unwinding long leg next cycle",
                    key,
                    short_symbol,
                    err
                );
                position.state = PositionState::Closing;
                position.close_reason = Some(ExitReason::EntryLegFailed);
                self.position = Some(position);
                return Err(err.into());
            }
        };
        position.short_qty = short_qty;
        if short_qty.is_zero() {
            log::error!(
                "[ENTRY] {} short leg {} reported no fill; unwinding long leg next cycle",
                key,
                short_symbol
            );
            position.state = PositionState::Closing;
            position.close_reason = Some(ExitReason::EntryLegFailed);
            self.position = Some(position);
            return Err(GatewayError::Rejected(format!(
                "short leg {} reported no fill",
                short_symbol
            ))
            .into());
        }

        log::info!(
            "[ENTRY] {} OPEN long {}={} short {}={}",
            key,
            long_symbol,
            long_qty,
            short_symbol,
            short_qty
        );
        self.position = Some(position);
        Ok(EntryOutcome::Opened { pair_key: key })
    }

    /// Exit rule for an open position. Stop-loss wins over take-profit, which
    /// wins over the optional half-life timer.
    pub fn decide_exit(
        params: &TradingParams,
        position: &Position,
        inputs: &MonitorInputs,
    ) -> MonitorDecision {
        let pnl = inputs.unrealized_pnl.to_f64().unwrap_or(0.0);
        if pnl <= -params.stop_loss_usd() {
            return MonitorDecision::Close(ExitReason::StopLoss);
        }
        if let Some(z) = inputs.current_zscore {
            if (z - position.entry_mean_zscore).abs() <= params.tp_buffer {
                return MonitorDecision::Close(ExitReason::TakeProfit);
            }
        }
        if params.half_life_exit {
            if let Some(hl) = position.half_life {
                let hold_ms = (hl.ceil() as i64).saturating_mul(params.bar_ms);
                if inputs.now_ms - position.entry_time_ms >= hold_ms {
                    return MonitorDecision::Close(ExitReason::HalfLifeElapsed);
                }
            }
        }
        MonitorDecision::Hold
    }

    /// Records the latest observation and moves OPEN to CLOSING when an exit
    /// rule fires. No-op unless a position is OPEN.
    pub fn apply_monitor(&mut self, inputs: MonitorInputs) -> MonitorDecision {
        let params = &self.params;
        let position = match self.position.as_mut() {
            Some(p) if p.state == PositionState::Open => p,
            _ => return MonitorDecision::Hold,
        };
        if inputs.current_zscore.is_some() {
            position.last_zscore = inputs.current_zscore;
        }
        position.last_unrealized_pnl = inputs.unrealized_pnl;
        let decision = Self::decide_exit(params, position, &inputs);
        if let MonitorDecision::Close(reason) = decision {
            log::info!(
                "[EXIT_CHECK] {} -> CLOSING ({}) z={:?} entry_mean_z={:.4} upnl={}",
                position.pair_key,
                reason,
                inputs.current_zscore,
                position.entry_mean_zscore,
                inputs.unrealized_pnl.round_dp(4)
            );
            position.state = PositionState::Closing;
            position.close_reason = Some(reason);
        }
        decision
    }

    /// Refreshes the open pair's z-score and PnL from the collaborators and
    /// applies the exit rules. Missing prices only disable take-profit; a
    /// failed position query is returned so the cycle retries.
    pub async fn monitor(
        &mut self,
        market_data: &dyn MarketDataSource,
        gateway: &dyn ExecutionGateway,
        timeframe: Timeframe,
        window: usize,
    ) -> Result<MonitorDecision, EngineError> {
        let (key, symbol_a, symbol_b, hedge_ratio, long_symbol, short_symbol) =
            match self.position.as_ref() {
                Some(p) if p.state == PositionState::Open => (
                    p.pair_key.clone(),
                    p.symbol_a.clone(),
                    p.symbol_b.clone(),
                    p.hedge_ratio,
                    p.long_symbol.clone(),
                    p.short_symbol.clone(),
                ),
                _ => return Ok(MonitorDecision::Hold),
            };

        let limit = window * 2;
        let current_zscore = match (
            market_data.fetch_recent(&symbol_a, timeframe, limit).await,
            market_data.fetch_recent(&symbol_b, timeframe, limit).await,
        ) {
            (Ok(a), Ok(b)) => latest_zscore(&a, &b, hedge_ratio, window),
            (Err(err), _) | (_, Err(err)) => {
                log::warn!("[EXIT_CHECK] {} price refresh failed: {}", key, err);
                None
            }
        };

        let positions = gateway.get_open_positions().await?;
        let unrealized_pnl: Decimal = positions
            .iter()
            .filter(|p| p.symbol == long_symbol || p.symbol == short_symbol)
            .map(|p| p.unrealized_pnl)
            .sum();
        log::debug!(
            "[EXIT_CHECK] {} z={:?} upnl={}",
            key,
            current_zscore,
            unrealized_pnl.round_dp(4)
        );

        Ok(self.apply_monitor(MonitorInputs {
            current_zscore,
            unrealized_pnl,
            now_ms: market_data.now_ms(),
        }))
    }

    /// Sends reduce-only orders for whatever each leg still holds. The
    /// position stays CLOSING on any failure so the next cycle retries.
    pub async fn execute_close(
        &mut self,
        gateway: &dyn ExecutionGateway,
    ) -> Result<CloseOutcome, EngineError> {
        let position = match self.position.as_mut() {
            Some(p) if p.state == PositionState::Closing => p,
            _ => return Ok(CloseOutcome::NothingToClose),
        };
        let mut first_error: Option<GatewayError> = None;
        let legs = position.legs();
        let mut remaining = [legs[0].2, legs[1].2];
        for (i, (symbol, side, qty)) in legs.iter().enumerate() {
            if qty.is_zero() {
                continue;
            }
            match gateway.submit_market_order(symbol, *side, *qty, true).await {
                Ok(result) => {
                    let left = if result.filled_quantity > Decimal::ZERO {
                        (*qty - result.filled_quantity).max(Decimal::ZERO)
                    } else {
                        held_quantity(gateway, symbol).await.unwrap_or(*qty)
                    };
                    log::info!(
                        "[CLOSE] {} {} {} qty={} filled={} remaining={}",
                        position.pair_key,
                        side,
                        symbol,
                        qty,
                        result.filled_quantity,
                        left
                    );
                    remaining[i] = left;
                }
                Err(GatewayError::ReduceOnlyRejected(detail)) => {
                    log::warn!(
                        "[CLOSE] {} {} already flat on venue ({})",
                        position.pair_key,
                        symbol,
                        detail
                    );
                    remaining[i] = Decimal::ZERO;
                }
                Err(err) => {
                    log::error!(
                        "[CLOSE] {} {} close failed: {}; retrying next cycle",
                        position.pair_key,
                        symbol,
                        err
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        position.long_qty = remaining[0];
        position.short_qty = remaining[1];

        if let Some(err) = first_error {
            return Err(err.into());
        }
        if !(position.long_qty.is_zero() && position.short_qty.is_zero()) {
            return Err(GatewayError::Rejected(format!(
                "{} partially closed, long={} short={} left",
                position.pair_key, position.long_qty, position.short_qty
            ))
            .into());
        }

        let mut closed = match self.position.take() {
            Some(p) => p,
            None => return Ok(CloseOutcome::NothingToClose),
        };
        closed.state = PositionState::Closed;
        log::info!(
            "[CLOSE] {} CLOSED reason={} upnl_at_exit={}",
            closed.pair_key,
            closed
                .close_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "n/a".to_string()),
            closed.last_unrealized_pnl.round_dp(4)
        );
        Ok(CloseOutcome::Closed(closed))
    }
}

/// Latest rolling z-score of the spread over the aligned tail of two series.
pub fn latest_zscore(
    a: &PriceSeries,
    b: &PriceSeries,
    hedge_ratio: f64,
    window: usize,
) -> Option<f64> {
    let aligned = PriceSeries::align(a, b);
    let spread = spread_series(&aligned.a, &aligned.b, hedge_ratio);
    rolling_zscore(&spread, window).last().copied().flatten()
}

/// Trusts the reported fill; a zero report is checked against the venue's
/// position before concluding nothing filled.
async fn reconcile_fill(
    gateway: &dyn ExecutionGateway,
    symbol: &str,
    result: &OrderResult,
) -> Decimal {
    if result.filled_quantity > Decimal::ZERO {
        return result.filled_quantity;
    }
    match held_quantity(gateway, symbol).await {
        Some(qty) => {
            log::warn!(
                "[ORDER] {} order {} reported zero fill, venue shows {}",
                symbol,
                result.id,
                qty
            );
            qty
        }
        None => Decimal::ZERO,
    }
}

async fn held_quantity(gateway: &dyn ExecutionGateway, symbol: &str) -> Option<Decimal> {
    match gateway.get_open_positions().await {
        Ok(positions) => Some(
            positions
                .iter()
                .find(|p| p.symbol == symbol)
                .map(|p| p.size.abs())
                .unwrap_or(Decimal::ZERO),
        ),
        Err(err) => {
            log::warn!("[ORDER] position query for {} failed: {}", symbol, err);
            None
        }
    }
}
