//! Scriptable collaborators for unit tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::ports::execution::{
    ExecutionGateway, GatewayError, OrderResult, OrderSide, OrderStatus, PositionSnapshot,
};
use crate::ports::market_data::{
    MarketDataError, MarketDataSource, PricePoint, PriceSeries, PriceTable, Timeframe,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub reduce_only: bool,
}

#[derive(Debug, Default)]
struct GatewayState {
    margin: Decimal,
    prices: HashMap<String, Decimal>,
    positions: HashMap<String, Decimal>,
    pnl: HashMap<String, Decimal>,
    failures: HashMap<String, GatewayError>,
    orders: Vec<RecordedOrder>,
    leverage: Vec<(String, u32)>,
    fill_ratio: Option<Decimal>,
    report_zero_fill: bool,
    positions_error: Option<GatewayError>,
}

#[derive(Debug, Default)]
pub(crate) struct MockGateway {
    state: Mutex<GatewayState>,
}

impl MockGateway {
    pub fn new(margin: Decimal) -> Self {
        let gateway = Self::default();
        gateway.state.lock().unwrap().margin = margin;
        gateway
    }

    pub fn set_margin(&self, margin: Decimal) {
        self.state.lock().unwrap().margin = margin;
    }

    pub fn with_price(self, symbol: &str, price: Decimal) -> Self {
        self.set_price(symbol, price);
        self
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.state
            .lock()
            .unwrap()
            .prices
            .insert(symbol.to_string(), price);
    }

    pub fn set_pnl(&self, symbol: &str, pnl: Decimal) {
        self.state.lock().unwrap().pnl.insert(symbol.to_string(), pnl);
    }

    pub fn set_position(&self, symbol: &str, size: Decimal) {
        self.state
            .lock()
            .unwrap()
            .positions
            .insert(symbol.to_string(), size);
    }

    pub fn fail_orders_for(&self, symbol: &str, err: GatewayError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(symbol.to_string(), err);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    pub fn fail_positions(&self, err: Option<GatewayError>) {
        self.state.lock().unwrap().positions_error = err;
    }

    /// Fraction of each order that fills.
    pub fn set_fill_ratio(&self, ratio: Decimal) {
        self.state.lock().unwrap().fill_ratio = Some(ratio);
    }

    /// Fills happen but the acknowledgement reports zero.
    pub fn set_report_zero_fill(&self, value: bool) {
        self.state.lock().unwrap().report_zero_fill = value;
    }

    pub fn orders(&self) -> Vec<RecordedOrder> {
        self.state.lock().unwrap().orders.clone()
    }

    pub fn leverage_calls(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().leverage.clone()
    }

    pub fn position(&self, symbol: &str) -> Decimal {
        self.state
            .lock()
            .unwrap()
            .positions
            .get(symbol)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionGateway for MockGateway {
    async fn get_available_margin(&self) -> Result<Decimal, GatewayError> {
        Ok(self.state.lock().unwrap().margin)
    }

    async fn get_last_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        self.state
            .lock()
            .unwrap()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::Rejected(format!("no price for {}", symbol)))
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderResult, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.orders.push(RecordedOrder {
            symbol: symbol.to_string(),
            side,
            quantity,
            reduce_only,
        });
        if let Some(err) = state.failures.get(symbol) {
            return Err(err.clone());
        }
        let current = state.positions.get(symbol).copied().unwrap_or_default();
        let mut filled = quantity * state.fill_ratio.unwrap_or(Decimal::ONE);
        if reduce_only {
            let reduces = match side {
                OrderSide::Buy => current < Decimal::ZERO,
                OrderSide::Sell => current > Decimal::ZERO,
            };
            if !reduces {
                return Err(GatewayError::ReduceOnlyRejected(symbol.to_string()));
            }
            filled = filled.min(current.abs());
        }
        let signed = match side {
            OrderSide::Buy => filled,
            OrderSide::Sell => -filled,
        };
        state.positions.insert(symbol.to_string(), current + signed);
        let reported = if state.report_zero_fill {
            Decimal::ZERO
        } else {
            filled
        };
        let avg_price = state.prices.get(symbol).copied();
        Ok(OrderResult {
            id: format!("mock-{}", state.orders.len()),
            status: OrderStatus::Filled,
            filled_quantity: reported,
            avg_price,
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        self.state
            .lock()
            .unwrap()
            .leverage
            .push((symbol.to_string(), leverage));
        Ok(())
    }

    async fn get_open_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.positions_error {
            return Err(err.clone());
        }
        let mut out: Vec<PositionSnapshot> = state
            .positions
            .iter()
            .filter(|(_, size)| !size.is_zero())
            .map(|(symbol, size)| PositionSnapshot {
                symbol: symbol.clone(),
                size: *size,
                entry_price: state.prices.get(symbol).copied(),
                unrealized_pnl: state.pnl.get(symbol).copied().unwrap_or_default(),
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(out)
    }
}

#[derive(Debug, Default)]
struct MarketState {
    table: PriceTable,
    failing: HashMap<String, MarketDataError>,
    now_ms: i64,
    instruments_error: Option<MarketDataError>,
}

#[derive(Debug, Default)]
pub(crate) struct MockMarketData {
    state: Mutex<MarketState>,
}

impl MockMarketData {
    pub fn new(now_ms: i64) -> Self {
        let source = Self::default();
        source.state.lock().unwrap().now_ms = now_ms;
        source
    }

    /// Closes at consecutive bars ending at `now_ms`.
    pub fn set_closes(&self, symbol: &str, closes: &[f64], bar_ms: i64) {
        let mut state = self.state.lock().unwrap();
        let end = state.now_ms;
        let n = closes.len() as i64;
        let points = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| PricePoint {
                ts: end - (n - 1 - i as i64) * bar_ms,
                close,
            })
            .collect();
        state
            .table
            .insert(symbol.to_string(), PriceSeries::new(symbol, points));
    }

    pub fn fail_symbol(&self, symbol: &str, err: MarketDataError) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(symbol.to_string(), err);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing.clear();
        state.instruments_error = None;
    }

    pub fn fail_instruments(&self, err: MarketDataError) {
        self.state.lock().unwrap().instruments_error = Some(err);
    }

    pub fn set_now_ms(&self, now_ms: i64) {
        self.state.lock().unwrap().now_ms = now_ms;
    }

    fn lookup(&self, symbol: &str) -> Result<PriceSeries, MarketDataError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = state.failing.get(symbol) {
            return Err(err.clone());
        }
        state
            .table
            .get(symbol)
            .cloned()
            .ok_or_else(|| MarketDataError::UnknownSymbol(symbol.to_string()))
    }
}

#[async_trait]
impl MarketDataSource for MockMarketData {
    async fn fetch_history(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        since_ms: i64,
    ) -> Result<PriceSeries, MarketDataError> {
        let series = self.lookup(symbol)?;
        let points = series
            .points()
            .iter()
            .filter(|p| p.ts >= since_ms)
            .copied()
            .collect();
        Ok(PriceSeries::new(symbol, points))
    }

    async fn fetch_recent(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<PriceSeries, MarketDataError> {
        let series = self.lookup(symbol)?;
        let skip = series.len().saturating_sub(limit);
        Ok(PriceSeries::new(symbol, series.points()[skip..].to_vec()))
    }

    async fn list_instruments(
        &self,
        _min_quote_volume_24h: f64,
    ) -> Result<Vec<String>, MarketDataError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.instruments_error {
            return Err(err.clone());
        }
        Ok(state.table.keys().cloned().collect())
    }

    fn now_ms(&self) -> i64 {
        self.state.lock().unwrap().now_ms
    }
}
