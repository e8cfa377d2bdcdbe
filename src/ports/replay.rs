use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use super::execution::{ExecutionGateway, GatewayError, OrderResult, OrderSide, PositionSnapshot};
use super::market_data::{MarketDataError, MarketDataSource, PricePoint, PriceSeries, Timeframe};
use super::paper::PaperBook;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpedSymbolSnapshot {
    pub price: Decimal,
}

/// One line of the JSONL market dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpedDataEntry {
    #[serde(alias = "timestamp_ms")]
    pub timestamp: i64,
    pub prices: BTreeMap<String, DumpedSymbolSnapshot>,
}

pub fn append_dump_entry(path: &Path, entry: &DumpedDataEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let line = serde_json::to_string(entry)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

/// Replays a recorded dump as both market data and a paper-trading venue.
/// Only bars up to the cursor are visible.
#[derive(Debug)]
pub struct ReplayConnector {
    data: Vec<DumpedDataEntry>,
    cursor: AtomicUsize,
    book: PaperBook,
}

impl ReplayConnector {
    pub fn new(path: &Path, initial_equity: Decimal) -> Result<Self, MarketDataError> {
        let file = File::open(path).map_err(|e| {
            MarketDataError::Rejected(format!(
                "failed to open replay file {}: {}",
                path.display(),
                e
            ))
        })?;
        let reader = BufReader::new(file);
        let mut data = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| {
                MarketDataError::Rejected(format!("failed to read replay line: {}", e))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: DumpedDataEntry = serde_json::from_str(&line).map_err(|e| {
                MarketDataError::Rejected(format!("failed to parse replay entry '{}': {}", line, e))
            })?;
            data.push(entry);
        }
        Self::from_entries(data, initial_equity)
    }

    pub fn from_entries(
        mut data: Vec<DumpedDataEntry>,
        initial_equity: Decimal,
    ) -> Result<Self, MarketDataError> {
        if data.is_empty() {
            return Err(MarketDataError::Rejected(
                "data dump file is empty or invalid".to_string(),
            ));
        }
        data.sort_by_key(|e| e.timestamp);
        Ok(Self {
            data,
            cursor: AtomicUsize::new(0),
            book: PaperBook::new(initial_equity),
        })
    }

    /// Advances one bar. Returns false once the last bar is current.
    pub fn tick(&self) -> bool {
        let current = self.cursor.load(AtomicOrdering::SeqCst);
        if current + 1 < self.data.len() {
            self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(AtomicOrdering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn current_timestamp_ms(&self) -> i64 {
        self.data[self.cursor()].timestamp
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.book.realized_pnl()
    }

    fn visible(&self) -> &[DumpedDataEntry] {
        &self.data[..=self.cursor()]
    }

    fn current_price(&self, symbol: &str) -> Option<Decimal> {
        self.data[self.cursor()]
            .prices
            .get(symbol)
            .map(|snapshot| snapshot.price)
    }

    fn series_since(&self, symbol: &str, since_ms: i64) -> Result<PriceSeries, MarketDataError> {
        let mut seen = false;
        let points: Vec<PricePoint> = self
            .visible()
            .iter()
            .filter_map(|entry| {
                let snapshot = entry.prices.get(symbol)?;
                seen = true;
                if entry.timestamp < since_ms {
                    return None;
                }
                Some(PricePoint {
                    ts: entry.timestamp,
                    close: snapshot.price.to_f64()?,
                })
            })
            .collect();
        if !seen {
            return Err(MarketDataError::UnknownSymbol(symbol.to_string()));
        }
        Ok(PriceSeries::new(symbol, points))
    }
}

#[async_trait]
impl MarketDataSource for ReplayConnector {
    async fn fetch_history(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        since_ms: i64,
    ) -> Result<PriceSeries, MarketDataError> {
        self.series_since(symbol, since_ms)
    }

    async fn fetch_recent(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<PriceSeries, MarketDataError> {
        let full = self.series_since(symbol, i64::MIN)?;
        let skip = full.len().saturating_sub(limit);
        Ok(PriceSeries::new(symbol, full.points()[skip..].to_vec()))
    }

    async fn list_instruments(
        &self,
        _min_quote_volume_24h: f64,
    ) -> Result<Vec<String>, MarketDataError> {
        let symbols: BTreeSet<String> = self.data[self.cursor()].prices.keys().cloned().collect();
        Ok(symbols.into_iter().collect())
    }

    fn now_ms(&self) -> i64 {
        self.current_timestamp_ms()
    }
}

#[async_trait]
impl ExecutionGateway for ReplayConnector {
    async fn get_available_margin(&self) -> Result<Decimal, GatewayError> {
        Ok(self.book.available_margin(|s| self.current_price(s)))
    }

    async fn get_last_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        self.current_price(symbol).ok_or_else(|| {
            GatewayError::Rejected(format!(
                "symbol '{}' not found at cursor {}",
                symbol,
                self.cursor()
            ))
        })
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderResult, GatewayError> {
        let price = self.get_last_price(symbol).await?;
        let result = self.book.fill(symbol, side, quantity, price, reduce_only, |s| {
            self.current_price(s)
        })?;
        log::debug!(
            "[REPLAY] filled {} {} qty={} @ {} (reduce_only={})",
            side,
            symbol,
            result.filled_quantity,
            price,
            reduce_only
        );
        Ok(result)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        self.book.set_leverage(symbol, leverage);
        Ok(())
    }

    async fn get_open_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
        Ok(self.book.positions(|s| self.current_price(s)))
    }
}
