//! Binance USD-M futures over REST.
//!
//! Market data always comes from the public endpoints. Orders go to the
//! signed endpoints in live mode and to a [`PaperBook`] in dry-run mode.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::config::{BinanceConfig, RunMode};
use crate::ports::execution::{
    ExecutionGateway, GatewayError, OrderResult, OrderSide, OrderStatus, PositionSnapshot,
};
use crate::ports::market_data::{
    MarketDataError, MarketDataSource, PricePoint, PriceSeries, Timeframe,
};
use crate::ports::paper::PaperBook;
use crate::rate_limit_notifier::notify_rate_limit;

type HmacSha256 = Hmac<Sha256>;

const KLINES_PAGE_LIMIT: usize = 1500;
const RECV_WINDOW_MS: u64 = 5000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Failure of a single REST call before it is mapped onto a port error.
#[derive(Debug, Clone, PartialEq)]
enum ApiError {
    Transport(String),
    Http {
        status: u16,
        code: Option<i64>,
        msg: String,
    },
    Decode(String),
}

impl ApiError {
    fn is_rate_limited(&self) -> bool {
        matches!(self, ApiError::Http { status, .. } if *status == 429 || *status == 418)
    }

    fn describe(&self) -> String {
        match self {
            ApiError::Transport(msg) => format!("transport: {}", msg),
            ApiError::Http { status, code, msg } => {
                format!("http {} code {:?}: {}", status, code, msg)
            }
            ApiError::Decode(msg) => format!("decode: {}", msg),
        }
    }
}

fn to_market_error(err: ApiError, symbol: &str) -> MarketDataError {
    match &err {
        ApiError::Http {
            code: Some(-1121), ..
        } => MarketDataError::UnknownSymbol(symbol.to_string()),
        ApiError::Transport(_) => MarketDataError::Transient(err.describe()),
        ApiError::Http { status, .. } if err.is_rate_limited() || *status >= 500 => {
            MarketDataError::Transient(err.describe())
        }
        _ => MarketDataError::Rejected(err.describe()),
    }
}

fn to_gateway_error(err: ApiError) -> GatewayError {
    match &err {
        ApiError::Http {
            code: Some(-2019) | Some(-2018),
            ..
        } => GatewayError::InsufficientFunds(err.describe()),
        ApiError::Http {
            code: Some(-2022), ..
        } => GatewayError::ReduceOnlyRejected(err.describe()),
        ApiError::Transport(_) => GatewayError::Network(err.describe()),
        ApiError::Http { status, .. } if err.is_rate_limited() || *status >= 500 => {
            GatewayError::Network(err.describe())
        }
        _ => GatewayError::Rejected(err.describe()),
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    status: String,
    #[serde(default)]
    contract_type: String,
    #[serde(default)]
    quote_asset: String,
    #[serde(default)]
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolFilter {
    filter_type: String,
    #[serde(default)]
    step_size: Option<String>,
}

impl SymbolInfo {
    fn lot_step(&self) -> Option<Decimal> {
        ["MARKET_LOT_SIZE", "LOT_SIZE"].iter().find_map(|kind| {
            self.filters
                .iter()
                .find(|f| f.filter_type == *kind)
                .and_then(|f| f.step_size.as_deref())
                .and_then(|s| Decimal::from_str(s).ok())
                .filter(|step| *step > Decimal::ZERO)
        })
    }

    fn is_usdt_perpetual(&self) -> bool {
        self.status == "TRADING" && self.contract_type == "PERPETUAL" && self.quote_asset == "USDT"
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    symbol: String,
    quote_volume: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountInfo {
    available_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    status: String,
    executed_qty: String,
    #[serde(default)]
    avg_price: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
    un_realized_profit: String,
}

fn parse_decimal(value: &str, field: &str) -> Result<Decimal, ApiError> {
    Decimal::from_str(value).map_err(|e| ApiError::Decode(format!("{} '{}': {}", field, value, e)))
}

/// Floors `qty` to a multiple of `step`.
pub fn quantize_to_step(qty: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return qty;
    }
    ((qty / step).trunc() * step).normalize()
}

pub fn sign_query(secret: &str, query: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Parses one kline row: `[openTime, open, high, low, close, volume, closeTime, ...]`.
fn parse_kline(row: &[serde_json::Value]) -> Option<(PricePoint, i64)> {
    let open_time = row.first()?.as_i64()?;
    let close = row.get(4)?.as_str()?.parse::<f64>().ok()?;
    let close_time = row.get(6)?.as_i64()?;
    Some((
        PricePoint {
            ts: open_time,
            close,
        },
        close_time,
    ))
}

pub struct BinanceFuturesClient {
    client: Client,
    cfg: BinanceConfig,
    run_mode: RunMode,
    rate_limit_delay: Duration,
    lot_steps: RwLock<HashMap<String, Decimal>>,
    paper: Option<PaperBook>,
    marks: Mutex<HashMap<String, Decimal>>,
}

impl BinanceFuturesClient {
    pub fn new(
        cfg: BinanceConfig,
        run_mode: RunMode,
        rate_limit_delay: Duration,
        paper_equity: Decimal,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        let paper = match run_mode {
            RunMode::Dry => Some(PaperBook::new(paper_equity)),
            RunMode::RealTrade => None,
        };
        Ok(Self {
            client,
            cfg,
            run_mode,
            rate_limit_delay,
            lot_steps: RwLock::new(HashMap::new()),
            paper,
            marks: Mutex::new(HashMap::new()),
        })
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
        signed: bool,
    ) -> Result<T, ApiError> {
        let mut query = encode_query(&params);
        if signed {
            let timestamp = chrono::Utc::now().timestamp_millis();
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&format!(
                "recvWindow={}&timestamp={}",
                RECV_WINDOW_MS, timestamp
            ));
            let signature = sign_query(&self.cfg.api_secret, &query);
            query.push_str(&format!("&signature={}", signature));
        }
        let url = if query.is_empty() {
            format!("{}{}", self.cfg.base_url, path)
        } else {
            format!("{}{}?{}", self.cfg.base_url, path, query)
        };
        let mut request = self.client.request(method, &url);
        if signed {
            request = request.header("X-MBX-APIKEY", &self.cfg.api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        if status != StatusCode::OK {
            let parsed = serde_json::from_str::<ApiErrorBody>(&body).ok();
            let err = ApiError::Http {
                status: status.as_u16(),
                code: parsed.as_ref().map(|b| b.code),
                msg: parsed.map(|b| b.msg).unwrap_or(body),
            };
            if err.is_rate_limited() {
                notify_rate_limit(&format!("calling {}", path), &err.describe());
            }
            return Err(err);
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(format!("{}: {}", path, e)))
    }

    async fn public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T, ApiError> {
        self.send(Method::GET, path, params, false).await
    }

    async fn load_exchange_info(&self) -> Result<ExchangeInfo, ApiError> {
        let info: ExchangeInfo = self.public("/fapi/v1/exchangeInfo", vec![]).await?;
        let mut steps = self.lot_steps.write().await;
        for symbol in &info.symbols {
            if let Some(step) = symbol.lot_step() {
                steps.insert(symbol.symbol.clone(), step);
            }
        }
        Ok(info)
    }

    async fn lot_step(&self, symbol: &str) -> Result<Option<Decimal>, ApiError> {
        if let Some(step) = self.lot_steps.read().await.get(symbol) {
            return Ok(Some(*step));
        }
        self.load_exchange_info().await?;
        Ok(self.lot_steps.read().await.get(symbol).copied())
    }

    async fn klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<(PricePoint, i64)>, ApiError> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("interval", timeframe.as_str().to_string()),
            ("limit", limit.min(KLINES_PAGE_LIMIT).to_string()),
        ];
        if let Some(start) = start_ms {
            params.push(("startTime", start.to_string()));
        }
        let rows: Vec<Vec<serde_json::Value>> = self.public("/fapi/v1/klines", params).await?;
        Ok(rows.iter().filter_map(|row| parse_kline(row)).collect())
    }

    fn finished(points: Vec<(PricePoint, i64)>, now_ms: i64) -> Vec<PricePoint> {
        points
            .into_iter()
            .filter(|(_, close_time)| *close_time <= now_ms)
            .map(|(point, _)| point)
            .collect()
    }

    fn remember_mark(&self, symbol: &str, price: Decimal) {
        self.marks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(symbol.to_string(), price);
    }

    fn mark(&self, symbol: &str) -> Option<Decimal> {
        self.marks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
            .copied()
    }

    async fn ticker_price(&self, symbol: &str) -> Result<Decimal, ApiError> {
        let ticker: TickerPrice = self
            .public("/fapi/v1/ticker/price", vec![("symbol", symbol.to_string())])
            .await?;
        let price = parse_decimal(&ticker.price, "price")?;
        self.remember_mark(symbol, price);
        Ok(price)
    }
}

#[async_trait]
impl MarketDataSource for BinanceFuturesClient {
    async fn fetch_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_ms: i64,
    ) -> Result<PriceSeries, MarketDataError> {
        let now_ms = self.now_ms();
        let mut points = Vec::new();
        let mut cursor = since_ms;
        loop {
            let page = self
                .klines(symbol, timeframe, Some(cursor), KLINES_PAGE_LIMIT)
                .await
                .map_err(|e| to_market_error(e, symbol))?;
            let page_len = page.len();
            let last_open = page.last().map(|(p, _)| p.ts);
            points.extend(Self::finished(page, now_ms));
            match last_open {
                Some(ts) if page_len == KLINES_PAGE_LIMIT && ts + 1 < now_ms => {
                    cursor = ts + 1;
                    sleep(self.rate_limit_delay).await;
                }
                _ => break,
            }
        }
        Ok(PriceSeries::new(symbol, points))
    }

    async fn fetch_recent(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<PriceSeries, MarketDataError> {
        // one extra row covers the candle still forming
        let rows = self
            .klines(symbol, timeframe, None, limit + 1)
            .await
            .map_err(|e| to_market_error(e, symbol))?;
        let mut points = Self::finished(rows, self.now_ms());
        let skip = points.len().saturating_sub(limit);
        points.drain(..skip);
        Ok(PriceSeries::new(symbol, points))
    }

    async fn list_instruments(
        &self,
        min_quote_volume_24h: f64,
    ) -> Result<Vec<String>, MarketDataError> {
        let info = self
            .load_exchange_info()
            .await
            .map_err(|e| to_market_error(e, "exchangeInfo"))?;
        sleep(self.rate_limit_delay).await;
        let tickers: Vec<Ticker24h> = self
            .public("/fapi/v1/ticker/24hr", vec![])
            .await
            .map_err(|e| to_market_error(e, "ticker/24hr"))?;
        let volumes: HashMap<&str, f64> = tickers
            .iter()
            .filter_map(|t| Some((t.symbol.as_str(), t.quote_volume.parse::<f64>().ok()?)))
            .collect();
        let mut symbols: Vec<String> = info
            .symbols
            .iter()
            .filter(|s| s.is_usdt_perpetual())
            .filter(|s| {
                volumes
                    .get(s.symbol.as_str())
                    .map(|v| *v > min_quote_volume_24h)
                    .unwrap_or(false)
            })
            .map(|s| s.symbol.clone())
            .collect();
        symbols.sort();
        log::info!(
            "[SCAN] {} USDT perpetuals above {} quote volume",
            symbols.len(),
            min_quote_volume_24h
        );
        Ok(symbols)
    }
}

#[async_trait]
impl ExecutionGateway for BinanceFuturesClient {
    async fn get_available_margin(&self) -> Result<Decimal, GatewayError> {
        if let Some(book) = &self.paper {
            return Ok(book.available_margin(|s| self.mark(s)));
        }
        let account: AccountInfo = self
            .send(Method::GET, "/fapi/v2/account", vec![], true)
            .await
            .map_err(to_gateway_error)?;
        parse_decimal(&account.available_balance, "availableBalance").map_err(to_gateway_error)
    }

    async fn get_last_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        self.ticker_price(symbol).await.map_err(to_gateway_error)
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderResult, GatewayError> {
        let step = self.lot_step(symbol).await.map_err(to_gateway_error)?;
        let qty = match step {
            Some(step) => quantize_to_step(quantity, step),
            None => quantity.normalize(),
        };
        if qty <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!(
                "{} quantity {} below lot step {:?}",
                symbol, quantity, step
            )));
        }

        if let Some(book) = &self.paper {
            let price = self.get_last_price(symbol).await?;
            let result = book.fill(symbol, side, qty, price, reduce_only, |s| self.mark(s))?;
            log::info!(
                "[ORDER] DRY RUN {} {} qty={} @ {} reduce_only={}",
                side,
                symbol,
                qty,
                price,
                reduce_only
            );
            return Ok(result);
        }

        let client_id = format!("ct-{:016x}", rand::random::<u64>());
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", qty.to_string()),
            ("newOrderRespType", "RESULT".to_string()),
            ("newClientOrderId", client_id),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        let response: OrderResponse = self
            .send(Method::POST, "/fapi/v1/order", params, true)
            .await
            .map_err(|e| {
                log::warn!("[ORDER] {} {} qty={} failed: {}", side, symbol, qty, e.describe());
                to_gateway_error(e)
            })?;
        let filled = parse_decimal(&response.executed_qty, "executedQty").map_err(to_gateway_error)?;
        let avg_price = response
            .avg_price
            .as_deref()
            .and_then(|p| Decimal::from_str(p).ok())
            .filter(|p| *p > Decimal::ZERO);
        log::info!(
            "[ORDER] {} {} qty={} filled={} avg={:?} status={} reduce_only={}",
            side,
            symbol,
            qty,
            filled,
            avg_price,
            response.status,
            reduce_only
        );
        Ok(OrderResult {
            id: response.order_id.to_string(),
            status: OrderStatus::from_exchange(&response.status),
            filled_quantity: filled,
            avg_price,
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        if let Some(book) = &self.paper {
            book.set_leverage(symbol, leverage);
            return Ok(());
        }
        let _: serde_json::Value = self
            .send(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
                true,
            )
            .await
            .map_err(to_gateway_error)?;
        Ok(())
    }

    async fn get_open_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
        if let Some(book) = &self.paper {
            for held in book.positions(|_| None) {
                if let Err(err) = self.ticker_price(&held.symbol).await {
                    log::warn!(
                        "[ORDER] DRY RUN mark refresh for {} failed: {}",
                        held.symbol,
                        err.describe()
                    );
                }
            }
            return Ok(book.positions(|s| self.mark(s)));
        }
        let rows: Vec<PositionRisk> = self
            .send(Method::GET, "/fapi/v2/positionRisk", vec![], true)
            .await
            .map_err(to_gateway_error)?;
        let mut out = Vec::new();
        for row in rows {
            let size = parse_decimal(&row.position_amt, "positionAmt").map_err(to_gateway_error)?;
            if size.is_zero() {
                continue;
            }
            let entry_price = Decimal::from_str(&row.entry_price)
                .ok()
                .filter(|p| *p > Decimal::ZERO);
            let unrealized_pnl = parse_decimal(&row.un_realized_profit, "unRealizedProfit")
                .map_err(to_gateway_error)?;
            out.push(PositionSnapshot {
                symbol: row.symbol,
                size,
                entry_price,
                unrealized_pnl,
            });
        }
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signature_matches_exchange_reference() {
        // Worked example from the Binance API documentation.
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn quantity_is_floored_to_lot_step() {
        assert_eq!(quantize_to_step(dec!(0.0023), dec!(0.001)), dec!(0.002));
        assert_eq!(quantize_to_step(dec!(12.7), dec!(1)), dec!(12));
        assert_eq!(quantize_to_step(dec!(0.0004), dec!(0.001)), Decimal::ZERO);
        assert_eq!(quantize_to_step(dec!(3.5), Decimal::ZERO), dec!(3.5));
    }

    #[test]
    fn error_codes_map_to_port_errors() {
        let http = |status: u16, code: i64| ApiError::Http {
            status,
            code: Some(code),
            msg: "x".into(),
        };
        assert!(matches!(
            to_market_error(http(400, -1121), "FOOUSDT"),
            MarketDataError::UnknownSymbol(s) if s == "FOOUSDT"
        ));
        assert!(matches!(
            to_gateway_error(http(400, -2019)),
            GatewayError::InsufficientFunds(_)
        ));
        assert!(matches!(
            to_gateway_error(http(400, -2022)),
            GatewayError::ReduceOnlyRejected(_)
        ));
        assert!(matches!(
            to_gateway_error(http(400, -1111)),
            GatewayError::Rejected(_)
        ));
        assert!(matches!(
            to_market_error(ApiError::Transport("reset".into()), "X"),
            MarketDataError::Transient(_)
        ));
        let throttled = ApiError::Http {
            status: 429,
            code: Some(-1003),
            msg: "too many".into(),
        };
        assert!(throttled.is_rate_limited());
        assert!(matches!(
            to_gateway_error(throttled),
            GatewayError::Network(_)
        ));
    }

    #[test]
    fn klines_parse_and_drop_unfinished_candle() {
        let raw = r#"[
            [1000, "1", "2", "0.5", "1.5", "10", 1999, "0", 1, "0", "0", "0"],
            [2000, "1", "2", "0.5", "1.7", "10", 2999, "0", 1, "0", "0", "0"]
        ]"#;
        let rows: Vec<Vec<serde_json::Value>> = serde_json::from_str(raw).unwrap();
        let parsed: Vec<(PricePoint, i64)> = rows.iter().filter_map(|r| parse_kline(r)).collect();
        assert_eq!(parsed.len(), 2);
        let done = BinanceFuturesClient::finished(parsed, 2500);
        assert_eq!(done, vec![PricePoint { ts: 1000, close: 1.5 }]);
    }

    #[test]
    fn lot_step_prefers_market_lot_size() {
        let info: SymbolInfo = serde_json::from_str(
            r#"{"symbol":"BTCUSDT","status":"TRADING","contractType":"PERPETUAL","quoteAsset":"USDT",
                "filters":[{"filterType":"LOT_SIZE","stepSize":"0.001"},
                           {"filterType":"MARKET_LOT_SIZE","stepSize":"0.01"}]}"#,
        )
        .unwrap();
        assert!(info.is_usdt_perpetual());
        assert_eq!(info.lot_step(), Some(dec!(0.01)));
    }
}
