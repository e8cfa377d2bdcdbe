use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Close prices keyed by symbol. Ordered so pair enumeration is deterministic.
pub type PriceTable = BTreeMap<String, PriceSeries>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MarketDataError {
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
    #[error("transient market data failure: {0}")]
    Transient(String),
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn duration_ms(&self) -> i64 {
        let secs = match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        };
        secs * 1_000
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("unsupported timeframe '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    /// Candle open time in milliseconds.
    pub ts: i64,
    pub close: f64,
}

/// Close prices for one instrument with strictly increasing timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    symbol: String,
    points: Vec<PricePoint>,
}

impl PriceSeries {
    /// Sorts by timestamp, keeps the first sample of any duplicated timestamp
    /// and drops non-finite closes.
    pub fn new(symbol: impl Into<String>, mut points: Vec<PricePoint>) -> Self {
        points.retain(|p| p.close.is_finite());
        points.sort_by_key(|p| p.ts);
        points.dedup_by_key(|p| p.ts);
        Self {
            symbol: symbol.into(),
            points,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&PricePoint> {
        self.points.last()
    }

    /// Keeps only timestamps present in both series.
    pub fn align(a: &PriceSeries, b: &PriceSeries) -> AlignedPair {
        let mut aligned = AlignedPair::default();
        let (mut i, mut j) = (0, 0);
        while i < a.points.len() && j < b.points.len() {
            let (pa, pb) = (a.points[i], b.points[j]);
            match pa.ts.cmp(&pb.ts) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    aligned.timestamps.push(pa.ts);
                    aligned.a.push(pa.close);
                    aligned.b.push(pb.close);
                    i += 1;
                    j += 1;
                }
            }
        }
        aligned
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignedPair {
    pub timestamps: Vec<i64>,
    pub a: Vec<f64>,
    pub b: Vec<f64>,
}

impl AlignedPair {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_ms: i64,
    ) -> Result<PriceSeries, MarketDataError>;

    async fn fetch_recent(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<PriceSeries, MarketDataError>;

    /// Tradable instruments whose 24h quote volume exceeds the floor.
    async fn list_instruments(
        &self,
        min_quote_volume_24h: f64,
    ) -> Result<Vec<String>, MarketDataError>;

    /// Clock of the data source in milliseconds. Replay sources follow their cursor.
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(symbol: &str, pts: &[(i64, f64)]) -> PriceSeries {
        PriceSeries::new(
            symbol,
            pts.iter().map(|&(ts, close)| PricePoint { ts, close }).collect(),
        )
    }

    #[test]
    fn new_sorts_and_drops_duplicates() {
        let s = series("AAA", &[(3, 3.0), (1, 1.0), (3, 9.0), (2, f64::NAN), (2, 2.0)]);
        let ts: Vec<i64> = s.points().iter().map(|p| p.ts).collect();
        assert_eq!(ts, vec![1, 2, 3]);
        assert_eq!(s.last().unwrap().close, 3.0);
    }

    #[test]
    fn align_keeps_common_timestamps_only() {
        let a = series("AAA", &[(1, 10.0), (2, 11.0), (4, 12.0)]);
        let b = series("BBB", &[(2, 20.0), (3, 21.0), (4, 22.0), (5, 23.0)]);
        let aligned = PriceSeries::align(&a, &b);
        assert_eq!(aligned.timestamps, vec![2, 4]);
        assert_eq!(aligned.a, vec![11.0, 12.0]);
        assert_eq!(aligned.b, vec![20.0, 22.0]);
    }

    #[test]
    fn align_of_disjoint_series_is_empty() {
        let a = series("AAA", &[(1, 10.0)]);
        let b = series("BBB", &[(2, 20.0)]);
        assert!(PriceSeries::align(&a, &b).is_empty());
    }

    #[test]
    fn timeframe_round_trips_through_str() {
        let tf: Timeframe = "1H".parse().unwrap();
        assert_eq!(tf, Timeframe::H1);
        assert_eq!(tf.to_string(), "1h");
        assert_eq!(tf.duration_ms(), 3_600_000);
        assert!("7m".parse::<Timeframe>().is_err());
    }
}
