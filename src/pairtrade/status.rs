use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::state_machine::{Position, PositionState};

const DEFAULT_RETAIN_DAYS: u64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlLogRecord {
    pub ts: i64,
    pub pair: String,
    pub long_symbol: String,
    pub short_symbol: String,
    pub reason: String,
    pub entry_zscore: f64,
    pub exit_zscore: Option<f64>,
    pub hold_secs: i64,
    pub pnl: Decimal,
}

impl PnlLogRecord {
    pub fn from_closed(position: &Position, now_ms: i64) -> Self {
        Self {
            ts: now_ms / 1000,
            pair: position.pair_key.clone(),
            long_symbol: position.long_symbol.clone(),
            short_symbol: position.short_symbol.clone(),
            reason: position
                .close_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            entry_zscore: position.entry_zscore,
            exit_zscore: position.last_zscore,
            hold_secs: (now_ms - position.entry_time_ms).max(0) / 1000,
            pnl: position.last_unrealized_pnl,
        }
    }
}

/// Appends one line per completed trade to `pnl[-tag]-YYYYMMDD.jsonl` and
/// prunes files older than the retention window.
#[derive(Debug)]
pub struct PnlLogger {
    dir: PathBuf,
    tag: Option<String>,
    retain_days: u64,
}

impl PnlLogger {
    pub fn new(dir: impl Into<PathBuf>, tag: Option<&str>) -> Self {
        Self {
            dir: dir.into(),
            tag: tag.map(sanitize_tag).filter(|t| !t.is_empty()),
            retain_days: DEFAULT_RETAIN_DAYS,
        }
    }

    pub fn log(&self, record: &PnlLogRecord) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.log_path(record.ts);
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")?;
        self.cleanup();
        Ok(path)
    }

    fn log_path(&self, ts_secs: i64) -> PathBuf {
        let date = Utc
            .timestamp_opt(ts_secs, 0)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y%m%d")
            .to_string();
        let name = match &self.tag {
            Some(tag) => format!("pnl-{}-{}.jsonl", tag, date),
            None => format!("pnl-{}.jsonl", date),
        };
        self.dir.join(name)
    }

    fn cleanup(&self) {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(self.retain_days.saturating_mul(86_400)))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_pnl_log_file(&path) {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if modified < cutoff {
                let _ = fs::remove_file(path);
            }
        }
    }
}

fn sanitize_tag(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn is_pnl_log_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with("pnl-") && name.ends_with(".jsonl")
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub ts: i64,
    pub updated_at: String,
    pub agent: Option<String>,
    pub exchange: String,
    pub dry_run: bool,
    pub state: PositionState,
    pub pair: Option<String>,
    pub long_symbol: Option<String>,
    pub short_symbol: Option<String>,
    pub long_qty: Option<String>,
    pub short_qty: Option<String>,
    pub current_zscore: Option<f64>,
    pub entry_mean_zscore: Option<f64>,
    pub unrealized_pnl: String,
    pub realized_pnl_total: String,
    pub last_scan_ms: Option<i64>,
    pub candidate_count: usize,
}

/// Read-only operator view rewritten atomically every cycle.
#[derive(Debug)]
pub struct StatusReporter {
    path: PathBuf,
    agent: Option<String>,
    exchange: String,
    dry_run: bool,
    realized_pnl_total: Decimal,
}

impl StatusReporter {
    pub fn new(path: impl Into<PathBuf>, agent: Option<String>, exchange: &str, dry_run: bool) -> Self {
        Self {
            path: path.into(),
            agent,
            exchange: exchange.to_string(),
            dry_run,
            realized_pnl_total: Decimal::ZERO,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_realized(&mut self, pnl: Decimal) {
        self.realized_pnl_total += pnl;
    }

    pub fn realized_pnl_total(&self) -> Decimal {
        self.realized_pnl_total
    }

    pub fn write(
        &self,
        now_ms: i64,
        position: Option<&Position>,
        last_scan_ms: Option<i64>,
        candidate_count: usize,
    ) -> io::Result<()> {
        let updated_at = DateTime::<Utc>::from_timestamp(now_ms / 1000, 0)
            .unwrap_or_else(Utc::now)
            .to_rfc3339();
        let snapshot = StatusSnapshot {
            ts: now_ms / 1000,
            updated_at,
            agent: self.agent.clone(),
            exchange: self.exchange.clone(),
            dry_run: self.dry_run,
            state: position.map(|p| p.state).unwrap_or(PositionState::None),
            pair: position.map(|p| p.pair_key.clone()),
            long_symbol: position.map(|p| p.long_symbol.clone()),
            short_symbol: position.map(|p| p.short_symbol.clone()),
            long_qty: position.map(|p| p.long_qty.to_string()),
            short_qty: position.map(|p| p.short_qty.to_string()),
            current_zscore: position.and_then(|p| p.last_zscore),
            entry_mean_zscore: position.map(|p| p.entry_mean_zscore),
            unrealized_pnl: position
                .map(|p| p.last_unrealized_pnl)
                .unwrap_or_default()
                .round_dp(6)
                .to_string(),
            realized_pnl_total: self.realized_pnl_total.round_dp(6).to_string(),
            last_scan_ms,
            candidate_count,
        };
        let payload = serde_json::to_string_pretty(&snapshot)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, payload)?;
        fs::rename(tmp_path, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairtrade::state_machine::ExitReason;
    use rust_decimal_macros::dec;

    fn closed_position() -> Position {
        Position {
            pair_key: "AAAUSDT:BBBUSDT".into(),
            symbol_a: "AAAUSDT".into(),
            symbol_b: "BBBUSDT".into(),
            hedge_ratio: 0.8,
            long_symbol: "AAAUSDT".into(),
            short_symbol: "BBBUSDT".into(),
            long_qty: Decimal::ZERO,
            short_qty: Decimal::ZERO,
            entry_time_ms: 1_700_000_000_000,
            entry_zscore: -2.0,
            entry_mean_zscore: 0.0,
            half_life: None,
            state: PositionState::Closed,
            close_reason: Some(ExitReason::TakeProfit),
            last_zscore: Some(-0.0001),
            last_unrealized_pnl: dec!(1.75),
            profit_alert_sent: true,
        }
    }

    #[test]
    fn pnl_log_appends_to_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = PnlLogger::new(dir.path(), Some("bot/1"));
        let record = PnlLogRecord::from_closed(&closed_position(), 1_700_003_600_000);
        assert_eq!(record.hold_secs, 3_600);
        assert_eq!(record.reason, "take_profit");

        let path = logger.log(&record).unwrap();
        logger.log(&record).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "pnl-bot_1-20231114.jsonl"
        );
        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: PnlLogRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.pnl, dec!(1.75));
    }

    #[test]
    fn status_snapshot_reflects_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut reporter =
            StatusReporter::new(dir.path().join("status.json"), None, "binance", true);
        reporter.record_realized(dec!(2.5));
        let mut position = closed_position();
        position.state = PositionState::Open;
        reporter
            .write(1_700_000_000_000, Some(&position), Some(5), 7)
            .unwrap();

        let text = fs::read_to_string(reporter.path()).unwrap();
        let snapshot: StatusSnapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(snapshot.state, PositionState::Open);
        assert_eq!(snapshot.pair.as_deref(), Some("AAAUSDT:BBBUSDT"));
        assert_eq!(snapshot.unrealized_pnl, "1.75");
        assert_eq!(snapshot.realized_pnl_total, "2.5");
        assert_eq!(snapshot.candidate_count, 7);

        reporter.write(1_700_000_060_000, None, None, 0).unwrap();
        let text = fs::read_to_string(reporter.path()).unwrap();
        let snapshot: StatusSnapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(snapshot.state, PositionState::None);
        assert!(snapshot.pair.is_none());
    }
}
