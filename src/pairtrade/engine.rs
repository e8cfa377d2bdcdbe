use anyhow::Result;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, MissedTickBehavior};

use super::config::PairTradeConfig;
use super::scanner::PairScanner;
use super::signal::{rank_signals, SpreadSignalEngine};
use super::state_machine::{CloseOutcome, EntryOutcome, PositionState, TradingStateMachine};
use super::status::{PnlLogRecord, PnlLogger, StatusReporter};
use super::store::{ScanSnapshot, SignalStore};
use crate::error::EngineError;
use crate::pnl_notifier::{notify_profit, notify_startup_close_failure};
use crate::ports::execution::{format_positions_summary, ExecutionGateway};
use crate::ports::market_data::{MarketDataSource, PriceTable};
use crate::ports::replay::{append_dump_entry, DumpedDataEntry, DumpedSymbolSnapshot, ReplayConnector};
use crate::stats::EngleGranger;
use crate::trade::execution::{close_all_positions, ConnectorBox};

const STATUS_FILE: &str = "status.json";

/// Sequences scan, close, monitor and entry within one cycle. Nothing here
/// runs concurrently with order placement.
pub struct PairTradeEngine {
    cfg: PairTradeConfig,
    market_data: Arc<dyn MarketDataSource>,
    gateway: Arc<dyn ExecutionGateway>,
    replay: Option<Arc<ReplayConnector>>,
    scanner: Arc<PairScanner>,
    signal_engine: SpreadSignalEngine,
    machine: TradingStateMachine,
    store: SignalStore,
    status: StatusReporter,
    pnl_logger: PnlLogger,
    snapshot: Option<ScanSnapshot>,
    snapshot_generation: u64,
    consumed_generation: u64,
    last_scan_bucket: Option<i64>,
}

impl PairTradeEngine {
    pub async fn new(cfg: PairTradeConfig) -> Result<Self> {
        let connectors = ConnectorBox::create(&cfg)?;
        Ok(Self::with_connectors(
            cfg,
            connectors.market_data,
            connectors.gateway,
            connectors.replay,
        ))
    }

    pub fn with_connectors(
        cfg: PairTradeConfig,
        market_data: Arc<dyn MarketDataSource>,
        gateway: Arc<dyn ExecutionGateway>,
        replay: Option<Arc<ReplayConnector>>,
    ) -> Self {
        let store = SignalStore::new(cfg.data_dir.clone());
        let status = StatusReporter::new(
            cfg.data_dir.join(STATUS_FILE),
            cfg.agent_name.clone(),
            &cfg.exchange,
            cfg.dry_run,
        );
        let pnl_logger = PnlLogger::new(cfg.data_dir.clone(), cfg.agent_name.as_deref());

        // Tables from a previous run are shown but never traded on.
        let (snapshot, generation) = match store.load() {
            Ok(Some(snapshot)) => {
                log::info!(
                    "[SCAN] loaded previous tables generated_at_ms={} candidates={}",
                    snapshot.generated_at_ms,
                    snapshot.candidates.len()
                );
                (Some(snapshot), 1)
            }
            Ok(None) => (None, 0),
            Err(err) => {
                log::warn!("[SCAN] failed to load previous tables: {}", err);
                (None, 0)
            }
        };

        Self {
            machine: TradingStateMachine::new(cfg.trading_params()),
            signal_engine: SpreadSignalEngine::new(cfg.zscore_window),
            scanner: Arc::new(PairScanner::new(Box::new(EngleGranger))),
            cfg,
            market_data,
            gateway,
            replay,
            store,
            status,
            pnl_logger,
            snapshot,
            snapshot_generation: generation,
            consumed_generation: generation,
            last_scan_bucket: None,
        }
    }

    pub fn machine(&self) -> &TradingStateMachine {
        &self.machine
    }

    pub fn snapshot(&self) -> Option<&ScanSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn realized_pnl_total(&self) -> Decimal {
        self.status.realized_pnl_total()
    }

    pub async fn run(&mut self) -> Result<()> {
        self.run_until(tokio::signal::ctrl_c()).await
    }

    /// Runs cycles until `shutdown` resolves. The future lives across cycles,
    /// so a request made while a step is running stops the loop right after it.
    pub async fn run_until<F: Future>(&mut self, shutdown: F) -> Result<()> {
        log::info!(
            "[CONFIG] exchange={} dry_run={} timeframe={} window={} threshold={} size={} leverage={}",
            self.cfg.exchange,
            self.cfg.dry_run,
            self.cfg.timeframe,
            self.cfg.zscore_window,
            self.cfg.zscore_threshold,
            self.cfg.position_size,
            self.cfg.leverage
        );

        if let Some(replay) = self.replay.clone() {
            log::info!("[REPLAY] running over {} bars", replay.len());
            loop {
                self.step().await?;
                if !replay.tick() {
                    break;
                }
            }
            log::info!(
                "[REPLAY] finished: engine realized={} book realized={}",
                self.status.realized_pnl_total().round_dp(4),
                replay.realized_pnl().round_dp(4)
            );
            return Ok(());
        }

        if self.cfg.force_close_on_startup {
            self.force_close_on_startup().await;
        }
        let period = Duration::from_secs(self.cfg.monitor_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    log::info!("[STATUS] shutdown requested, state={}", self.machine.state());
                    break;
                }
                _ = ticker.tick() => {}
            }
            self.step().await?;
        }
        Ok(())
    }

    /// One orchestration cycle. Only fatal errors escape; everything else is
    /// logged and retried on a later cycle.
    pub async fn step(&mut self) -> Result<(), EngineError> {
        let now_ms = self.market_data.now_ms();

        let bucket = self.scan_bucket(now_ms);
        if self.last_scan_bucket != Some(bucket) {
            self.last_scan_bucket = Some(bucket);
            if let Err(err) = self.scan(now_ms).await {
                if err.is_fatal() {
                    return Err(err);
                }
                log::warn!(
                    "[SCAN] cycle {} failed, keeping previous tables: {}",
                    bucket,
                    err
                );
            }
        }

        if self.machine.state() == PositionState::Open {
            self.monitor_open().await;
        }
        let mut closed_this_cycle = false;
        if self.machine.state() == PositionState::Closing {
            closed_this_cycle = self.close_pending(now_ms).await;
        }
        if self.machine.state() == PositionState::None && !closed_this_cycle {
            self.try_entry(now_ms).await;
        }

        let (last_scan_ms, candidate_count) = match &self.snapshot {
            Some(s) => (Some(s.generated_at_ms), s.candidates.len()),
            None => (None, 0),
        };
        if let Err(err) =
            self.status
                .write(now_ms, self.machine.position(), last_scan_ms, candidate_count)
        {
            log::warn!("[STATUS] failed to write {}: {}", self.status.path().display(), err);
        }
        Ok(())
    }

    fn scan_bucket(&self, now_ms: i64) -> i64 {
        let interval = self.cfg.scan_interval_secs.max(1) as i64;
        let offset = self.cfg.scan_offset_secs as i64;
        (now_ms / 1000 - offset).div_euclid(interval)
    }

    async fn scan(&mut self, now_ms: i64) -> Result<(), EngineError> {
        let universe = if self.cfg.universe_symbols.is_empty() {
            self.market_data
                .list_instruments(self.cfg.min_quote_volume_24h)
                .await?
        } else {
            self.cfg.universe_symbols.clone()
        };
        if universe.len() < 2 {
            return Err(EngineError::data(
                "scan",
                format!("universe has {} symbols", universe.len()),
            ));
        }

        let since_ms = now_ms - self.cfg.lookback_ms();
        let delay = Duration::from_millis(self.cfg.rate_limit_delay_ms);
        let mut table = PriceTable::new();
        for (i, symbol) in universe.iter().enumerate() {
            if i > 0 && !delay.is_zero() && self.replay.is_none() {
                sleep(delay).await;
            }
            match self
                .market_data
                .fetch_history(symbol, self.cfg.timeframe, since_ms)
                .await
            {
                Ok(series) if series.is_empty() => {
                    log::debug!("[SCAN] skip {}: no bars since {}", symbol, since_ms);
                }
                Ok(series) => {
                    table.insert(symbol.clone(), series);
                }
                Err(err) => {
                    log::warn!("[SCAN] skip {}: {}", symbol, err);
                }
            }
        }
        if table.len() < 2 {
            return Err(EngineError::data(
                "scan",
                format!("only {} of {} symbols returned data", table.len(), universe.len()),
            ));
        }

        let scanner = self.scanner.clone();
        let (mut candidates, table) = tokio::task::spawn_blocking(move || {
            let candidates = scanner.scan(&table);
            (candidates, table)
        })
        .await
        .map_err(|e| EngineError::data("scan", e))?;
        candidates.truncate(self.cfg.max_candidates);

        let mut signals = self.signal_engine.compute_all(&candidates, &table);
        rank_signals(&mut signals);
        log::info!(
            "[SCAN] {} symbols, {} candidates, {} signals, best={}",
            table.len(),
            candidates.len(),
            signals.len(),
            signals
                .first()
                .map(|s| format!("{} z={:?}", s.key(), s.current_zscore()))
                .unwrap_or_else(|| "none".to_string())
        );

        let snapshot = ScanSnapshot {
            generated_at_ms: now_ms,
            candidates,
            signals,
        };
        if let Err(err) = self.store.save(&snapshot) {
            log::warn!("[SCAN] failed to persist tables: {}", err);
        }
        if self.cfg.enable_data_dump {
            self.dump_latest(&table, now_ms);
        }
        self.snapshot = Some(snapshot);
        self.snapshot_generation += 1;
        // Signals from a scan taken while a pair is held are stale by the
        // time that pair is flat again.
        if self.machine.state() != PositionState::None {
            self.consumed_generation = self.snapshot_generation;
            log::info!(
                "[SCAN] state={} at scan, tables not used for entry",
                self.machine.state()
            );
        }
        Ok(())
    }

    fn dump_latest(&self, table: &PriceTable, now_ms: i64) {
        let prices: BTreeMap<String, DumpedSymbolSnapshot> = table
            .iter()
            .filter_map(|(symbol, series)| {
                let close = series.last()?.close;
                let price = Decimal::try_from(close).ok()?;
                Some((symbol.clone(), DumpedSymbolSnapshot { price }))
            })
            .collect();
        let entry = DumpedDataEntry {
            timestamp: now_ms,
            prices,
        };
        let path = self.cfg.data_dump_path();
        if let Err(err) = append_dump_entry(&path, &entry) {
            log::warn!("[SCAN] data dump to {} failed: {}", path.display(), err);
        }
    }

    async fn monitor_open(&mut self) {
        let result = self
            .machine
            .monitor(
                self.market_data.as_ref(),
                self.gateway.as_ref(),
                self.cfg.timeframe,
                self.signal_engine.window(),
            )
            .await;
        if let Err(err) = result {
            log::warn!("[EXIT_CHECK] check failed, retrying next cycle: {}", err);
            return;
        }

        let threshold = self.cfg.profit_alert_usd;
        let agent = self.cfg.agent_name.clone();
        if let Some(position) = self.machine.position_mut() {
            if position.state == PositionState::Open
                && !position.profit_alert_sent
                && threshold > Decimal::ZERO
                && position.last_unrealized_pnl > threshold
            {
                notify_profit(
                    agent.as_deref(),
                    &position.pair_key,
                    position.last_unrealized_pnl,
                );
                position.profit_alert_sent = true;
            }
        }
    }

    /// Returns true when the position was fully closed.
    async fn close_pending(&mut self, now_ms: i64) -> bool {
        match self.machine.execute_close(self.gateway.as_ref()).await {
            Ok(CloseOutcome::Closed(position)) => {
                let record = PnlLogRecord::from_closed(&position, now_ms);
                self.status.record_realized(record.pnl);
                log::info!(
                    "[PNL] {} reason={} pnl={} total={}",
                    record.pair,
                    record.reason,
                    record.pnl.round_dp(4),
                    self.status.realized_pnl_total().round_dp(4)
                );
                if let Err(err) = self.pnl_logger.log(&record) {
                    log::warn!("[PNL] failed to append trade log: {}", err);
                }
                true
            }
            Ok(CloseOutcome::NothingToClose) => false,
            Err(err) => {
                log::error!("[CLOSE] close incomplete, retrying next cycle: {}", err);
                false
            }
        }
    }

    async fn try_entry(&mut self, now_ms: i64) {
        if self.consumed_generation == self.snapshot_generation {
            return;
        }
        let snapshot = match &self.snapshot {
            Some(snapshot) => snapshot,
            None => return,
        };
        self.consumed_generation = self.snapshot_generation;
        match self
            .machine
            .evaluate_entry(&snapshot.signals, self.gateway.as_ref(), now_ms)
            .await
        {
            Ok(EntryOutcome::Opened { pair_key }) => {
                log::info!("[ENTRY] opened {}", pair_key);
            }
            Ok(EntryOutcome::BelowThreshold { pair_key, zscore }) => {
                log::info!(
                    "[ENTRY] best {} z={:.4} not below {}",
                    pair_key,
                    zscore,
                    self.cfg.zscore_threshold
                );
            }
            Ok(EntryOutcome::NoCandidate) => {
                log::info!("[ENTRY] no actionable candidate");
            }
            Ok(EntryOutcome::NotFlat) => {}
            Err(err @ EngineError::Margin { .. }) => {
                log::warn!("[ENTRY] skipped: {}", err);
            }
            Err(EngineError::Execution(err)) if err.is_insufficient_funds() => {
                log::warn!("[ENTRY] skipped, venue reports insufficient funds: {}", err);
            }
            Err(err) => {
                log::error!("[ENTRY] aborted: {}", err);
            }
        }
    }

    /// Flattens positions left over from a previous process. Failure alerts
    /// the operator but does not stop startup.
    pub async fn force_close_on_startup(&self) {
        let attempts = self.cfg.startup_force_close_attempts.max(1);
        let wait = Duration::from_secs(self.cfg.startup_force_close_wait_secs);
        let gateway = self.gateway.as_ref();
        let mut last_error = String::from("none");

        for attempt in 1..=attempts {
            match gateway.get_open_positions().await {
                Ok(positions) if positions.is_empty() => {
                    if attempt == 1 {
                        log::info!("[STARTUP] no open positions detected");
                    } else {
                        log::info!("[STARTUP] all positions closed");
                    }
                    return;
                }
                Ok(positions) => {
                    log::info!(
                        "[STARTUP] close attempt {}/{}: {}",
                        attempt,
                        attempts,
                        format_positions_summary(&positions)
                    );
                }
                Err(err) => {
                    log::warn!(
                        "[STARTUP] position query failed on attempt {}/{}: {}",
                        attempt,
                        attempts,
                        err
                    );
                    last_error = err.to_string();
                }
            }
            if let Err(err) = close_all_positions(gateway).await {
                log::error!("[STARTUP] close attempt {} failed: {}", attempt, err);
                last_error = err.to_string();
            }
            if attempt < attempts && !wait.is_zero() {
                sleep(wait).await;
            }
        }

        match gateway.get_open_positions().await {
            Ok(positions) if positions.is_empty() => {
                log::info!("[STARTUP] all positions closed");
            }
            Ok(positions) => {
                let summary = format_positions_summary(&positions);
                log::error!(
                    "[STARTUP] positions still open after {} attempts: {}",
                    attempts,
                    summary
                );
                notify_startup_close_failure(self.cfg.agent_name.as_deref(), &summary, &last_error);
            }
            Err(err) => {
                log::error!(
                    "[STARTUP] position query failed after {} attempts: {}",
                    attempts,
                    err
                );
                notify_startup_close_failure(
                    self.cfg.agent_name.as_deref(),
                    "unknown",
                    &err.to_string(),
                );
            }
        }
    }
}
