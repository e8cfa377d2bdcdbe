use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::scanner::CandidatePair;
use crate::error::EngineError;
use crate::ports::market_data::{PriceSeries, PriceTable};
use crate::stats::ols;

/// Relative floor below which a window's standard deviation counts as zero.
const STD_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpreadSample {
    pub ts: i64,
    pub spread: f64,
    /// `None` until a full window exists or when the window is flat.
    pub zscore: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanReversionStats {
    pub pair_key: String,
    /// Mean of every defined rolling z-score in the history.
    pub mean_zscore: Option<f64>,
    /// Mean of the last `window` z-scores, when all of them are defined.
    pub rolling_mean_zscore: Option<f64>,
    pub half_life: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSignal {
    pub candidate: CandidatePair,
    pub samples: Vec<SpreadSample>,
    pub stats: MeanReversionStats,
}

impl PairSignal {
    pub fn key(&self) -> String {
        self.candidate.key()
    }

    pub fn current_zscore(&self) -> Option<f64> {
        self.samples.last().and_then(|s| s.zscore)
    }

    /// Usable for entry: both the latest z-score and the mean are defined.
    pub fn is_actionable(&self) -> bool {
        self.current_zscore().is_some() && self.stats.mean_zscore.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SpreadSignalEngine {
    window: usize,
}

impl SpreadSignalEngine {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn compute(
        &self,
        candidate: &CandidatePair,
        prices: &PriceTable,
    ) -> Result<PairSignal, EngineError> {
        let a = prices
            .get(&candidate.symbol_a)
            .ok_or_else(|| EngineError::data(candidate.key(), "missing series for symbol_a"))?;
        let b = prices
            .get(&candidate.symbol_b)
            .ok_or_else(|| EngineError::data(candidate.key(), "missing series for symbol_b"))?;
        self.compute_from_series(candidate, a, b)
    }

    pub fn compute_from_series(
        &self,
        candidate: &CandidatePair,
        a: &PriceSeries,
        b: &PriceSeries,
    ) -> Result<PairSignal, EngineError> {
        let aligned = PriceSeries::align(a, b);
        if aligned.is_empty() {
            return Err(EngineError::data(candidate.key(), "no common timestamps"));
        }
        let spread = spread_series(&aligned.a, &aligned.b, candidate.hedge_ratio);
        let zscores = rolling_zscore(&spread, self.window);
        let samples: Vec<SpreadSample> = aligned
            .timestamps
            .iter()
            .zip(spread.iter().zip(&zscores))
            .map(|(&ts, (&spread, &zscore))| SpreadSample { ts, spread, zscore })
            .collect();

        let stats = MeanReversionStats {
            pair_key: candidate.key(),
            mean_zscore: mean_defined(&zscores),
            rolling_mean_zscore: rolling_mean(&zscores, self.window),
            half_life: half_life(&zscores),
        };
        Ok(PairSignal {
            candidate: candidate.clone(),
            samples,
            stats,
        })
    }

    /// Signals for every candidate that can be computed; the rest are logged
    /// and dropped for this cycle.
    pub fn compute_all(&self, candidates: &[CandidatePair], prices: &PriceTable) -> Vec<PairSignal> {
        candidates
            .iter()
            .filter_map(|candidate| match self.compute(candidate, prices) {
                Ok(signal) => Some(signal),
                Err(err) => {
                    log::warn!("[SIGNAL] skip {}: {}", candidate.key(), err);
                    None
                }
            })
            .collect()
    }
}

pub fn spread_series(a: &[f64], b: &[f64], hedge_ratio: f64) -> Vec<f64> {
    a.iter().zip(b).map(|(pa, pb)| pa - hedge_ratio * pb).collect()
}

/// Trailing-window z-score using the sample standard deviation.
pub fn rolling_zscore(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window < 2 || values.len() < window {
        return out;
    }
    for end in (window - 1)..values.len() {
        let slice = &values[end + 1 - window..=end];
        let mean = slice.iter().sum::<f64>() / window as f64;
        let var = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (window - 1) as f64;
        let std = var.sqrt();
        if !std.is_finite() || std <= STD_EPSILON * mean.abs().max(1.0) {
            continue;
        }
        let z = (values[end] - mean) / std;
        if z.is_finite() {
            out[end] = Some(z);
        }
    }
    out
}

fn mean_defined(values: &[Option<f64>]) -> Option<f64> {
    let defined: Vec<f64> = values.iter().flatten().copied().collect();
    if defined.is_empty() {
        return None;
    }
    Some(defined.iter().sum::<f64>() / defined.len() as f64)
}

/// Mean of the last `window` entries, `None` if any of them is undefined.
pub fn rolling_mean(values: &[Option<f64>], window: usize) -> Option<f64> {
    if window == 0 || values.len() < window {
        return None;
    }
    let tail = &values[values.len() - window..];
    let mut sum = 0.0;
    for value in tail {
        sum += (*value)?;
    }
    Some(sum / window as f64)
}

/// Half-life from `Δz_t = β z_{t-1} + c` over the defined z-scores.
/// `None` when the fit fails or β is not negative.
pub fn half_life(zscores: &[Option<f64>]) -> Option<f64> {
    let defined: Vec<f64> = zscores.iter().flatten().copied().collect();
    if defined.len() < 3 {
        return None;
    }
    let lagged = &defined[..defined.len() - 1];
    let delta: Vec<f64> = defined.windows(2).map(|w| w[1] - w[0]).collect();
    let fit = ols::with_intercept(&delta, lagged).ok()?;
    if fit.slope >= 0.0 {
        return None;
    }
    let hl = -std::f64::consts::LN_2 / fit.slope;
    hl.is_finite().then_some(hl)
}

/// Most negative current z-score first. Ties go to more zero crossings, then
/// the pair key. Signals without a current z-score sink to the end.
pub fn rank_signals(signals: &mut [PairSignal]) {
    signals.sort_by(|x, y| {
        let by_z = match (x.current_zscore(), y.current_zscore()) {
            (Some(zx), Some(zy)) => zx.partial_cmp(&zy).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_z.then_with(|| y.candidate.zero_crossings.cmp(&x.candidate.zero_crossings))
            .then_with(|| x.key().cmp(&y.key()))
    });
}
