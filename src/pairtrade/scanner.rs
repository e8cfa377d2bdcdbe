use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::EngineError;
use crate::ports::market_data::{PriceSeries, PriceTable};
use crate::stats::{StatsBackend, StatsError};

/// Inclusion cut on the Engle-Granger p-value. Loose on purpose; ranking by
/// zero crossings does the real filtering.
pub const MAX_P_VALUE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub symbol_a: String,
    pub symbol_b: String,
    pub hedge_ratio: f64,
    pub t_stat: f64,
    pub p_value: f64,
    pub critical_value_95: f64,
    pub zero_crossings: usize,
}

impl CandidatePair {
    pub fn key(&self) -> String {
        pair_key(&self.symbol_a, &self.symbol_b)
    }
}

pub fn pair_key(symbol_a: &str, symbol_b: &str) -> String {
    format!("{}:{}", symbol_a, symbol_b)
}

pub struct PairScanner {
    backend: Box<dyn StatsBackend>,
}

impl PairScanner {
    pub fn new(backend: Box<dyn StatsBackend>) -> Self {
        Self { backend }
    }

    /// Tests every unordered pair in the table and returns the qualifying
    /// ones, most zero crossings first. Per-pair failures are logged and skipped.
    pub fn scan(&self, prices: &PriceTable) -> Vec<CandidatePair> {
        let series: Vec<&PriceSeries> = prices.values().collect();
        let mut combos = Vec::with_capacity(series.len() * series.len().saturating_sub(1) / 2);
        for i in 0..series.len() {
            for j in (i + 1)..series.len() {
                combos.push((series[i], series[j]));
            }
        }

        let mut candidates: Vec<CandidatePair> = combos
            .par_iter()
            .filter_map(|(first, second)| {
                let (a, b) = if first.symbol() <= second.symbol() {
                    (*first, *second)
                } else {
                    (*second, *first)
                };
                match self.evaluate_pair(a, b) {
                    Ok(Some(candidate)) => Some(candidate),
                    Ok(None) => None,
                    Err(err) => {
                        log::debug!(
                            "[SCAN] skip {}: {}",
                            pair_key(a.symbol(), b.symbol()),
                            err
                        );
                        None
                    }
                }
            })
            .collect();

        rank_candidates(&mut candidates);
        log::info!(
            "[SCAN] {} symbols, {} pairs tested, {} cointegrated",
            series.len(),
            combos.len(),
            candidates.len()
        );
        candidates
    }

    /// `Ok(None)` means the pair was tested and did not qualify.
    pub fn evaluate_pair(
        &self,
        a: &PriceSeries,
        b: &PriceSeries,
    ) -> Result<Option<CandidatePair>, EngineError> {
        let key = pair_key(a.symbol(), b.symbol());
        let aligned = PriceSeries::align(a, b);
        if aligned.is_empty() {
            return Err(EngineError::data(key, "no common timestamps"));
        }
        let coint = self
            .backend
            .cointegration_test(&aligned.a, &aligned.b)
            .map_err(|e| EngineError::data(key.clone(), e))?;
        if !(coint.p_value < MAX_P_VALUE && coint.t_stat < coint.critical_value_95()) {
            return Ok(None);
        }
        let hedge_ratio = self
            .backend
            .ols_no_intercept(&aligned.a, &aligned.b)
            .map_err(|e| EngineError::data(key.clone(), e))?;
        if !hedge_ratio.is_finite() {
            return Err(EngineError::data(key, StatsError::NonFinite));
        }
        let spread: Vec<f64> = aligned
            .a
            .iter()
            .zip(&aligned.b)
            .map(|(pa, pb)| pa - hedge_ratio * pb)
            .collect();

        Ok(Some(CandidatePair {
            symbol_a: a.symbol().to_string(),
            symbol_b: b.symbol().to_string(),
            hedge_ratio,
            t_stat: coint.t_stat,
            p_value: coint.p_value,
            critical_value_95: coint.critical_value_95(),
            zero_crossings: zero_crossings(&spread),
        }))
    }
}

fn sign(value: f64) -> i8 {
    if value > 0.0 {
        1
    } else if value < 0.0 {
        -1
    } else {
        0
    }
}

/// Number of sign changes between consecutive values. Touching zero counts.
pub fn zero_crossings(values: &[f64]) -> usize {
    values
        .windows(2)
        .filter(|w| sign(w[0]) != sign(w[1]))
        .count()
}

/// Most zero crossings first; the pair key breaks ties so the order does
/// not depend on completion order of the parallel scan.
pub fn rank_candidates(candidates: &mut [CandidatePair]) {
    candidates.sort_by(|x, y| match y.zero_crossings.cmp(&x.zero_crossings) {
        Ordering::Equal => x.key().cmp(&y.key()),
        other => other,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::market_data::PricePoint;
    use crate::stats::{CointegrationResult, EngleGranger};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use std::collections::HashSet;

    fn series(symbol: &str, closes: &[f64]) -> PriceSeries {
        PriceSeries::new(
            symbol,
            closes
                .iter()
                .enumerate()
                .map(|(i, &close)| PricePoint {
                    ts: i as i64 * 3_600_000,
                    close,
                })
                .collect(),
        )
    }

    fn random_walk(rng: &mut StdRng, n: usize, start: f64) -> Vec<f64> {
        let step = Normal::new(0.0, 1.0).unwrap();
        let mut level = start;
        (0..n)
            .map(|_| {
                level += step.sample(rng);
                level
            })
            .collect()
    }

    struct AlwaysCointegrated;

    impl StatsBackend for AlwaysCointegrated {
        fn cointegration_test(
            &self,
            a: &[f64],
            _b: &[f64],
        ) -> Result<CointegrationResult, StatsError> {
            if a.len() < 3 {
                return Err(StatsError::TooShort {
                    needed: 3,
                    got: a.len(),
                });
            }
            Ok(CointegrationResult {
                t_stat: -5.0,
                p_value: 0.01,
                critical_values: [-3.9, -3.3, -3.0],
            })
        }
    }

    #[test]
    fn zero_crossings_counts_sign_changes() {
        assert_eq!(zero_crossings(&[1.0, -1.0, 2.0, 3.0, -0.5]), 3);
        assert_eq!(zero_crossings(&[1.0, 0.0, -1.0]), 2);
        assert_eq!(zero_crossings(&[1.0]), 0);
        assert_eq!(zero_crossings(&[]), 0);
    }

    #[test]
    fn scan_emits_each_unordered_pair_once_in_canonical_order() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut table = PriceTable::new();
        for symbol in ["DDD", "AAA", "CCC", "BBB"] {
            let closes = random_walk(&mut rng, 50, 100.0);
            table.insert(symbol.to_string(), series(symbol, &closes));
        }
        let scanner = PairScanner::new(Box::new(AlwaysCointegrated));
        let candidates = scanner.scan(&table);

        assert_eq!(candidates.len(), 6);
        let mut seen = HashSet::new();
        for c in &candidates {
            assert!(c.symbol_a < c.symbol_b, "{} not canonical", c.key());
            assert!(seen.insert(c.key()), "duplicate {}", c.key());
        }
        for w in candidates.windows(2) {
            assert!(w[0].zero_crossings >= w[1].zero_crossings);
        }
    }

    #[test]
    fn synthetic_cointegrated_pair_is_detected_with_unit_hedge_ratio() {
        let mut rng = StdRng::seed_from_u64(42);
        let noise = Normal::new(0.0, 0.5).unwrap();
        let a = random_walk(&mut rng, 500, 1000.0);
        let b: Vec<f64> = a.iter().map(|x| x + noise.sample(&mut rng)).collect();

        let scanner = PairScanner::new(Box::new(EngleGranger));
        let candidate = scanner
            .evaluate_pair(&series("AAA", &a), &series("BBB", &b))
            .unwrap()
            .expect("pair should qualify");

        assert!((candidate.hedge_ratio - 1.0).abs() < 0.01);
        assert!(candidate.p_value < 0.05);
        assert!(candidate.t_stat < candidate.critical_value_95);
        assert!(candidate.zero_crossings > 50);
    }

    #[test]
    fn degenerate_pairs_are_skipped_without_aborting_scan() {
        let mut table = PriceTable::new();
        table.insert("AAA".into(), series("AAA", &[1.0, 2.0, 3.0, 4.0]));
        table.insert("BBB".into(), series("BBB", &[2.0, 1.0, 4.0, 3.0]));
        // no timestamps in common with the others
        table.insert(
            "CCC".into(),
            PriceSeries::new(
                "CCC",
                vec![PricePoint {
                    ts: 1,
                    close: 5.0,
                }],
            ),
        );
        table.insert("ZZZ".into(), series("ZZZ", &[0.0, 0.0, 0.0, 0.0]));

        let scanner = PairScanner::new(Box::new(AlwaysCointegrated));
        let candidates = scanner.scan(&table);
        let keys: Vec<String> = candidates.iter().map(|c| c.key()).collect();
        assert_eq!(keys, vec!["AAA:BBB"]);
    }

    #[test]
    fn ranking_breaks_ties_by_key() {
        let make = |a: &str, b: &str, zc: usize| CandidatePair {
            symbol_a: a.into(),
            symbol_b: b.into(),
            hedge_ratio: 1.0,
            t_stat: -4.0,
            p_value: 0.01,
            critical_value_95: -3.3,
            zero_crossings: zc,
        };
        let mut list = vec![make("CCC", "DDD", 5), make("AAA", "BBB", 5), make("AAA", "CCC", 9)];
        rank_candidates(&mut list);
        let keys: Vec<String> = list.iter().map(|c| c.key()).collect();
        assert_eq!(keys, vec!["AAA:CCC", "AAA:BBB", "CCC:DDD"]);
    }
}
