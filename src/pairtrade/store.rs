use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::scanner::CandidatePair;
use super::signal::{MeanReversionStats, PairSignal};

const CANDIDATES_FILE: &str = "candidates.json";
const ZSCORES_FILE: &str = "zscores.json";
const MEAN_HALFLIFE_FILE: &str = "mean_halflife.json";

#[derive(Debug, Deserialize)]
struct Table<T> {
    generated_at_ms: i64,
    rows: Vec<T>,
}

#[derive(Serialize)]
struct TableRef<'a, T> {
    generated_at_ms: i64,
    rows: &'a [T],
}

/// Output of one scan cycle: ranked candidates and their signals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSnapshot {
    pub generated_at_ms: i64,
    pub candidates: Vec<CandidatePair>,
    pub signals: Vec<PairSignal>,
}

impl ScanSnapshot {
    pub fn stats(&self) -> Vec<MeanReversionStats> {
        self.signals.iter().map(|s| s.stats.clone()).collect()
    }
}

/// The three scan tables on disk. Each save replaces the previous file.
#[derive(Debug, Clone)]
pub struct SignalStore {
    dir: PathBuf,
}

impl SignalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(&self, snapshot: &ScanSnapshot) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_table(
            &self.dir.join(CANDIDATES_FILE),
            snapshot.generated_at_ms,
            &snapshot.candidates,
        )?;
        write_table(
            &self.dir.join(ZSCORES_FILE),
            snapshot.generated_at_ms,
            &snapshot.signals,
        )?;
        write_table(
            &self.dir.join(MEAN_HALFLIFE_FILE),
            snapshot.generated_at_ms,
            &snapshot.stats(),
        )?;
        log::debug!(
            "[SCAN] persisted {} candidates / {} signals to {}",
            snapshot.candidates.len(),
            snapshot.signals.len(),
            self.dir.display()
        );
        Ok(())
    }

    /// Last persisted snapshot. `Ok(None)` when nothing was saved yet; the
    /// tables must come from the same scan to be returned.
    pub fn load(&self) -> io::Result<Option<ScanSnapshot>> {
        let candidates: Option<Table<CandidatePair>> =
            read_table(&self.dir.join(CANDIDATES_FILE))?;
        let signals: Option<Table<PairSignal>> = read_table(&self.dir.join(ZSCORES_FILE))?;
        match (candidates, signals) {
            (Some(c), Some(s)) if c.generated_at_ms == s.generated_at_ms => {
                Ok(Some(ScanSnapshot {
                    generated_at_ms: c.generated_at_ms,
                    candidates: c.rows,
                    signals: s.rows,
                }))
            }
            (Some(_), Some(_)) => {
                log::warn!(
                    "[SCAN] persisted tables in {} come from different scans; ignoring",
                    self.dir.display()
                );
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

fn write_table<T: Serialize>(path: &Path, generated_at_ms: i64, rows: &[T]) -> io::Result<()> {
    let payload = serde_json::to_string(&TableRef {
        generated_at_ms,
        rows,
    })?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload)?;
    fs::rename(tmp_path, path)
}

fn read_table<T: DeserializeOwned>(path: &Path) -> io::Result<Option<Table<T>>> {
    let payload = match fs::read_to_string(path) {
        Ok(payload) => payload,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    serde_json::from_str(&payload)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairtrade::signal::SpreadSample;

    fn snapshot(ts: i64, keys: &[(&str, &str)]) -> ScanSnapshot {
        let candidates: Vec<CandidatePair> = keys
            .iter()
            .map(|(a, b)| CandidatePair {
                symbol_a: a.to_string(),
                symbol_b: b.to_string(),
                hedge_ratio: 1.25,
                t_stat: -4.125,
                p_value: 0.015625,
                critical_value_95: -3.5,
                zero_crossings: 12,
            })
            .collect();
        let signals = candidates
            .iter()
            .map(|c| PairSignal {
                candidate: c.clone(),
                samples: vec![SpreadSample {
                    ts,
                    spread: 0.5,
                    zscore: None,
                }],
                stats: MeanReversionStats {
                    pair_key: c.key(),
                    mean_zscore: Some(-0.125),
                    rolling_mean_zscore: None,
                    half_life: Some(4.25),
                },
            })
            .collect();
        ScanSnapshot {
            generated_at_ms: ts,
            candidates,
            signals,
        }
    }

    #[test]
    fn load_without_files_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SignalStore::new(dir.path().join("missing"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_replaces_previous_tables() {
        let dir = tempfile::tempdir().unwrap();
        let store = SignalStore::new(dir.path());
        store
            .save(&snapshot(1, &[("AAA", "BBB"), ("AAA", "CCC")]))
            .unwrap();
        let second = snapshot(2, &[("BBB", "CCC")]);
        store.save(&second).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, second);
        assert!(dir.path().join(MEAN_HALFLIFE_FILE).exists());
        assert!(!dir.path().join("candidates.json.tmp").exists());
    }

    #[test]
    fn mismatched_tables_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = SignalStore::new(dir.path());
        store.save(&snapshot(1, &[("AAA", "BBB")])).unwrap();
        let newer = snapshot(2, &[("AAA", "BBB")]);
        write_table(&dir.path().join(CANDIDATES_FILE), 2, &newer.candidates).unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
