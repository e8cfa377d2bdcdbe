//! Numeric primitives used by the scanner and the signal engine.
//!
//! The scanner only talks to [`StatsBackend`]; [`EngleGranger`] is the
//! default implementation.

mod adf;
mod engle_granger;
pub mod ols;

pub use adf::{adf_test, default_max_lag, AdfResult};
pub use engle_granger::{mackinnon_critical_values, mackinnon_p_value, EngleGranger};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatsError {
    #[error("need at least {needed} observations, got {got}")]
    TooShort { needed: usize, got: usize },
    #[error("series lengths differ ({0} vs {1})")]
    LengthMismatch(usize, usize),
    #[error("regressor has zero variance")]
    ZeroVariance,
    #[error("singular design matrix")]
    Singular,
    #[error("non-finite value in input")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CointegrationResult {
    pub t_stat: f64,
    pub p_value: f64,
    /// Critical values at the 1%, 5% and 10% levels.
    pub critical_values: [f64; 3],
}

impl CointegrationResult {
    pub fn critical_value_95(&self) -> f64 {
        self.critical_values[1]
    }
}

pub trait StatsBackend: Send + Sync {
    /// Tests whether `a` and `b` (same length, aligned) are cointegrated.
    fn cointegration_test(&self, a: &[f64], b: &[f64])
        -> Result<CointegrationResult, StatsError>;

    /// Slope of `y = slope * x` fitted by least squares.
    fn ols_no_intercept(&self, y: &[f64], x: &[f64]) -> Result<f64, StatsError> {
        ols::no_intercept(y, x)
    }
}
