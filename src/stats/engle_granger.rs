use statrs::function::erf::erfc;

use super::adf::adf_test;
use super::ols;
use super::{CointegrationResult, StatsBackend, StatsError};

const MIN_OBSERVATIONS: usize = 10;

// MacKinnon (2010) response surface, two variables, constant term.
// Rows are the 1%, 5% and 10% levels; columns are tau_inf, tau_1, tau_2.
const TAU_2010_C_N2: [[f64; 3]; 3] = [
    [-3.89644, -10.9519, -22.5270],
    [-3.33613, -6.1101, -6.8230],
    [-3.04445, -4.2412, -2.7200],
];

// MacKinnon (1994) approximate p-value surface for the same case.
const TAU_MAX: f64 = 0.92;
const TAU_MIN: f64 = -18.86;
const TAU_STAR: f64 = -2.62;
const TAU_SMALL_P: [f64; 3] = [2.92, 1.5012, 3.9796e-2];
const TAU_LARGE_P: [f64; 4] = [2.1945, 0.64695, -0.29198, -0.042377];

/// Critical values for the residual-based test with `nobs` observations.
pub fn mackinnon_critical_values(nobs: usize) -> [f64; 3] {
    let n = nobs.max(1) as f64;
    TAU_2010_C_N2.map(|[inf, c1, c2]| inf + c1 / n + c2 / (n * n))
}

pub fn mackinnon_p_value(t_stat: f64) -> f64 {
    if t_stat > TAU_MAX {
        return 1.0;
    }
    if t_stat < TAU_MIN {
        return 0.0;
    }
    let poly = if t_stat <= TAU_STAR {
        polyval(&TAU_SMALL_P, t_stat)
    } else {
        polyval(&TAU_LARGE_P, t_stat)
    };
    standard_normal_cdf(poly)
}

fn polyval(coefs: &[f64], x: f64) -> f64 {
    coefs.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

fn standard_normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Two-step Engle-Granger test: regress `a` on `b` with a constant, then run an
/// ADF test on the residuals.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngleGranger;

impl StatsBackend for EngleGranger {
    fn cointegration_test(
        &self,
        a: &[f64],
        b: &[f64],
    ) -> Result<CointegrationResult, StatsError> {
        if a.len() != b.len() {
            return Err(StatsError::LengthMismatch(a.len(), b.len()));
        }
        if a.len() < MIN_OBSERVATIONS {
            return Err(StatsError::TooShort {
                needed: MIN_OBSERVATIONS,
                got: a.len(),
            });
        }
        let fit = ols::with_intercept(a, b)?;
        let residuals = fit.residuals(a, b);
        let adf = adf_test(&residuals, None)?;
        Ok(CointegrationResult {
            t_stat: adf.t_stat,
            p_value: mackinnon_p_value(adf.t_stat),
            critical_values: mackinnon_critical_values(a.len() - 1),
        })
    }
}
