use nalgebra::{DMatrix, DVector};

use super::StatsError;

const MIN_OBSERVATIONS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdfResult {
    pub t_stat: f64,
    pub used_lag: usize,
    pub nobs: usize,
}

struct OlsFit {
    t_first: f64,
    aic: f64,
}

/// Schwert's rule of thumb, `ceil(12 * (n / 100)^(1/4))`.
pub fn default_max_lag(n: usize) -> usize {
    (12.0 * (n as f64 / 100.0).powf(0.25)).ceil() as usize
}

/// Augmented Dickey-Fuller test without deterministic terms.
///
/// Regresses `d(x_t)` on `x_{t-1}` and `lag` lagged differences; the lag order
/// is picked by AIC over a common sample, then the chosen model is refitted on
/// the largest sample it allows. Returns the t statistic of the level term.
pub fn adf_test(series: &[f64], max_lag: Option<usize>) -> Result<AdfResult, StatsError> {
    let n = series.len();
    if n < MIN_OBSERVATIONS {
        return Err(StatsError::TooShort {
            needed: MIN_OBSERVATIONS,
            got: n,
        });
    }
    if series.iter().any(|v| !v.is_finite()) {
        return Err(StatsError::NonFinite);
    }

    let cap = (n / 2).saturating_sub(1);
    let max_lag = max_lag.unwrap_or_else(|| default_max_lag(n)).min(cap);
    let diff: Vec<f64> = series.windows(2).map(|w| w[1] - w[0]).collect();

    let mut best: Option<(usize, f64)> = None;
    if max_lag > 0 {
        for lag in 0..=max_lag {
            let (y, x) = design(series, &diff, lag, max_lag);
            let Ok(fit) = ols_fit(&y, &x) else {
                continue;
            };
            match best {
                Some((_, aic)) if aic <= fit.aic => {}
                _ => best = Some((lag, fit.aic)),
            }
        }
    }
    let used_lag = best.map(|(lag, _)| lag).unwrap_or(0);

    let (y, x) = design(series, &diff, used_lag, used_lag);
    let nobs = y.len();
    let fit = ols_fit(&y, &x)?;
    Ok(AdfResult {
        t_stat: fit.t_first,
        used_lag,
        nobs,
    })
}

fn design(level: &[f64], diff: &[f64], lags: usize, start: usize) -> (DVector<f64>, DMatrix<f64>) {
    let rows = diff.len().saturating_sub(start);
    let y = DVector::from_fn(rows, |r, _| diff[start + r]);
    let x = DMatrix::from_fn(rows, lags + 1, |r, c| {
        let t = start + r;
        if c == 0 {
            level[t]
        } else {
            diff[t - c]
        }
    });
    (y, x)
}

fn ols_fit(y: &DVector<f64>, x: &DMatrix<f64>) -> Result<OlsFit, StatsError> {
    let (rows, cols) = x.shape();
    if rows <= cols {
        return Err(StatsError::TooShort {
            needed: cols + 1,
            got: rows,
        });
    }
    let xt = x.transpose();
    let inv = (&xt * x).try_inverse().ok_or(StatsError::Singular)?;
    let beta = &inv * (&xt * y);
    let resid = y - x * &beta;
    let ssr = resid.dot(&resid);
    if !(ssr > 0.0) {
        return Err(StatsError::Singular);
    }
    let sigma2 = ssr / (rows - cols) as f64;
    let se = (sigma2 * inv[(0, 0)]).sqrt();
    let t_first = beta[0] / se;
    if !t_first.is_finite() {
        return Err(StatsError::Singular);
    }
    let m = rows as f64;
    let llf = -m / 2.0 * ((2.0 * std::f64::consts::PI).ln() + (ssr / m).ln() + 1.0);
    Ok(OlsFit {
        t_first,
        aic: -2.0 * llf + 2.0 * cols as f64,
    })
}
