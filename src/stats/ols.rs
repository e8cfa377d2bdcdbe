use super::StatsError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearFit {
    pub fn residuals(&self, y: &[f64], x: &[f64]) -> Vec<f64> {
        y.iter()
            .zip(x)
            .map(|(yi, xi)| yi - (self.intercept + self.slope * xi))
            .collect()
    }
}

fn check_inputs(y: &[f64], x: &[f64], min_len: usize) -> Result<(), StatsError> {
    if y.len() != x.len() {
        return Err(StatsError::LengthMismatch(y.len(), x.len()));
    }
    if y.len() < min_len {
        return Err(StatsError::TooShort {
            needed: min_len,
            got: y.len(),
        });
    }
    if y.iter().chain(x).any(|v| !v.is_finite()) {
        return Err(StatsError::NonFinite);
    }
    Ok(())
}

pub fn no_intercept(y: &[f64], x: &[f64]) -> Result<f64, StatsError> {
    check_inputs(y, x, 1)?;
    let sxx: f64 = x.iter().map(|v| v * v).sum();
    if sxx <= f64::MIN_POSITIVE {
        return Err(StatsError::ZeroVariance);
    }
    let sxy: f64 = x.iter().zip(y).map(|(xi, yi)| xi * yi).sum();
    Ok(sxy / sxx)
}

pub fn with_intercept(y: &[f64], x: &[f64]) -> Result<LinearFit, StatsError> {
    check_inputs(y, x, 2)?;
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut sum_sq_x = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        let dx = xi - mean_x;
        cov += dx * (yi - mean_y);
        var_x += dx * dx;
        sum_sq_x += xi * xi;
    }
    // relative test so constant series with rounding noise still count as flat
    if var_x <= f64::EPSILON * sum_sq_x.max(f64::MIN_POSITIVE) {
        return Err(StatsError::ZeroVariance);
    }
    let slope = cov / var_x;
    Ok(LinearFit {
        slope,
        intercept: mean_y - slope * mean_x,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_intercept_recovers_exact_slope() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y: Vec<f64> = x.iter().map(|v| 2.5 * v).collect();
        let slope = no_intercept(&y, &x).unwrap();
        assert!((slope - 2.5).abs() < 1e-12);
    }

    #[test]
    fn no_intercept_rejects_all_zero_regressor() {
        assert_eq!(
            no_intercept(&[1.0, 2.0], &[0.0, 0.0]),
            Err(StatsError::ZeroVariance)
        );
    }

    #[test]
    fn with_intercept_fits_line() {
        let x = [0.0, 1.0, 2.0, 3.0, 4.0];
        let y: Vec<f64> = x.iter().map(|v| 1.0 - 0.5 * v).collect();
        let fit = with_intercept(&y, &x).unwrap();
        assert!((fit.slope + 0.5).abs() < 1e-12);
        assert!((fit.intercept - 1.0).abs() < 1e-12);
        assert!(fit.residuals(&y, &x).iter().all(|r| r.abs() < 1e-12));
    }

    #[test]
    fn with_intercept_rejects_constant_regressor() {
        let err = with_intercept(&[1.0, 2.0, 3.0], &[7.0, 7.0, 7.0]).unwrap_err();
        assert_eq!(err, StatsError::ZeroVariance);
    }

    #[test]
    fn mismatched_lengths_are_reported() {
        assert_eq!(
            with_intercept(&[1.0, 2.0, 3.0], &[1.0, 2.0]),
            Err(StatsError::LengthMismatch(3, 2))
        );
    }
}
