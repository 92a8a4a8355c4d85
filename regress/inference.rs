//! Reference distributions and covariance helpers shared by the strategies.

use crate::regress::model::FitError;
use ndarray::Array2;
use ndarray_linalg::LeastSquaresSvd;
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal, StudentsT};

/// Coverage of every reported confidence interval.
pub const CONFIDENCE_LEVEL: f64 = 0.95;

/// Two-sided test and interval for a single coefficient.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WaldTest {
    pub pval: f64,
    pub ci_low: f64,
    pub ci_high: f64,
}

impl WaldTest {
    fn missing() -> Self {
        Self {
            pval: f64::NAN,
            ci_low: f64::NAN,
            ci_high: f64::NAN,
        }
    }

    /// z-test against the standard normal.
    pub fn normal(beta: f64, se: f64) -> Result<Self, FitError> {
        if !beta.is_finite() || !se.is_finite() {
            return Ok(Self::missing());
        }
        let dist = Normal::new(0.0, 1.0).map_err(|e| FitError::Distribution(e.to_string()))?;
        Ok(Self::with_distribution(&dist, beta, se))
    }

    /// t-test with `df` residual degrees of freedom.
    pub fn student(beta: f64, se: f64, df: f64) -> Result<Self, FitError> {
        if !beta.is_finite() || !se.is_finite() {
            return Ok(Self::missing());
        }
        let dist =
            StudentsT::new(0.0, 1.0, df).map_err(|e| FitError::Distribution(e.to_string()))?;
        Ok(Self::with_distribution(&dist, beta, se))
    }

    fn with_distribution<D: ContinuousCDF<f64, f64>>(dist: &D, beta: f64, se: f64) -> Self {
        let critical = dist.inverse_cdf(0.5 + CONFIDENCE_LEVEL / 2.0);
        let statistic = beta / se;
        Self {
            pval: 2.0 * dist.sf(statistic.abs()),
            ci_low: beta - critical * se,
            ci_high: beta + critical * se,
        }
    }
}

/// Upper tail of the chi-squared distribution; NaN for a non-finite statistic.
pub fn chi_squared_sf(statistic: f64, df: f64) -> Result<f64, FitError> {
    if !statistic.is_finite() {
        return Ok(f64::NAN);
    }
    let dist = ChiSquared::new(df).map_err(|e| FitError::Distribution(e.to_string()))?;
    Ok(dist.sf(statistic.max(0.0)))
}

/// Moore-Penrose inverse of a square symmetric matrix via an SVD least-squares solve.
pub fn pseudo_inverse(matrix: &Array2<f64>) -> Result<Array2<f64>, FitError> {
    let identity = Array2::<f64>::eye(matrix.nrows());
    Ok(matrix.least_squares(&identity)?.solution)
}

/// Standard error of the leading coefficient, NaN when the variance is unusable.
pub fn leading_standard_error(covariance: &Array2<f64>) -> f64 {
    let variance = covariance[[0, 0]];
    if variance.is_finite() && variance >= 0.0 {
        variance.sqrt()
    } else {
        f64::NAN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn normal_test_matches_tabulated_values() {
        let test = WaldTest::normal(1.96, 1.0).unwrap();
        assert_abs_diff_eq!(test.pval, 0.05, epsilon = 1e-3);
        assert_abs_diff_eq!(test.ci_low, 1.96 - 1.959964, epsilon = 1e-5);
        assert_abs_diff_eq!(test.ci_high, 1.96 + 1.959964, epsilon = 1e-5);
    }

    #[test]
    fn student_interval_uses_the_t_quantile() {
        let test = WaldTest::student(2.0, 0.5, 3.0).unwrap();
        assert_abs_diff_eq!(test.ci_high - 2.0, 3.182446 * 0.5, epsilon = 1e-4);
        assert!(test.pval > 0.0 && test.pval < 0.05);
    }

    #[test]
    fn missing_standard_error_propagates_nan() {
        let test = WaldTest::normal(0.3, f64::NAN).unwrap();
        assert!(test.pval.is_nan());
        assert!(test.ci_low.is_nan() && test.ci_high.is_nan());
    }

    #[test]
    fn chi_squared_tail_at_the_critical_value() {
        assert_abs_diff_eq!(chi_squared_sf(3.841459, 1.0).unwrap(), 0.05, epsilon = 1e-5);
        assert!(chi_squared_sf(f64::INFINITY, 1.0).unwrap().is_nan());
    }

    #[test]
    fn pseudo_inverse_of_singular_matrix_is_finite() {
        let singular = array![[1.0, 1.0], [1.0, 1.0]];
        let inverse = pseudo_inverse(&singular).unwrap();
        for value in inverse.iter() {
            assert_abs_diff_eq!(*value, 0.25, epsilon = 1e-10);
        }
        let regular = array![[4.0, 0.0], [0.0, 2.0]];
        let inverse = pseudo_inverse(&regular).unwrap();
        assert_abs_diff_eq!(inverse[[0, 0]], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(leading_standard_error(&inverse), 0.5, epsilon = 1e-12);
    }
}
