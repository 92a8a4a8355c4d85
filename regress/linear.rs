use crate::regress::inference::{WaldTest, leading_standard_error, pseudo_inverse};
use crate::regress::model::{FitError, FitSummary, FittedModel, check_shapes};
use ndarray::{ArrayView1, ArrayView2};
use ndarray_linalg::LeastSquaresSvd;

/// Ordinary least squares with a Student-t test on the leading coefficient.
///
/// The solve is minimum-norm, so a rank-deficient design still yields an
/// estimate; the residual degrees of freedom use the numerical rank.
pub fn fit_linear(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<FitSummary, FitError> {
    let (n, p) = x.dim();
    check_shapes(n, p, y.len())?;

    let solved = x.least_squares(&y)?;
    let beta = solved.solution;
    let rank = solved.rank.max(0) as usize;
    if n <= rank {
        return Err(FitError::DegreesOfFreedom {
            observations: n,
            rank,
        });
    }
    let df = (n - rank) as f64;

    let residuals = &y - &x.dot(&beta);
    let rss = residuals.dot(&residuals);
    let sigma2 = rss / df;
    let covariance = pseudo_inverse(&x.t().dot(&x))? * sigma2;
    let se = leading_standard_error(&covariance);
    let test = WaldTest::student(beta[0], se, df)?;

    log::trace!("OLS fit: rank {rank}/{p}, RSS {rss:.6e}, sigma^2 {sigma2:.6e}");

    Ok(FitSummary {
        model: FittedModel::Linear,
        beta: beta[0],
        se,
        pval: test.pval,
        beta_ci_low: test.ci_low,
        beta_ci_high: test.ci_high,
        converged: true,
        iterations: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2, array};

    fn simple_line() -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((5, 2), |(i, j)| if j == 0 { (i + 1) as f64 } else { 1.0 });
        let y = array![2.1, 3.9, 6.2, 7.8, 10.1];
        (x, y)
    }

    #[test]
    fn slope_standard_error_and_interval_match_hand_computation() {
        let (x, y) = simple_line();
        let fit = fit_linear(x.view(), y.view()).unwrap();
        // Sxx = 10, RSS = 0.107, sigma^2 = RSS / 3.
        assert_abs_diff_eq!(fit.beta, 1.99, epsilon = 1e-9);
        assert_abs_diff_eq!(fit.se, (0.107_f64 / 3.0 / 10.0).sqrt(), epsilon = 1e-9);
        assert_abs_diff_eq!(fit.beta_ci_low, 1.79994, epsilon = 1e-4);
        assert_abs_diff_eq!(fit.beta_ci_high, 2.18006, epsilon = 1e-4);
        assert!(fit.pval < 1e-4);
        assert!(fit.converged);
        assert_eq!(fit.model, FittedModel::Linear);
    }

    #[test]
    fn saturated_design_has_no_residual_degrees_of_freedom() {
        let x = array![[1.0, 1.0], [2.0, 1.0]];
        let y = array![1.0, 3.0];
        assert!(matches!(
            fit_linear(x.view(), y.view()),
            Err(FitError::DegreesOfFreedom { observations: 2, rank: 2 })
        ));
    }

    #[test]
    fn duplicated_column_does_not_abort_the_fit() {
        let (base, y) = simple_line();
        let x = Array2::from_shape_fn((5, 3), |(i, j)| match j {
            0 | 1 => base[[i, 0]],
            _ => 1.0,
        });
        let fit = fit_linear(x.view(), y.view()).unwrap();
        // The minimum-norm solution splits the slope across both copies.
        assert_abs_diff_eq!(fit.beta, 0.995, epsilon = 1e-8);
        assert!(fit.se.is_finite());
    }
}
