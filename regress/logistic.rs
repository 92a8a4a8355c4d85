//! The two logistic-family strategies built on the shared Newton solver.

use crate::regress::firth::{NewtonFit, NewtonOptions, fit_firth, fit_firth_constrained};
use crate::regress::inference::{WaldTest, chi_squared_sf, leading_standard_error, pseudo_inverse};
use crate::regress::model::{FitError, FitSummary, FittedModel, SolverConfig};
use ndarray::{ArrayView1, ArrayView2};

/// Unpenalized logistic regression with a Wald test on the predictor.
pub fn fit_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    solver: &SolverConfig,
) -> Result<FitSummary, FitError> {
    let fit = fit_firth(x, y, &NewtonOptions::logistic(solver))?;
    let se = standard_error(&fit)?;
    let test = WaldTest::normal(fit.beta[0], se)?;
    Ok(FitSummary {
        model: FittedModel::Logistic,
        beta: fit.beta[0],
        se,
        pval: test.pval,
        beta_ci_low: test.ci_low,
        beta_ci_high: test.ci_high,
        converged: fit.converged(),
        iterations: fit.iterations,
    })
}

/// Firth-penalized logistic regression.
///
/// The p-value is the penalized likelihood-ratio test of `β₀ = 0`; the interval
/// is the Wald interval built from the information matrix at the estimate.
pub fn fit_firth_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    solver: &SolverConfig,
) -> Result<FitSummary, FitError> {
    let options = NewtonOptions::firth(solver);
    let full = fit_firth(x, y, &options)?;
    let restricted = fit_firth_constrained(x, y, &options, &[0])?;
    let statistic = 2.0 * (restricted.penalized_nll - full.penalized_nll);
    let pval = chi_squared_sf(statistic, 1.0)?;

    let se = standard_error(&full)?;
    let interval = WaldTest::normal(full.beta[0], se)?;
    Ok(FitSummary {
        model: FittedModel::Firth,
        beta: full.beta[0],
        se,
        pval,
        beta_ci_low: interval.ci_low,
        beta_ci_high: interval.ci_high,
        converged: full.converged(),
        iterations: full.iterations,
    })
}

fn standard_error(fit: &NewtonFit) -> Result<f64, FitError> {
    let covariance = pseudo_inverse(&fit.fisher_information)?;
    Ok(leading_standard_error(&covariance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};

    /// Exposed group 4/6 cases, unexposed group 2/6 cases.
    fn two_groups() -> (Array2<f64>, Array1<f64>) {
        let exposure = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let outcome = [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let x = Array2::from_shape_fn((12, 2), |(i, j)| if j == 0 { exposure[i] } else { 1.0 });
        (x, Array1::from_vec(outcome.to_vec()))
    }

    #[test]
    fn logistic_matches_the_two_by_two_log_odds_ratio() {
        let (x, y) = two_groups();
        let fit = fit_logistic(x.view(), y.view(), &SolverConfig::default()).unwrap();
        assert!(fit.converged);
        assert_eq!(fit.model, FittedModel::Logistic);
        assert_abs_diff_eq!(fit.beta, 2.0 * 2.0_f64.ln(), epsilon = 1e-3);
        // Var = 1/4 + 1/2 + 1/2 + 1/4 from the cell counts.
        assert_abs_diff_eq!(fit.se, 1.5_f64.sqrt(), epsilon = 1e-3);
        assert_abs_diff_eq!(fit.pval, 0.2577, epsilon = 2e-3);
        let (odds_ratio, low, high) = fit.odds_ratio();
        assert_abs_diff_eq!(odds_ratio, 4.0, epsilon = 1e-2);
        assert!(low < odds_ratio && odds_ratio < high);
    }

    #[test]
    fn firth_shrinks_towards_zero_and_reports_an_lrt_p_value() {
        let (x, y) = two_groups();
        let plain = fit_logistic(x.view(), y.view(), &SolverConfig::default()).unwrap();
        let firth = fit_firth_logistic(x.view(), y.view(), &SolverConfig::default()).unwrap();
        assert_eq!(firth.model, FittedModel::Firth);
        assert!(firth.converged);
        assert!(firth.beta > 0.0 && firth.beta < plain.beta);
        assert!(firth.pval > 0.0 && firth.pval < 1.0);
        assert!(firth.beta_ci_low < firth.beta && firth.beta < firth.beta_ci_high);
    }

    #[test]
    fn firth_stays_finite_under_complete_separation() {
        let x = Array2::from_shape_fn((10, 2), |(i, j)| match (i < 5, j) {
            (true, 0) => 1.0,
            (false, 0) => 0.0,
            _ => 1.0,
        });
        let y = Array1::from_shape_fn(10, |i| if i < 5 { 1.0 } else { 0.0 });
        let solver = SolverConfig {
            max_iter: 100,
            ..SolverConfig::default()
        };
        let fit = fit_firth_logistic(x.view(), y.view(), &solver).unwrap();
        assert!(fit.beta.is_finite() && fit.se.is_finite());
        assert!(fit.pval < 0.05);
    }
}
