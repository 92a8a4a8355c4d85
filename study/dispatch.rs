use crate::regress::linear::fit_linear;
use crate::regress::logistic::{fit_firth_logistic, fit_logistic};
use crate::regress::model::{FitError, FitSummary, ModelKind, SolverConfig};
use ndarray::{ArrayView1, ArrayView2};

/// Fits `model` to one design. For the hybrid policy the cheap logistic fit
/// runs first and is replaced by a Firth fit when it looks significant.
pub fn fit_model(
    model: ModelKind,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    solver: &SolverConfig,
    alpha: f64,
) -> Result<FitSummary, FitError> {
    match model {
        ModelKind::Linear => fit_linear(x, y),
        ModelKind::Logistic => fit_logistic(x, y, solver),
        ModelKind::Firth => fit_firth_logistic(x, y, solver),
        ModelKind::FirthHybrid => {
            let first = fit_logistic(x, y, solver)?;
            if !needs_firth_refit(&first, alpha) {
                return Ok(first);
            }
            log::debug!(
                "Logistic p-value {:.3e} < alpha {}; refitting with Firth",
                first.pval,
                alpha
            );
            fit_firth_logistic(x, y, solver)
        }
    }
}

/// NaN p-values never trigger a refit.
pub fn needs_firth_refit(first: &FitSummary, alpha: f64) -> bool {
    first.pval < alpha
}
