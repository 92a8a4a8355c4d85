use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// --- Public Data Structures ---
// These types are shared by every fitting strategy and are the only things the
// orchestration layer needs to know about a fit.

/// The association model requested for a study.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    /// Ordinary least squares on a continuous dependent.
    Linear,
    /// Unpenalized IRLS logistic regression.
    Logistic,
    /// Firth-penalized logistic regression.
    #[default]
    Firth,
    /// Logistic first; refit with Firth when the logistic p-value is below alpha.
    #[serde(alias = "logistic-hybrid")]
    #[value(alias = "logistic-hybrid")]
    FirthHybrid,
}

impl ModelKind {
    /// True for every model of the logistic family, which needs a 0/1 dependent.
    pub fn is_binary(self) -> bool {
        !matches!(self, ModelKind::Linear)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Linear => "linear",
            ModelKind::Logistic => "logistic",
            ModelKind::Firth => "firth",
            ModelKind::FirthHybrid => "firth-hybrid",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The strategy that actually produced a set of estimates. For the hybrid
/// policy this records whether the Firth refit happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FittedModel {
    Linear,
    Logistic,
    Firth,
}

impl FittedModel {
    pub fn as_str(self) -> &'static str {
        match self {
            FittedModel::Linear => "linear",
            FittedModel::Logistic => "logistic",
            FittedModel::Firth => "firth",
        }
    }
}

impl fmt::Display for FittedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric controls for the Newton-Raphson family of solvers.
///
/// The defaults mirror the command-line defaults: 25 iterations, 25 step
/// halvings, a maximum per-coefficient step of 5, `1e-4` for both the
/// parameter (`xtol`) and gradient (`gtol`) criteria, and the classic Firth
/// penalty weight of one half.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfig {
    pub max_iter: usize,
    pub max_halfstep: usize,
    pub max_step: f64,
    pub gtol: f64,
    pub xtol: f64,
    pub penalty_weight: f64,
    pub fit_intercept: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iter: 25,
            max_halfstep: 25,
            max_step: 5.0,
            gtol: 1e-4,
            xtol: 1e-4,
            penalty_weight: 0.5,
            fit_intercept: true,
        }
    }
}

/// The estimates for the predictor coefficient (`beta[0]`) of one fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    pub model: FittedModel,
    pub beta: f64,
    pub se: f64,
    pub pval: f64,
    pub beta_ci_low: f64,
    pub beta_ci_high: f64,
    pub converged: bool,
    pub iterations: usize,
}

impl FitSummary {
    /// Odds ratio and its interval, `exp` of the coefficient scale.
    pub fn odds_ratio(&self) -> (f64, f64, f64) {
        (
            self.beta.exp(),
            self.beta_ci_low.exp(),
            self.beta_ci_high.exp(),
        )
    }
}

/// Errors that abort a single fit. Non-convergence is not one of them.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Design matrix has {x_rows} rows but the response has {y_len} values.")]
    ShapeMismatch { x_rows: usize, y_len: usize },

    #[error("Design matrix is empty ({rows} rows, {cols} columns).")]
    EmptyDesign { rows: usize, cols: usize },

    #[error("Not enough residual degrees of freedom: {observations} observations for rank {rank}.")]
    DegreesOfFreedom { observations: usize, rank: usize },

    #[error("A linear algebra routine failed: {0}")]
    LinearAlgebra(#[from] ndarray_linalg::error::LinalgError),

    #[error("Could not evaluate a reference distribution: {0}")]
    Distribution(String),
}

/// Shared shape check for every strategy.
pub(crate) fn check_shapes(rows: usize, cols: usize, y_len: usize) -> Result<(), FitError> {
    if rows != y_len {
        return Err(FitError::ShapeMismatch {
            x_rows: rows,
            y_len,
        });
    }
    if rows == 0 || cols == 0 {
        return Err(FitError::EmptyDesign { rows, cols });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_kind_parses_hybrid_aliases() {
        let hybrid = ModelKind::from_str("firth-hybrid", true).unwrap();
        let alias = ModelKind::from_str("logistic-hybrid", true).unwrap();
        assert_eq!(hybrid, ModelKind::FirthHybrid);
        assert_eq!(alias, ModelKind::FirthHybrid);
        assert!(!ModelKind::Linear.is_binary());
        assert!(ModelKind::FirthHybrid.is_binary());
    }

    #[test]
    fn shape_check_rejects_mismatch_and_empty() {
        assert!(matches!(
            check_shapes(3, 2, 4),
            Err(FitError::ShapeMismatch { x_rows: 3, y_len: 4 })
        ));
        assert!(matches!(
            check_shapes(0, 2, 0),
            Err(FitError::EmptyDesign { .. })
        ));
        assert!(check_shapes(5, 2, 5).is_ok());
    }
}
