//! # Study Configuration
//!
//! A `StudyConfig` is either deserialized from TOML or assembled from
//! command-line flags. Column lists may name columns directly or use index
//! selectors against the input's column order:
//!
//! - `i:N` selects the single column at index `N`.
//! - `i:A-B` selects columns `A` up to but not including `B`.
//! - `i:A-` selects column `A` through the last column.
//!
//! Selectors are expanded by [`StudyConfig::resolve_columns`] once the input
//! table is known, and [`StudyConfig::validate`] enforces the invariants the
//! batch relies on.

use crate::preprocess::MissingCovariates;
use crate::regress::model::{ModelKind, SolverConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

const INDEX_PREFIX: &str = "i:";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read the configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse the TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Column '{0}' does not exist in the input data.")]
    UnknownColumn(String),
    #[error("Invalid column selector '{selector}': {reason}")]
    BadSelector { selector: String, reason: String },
    #[error("The {first} and {second} columns must be unique; both contain: {overlap}")]
    OverlappingColumns {
        first: &'static str,
        second: &'static str,
        overlap: String,
    },
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Everything a batch needs besides the data itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StudyConfig {
    pub predictors: Vec<String>,
    pub dependents: Vec<String>,
    pub covariates: Vec<String>,
    /// Covariates expanded into indicator columns; a subset of `covariates`.
    pub categorical_covariates: Vec<String>,
    pub missing_covariates: MissingCovariates,
    /// Extra tokens read as missing in delimited input.
    pub null_values: Vec<String>,
    pub model: ModelKind,
    pub solver: SolverConfig,
    pub alpha: f64,
    pub min_case_count: usize,
    pub num_workers: usize,
    pub threads_per_worker: usize,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            predictors: Vec::new(),
            dependents: Vec::new(),
            covariates: Vec::new(),
            categorical_covariates: Vec::new(),
            missing_covariates: MissingCovariates::default(),
            null_values: Vec::new(),
            model: ModelKind::default(),
            solver: SolverConfig::default(),
            alpha: 0.05,
            min_case_count: 20,
            num_workers: 1,
            threads_per_worker: 1,
        }
    }
}

impl StudyConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Expands index selectors and checks that every named column exists.
    pub fn resolve_columns(&mut self, available: &[String]) -> Result<(), ConfigError> {
        self.predictors = resolve_list(&self.predictors, available)?;
        self.dependents = resolve_list(&self.dependents, available)?;
        self.covariates = resolve_list(&self.covariates, available)?;
        self.categorical_covariates = resolve_list(&self.categorical_covariates, available)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.predictors.is_empty() {
            return Err(invalid("predictors", "at least one column is required"));
        }
        if self.dependents.is_empty() {
            return Err(invalid("dependents", "at least one column is required"));
        }
        check_disjoint("predictor", &self.predictors, "dependent", &self.dependents)?;
        check_disjoint("predictor", &self.predictors, "covariate", &self.covariates)?;
        check_disjoint("dependent", &self.dependents, "covariate", &self.covariates)?;
        if let Some(stray) = self
            .categorical_covariates
            .iter()
            .find(|c| !self.covariates.contains(c))
        {
            return Err(invalid(
                "categorical_covariates",
                format!("'{stray}' is not one of the covariates"),
            ));
        }

        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(invalid("alpha", format!("{} is outside [0, 1]", self.alpha)));
        }
        if self.num_workers == 0 {
            return Err(invalid("num_workers", "must be at least 1"));
        }
        if self.threads_per_worker == 0 {
            return Err(invalid("threads_per_worker", "must be at least 1"));
        }
        let solver = &self.solver;
        if solver.max_iter == 0 {
            return Err(invalid("max_iter", "must be at least 1"));
        }
        for (field, value) in [
            ("xtol", solver.xtol),
            ("gtol", solver.gtol),
            ("max_step", solver.max_step),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(invalid(field, format!("{value} must be positive")));
            }
        }
        if !(solver.penalty_weight >= 0.0 && solver.penalty_weight.is_finite()) {
            return Err(invalid(
                "penalty_weight",
                format!("{} must be non-negative", solver.penalty_weight),
            ));
        }
        Ok(())
    }

    pub fn is_categorical(&self, column: &str) -> bool {
        self.categorical_covariates.iter().any(|c| c == column)
    }

    /// Warns when the requested threads exceed the machine's logical CPUs.
    pub fn check_oversubscription(&self) -> bool {
        let requested = self.num_workers.saturating_mul(self.threads_per_worker);
        let available = num_cpus::get();
        if requested > available {
            log::warn!(
                "{} workers x {} threads per worker = {} threads exceeds the {} available CPUs.",
                self.num_workers,
                self.threads_per_worker,
                requested,
                available
            );
            return true;
        }
        false
    }

    /// Logs a readable summary of the configuration.
    pub fn summary(&self) {
        log::info!("Model: {}", self.model);
        log::info!(
            "Predictors ({}): {}",
            self.predictors.len(),
            abbreviate(&self.predictors)
        );
        log::info!(
            "Dependents ({}): {}",
            self.dependents.len(),
            abbreviate(&self.dependents)
        );
        if self.covariates.is_empty() {
            log::info!("Covariates: none");
        } else {
            log::info!(
                "Covariates ({}): {}",
                self.covariates.len(),
                abbreviate(&self.covariates)
            );
        }
        if !self.categorical_covariates.is_empty() {
            log::info!(
                "Categorical covariates ({}): {}",
                self.categorical_covariates.len(),
                abbreviate(&self.categorical_covariates)
            );
        }
        log::info!("Missing covariates: {}", self.missing_covariates);
        log::info!(
            "Regressions: {}",
            self.predictors.len() * self.dependents.len()
        );
        log::info!(
            "Workers: {} x {} threads",
            self.num_workers,
            self.threads_per_worker
        );
        log::info!(
            "Minimum cases/controls: {}, alpha: {}",
            self.min_case_count,
            self.alpha
        );
        let s = &self.solver;
        log::info!(
            "Solver: max_iter={}, max_halfstep={}, max_step={}, gtol={:e}, xtol={:e}, penalty_weight={}, intercept={}",
            s.max_iter,
            s.max_halfstep,
            s.max_step,
            s.gtol,
            s.xtol,
            s.penalty_weight,
            s.fit_intercept
        );
    }
}

/// Splits a comma-separated flag value into raw entries.
pub fn parse_column_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn resolve_list(entries: &[String], available: &[String]) -> Result<Vec<String>, ConfigError> {
    let known: HashSet<&str> = available.iter().map(|s| s.as_str()).collect();
    let mut resolved = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(selector) = entry.strip_prefix(INDEX_PREFIX) {
            resolved.extend(expand_index_selector(entry, selector, available)?);
        } else if known.contains(entry.as_str()) {
            resolved.push(entry.clone());
        } else {
            return Err(ConfigError::UnknownColumn(entry.clone()));
        }
    }
    Ok(resolved)
}

fn expand_index_selector(
    entry: &str,
    selector: &str,
    available: &[String],
) -> Result<Vec<String>, ConfigError> {
    let total = available.len();
    let bad = |reason: String| ConfigError::BadSelector {
        selector: entry.to_string(),
        reason,
    };
    let parse_index = |text: &str| {
        text.trim()
            .parse::<usize>()
            .map_err(|_| bad(format!("'{text}' is not a column index")))
    };

    let (start, end) = match selector.split_once('-') {
        None => {
            let index = parse_index(selector)?;
            (index, index + 1)
        }
        Some((first, last)) => {
            let start = parse_index(first)?;
            let end = if last.trim().is_empty() {
                total
            } else {
                parse_index(last)?
            };
            if end > total {
                return Err(bad(format!(
                    "end index {end} is beyond the {total} available columns"
                )));
            }
            (start, end)
        }
    };
    if start >= total {
        return Err(bad(format!(
            "index {start} is out of range for {total} columns"
        )));
    }
    if end <= start {
        return Err(bad(format!("end index {end} is not after start {start}")));
    }
    Ok(available[start..end].to_vec())
}

fn check_disjoint(
    first: &'static str,
    a: &[String],
    second: &'static str,
    b: &[String],
) -> Result<(), ConfigError> {
    let left: HashSet<&String> = a.iter().collect();
    let shared: Vec<String> = b
        .iter()
        .filter(|name| left.contains(name))
        .cloned()
        .collect();
    if shared.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::OverlappingColumns {
            first,
            second,
            overlap: abbreviate(&shared),
        })
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

/// `a, b, ..., y, z` for long lists.
fn abbreviate(columns: &[String]) -> String {
    if columns.len() <= 5 {
        columns.join(", ")
    } else {
        format!(
            "{}, {}, ..., {}, {}",
            columns[0],
            columns[1],
            columns[columns.len() - 2],
            columns[columns.len() - 1]
        )
    }
}
