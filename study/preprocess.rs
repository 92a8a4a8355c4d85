//! # Covariate Preparation
//!
//! Runs once over the whole input table, before any task is built. Missing
//! covariate values are handled according to [`MissingCovariates`], then each
//! categorical covariate is replaced by one indicator column per level except
//! the first. The configuration's covariate list is rewritten to name the
//! indicators, so every task sees the same expanded design.
//!
//! Imputation applies to numeric covariates only. A missing categorical value
//! stays missing in its indicators, and the task-level complete-case rule
//! drops that row.

use crate::config::StudyConfig;
use crate::source::{SourceError, numeric_column};
use clap::ValueEnum;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// What to do with rows whose covariates are null or non-finite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MissingCovariates {
    /// Refuse to start the study.
    Fail,
    /// Remove the affected rows from every task.
    #[default]
    Drop,
    Mean,
    Max,
    Min,
    Zero,
    One,
}

impl MissingCovariates {
    pub fn as_str(self) -> &'static str {
        match self {
            MissingCovariates::Fail => "fail",
            MissingCovariates::Drop => "drop",
            MissingCovariates::Mean => "mean",
            MissingCovariates::Max => "max",
            MissingCovariates::Min => "min",
            MissingCovariates::Zero => "zero",
            MissingCovariates::One => "one",
        }
    }

    fn fill_value(self, observed: impl Iterator<Item = f64>) -> Option<f64> {
        match self {
            MissingCovariates::Zero => Some(0.0),
            MissingCovariates::One => Some(1.0),
            MissingCovariates::Mean => {
                let (sum, count) = observed.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                (count > 0).then(|| sum / count as f64)
            }
            MissingCovariates::Min => observed.reduce(f64::min),
            MissingCovariates::Max => observed.reduce(f64::max),
            MissingCovariates::Fail | MissingCovariates::Drop => None,
        }
    }
}

impl fmt::Display for MissingCovariates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("Missing values found in covariate columns: {0}")]
    MissingCovariates(String),
    #[error("Covariate column '{column}' has no observed values to take the {strategy} of.")]
    NothingToImpute {
        column: String,
        strategy: MissingCovariates,
    },
    #[error("Indicator column '{0}' for a categorical covariate clashes with an existing column.")]
    IndicatorCollision(String),
}

/// Applies the missing-covariate policy and expands categorical covariates.
/// `config` must already be resolved against `frame`'s columns.
pub fn prepare_covariates(
    frame: DataFrame,
    config: &mut StudyConfig,
) -> Result<DataFrame, PreprocessError> {
    let frame = handle_missing(frame, config)?;
    expand_categorical(frame, config)
}

fn handle_missing(frame: DataFrame, config: &StudyConfig) -> Result<DataFrame, PreprocessError> {
    if config.covariates.is_empty() {
        return Ok(frame);
    }
    match config.missing_covariates {
        MissingCovariates::Fail => {
            let mut offenders = Vec::new();
            for name in &config.covariates {
                let count = missing_rows(&frame, name, config.is_categorical(name))?
                    .into_iter()
                    .filter(|&missing| missing)
                    .count();
                if count > 0 {
                    offenders.push(format!("{name} ({count})"));
                }
            }
            if offenders.is_empty() {
                Ok(frame)
            } else {
                Err(PreprocessError::MissingCovariates(offenders.join(", ")))
            }
        }
        MissingCovariates::Drop => {
            let mut keep = vec![true; frame.height()];
            for name in &config.covariates {
                let missing = missing_rows(&frame, name, config.is_categorical(name))?;
                for (flag, gone) in keep.iter_mut().zip(missing) {
                    *flag &= !gone;
                }
            }
            let dropped = keep.iter().filter(|&&k| !k).count();
            if dropped == 0 {
                return Ok(frame);
            }
            let mask = BooleanChunked::from_slice(PlSmallStr::from_static("keep"), &keep);
            let filtered = frame.filter(&mask)?;
            log::info!("Dropped {dropped} rows due to missing covariate values.");
            Ok(filtered)
        }
        strategy => impute(frame, config, strategy),
    }
}

fn impute(
    mut frame: DataFrame,
    config: &StudyConfig,
    strategy: MissingCovariates,
) -> Result<DataFrame, PreprocessError> {
    for name in config.covariates.iter().filter(|c| !config.is_categorical(c)) {
        let values = numeric_column(&frame, name)?;
        let missing = values.iter().filter(|v| !v.is_some_and(f64::is_finite)).count();
        if missing == 0 {
            continue;
        }
        let observed = values.iter().flatten().copied().filter(|v| v.is_finite());
        let Some(fill) = strategy.fill_value(observed) else {
            return Err(PreprocessError::NothingToImpute {
                column: name.clone(),
                strategy,
            });
        };
        let filled = Float64Chunked::from_iter_options(
            name.as_str().into(),
            values
                .into_iter()
                .map(|v| Some(v.filter(|x| x.is_finite()).unwrap_or(fill))),
        );
        frame.with_column(filled.into_series())?;
        log::info!("Imputed {missing} missing values of covariate '{name}' with its {strategy} ({fill}).");
    }
    Ok(frame)
}

fn expand_categorical(
    mut frame: DataFrame,
    config: &mut StudyConfig,
) -> Result<DataFrame, PreprocessError> {
    if config.categorical_covariates.is_empty() {
        return Ok(frame);
    }
    let mut covariates = Vec::with_capacity(config.covariates.len());
    for name in &config.covariates {
        if !config.is_categorical(name) {
            covariates.push(name.clone());
            continue;
        }
        let levels = column_levels(&frame, name)?;
        let distinct = distinct_levels(&levels);
        for level in distinct.iter().skip(1) {
            let indicator = format!("{name}_{level}");
            if frame
                .get_column_names()
                .iter()
                .any(|c| c.as_str() == indicator)
            {
                return Err(PreprocessError::IndicatorCollision(indicator));
            }
            let column = Float64Chunked::from_iter_options(
                indicator.as_str().into(),
                levels
                    .iter()
                    .map(|v| v.as_ref().map(|v| if v == level { 1.0 } else { 0.0 })),
            );
            frame.with_column(column.into_series())?;
            covariates.push(indicator);
        }
        frame = frame.drop(name)?;
        log::info!(
            "Expanded categorical covariate '{name}' into {} indicator columns (baseline '{}').",
            distinct.len().saturating_sub(1),
            distinct.first().map(String::as_str).unwrap_or("none")
        );
    }
    config.covariates = covariates;
    Ok(frame)
}

/// Null or non-finite, per row. Categorical columns only have nulls.
fn missing_rows(frame: &DataFrame, name: &str, categorical: bool) -> Result<Vec<bool>, PreprocessError> {
    if categorical {
        let column = frame.column(name)?;
        return Ok(column
            .is_null()
            .into_iter()
            .map(|flag| flag.unwrap_or(true))
            .collect());
    }
    Ok(numeric_column(frame, name)?
        .into_iter()
        .map(|v| !v.is_some_and(f64::is_finite))
        .collect())
}

fn column_levels(frame: &DataFrame, name: &str) -> Result<Vec<Option<String>>, PreprocessError> {
    let text = frame.column(name)?.cast(&DataType::String)?;
    Ok(text
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

/// Levels in order of first appearance; the first one is the baseline.
fn distinct_levels(levels: &[Option<String>]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for level in levels.iter().flatten() {
        if !seen.contains(level) {
            seen.push(level.clone());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> DataFrame {
        df!(
            "snp" => [0.0, 1.0, 2.0, 1.0, 0.0],
            "age" => [Some(30.0), None, Some(50.0), Some(f64::NAN), Some(70.0)],
            "site" => ["north", "south", "east", "south", "north"],
        )
        .unwrap()
    }

    fn study(missing: MissingCovariates, categorical: &[&str]) -> StudyConfig {
        StudyConfig {
            predictors: vec!["snp".to_string()],
            covariates: vec!["age".to_string(), "site".to_string()],
            categorical_covariates: categorical.iter().map(|s| s.to_string()).collect(),
            missing_covariates: missing,
            ..StudyConfig::default()
        }
    }

    #[test]
    fn fail_reports_every_incomplete_covariate() {
        let mut config = study(MissingCovariates::Fail, &["site"]);
        let err = prepare_covariates(frame(), &mut config).unwrap_err();
        match err {
            PreprocessError::MissingCovariates(text) => assert_eq!(text, "age (2)"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn drop_removes_rows_with_null_or_non_finite_covariates() {
        let mut config = study(MissingCovariates::Drop, &[]);
        let prepared = prepare_covariates(frame(), &mut config).unwrap();
        assert_eq!(prepared.height(), 3);
        assert_eq!(
            numeric_column(&prepared, "snp").unwrap(),
            vec![Some(0.0), Some(2.0), Some(0.0)]
        );
    }

    #[test]
    fn imputation_fills_from_observed_values() {
        for (strategy, fill) in [
            (MissingCovariates::Mean, 50.0),
            (MissingCovariates::Min, 30.0),
            (MissingCovariates::Max, 70.0),
            (MissingCovariates::Zero, 0.0),
            (MissingCovariates::One, 1.0),
        ] {
            let mut config = study(strategy, &[]);
            let prepared = prepare_covariates(frame(), &mut config).unwrap();
            assert_eq!(
                numeric_column(&prepared, "age").unwrap(),
                vec![Some(30.0), Some(fill), Some(50.0), Some(fill), Some(70.0)],
                "strategy {strategy}"
            );
        }
    }

    #[test]
    fn imputing_an_empty_column_is_an_error() {
        let empty = df!(
            "snp" => [0.0, 1.0],
            "age" => [None::<f64>, None],
        )
        .unwrap();
        let mut config = StudyConfig {
            covariates: vec!["age".to_string()],
            missing_covariates: MissingCovariates::Mean,
            ..StudyConfig::default()
        };
        assert!(matches!(
            prepare_covariates(empty, &mut config),
            Err(PreprocessError::NothingToImpute { .. })
        ));
    }

    #[test]
    fn categorical_covariates_become_indicators_after_the_baseline() {
        let mut config = study(MissingCovariates::Zero, &["site"]);
        let prepared = prepare_covariates(frame(), &mut config).unwrap();
        assert_eq!(config.covariates, vec!["age", "site_south", "site_east"]);
        assert!(prepared.column("site").is_err());
        assert_eq!(
            numeric_column(&prepared, "site_south").unwrap(),
            vec![Some(0.0), Some(1.0), Some(0.0), Some(1.0), Some(0.0)]
        );
        assert_eq!(
            numeric_column(&prepared, "site_east").unwrap(),
            vec![Some(0.0), Some(0.0), Some(1.0), Some(0.0), Some(0.0)]
        );
    }

    #[test]
    fn indicator_names_must_not_shadow_existing_columns() {
        let clash = df!(
            "site" => ["a", "b"],
            "site_b" => [1.0, 2.0],
        )
        .unwrap();
        let mut config = StudyConfig {
            covariates: vec!["site".to_string(), "site_b".to_string()],
            categorical_covariates: vec!["site".to_string()],
            ..StudyConfig::default()
        };
        assert!(matches!(
            prepare_covariates(clash, &mut config),
            Err(PreprocessError::IndicatorCollision(name)) if name == "site_b"
        ));
    }
}
