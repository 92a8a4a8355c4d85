//! Turns one task's columns into a numeric design matrix.

use crate::source::{ColumnSource, SourceError, numeric_column};
use ndarray::{Array1, Array2};

/// The complete cases of one task's columns.
#[derive(Debug, Clone)]
pub struct TaskFrame {
    pub predictor_name: String,
    pub dependent_name: String,
    pub predictor: Vec<f64>,
    pub response: Vec<f64>,
    pub covariates: Vec<(String, Vec<f64>)>,
    /// Rows removed because some task column was null or non-finite.
    pub dropped_rows: usize,
}

impl TaskFrame {
    /// Loads the predictor, dependent and covariates and keeps only the rows
    /// where every one of them is present and finite.
    pub fn extract(
        source: &dyn ColumnSource,
        predictor: &str,
        dependent: &str,
        covariates: &[String],
    ) -> Result<Self, SourceError> {
        let mut names = Vec::with_capacity(2 + covariates.len());
        names.push(predictor.to_string());
        names.push(dependent.to_string());
        names.extend(covariates.iter().cloned());

        let frame = source.select(&names)?;
        let raw = names
            .iter()
            .map(|name| numeric_column(&frame, name))
            .collect::<Result<Vec<_>, _>>()?;

        let keep: Vec<usize> = (0..frame.height())
            .filter(|&i| raw.iter().all(|column| column[i].is_some_and(f64::is_finite)))
            .collect();
        let dropped_rows = frame.height() - keep.len();

        let mut columns = raw.into_iter().map(|column| {
            keep.iter()
                .map(|&i| column[i].unwrap_or(f64::NAN))
                .collect::<Vec<f64>>()
        });
        let predictor_values = columns.next().unwrap_or_default();
        let response = columns.next().unwrap_or_default();
        let covariates = covariates.iter().cloned().zip(columns).collect();

        Ok(Self {
            predictor_name: predictor.to_string(),
            dependent_name: dependent.to_string(),
            predictor: predictor_values,
            response,
            covariates,
            dropped_rows,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.response.len()
    }
}

/// The regression inputs for one task. Column 0 is always the predictor, then
/// the non-constant covariates, then the intercept when requested.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub covariates_used: Vec<String>,
    pub covariates_dropped: Vec<String>,
    pub equation: String,
}

impl DesignMatrix {
    pub fn build(frame: TaskFrame, fit_intercept: bool) -> Self {
        let (kept, dropped): (Vec<_>, Vec<_>) = frame
            .covariates
            .into_iter()
            .partition(|(_, values)| !is_constant(values));
        let covariates_dropped: Vec<String> = dropped.into_iter().map(|(name, _)| name).collect();
        if !covariates_dropped.is_empty() {
            log::debug!(
                "Dropping constant covariate columns for '{}' ~ '{}': {}",
                frame.dependent_name,
                frame.predictor_name,
                covariates_dropped.join(", ")
            );
        }

        let n = frame.response.len();
        let p = 1 + kept.len() + usize::from(fit_intercept);
        let x = Array2::from_shape_fn((n, p), |(i, j)| {
            if j == 0 {
                frame.predictor[i]
            } else if j <= kept.len() {
                kept[j - 1].1[i]
            } else {
                1.0
            }
        });

        let covariates_used: Vec<String> = kept.into_iter().map(|(name, _)| name).collect();
        let equation = format_equation(
            &frame.dependent_name,
            &frame.predictor_name,
            &covariates_used,
        );

        Self {
            x,
            y: Array1::from_vec(frame.response),
            covariates_used,
            covariates_dropped,
            equation,
        }
    }
}

/// `dependent ~ predictor + covariate1 + ...`
pub fn format_equation(dependent: &str, predictor: &str, covariates: &[String]) -> String {
    let mut terms = Vec::with_capacity(1 + covariates.len());
    terms.push(predictor);
    terms.extend(covariates.iter().map(|c| c.as_str()));
    format!("{dependent} ~ {}", terms.join(" + "))
}

fn is_constant(values: &[f64]) -> bool {
    values.windows(2).all(|pair| pair[0] == pair[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FrameSource;
    use polars::prelude::*;

    fn source() -> FrameSource {
        FrameSource::new(
            df!(
                "snp" => [Some(0.0), Some(1.0), Some(2.0), None, Some(1.0)],
                "trait" => [1.0, 0.0, 1.0, 0.0, f64::NAN],
                "age" => [30.0, 41.0, 52.0, 63.0, 74.0],
                "batch" => [1.0, 1.0, 1.0, 2.0, 1.0],
            )
            .unwrap(),
        )
    }

    #[test]
    fn extraction_drops_incomplete_rows() {
        let covariates = vec!["age".to_string(), "batch".to_string()];
        let frame = TaskFrame::extract(&source(), "snp", "trait", &covariates).unwrap();
        assert_eq!(frame.n_rows(), 3);
        assert_eq!(frame.dropped_rows, 2);
        assert_eq!(frame.predictor, vec![0.0, 1.0, 2.0]);
        assert_eq!(frame.response, vec![1.0, 0.0, 1.0]);
        assert_eq!(frame.covariates[0].1, vec![30.0, 41.0, 52.0]);
    }

    #[test]
    fn constant_covariates_are_dropped_from_the_design_only() {
        let covariates = vec!["age".to_string(), "batch".to_string()];
        let frame = TaskFrame::extract(&source(), "snp", "trait", &covariates).unwrap();
        let design = DesignMatrix::build(frame, true);
        assert_eq!(design.covariates_used, vec!["age"]);
        assert_eq!(design.covariates_dropped, vec!["batch"]);
        assert_eq!(design.equation, "trait ~ snp + age");
        assert_eq!(design.x.dim(), (3, 3));
        assert_eq!(design.x.column(2).to_vec(), vec![1.0, 1.0, 1.0]);
        assert_eq!(covariates.len(), 2);
    }

    #[test]
    fn equation_without_covariates_has_no_trailing_plus() {
        assert_eq!(format_equation("y", "x", &[]), "y ~ x");
        let frame = TaskFrame::extract(&source(), "snp", "age", &[]).unwrap();
        let design = DesignMatrix::build(frame, false);
        assert_eq!(design.x.ncols(), 1);
        assert_eq!(design.equation, "age ~ snp");
    }
}
