use crate::config::StudyConfig;
use crate::design::{DesignMatrix, TaskFrame};
use crate::dispatch::fit_model;
use crate::results::ResultRow;
use crate::source::ColumnSource;
use crate::validate::{Admissibility, validate_task};

/// One (predictor, dependent) regression. `index` is the 1-based submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub index: usize,
    pub predictor: String,
    pub dependent: String,
}

impl Task {
    pub fn label(&self) -> String {
        format!("'{}' ~ '{}'", self.dependent, self.predictor)
    }
}

/// A finished task. Both arms carry a complete row; a failure row has its
/// `failed_reason` set and every estimate at its sentinel.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success(ResultRow),
    Failure(ResultRow),
}

impl TaskOutcome {
    pub fn failed(task: &Task, config: &StudyConfig, reason: String) -> Self {
        let mut row = ResultRow::empty(&task.predictor, &task.dependent, config.model);
        row.failed_reason = Some(reason);
        TaskOutcome::Failure(row)
    }

    pub fn row(&self) -> &ResultRow {
        match self {
            TaskOutcome::Success(row) | TaskOutcome::Failure(row) => row,
        }
    }

    pub fn into_row(self) -> ResultRow {
        match self {
            TaskOutcome::Success(row) | TaskOutcome::Failure(row) => row,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

/// Loads, validates and fits one task. Never panics on bad data; every
/// problem ends up in the row's `failed_reason`.
pub fn run_task(
    task: &Task,
    config: &StudyConfig,
    source: &dyn ColumnSource,
    total_tasks: usize,
) -> TaskOutcome {
    let mut row = ResultRow::empty(&task.predictor, &task.dependent, config.model);

    let frame = match TaskFrame::extract(
        source,
        &task.predictor,
        &task.dependent,
        &config.covariates,
    ) {
        Ok(frame) => frame,
        Err(e) => {
            log::error!(
                "Task {}/{}: could not load data for {}: {e}",
                task.index,
                total_tasks,
                task.label()
            );
            row.failed_reason = Some(e.to_string());
            return TaskOutcome::Failure(row);
        }
    };
    if frame.dropped_rows > 0 {
        log::debug!(
            "Task {}/{}: dropped {} incomplete rows for {}",
            task.index,
            total_tasks,
            frame.dropped_rows,
            task.label()
        );
    }

    match validate_task(&frame.response, config.model, config.min_case_count) {
        Admissibility::Admissible(counts) => row.record_counts(counts),
        Admissibility::Rejected { reason, counts } => {
            if let Some(counts) = counts {
                row.record_counts(counts);
            }
            log::warn!(
                "Task {}/{}: Skipping regression {}: {}",
                task.index,
                total_tasks,
                task.label(),
                reason
            );
            row.failed_reason = Some(reason.to_string());
            return TaskOutcome::Failure(row);
        }
    }

    let design = DesignMatrix::build(frame, config.solver.fit_intercept);
    row.equation = Some(design.equation.clone());

    match fit_model(
        config.model,
        design.x.view(),
        design.y.view(),
        &config.solver,
        config.alpha,
    ) {
        Ok(summary) => {
            if !summary.converged {
                log::warn!(
                    "Task {}/{}: {} fit for {} did not converge after {} iterations",
                    task.index,
                    total_tasks,
                    summary.model,
                    task.label(),
                    summary.iterations
                );
            }
            row.record_fit(&summary);
            TaskOutcome::Success(row)
        }
        Err(e) => {
            log::error!(
                "Task {}/{}: Regression failed for {}: {e}",
                task.index,
                total_tasks,
                task.label()
            );
            row.failed_reason = Some(e.to_string());
            TaskOutcome::Failure(row)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regress::model::{FittedModel, ModelKind};
    use crate::source::FrameSource;
    use polars::prelude::*;

    fn source() -> FrameSource {
        FrameSource::new(
            df!(
                "g" => [0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 1.0, 0.0],
                "case" => [0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0],
                "height" => [160.0, 171.0, 180.0, 158.0, 169.0, 183.0, 172.0, 161.0],
                "label" => ["a", "b", "c", "d", "e", "f", "g", "h"],
            )
            .unwrap(),
        )
    }

    fn task(predictor: &str, dependent: &str) -> Task {
        Task {
            index: 1,
            predictor: predictor.to_string(),
            dependent: dependent.to_string(),
        }
    }

    fn config(model: ModelKind) -> StudyConfig {
        StudyConfig {
            predictors: vec!["g".to_string()],
            dependents: vec!["case".to_string()],
            model,
            min_case_count: 2,
            ..StudyConfig::default()
        }
    }

    #[test]
    fn successful_linear_task_records_observations() {
        let outcome = run_task(&task("g", "height"), &config(ModelKind::Linear), &source(), 1);
        assert!(outcome.is_success());
        let row = outcome.row();
        assert_eq!(row.model, Some(FittedModel::Linear));
        assert_eq!(row.linear().unwrap().n_observations, 8);
        assert_eq!(row.equation.as_deref(), Some("height ~ g"));
        assert!(row.pval.is_finite());
    }

    #[test]
    fn non_numeric_dependent_becomes_a_failure_row() {
        let outcome = run_task(&task("g", "label"), &config(ModelKind::Firth), &source(), 1);
        assert!(!outcome.is_success());
        let row = outcome.into_row();
        assert!(row.failed_reason.unwrap().contains("label"));
        assert!(row.pval.is_nan());
        assert_eq!(row.model, None);
    }

    #[test]
    fn rejected_task_keeps_counts_but_no_estimates() {
        let mut strict = config(ModelKind::Logistic);
        strict.min_case_count = 5;
        let outcome = run_task(&task("g", "case"), &strict, &source(), 1);
        let row = outcome.row();
        assert_eq!(
            row.failed_reason.as_deref(),
            Some("Insufficient cases: 4 (< 5)")
        );
        let detail = row.binary().unwrap();
        assert_eq!((detail.cases, detail.controls, detail.total_n), (4, 4, 8));
        assert!(row.beta.is_nan());
        assert_eq!(row.equation, None);
    }
}
