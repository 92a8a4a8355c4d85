//! # Result Rows and the Aggregated Table
//!
//! Linear and logistic-family rows carry different fields. Each row keeps its
//! model-specific part in [`RowDetail`]; the aggregated table renders the union
//! of both layouts, filling whatever a row does not have with sentinels
//! (`NaN` for floats, `-9` for counts, `false` for `converged`, `"nan"` for text).

use crate::regress::model::{FitSummary, FittedModel, ModelKind};
use crate::source::{SourceError, extension_of};
use crate::validate::ObservedCounts;
use polars::prelude::*;
use std::cmp::Ordering;
use std::fs::File;
use std::path::Path;

pub const MISSING_COUNT: i64 = -9;
pub const MISSING_TEXT: &str = "nan";

/// Columns of the rendered table, in output order.
pub const COLUMNS: [&str; 18] = [
    "predictor",
    "dependent",
    "model",
    "pval",
    "beta",
    "se",
    "beta_ci_low",
    "beta_ci_high",
    "failed_reason",
    "equation",
    "OR",
    "OR_ci_low",
    "OR_ci_high",
    "cases",
    "controls",
    "total_n",
    "converged",
    "n_observations",
];

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryDetail {
    pub odds_ratio: f64,
    pub odds_ratio_ci_low: f64,
    pub odds_ratio_ci_high: f64,
    pub cases: i64,
    pub controls: i64,
    pub total_n: i64,
    pub converged: bool,
}

impl Default for BinaryDetail {
    fn default() -> Self {
        Self {
            odds_ratio: f64::NAN,
            odds_ratio_ci_low: f64::NAN,
            odds_ratio_ci_high: f64::NAN,
            cases: MISSING_COUNT,
            controls: MISSING_COUNT,
            total_n: MISSING_COUNT,
            converged: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinearDetail {
    pub n_observations: i64,
}

impl Default for LinearDetail {
    fn default() -> Self {
        Self {
            n_observations: MISSING_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowDetail {
    Binary(BinaryDetail),
    Linear(LinearDetail),
}

/// One output row per (predictor, dependent) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub predictor: String,
    pub dependent: String,
    /// The strategy that produced the estimates; `None` when nothing was fitted.
    pub model: Option<FittedModel>,
    pub pval: f64,
    pub beta: f64,
    pub se: f64,
    pub beta_ci_low: f64,
    pub beta_ci_high: f64,
    pub failed_reason: Option<String>,
    pub equation: Option<String>,
    pub detail: RowDetail,
}

impl ResultRow {
    /// A row with every estimate at its sentinel, shaped for `kind`.
    pub fn empty(predictor: &str, dependent: &str, kind: ModelKind) -> Self {
        let detail = if kind.is_binary() {
            RowDetail::Binary(BinaryDetail::default())
        } else {
            RowDetail::Linear(LinearDetail::default())
        };
        Self {
            predictor: predictor.to_string(),
            dependent: dependent.to_string(),
            model: None,
            pval: f64::NAN,
            beta: f64::NAN,
            se: f64::NAN,
            beta_ci_low: f64::NAN,
            beta_ci_high: f64::NAN,
            failed_reason: None,
            equation: None,
            detail,
        }
    }

    pub fn record_counts(&mut self, counts: ObservedCounts) {
        match (&mut self.detail, counts) {
            (
                RowDetail::Binary(detail),
                ObservedCounts::Binary {
                    cases,
                    controls,
                    total,
                },
            ) => {
                detail.cases = cases as i64;
                detail.controls = controls as i64;
                detail.total_n = total as i64;
            }
            (RowDetail::Linear(detail), ObservedCounts::Continuous { observations }) => {
                detail.n_observations = observations as i64;
            }
            (detail, counts) => {
                log::warn!("Ignoring counts {counts:?} for a row shaped as {detail:?}");
            }
        }
    }

    pub fn record_fit(&mut self, summary: &FitSummary) {
        self.model = Some(summary.model);
        self.pval = summary.pval;
        self.beta = summary.beta;
        self.se = summary.se;
        self.beta_ci_low = summary.beta_ci_low;
        self.beta_ci_high = summary.beta_ci_high;
        if let RowDetail::Binary(detail) = &mut self.detail {
            let (odds_ratio, low, high) = summary.odds_ratio();
            detail.odds_ratio = odds_ratio;
            detail.odds_ratio_ci_low = low;
            detail.odds_ratio_ci_high = high;
            detail.converged = summary.converged;
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed_reason.is_some()
    }

    pub fn binary(&self) -> Option<&BinaryDetail> {
        match &self.detail {
            RowDetail::Binary(detail) => Some(detail),
            RowDetail::Linear(_) => None,
        }
    }

    pub fn linear(&self) -> Option<&LinearDetail> {
        match &self.detail {
            RowDetail::Linear(detail) => Some(detail),
            RowDetail::Binary(_) => None,
        }
    }
}

/// All rows of a batch, ordered by significance.
#[derive(Debug, Clone, Default)]
pub struct ResultTable {
    rows: Vec<ResultRow>,
}

impl ResultTable {
    /// Orders rows by task index, then stably by p-value with missing p-values last.
    pub fn aggregate(mut indexed: Vec<(usize, ResultRow)>) -> Self {
        indexed.sort_by_key(|(index, _)| *index);
        indexed.sort_by(|(_, a), (_, b)| compare_pvalues(a.pval, b.pval));
        Self {
            rows: indexed.into_iter().map(|(_, row)| row).collect(),
        }
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.rows.iter().filter(|row| row.is_failed()).count()
    }

    /// Renders the union schema.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let rows = &self.rows;
        let columns = vec![
            text_column(COLUMNS[0], rows, |r| Some(r.predictor.clone())),
            text_column(COLUMNS[1], rows, |r| Some(r.dependent.clone())),
            text_column(COLUMNS[2], rows, |r| r.model.map(|m| m.as_str().to_string())),
            float_column(COLUMNS[3], rows, |r| r.pval),
            float_column(COLUMNS[4], rows, |r| r.beta),
            float_column(COLUMNS[5], rows, |r| r.se),
            float_column(COLUMNS[6], rows, |r| r.beta_ci_low),
            float_column(COLUMNS[7], rows, |r| r.beta_ci_high),
            text_column(COLUMNS[8], rows, |r| r.failed_reason.clone()),
            text_column(COLUMNS[9], rows, |r| r.equation.clone()),
            float_column(COLUMNS[10], rows, |r| r.binary().map_or(f64::NAN, |d| d.odds_ratio)),
            float_column(COLUMNS[11], rows, |r| {
                r.binary().map_or(f64::NAN, |d| d.odds_ratio_ci_low)
            }),
            float_column(COLUMNS[12], rows, |r| {
                r.binary().map_or(f64::NAN, |d| d.odds_ratio_ci_high)
            }),
            count_column(COLUMNS[13], rows, |r| r.binary().map_or(MISSING_COUNT, |d| d.cases)),
            count_column(COLUMNS[14], rows, |r| {
                r.binary().map_or(MISSING_COUNT, |d| d.controls)
            }),
            count_column(COLUMNS[15], rows, |r| {
                r.binary().map_or(MISSING_COUNT, |d| d.total_n)
            }),
            Column::new(
                COLUMNS[16].into(),
                rows.iter()
                    .map(|r| r.binary().is_some_and(|d| d.converged))
                    .collect::<Vec<bool>>(),
            ),
            count_column(COLUMNS[17], rows, |r| {
                r.linear().map_or(MISSING_COUNT, |d| d.n_observations)
            }),
        ];
        DataFrame::new(columns)
    }

    /// Writes the table, choosing the format from the file extension.
    pub fn write(&self, path: &Path) -> Result<(), SourceError> {
        let mut frame = self.to_dataframe()?;
        let extension = extension_of(path);
        let separator = match extension.as_str() {
            "csv" => b',',
            "tsv" | "txt" => b'\t',
            "ipc" | "arrow" => {
                let mut file = File::create(path)?;
                IpcWriter::new(&mut file).finish(&mut frame)?;
                return Ok(());
            }
            _ => return Err(SourceError::UnsupportedFormat(extension)),
        };
        let mut file = File::create(path)?;
        CsvWriter::new(&mut file)
            .with_separator(separator)
            .finish(&mut frame)?;
        Ok(())
    }
}

fn text_column(name: &str, rows: &[ResultRow], f: impl Fn(&ResultRow) -> Option<String>) -> Column {
    let values: Vec<String> = rows
        .iter()
        .map(|r| f(r).unwrap_or_else(|| MISSING_TEXT.to_string()))
        .collect();
    Column::new(name.into(), values)
}

fn float_column(name: &str, rows: &[ResultRow], f: impl Fn(&ResultRow) -> f64) -> Column {
    Column::new(name.into(), rows.iter().map(f).collect::<Vec<f64>>())
}

fn count_column(name: &str, rows: &[ResultRow], f: impl Fn(&ResultRow) -> i64) -> Column {
    Column::new(name.into(), rows.iter().map(f).collect::<Vec<i64>>())
}

fn compare_pvalues(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (false, false) => a.total_cmp(&b),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (true, true) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(predictor: &str, pval: f64) -> ResultRow {
        let mut row = ResultRow::empty(predictor, "dep", ModelKind::Logistic);
        row.pval = pval;
        if pval.is_nan() {
            row.failed_reason = Some("No variation in dependent variable".to_string());
        }
        row
    }

    #[test]
    fn aggregation_sorts_by_p_value_with_failures_last_in_task_order() {
        let table = ResultTable::aggregate(vec![
            (3, row("c", f64::NAN)),
            (1, row("a", 0.5)),
            (4, row("d", 0.01)),
            (2, row("b", f64::NAN)),
            (5, row("e", 0.5)),
        ]);
        let order: Vec<&str> = table.rows().iter().map(|r| r.predictor.as_str()).collect();
        assert_eq!(order, vec!["d", "a", "e", "b", "c"]);
        assert_eq!(table.failed_count(), 2);
    }

    #[test]
    fn union_schema_fills_sentinels() {
        let linear = {
            let mut r = ResultRow::empty("x", "height", ModelKind::Linear);
            r.record_counts(ObservedCounts::Continuous { observations: 12 });
            r
        };
        let binary = ResultRow::empty("x", "disease", ModelKind::Firth);
        let table = ResultTable::aggregate(vec![(1, linear), (2, binary)]);
        let frame = table.to_dataframe().unwrap();

        let names: Vec<String> = frame
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(names, COLUMNS.to_vec());

        let n_obs: Vec<Option<i64>> = frame.column("n_observations").unwrap().i64().unwrap().into_iter().collect();
        assert_eq!(n_obs, vec![Some(12), Some(MISSING_COUNT)]);
        let cases: Vec<Option<i64>> = frame.column("cases").unwrap().i64().unwrap().into_iter().collect();
        assert_eq!(cases, vec![Some(MISSING_COUNT), Some(MISSING_COUNT)]);
        let model: Vec<Option<&str>> = frame.column("model").unwrap().str().unwrap().into_iter().collect();
        assert_eq!(model, vec![Some(MISSING_TEXT), Some(MISSING_TEXT)]);
        let converged: Vec<Option<bool>> = frame.column("converged").unwrap().bool().unwrap().into_iter().collect();
        assert_eq!(converged, vec![Some(false), Some(false)]);
    }

    #[test]
    fn recorded_fit_fills_odds_ratios() {
        let mut r = ResultRow::empty("x", "disease", ModelKind::FirthHybrid);
        r.record_fit(&FitSummary {
            model: FittedModel::Firth,
            beta: 0.0,
            se: 0.5,
            pval: 1.0,
            beta_ci_low: -1.0,
            beta_ci_high: 1.0,
            converged: true,
            iterations: 3,
        });
        let detail = r.binary().unwrap();
        assert_eq!(detail.odds_ratio, 1.0);
        assert!((detail.odds_ratio_ci_high - 1.0_f64.exp()).abs() < 1e-12);
        assert!(detail.converged);
        assert_eq!(r.model, Some(FittedModel::Firth));
        assert!(r.linear().is_none());
    }

    #[test]
    fn write_round_trips_through_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.tsv");
        let table = ResultTable::aggregate(vec![(1, row("a", 0.2))]);
        table.write(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(header, COLUMNS.join("\t"));
        assert!(matches!(
            table.write(&dir.path().join("results.xlsx")),
            Err(SourceError::UnsupportedFormat(_))
        ));
    }
}
