//! # Columnar Data Sources
//!
//! Every task reads its columns through the [`ColumnSource`] trait, so the
//! orchestrator never cares whether the table lives in memory or in a
//! memory-mapped Arrow IPC file on disk. Sources are shared read-only between
//! workers.

use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The column '{0}' was not found in the data source.")]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to a numeric type. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },
    #[error("Unsupported file format '{0}'. Expected .csv, .tsv, .txt, .ipc or .arrow.")]
    UnsupportedFormat(String),
}

/// Read-only access to a named set of columns.
pub trait ColumnSource: Send + Sync {
    /// All column names, in table order.
    fn column_names(&self) -> Vec<String>;

    /// A frame holding exactly `columns`, in the requested order.
    fn select(&self, columns: &[String]) -> Result<DataFrame, SourceError>;
}

/// An in-memory polars frame.
#[derive(Clone, Debug)]
pub struct FrameSource {
    frame: Arc<DataFrame>,
}

impl FrameSource {
    pub fn new(frame: DataFrame) -> Self {
        Self {
            frame: Arc::new(frame),
        }
    }
}

impl ColumnSource for FrameSource {
    fn column_names(&self) -> Vec<String> {
        self.frame
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn select(&self, columns: &[String]) -> Result<DataFrame, SourceError> {
        ensure_present(&self.column_names(), columns)?;
        Ok(self.frame.select(columns.iter().map(|c| c.as_str()))?)
    }
}

/// An Arrow IPC file that is memory-mapped and projected per request, so a
/// task only touches the pages of its own columns.
#[derive(Clone, Debug)]
pub struct IpcSource {
    path: PathBuf,
    columns: Vec<String>,
}

impl IpcSource {
    /// Opens an existing IPC file, reading only its schema.
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let header = IpcReader::new(File::open(path)?)
            .with_n_rows(Some(0))
            .finish()?;
        let columns = header
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            columns,
        })
    }

    /// Writes `frame` to `path` as IPC and opens it as a source.
    pub fn create(frame: &mut DataFrame, path: &Path) -> Result<Self, SourceError> {
        let mut file = File::create(path)?;
        IpcWriter::new(&mut file).finish(frame)?;
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ColumnSource for IpcSource {
    fn column_names(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn select(&self, columns: &[String]) -> Result<DataFrame, SourceError> {
        ensure_present(&self.columns, columns)?;
        let projected = IpcReader::new(File::open(&self.path)?)
            .with_columns(Some(columns.to_vec()))
            .memory_mapped(Some(self.path.clone()))
            .finish()?;
        // The reader may return file order; restore the requested order.
        Ok(projected.select(columns.iter().map(|c| c.as_str()))?)
    }
}

fn ensure_present(available: &[String], requested: &[String]) -> Result<(), SourceError> {
    let known: HashSet<&str> = available.iter().map(|s| s.as_str()).collect();
    match requested.iter().find(|c| !known.contains(c.as_str())) {
        Some(missing) => Err(SourceError::ColumnNotFound(missing.clone())),
        None => Ok(()),
    }
}

/// Reads a whole table, choosing the format from the file extension.
/// `null_values` are extra tokens read as missing in delimited files; IPC
/// carries its own nulls.
pub fn read_table(path: &Path, null_values: &[String]) -> Result<DataFrame, SourceError> {
    match extension_of(path).as_str() {
        "csv" => read_delimited(path, b',', null_values),
        "tsv" | "txt" => read_delimited(path, b'\t', null_values),
        "ipc" | "arrow" => Ok(IpcReader::new(File::open(path)?).finish()?),
        other => Err(SourceError::UnsupportedFormat(other.to_string())),
    }
}

fn read_delimited(
    path: &Path,
    separator: u8,
    null_values: &[String],
) -> Result<DataFrame, SourceError> {
    let tokens = (!null_values.is_empty()).then(|| {
        NullValues::AllColumns(null_values.iter().map(|v| v.as_str().into()).collect())
    });
    Ok(CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(
                    CsvParseOptions::default()
                        .with_separator(separator)
                        .with_null_values(tokens),
                ),
        )
        .finish()?)
}

pub(crate) fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// One column as `f64`, keeping nulls. Strings that do not parse as numbers are
/// a type error rather than silently missing values.
pub fn numeric_column(frame: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, SourceError> {
    let column = frame
        .column(name)
        .map_err(|_| SourceError::ColumnNotFound(name.to_string()))?;
    let wrong_type = || SourceError::ColumnWrongType {
        column_name: name.to_string(),
        found_type: format!("{:?}", column.dtype()),
    };
    let casted = column.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    if casted.null_count() > column.null_count() {
        return Err(wrong_type());
    }
    Ok(casted.f64()?.into_iter().collect())
}
