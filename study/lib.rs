#![deny(dead_code)]
#![deny(unused_imports)]

pub mod batch;
pub mod config;
pub mod design;
pub mod dispatch;
pub mod preprocess;
pub mod progress;
pub mod results;
pub mod source;
pub mod task;
pub mod validate;

#[path = "../regress/lib.rs"]
pub mod regress;

pub use batch::{BatchError, CancelToken, run_all_regressions, run_all_regressions_with};
pub use config::StudyConfig;
pub use preprocess::{MissingCovariates, prepare_covariates};
pub use results::{ResultRow, ResultTable};
