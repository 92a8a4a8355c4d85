// ========================================================================================
//
//                      THE STUDY ORCHESTRATOR: MAS
//
// ========================================================================================
//
// The binary reads one input table, resolves the study configuration against its
// columns, runs every (predictor, dependent) regression in parallel, and writes the
// aggregated table. Ctrl-C cancels the batch; no partial output is written.

use clap::Parser;
use log::LevelFilter;
use mas::batch::{BatchError, CancelToken, THREAD_LIMIT_VAR, run_all_regressions_with};
use mas::config::{StudyConfig, parse_column_list};
use mas::preprocess::{MissingCovariates, prepare_covariates};
use mas::progress::{BarProgress, BatchProgress, LogProgress};
use mas::regress::model::{ModelKind, SolverConfig};
use mas::source::{FrameSource, read_table};
use std::env;
use std::error::Error;
use std::fs;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Exit code for a batch interrupted by the user (128 + SIGINT).
const EXIT_INTERRUPTED: i32 = 130;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser, Debug)]
#[command(
    name = "mas",
    version,
    about = "Multiple association studies: every predictor against every dependent."
)]
struct Args {
    /// Input table (.csv, .tsv, .txt, .ipc or .arrow).
    #[arg(short = 'i', long)]
    input_file: PathBuf,

    /// Output table; the format follows the extension.
    #[arg(short = 'o', long)]
    output_file: PathBuf,

    /// Predictor columns: names or index selectors (i:N, i:A-B, i:A-), comma separated.
    #[arg(short = 'p', long)]
    predictors: Option<String>,

    /// Dependent columns, same syntax as --predictors.
    #[arg(short = 'd', long)]
    dependents: Option<String>,

    /// Covariate columns, same syntax as --predictors.
    #[arg(short = 'c', long)]
    covariates: Option<String>,

    /// Covariates to expand into indicator columns (must also be listed as covariates).
    #[arg(long, visible_alias = "cc")]
    categorical_covariates: Option<String>,

    /// How to treat missing covariate values [default: drop].
    #[arg(long, visible_alias = "mco", value_enum)]
    missing_covariates_operation: Option<MissingCovariates>,

    /// Extra tokens read as missing in delimited input, comma separated.
    #[arg(long, visible_alias = "nv")]
    null_values: Option<String>,

    /// TOML configuration. Every flag below without a fixed default overrides it;
    /// the solver flags are ignored.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Parallel workers [default: 1].
    #[arg(short = 'n', long)]
    num_workers: Option<usize>,

    /// Threads inside each worker [default: 1].
    #[arg(short = 't', long)]
    threads_per_worker: Option<usize>,

    #[arg(short = 'm', long, value_enum)]
    model: Option<ModelKind>,

    /// Maximum Newton-Raphson iterations.
    #[arg(long, default_value_t = 25)]
    max_iter: usize,

    /// Maximum absolute change of any coefficient in one step.
    #[arg(long, default_value_t = 5.0)]
    max_step: f64,

    /// Maximum step halvings per iteration.
    #[arg(long, default_value_t = 25)]
    max_halfstep: usize,

    /// Convergence threshold on the score.
    #[arg(long, default_value_t = 1e-4)]
    gtol: f64,

    /// Convergence threshold on the coefficient change.
    #[arg(long, default_value_t = 1e-4)]
    xtol: f64,

    /// Fit without an intercept column.
    #[arg(long)]
    no_intercept: bool,

    /// Weight of the Firth penalty (0.5 is the classic Jeffreys prior).
    #[arg(long, default_value_t = 0.5)]
    penalty_weight: f64,

    /// Logistic p-value threshold that triggers a Firth refit in the hybrid model [default: 0.05].
    #[arg(long)]
    alpha: Option<f64>,

    /// Minimum rows, cases and controls for a regression to run [default: 20].
    #[arg(long)]
    min_case_count: Option<usize>,

    /// Create the output directory if it does not exist.
    #[arg(long)]
    make_dirs: bool,

    /// Validate and summarize the configuration without running any regression.
    #[arg(long)]
    dry_run: bool,

    #[arg(short = 'v', long, conflicts_with = "quiet")]
    verbose: bool,

    #[arg(short = 'q', long)]
    quiet: bool,
}

// ========================================================================================
//                           THE MAIN ORCHESTRATION LOGIC
// ========================================================================================

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args) {
        if let Some(BatchError::Cancelled { completed, total }) = e.downcast_ref::<BatchError>() {
            log::warn!("Interrupted after {completed} of {total} regressions; no output written.");
            process::exit(EXIT_INTERRUPTED);
        }
        log::error!("{e}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        LevelFilter::Warn
    } else if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}

fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let start_time = Instant::now();

    // --- Phase 1: Configuration and input ---
    let mut config = build_config(&args)?;
    check_output_dir(&args)?;
    cap_polars_threads(config.threads_per_worker);

    log::info!("Loading data from '{}'", args.input_file.display());
    let frame = read_table(&args.input_file, &config.null_values)?;
    log::info!(
        "Loaded {} rows and {} columns.",
        frame.height(),
        frame.width()
    );
    let columns: Vec<String> = frame
        .get_column_names()
        .into_iter()
        .map(|c| c.to_string())
        .collect();
    config.resolve_columns(&columns)?;
    config.validate()?;
    let frame = prepare_covariates(frame, &mut config)?;
    config.summary();
    if args.dry_run {
        log::info!("Dry run requested; configuration is valid. Exiting.");
        return Ok(());
    }

    // --- Phase 2: The batch ---
    let source = Arc::new(FrameSource::new(frame));
    let cancel = CancelToken::new();
    watch_for_interrupt(cancel.clone())?;
    let mut progress: Box<dyn BatchProgress> = if std::io::stderr().is_terminal() && !args.quiet {
        Box::new(BarProgress::default())
    } else {
        Box::new(LogProgress::default())
    };
    let table = run_all_regressions_with(&config, source, &cancel, progress.as_mut())?;

    // --- Phase 3: Output ---
    table.write(&args.output_file)?;
    log::info!(
        "Wrote {} rows ({} failed) to '{}' in {:.2?}.",
        table.len(),
        table.failed_count(),
        args.output_file.display(),
        start_time.elapsed()
    );
    Ok(())
}

fn build_config(args: &Args) -> Result<StudyConfig, Box<dyn Error + Send + Sync>> {
    let mut config = match &args.config {
        Some(path) => {
            log::info!("Reading configuration from '{}'", path.display());
            StudyConfig::from_toml_file(path)?
        }
        None => StudyConfig {
            solver: SolverConfig {
                max_iter: args.max_iter,
                max_halfstep: args.max_halfstep,
                max_step: args.max_step,
                gtol: args.gtol,
                xtol: args.xtol,
                penalty_weight: args.penalty_weight,
                fit_intercept: !args.no_intercept,
            },
            ..StudyConfig::default()
        },
    };

    if let Some(alpha) = args.alpha {
        config.alpha = alpha;
    }
    if let Some(count) = args.min_case_count {
        config.min_case_count = count;
    }
    if let Some(workers) = args.num_workers {
        config.num_workers = workers;
    }
    if let Some(threads) = args.threads_per_worker {
        config.threads_per_worker = threads;
    }
    if let Some(operation) = args.missing_covariates_operation {
        config.missing_covariates = operation;
    }
    if let Some(list) = &args.categorical_covariates {
        config.categorical_covariates = parse_column_list(list);
    }
    if let Some(list) = &args.null_values {
        config.null_values = parse_column_list(list);
    }

    if let Some(list) = &args.predictors {
        config.predictors = parse_column_list(list);
    }
    if let Some(list) = &args.dependents {
        config.dependents = parse_column_list(list);
    }
    if let Some(list) = &args.covariates {
        config.covariates = parse_column_list(list);
    }
    match (args.model, &args.config) {
        (Some(model), _) => config.model = model,
        (None, None) => return Err("--model is required when no --config is given".into()),
        (None, Some(_)) => {}
    }
    Ok(config)
}

/// Polars sizes its global pool once, on first use, so the per-worker thread
/// budget has to be in place before the input is read.
fn cap_polars_threads(threads: usize) {
    // SAFETY: runs on the main thread before the signal watcher or any pool
    // thread has been spawned.
    unsafe { env::set_var(THREAD_LIMIT_VAR, threads.to_string()) };
}

fn check_output_dir(args: &Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let Some(dir) = args
        .output_file
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
    else {
        return Ok(());
    };
    if dir.is_dir() {
        return Ok(());
    }
    if args.make_dirs {
        fs::create_dir_all(dir)?;
        log::info!("Created output directory '{}'", dir.display());
        Ok(())
    } else {
        Err(format!(
            "Output directory '{}' does not exist; pass --make-dirs to create it.",
            dir.display()
        )
        .into())
    }
}

/// Cancels the batch on Ctrl-C. The watcher thread is detached and ends with the process.
fn watch_for_interrupt(cancel: CancelToken) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new()
        .name("mas-signal".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        log::warn!("Interrupt received; cancelling the batch.");
                        cancel.cancel();
                    }
                    Err(e) => log::warn!("Could not listen for Ctrl-C: {e}"),
                }
            });
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn explicit_flags_override_the_toml_configuration() {
        let mut toml = NamedTempFile::new().unwrap();
        writeln!(
            toml,
            "model = \"linear\"\nalpha = 0.01\nnum_workers = 4\nmin_case_count = 5"
        )
        .unwrap();
        let path = toml.path().to_str().unwrap();
        let args = Args::parse_from([
            "mas", "-i", "in.csv", "-o", "out.tsv", "--config", path, "-n", "2", "--alpha", "0.2",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.model, ModelKind::Linear);
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.alpha, 0.2);
        assert_eq!(config.min_case_count, 5);
        assert_eq!(config.threads_per_worker, 1);
    }

    #[test]
    fn unset_flags_fall_back_to_the_defaults() {
        let args = Args::parse_from([
            "mas", "-i", "in.csv", "-o", "out.tsv", "-m", "firth", "-c", "site", "--cc", "site",
            "--mco", "fail", "--nv", "NA,-9",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.alpha, 0.05);
        assert_eq!(config.min_case_count, 20);
        assert_eq!(config.num_workers, 1);
        assert_eq!(config.categorical_covariates, vec!["site"]);
        assert_eq!(config.missing_covariates, MissingCovariates::Fail);
        assert_eq!(config.null_values, vec!["NA", "-9"]);

        let no_model = Args::parse_from(["mas", "-i", "in.csv", "-o", "out.tsv"]);
        assert!(build_config(&no_model).is_err());
    }
}
