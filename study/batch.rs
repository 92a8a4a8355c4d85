// ========================================================================================
//
//                               THE BATCH ORCHESTRATOR
//
// ========================================================================================
//
// Every (predictor, dependent) pair is an independent task. Tasks are spawned onto a
// rayon pool of `num_workers` threads; each worker owns a lazily built inner pool of
// `threads_per_worker` threads inside which every fit runs. Completed rows flow back
// over a crossbeam channel in completion order and are re-ordered only at the end by
// the result table.

use crate::config::StudyConfig;
use crate::progress::{BatchProgress, LogProgress};
use crate::results::{ResultRow, ResultTable};
use crate::source::ColumnSource;
use crate::task::{Task, TaskOutcome, run_task};
use crossbeam_channel::{RecvTimeoutError, unbounded};
use itertools::iproduct;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::any::Any;
use std::collections::HashSet;
use std::env;
use std::ffi::OsString;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use thread_local::ThreadLocal;

/// Process-wide cap honoured by polars' own thread pool.
pub const THREAD_LIMIT_VAR: &str = "POLARS_MAX_THREADS";

/// How often the consumer wakes up to check for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("No predictor columns were configured.")]
    NoPredictors,
    #[error("No dependent columns were configured.")]
    NoDependents,
    #[error("The {role} column '{column}' does not exist in the data source.")]
    MissingColumn { role: &'static str, column: String },
    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
    #[error("The batch was cancelled after {completed} of {total} regressions.")]
    Cancelled { completed: usize, total: usize },
    #[error("Workers stopped reporting after {completed} of {total} regressions.")]
    WorkersLost { completed: usize, total: usize },
}

/// A shared flag that asks a running batch to stop.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

fn env_mutex() -> &'static Mutex<()> {
    static ENV_MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_MUTEX.get_or_init(|| Mutex::new(()))
}

/// Sets an environment variable for the lifetime of the guard and restores the
/// previous value, or its absence, on drop. Guards are serialized process-wide:
/// a second guard blocks until the first is dropped, so overlapping batches
/// cannot interleave their restores. A thread must not hold two guards at once.
#[derive(Debug)]
pub struct ScopedEnvVar {
    key: &'static str,
    previous: Option<OsString>,
    lock: Option<MutexGuard<'static, ()>>,
}

impl ScopedEnvVar {
    pub fn set(key: &'static str, value: &str) -> Self {
        let lock = env_mutex().lock().unwrap_or_else(PoisonError::into_inner);
        let previous = env::var_os(key);
        // SAFETY: every write from this crate happens under `env_mutex`. Polars
        // reads the variable without the lock, once, when its pool is built.
        unsafe { env::set_var(key, value) };
        Self {
            key,
            previous,
            lock: Some(lock),
        }
    }
}

impl Drop for ScopedEnvVar {
    fn drop(&mut self) {
        // SAFETY: as in `set`; the lock is released only after the restore.
        match self.previous.take() {
            Some(value) => unsafe { env::set_var(self.key, value) },
            None => unsafe { env::remove_var(self.key) },
        }
        drop(self.lock.take());
    }
}

/// The cross product of predictors and dependents, predictor-major, with
/// 1-based indices in submission order.
pub fn build_tasks(config: &StudyConfig, available: &[String]) -> Result<Vec<Task>, BatchError> {
    if config.predictors.is_empty() {
        return Err(BatchError::NoPredictors);
    }
    if config.dependents.is_empty() {
        return Err(BatchError::NoDependents);
    }
    let known: HashSet<&str> = available.iter().map(|s| s.as_str()).collect();
    for (role, columns) in [
        ("predictor", &config.predictors),
        ("dependent", &config.dependents),
        ("covariate", &config.covariates),
    ] {
        if let Some(column) = columns.iter().find(|c| !known.contains(c.as_str())) {
            return Err(BatchError::MissingColumn {
                role,
                column: column.clone(),
            });
        }
    }

    Ok(iproduct!(config.predictors.iter(), config.dependents.iter())
        .enumerate()
        .map(|(i, (predictor, dependent))| Task {
            index: i + 1,
            predictor: predictor.clone(),
            dependent: dependent.clone(),
        })
        .collect())
}

/// Runs every regression with cadence logging and no external cancellation.
pub fn run_all_regressions(
    config: &StudyConfig,
    source: Arc<dyn ColumnSource>,
) -> Result<ResultTable, BatchError> {
    run_all_regressions_with(
        config,
        source,
        &CancelToken::new(),
        &mut LogProgress::default(),
    )
}

/// Runs every regression, reporting to `progress` and stopping early when
/// `cancel` is triggered. The table has exactly one row per task.
pub fn run_all_regressions_with(
    config: &StudyConfig,
    source: Arc<dyn ColumnSource>,
    cancel: &CancelToken,
    progress: &mut dyn BatchProgress,
) -> Result<ResultTable, BatchError> {
    // Held until return, so the previous value comes back on every path.
    let thread_limit = ScopedEnvVar::set(THREAD_LIMIT_VAR, &config.threads_per_worker.to_string());
    let tasks = build_tasks(config, &source.column_names())?;
    log::info!(
        "Running {} regressions ({} predictors x {} dependents) with model '{}'.",
        tasks.len(),
        config.predictors.len(),
        config.dependents.len(),
        config.model
    );
    config.check_oversubscription();

    let started = Instant::now();
    let rows = execute(tasks, config, source, cancel, progress)?;
    drop(thread_limit);

    let table = ResultTable::aggregate(rows);
    log::info!(
        "All regressions completed in {:.2?} ({} failed).",
        started.elapsed(),
        table.failed_count()
    );
    Ok(table)
}

fn execute(
    tasks: Vec<Task>,
    config: &StudyConfig,
    source: Arc<dyn ColumnSource>,
    cancel: &CancelToken,
    progress: &mut dyn BatchProgress,
) -> Result<Vec<(usize, ResultRow)>, BatchError> {
    let total = tasks.len();
    let pool = ThreadPoolBuilder::new()
        .num_threads(config.num_workers)
        .thread_name(|i| format!("mas-worker-{i}"))
        .build()?;
    let inner_pools: Arc<ThreadLocal<ThreadPool>> = Arc::new(ThreadLocal::new());
    let shared_config = Arc::new(config.clone());
    let (sender, receiver) = unbounded::<(usize, TaskOutcome)>();

    progress.on_batch_start(total);
    for task in tasks {
        let sender = sender.clone();
        let config = Arc::clone(&shared_config);
        let source = Arc::clone(&source);
        let inner_pools = Arc::clone(&inner_pools);
        let cancel = cancel.clone();
        pool.spawn(move || {
            if cancel.is_cancelled() {
                return;
            }
            let outcome = run_isolated(&task, &config, source.as_ref(), &inner_pools, total);
            // The receiver is gone only when the batch was abandoned.
            let _ = sender.send((task.index, outcome));
        });
    }
    drop(sender);

    let mut rows = Vec::with_capacity(total);
    while rows.len() < total {
        if cancel.is_cancelled() {
            log::warn!(
                "Cancellation requested; abandoning {} unfinished regressions.",
                total - rows.len()
            );
            return Err(BatchError::Cancelled {
                completed: rows.len(),
                total,
            });
        }
        match receiver.recv_timeout(CANCEL_POLL_INTERVAL) {
            Ok((index, outcome)) => {
                let row = outcome.into_row();
                progress.on_task_complete(rows.len() + 1, total, &row);
                rows.push((index, row));
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    if rows.len() < total {
        return Err(if cancel.is_cancelled() {
            BatchError::Cancelled {
                completed: rows.len(),
                total,
            }
        } else {
            BatchError::WorkersLost {
                completed: rows.len(),
                total,
            }
        });
    }
    progress.on_batch_finish(rows.len(), total);
    Ok(rows)
}

/// Runs one task inside this worker's capped inner pool and turns a panic
/// into a failure row.
fn run_isolated(
    task: &Task,
    config: &StudyConfig,
    source: &dyn ColumnSource,
    inner_pools: &ThreadLocal<ThreadPool>,
    total: usize,
) -> TaskOutcome {
    let inner = match inner_pools.get_or_try(|| {
        ThreadPoolBuilder::new()
            .num_threads(config.threads_per_worker)
            .build()
    }) {
        Ok(pool) => pool,
        Err(e) => {
            log::error!("Task {}/{}: could not build its thread pool: {e}", task.index, total);
            return TaskOutcome::failed(task, config, format!("Thread pool error: {e}"));
        }
    };

    match panic::catch_unwind(AssertUnwindSafe(|| {
        inner.install(|| run_task(task, config, source, total))
    })) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!(
                "Task {}/{}: Regression panicked for {}: {message}",
                task.index,
                total,
                task.label()
            );
            TaskOutcome::failed(task, config, format!("Unexpected error: {message}"))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "task panicked".to_string()
    }
}
