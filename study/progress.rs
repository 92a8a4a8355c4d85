use crate::results::ResultRow;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;

/// Observer for reporting incremental progress while a batch runs.
///
/// Callbacks arrive on the orchestrating thread in completion order.
pub trait BatchProgress {
    fn on_batch_start(&mut self, total_tasks: usize) {
        let _ = total_tasks;
    }
    fn on_task_complete(&mut self, completed: usize, total_tasks: usize, row: &ResultRow) {
        let _ = (completed, total_tasks, row);
    }
    fn on_batch_finish(&mut self, completed: usize, total_tasks: usize) {
        let _ = (completed, total_tasks);
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl BatchProgress for NoopProgress {}

/// How many completions pass between progress log lines.
pub fn log_interval(total_tasks: usize) -> usize {
    match total_tasks {
        0..=10 => 1,
        11..=50 => 5,
        51..=100 => 10,
        101..=200 => 20,
        201..=300 => 30,
        301..=400 => 40,
        401..=500 => 50,
        _ => 100,
    }
}

/// Logs progress at a cadence scaled to the batch size, and always at the end.
#[derive(Default)]
pub struct LogProgress {
    interval: usize,
    failures: usize,
}

impl LogProgress {
    fn should_log(&self, completed: usize, total_tasks: usize) -> bool {
        completed == total_tasks || completed % self.interval.max(1) == 0
    }
}

impl BatchProgress for LogProgress {
    fn on_batch_start(&mut self, total_tasks: usize) {
        self.interval = log_interval(total_tasks);
        self.failures = 0;
    }

    fn on_task_complete(&mut self, completed: usize, total_tasks: usize, row: &ResultRow) {
        if row.is_failed() {
            self.failures += 1;
        }
        if self.should_log(completed, total_tasks) {
            let percent = 100.0 * completed as f64 / total_tasks.max(1) as f64;
            log::info!(
                "Progress: {completed}/{total_tasks} regressions ({percent:.2}%), {} failed",
                self.failures
            );
        }
    }

    fn on_batch_finish(&mut self, completed: usize, total_tasks: usize) {
        log::info!(
            "Finished {completed}/{total_tasks} regressions ({} failed).",
            self.failures
        );
    }
}

/// An interactive bar on stderr. Falls back to a hidden bar when stderr is not a terminal.
#[derive(Default)]
pub struct BarProgress {
    bar: Option<ProgressBar>,
    failures: usize,
}

impl BatchProgress for BarProgress {
    fn on_batch_start(&mut self, total_tasks: usize) {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(total_tasks as u64), draw_target);
        match ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            Ok(style) => bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  ")),
            Err(e) => log::debug!("Falling back to the default progress style: {e}"),
        }
        bar.set_message("regressions");
        self.bar = Some(bar);
        self.failures = 0;
    }

    fn on_task_complete(&mut self, completed: usize, total_tasks: usize, row: &ResultRow) {
        let _ = total_tasks;
        if row.is_failed() {
            self.failures += 1;
        }
        if let Some(bar) = &self.bar {
            bar.set_position(completed as u64);
            if self.failures > 0 {
                bar.set_message(format!("regressions ({} failed)", self.failures));
            }
        }
    }

    fn on_batch_finish(&mut self, completed: usize, total_tasks: usize) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!(
                "{completed}/{total_tasks} regressions ({} failed)",
                self.failures
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regress::model::ModelKind;

    #[test]
    fn cadence_scales_with_batch_size() {
        let expected = [
            (1, 1),
            (10, 1),
            (11, 5),
            (50, 5),
            (100, 10),
            (200, 20),
            (300, 30),
            (400, 40),
            (500, 50),
            (501, 100),
            (100_000, 100),
        ];
        for (total, interval) in expected {
            assert_eq!(log_interval(total), interval, "total = {total}");
        }
    }

    #[test]
    fn log_progress_always_reports_the_final_task() {
        let mut progress = LogProgress::default();
        progress.on_batch_start(23);
        assert!(progress.should_log(5, 23));
        assert!(!progress.should_log(7, 23));
        assert!(progress.should_log(23, 23));

        let mut failed = ResultRow::empty("x", "y", ModelKind::Firth);
        failed.failed_reason = Some("Insufficient data: 3 rows (< 20)".to_string());
        progress.on_task_complete(1, 23, &failed);
        assert_eq!(progress.failures, 1);
    }

    #[test]
    fn hidden_bar_tracks_position() {
        let mut progress = BarProgress::default();
        progress.on_batch_start(3);
        let row = ResultRow::empty("x", "y", ModelKind::Linear);
        progress.on_task_complete(2, 3, &row);
        assert_eq!(progress.bar.as_ref().map(|b| b.position()), Some(2));
        progress.on_batch_finish(3, 3);
        assert!(progress.bar.is_none());
    }
}
