use std::time::{Duration, Instant};

use serde_json::json;

use crate::logging::{LogLevel, Logger};

/// Logs the lifetime of a unit of work at debug level when dropped, so
/// early returns and unwinding are timed too.
pub struct ScopedExecutionTimer<'a> {
    task_name: &'a str,
    context: Option<&'a str>,
    started_at: Instant,
    logger: &'a Logger,
}

impl<'a> ScopedExecutionTimer<'a> {
    pub fn new(task_name: &'a str, context: Option<&'a str>, logger: &'a Logger) -> Self {
        Self {
            task_name,
            context,
            started_at: Instant::now(),
            logger,
        }
    }
}

impl Drop for ScopedExecutionTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.started_at.elapsed();
        self.logger.log(
            LogLevel::Debug,
            self.context,
            &format!(
                "task '{}' finished in {}",
                self.task_name,
                format_duration_human_friendly(elapsed)
            ),
            Some(json!({ "elapsed_us": elapsed.as_micros() as u64 })),
        );
    }
}

pub fn measure_execution<T, F>(task_name: &str, context: Option<&str>, logger: &Logger, task: F) -> T
where
    F: FnOnce() -> T,
{
    let _timer = ScopedExecutionTimer::new(task_name, context, logger);
    task()
}

fn format_duration_human_friendly(duration: Duration) -> String {
    let total_ms = duration.as_secs_f64() * 1000.0;
    if total_ms < 1_000.0 {
        return format!("{total_ms:.2} ms");
    }

    let total_seconds = total_ms / 1_000.0;
    if total_seconds < 60.0 {
        return format!("{total_seconds:.2} s");
    }

    let minutes = (total_seconds / 60.0).floor();
    format!("{minutes:.0}m {:.2}s", total_seconds - minutes * 60.0)
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::time::Duration;

    use crate::logging::testing::memory_logger;
    use crate::logging::LogLevel;

    use super::{format_duration_human_friendly, measure_execution};

    #[test]
    fn formats_durations_by_magnitude() {
        assert_eq!(format_duration_human_friendly(Duration::from_millis(250)), "250.00 ms");
        assert_eq!(format_duration_human_friendly(Duration::from_millis(1_500)), "1.50 s");
        assert_eq!(format_duration_human_friendly(Duration::from_secs(125)), "2m 5.00s");
    }

    #[test]
    fn logs_debug_line_with_task_name() {
        let (logger, sink) = memory_logger(LogLevel::Debug);

        let value = measure_execution("CancelJob rid=7", Some("dispatch::unit"), &logger, || 7);
        assert_eq!(value, 7);

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[DEBUG]"));
        assert!(lines[0].contains("task 'CancelJob rid=7' finished in"));
        assert!(lines[0].contains("elapsed_us"));
    }

    #[test]
    fn times_units_that_panic() {
        let (logger, sink) = memory_logger(LogLevel::Debug);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            measure_execution("boom", None, &logger, || panic!("unit failed"))
        }));

        assert!(outcome.is_err());
        assert!(sink.contains("task 'boom' finished in"));
    }

    #[test]
    fn stays_quiet_above_debug() {
        let (logger, sink) = memory_logger(LogLevel::Info);
        measure_execution("quiet", None, &logger, || ());
        assert!(sink.lines().is_empty());
    }
}
