use std::time::{Duration, Instant};

use chrono::SecondsFormat;
use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::worker::Job;

/// Logs how long a job's callback ran once the timer goes out of scope.
pub struct JobExecutionTimer<'a> {
    job: &'a Job,
    context: Option<&'a str>,
    started_at: Instant,
    logger: &'a Logger,
}

impl<'a> JobExecutionTimer<'a> {
    pub fn new(job: &'a Job, context: Option<&'a str>, logger: &'a Logger) -> Self {
        Self {
            job,
            context,
            started_at: Instant::now(),
            logger,
        }
    }
}

impl Drop for JobExecutionTimer<'_> {
    fn drop(&mut self) {
        if !self.logger.enabled(LogLevel::Debug) {
            return;
        }

        let elapsed = self.started_at.elapsed();
        self.logger.log(
            LogLevel::Debug,
            self.context,
            &format!(
                "task '{}' finished in {}",
                self.job.task(),
                format_duration_human_friendly(elapsed)
            ),
            Some(json!({
                "handle": self.job.handle(),
                "assigned_at": self.job.assigned_at().to_rfc3339_opts(SecondsFormat::Millis, true),
                "elapsed_ms": elapsed.as_millis() as u64,
            })),
        );
    }
}

pub fn measure_job<T, F>(job: &Job, context: Option<&str>, logger: &Logger, run: F) -> T
where
    F: FnOnce() -> T,
{
    let timer = JobExecutionTimer::new(job, context, logger);
    let result = run();
    drop(timer);
    result
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
