use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ExecError;

/// Error raised by a job's prepare/run/cleanup step.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// A job error shared between the owning manager and runner listeners.
pub type SharedJobError = Arc<dyn std::error::Error + Send + Sync>;

/// The minimal unit of schedulable work.
///
/// A runnable has no identity beyond the `Arc` that holds it. The runner
/// calls `prepare`, then `run`, then `cleanup`; the first error stops the
/// sequence. Cancellation is cooperative: long-running jobs are expected to
/// poll the token and return early once it fires.
pub trait Runnable: Send + Sync {
    /// Display name used in logs and in the running-jobs snapshot.
    fn name(&self) -> &str {
        "job"
    }

    fn prepare(&self) -> Result<(), JobError> {
        Ok(())
    }

    fn run(&self, cancel: &CancellationToken) -> Result<(), JobError>;

    /// Release anything acquired by `prepare`/`run`. May be called more than
    /// once when the runner is stopped while the job is in flight.
    fn cleanup(&self, _cancel: &CancellationToken) -> Result<(), JobError> {
        Ok(())
    }
}

/// Placeholder job queued when a run has nothing to do, so the usual
/// completion path still fires.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyJob;

impl Runnable for EmptyJob {
    fn name(&self) -> &str {
        "empty"
    }

    fn run(&self, _cancel: &CancellationToken) -> Result<(), JobError> {
        Ok(())
    }
}

/// Outcome of a single job, produced exactly once per dispatched job.
#[derive(Clone)]
pub struct JobCompletionRecord {
    pub job: Arc<dyn Runnable>,
    pub error: Option<SharedJobError>,
    pub elapsed: Duration,
}

impl JobCompletionRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Debug for JobCompletionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobCompletionRecord")
            .field("job", &self.job.name())
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .field("elapsed", &self.elapsed)
            .finish()
    }
}

/// Outcome of one `JobRunner::run` invocation. `error` is only set for
/// runner-level failures; individual job failures live in job records.
#[derive(Debug, Clone)]
pub struct RunCompletionRecord {
    pub error: Option<Arc<ExecError>>,
    pub elapsed: Duration,
}

/// Emitted once when a manager's outstanding count reaches zero.
#[derive(Debug, Clone)]
pub struct ManagerCompletionRecord {
    pub manager: String,
    pub num_jobs: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Run one job step, turning a panic into a job error.
pub(crate) fn guarded<F>(step: F) -> Result<(), JobError>
where
    F: FnOnce() -> Result<(), JobError>,
{
    match catch_unwind(AssertUnwindSafe(step)) {
        Ok(result) => result,
        Err(panic) => Err(format!("job panicked: {}", panic_message(panic.as_ref())).into()),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
