use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::jobs::events::{notify, EventHandlers};
use crate::jobs::runnable::{
    JobCompletionRecord, JobError, ManagerCompletionRecord, Runnable, SharedJobError,
};

/// Manager-specific behavior around a run.
pub trait ManagerHooks: Send + Sync {
    /// One-time setup performed lazily on the first pull of jobs. May add
    /// jobs. An error here is a runner-level failure.
    fn before_first_job(&self, _manager: &JobManager) -> Result<(), JobError> {
        Ok(())
    }

    /// Invoked once when every job of a run has completed.
    fn after_all_jobs(&self, _manager: &JobManager) {}
}

struct NoHooks;

impl ManagerHooks for NoHooks {}

#[derive(Debug, Default)]
struct Counters {
    num_jobs: i64,
    outstanding: i64,
    completed: usize,
}

/// Owns the jobs of one logical run and tracks how many are outstanding.
///
/// `add` must not be called from several threads at once, and never while a
/// runner is pulling from this manager. This is a precondition of the API,
/// not something the manager checks.
pub struct JobManager {
    name: String,
    jobs: Mutex<Vec<Arc<dyn Runnable>>>,
    counters: Mutex<Counters>,
    errors: Mutex<Vec<SharedJobError>>,
    setup_done: AtomicBool,
    started: Mutex<Option<Instant>>,
    hooks: Box<dyn ManagerHooks>,
    job_completed: EventHandlers<JobCompletionRecord>,
    completed: EventHandlers<ManagerCompletionRecord>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("name", &self.name)
            .field("num_jobs", &self.num_jobs())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl JobManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_hooks(name, NoHooks)
    }

    pub fn with_hooks(name: impl Into<String>, hooks: impl ManagerHooks + 'static) -> Self {
        Self {
            name: name.into(),
            jobs: Mutex::new(Vec::new()),
            counters: Mutex::new(Counters::default()),
            errors: Mutex::new(Vec::new()),
            setup_done: AtomicBool::new(false),
            started: Mutex::new(None),
            hooks: Box::new(hooks),
            job_completed: EventHandlers::default(),
            completed: EventHandlers::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job. Increments both the total and the outstanding count.
    pub fn add(&self, job: Arc<dyn Runnable>) {
        self.jobs.lock().push(job);
        let mut counters = self.counters.lock();
        counters.num_jobs += 1;
        counters.outstanding += 1;
    }

    pub fn add_job<R: Runnable + 'static>(&self, job: R) {
        self.add(Arc::new(job));
    }

    /// Total number of jobs ever added.
    pub fn num_jobs(&self) -> usize {
        self.counters.lock().num_jobs as usize
    }

    /// Jobs not yet completed in the current run. May be negative briefly
    /// when the manager is reused for another run.
    pub fn outstanding(&self) -> i64 {
        self.counters.lock().outstanding
    }

    pub fn num_jobs_completed(&self) -> usize {
        self.counters.lock().completed
    }

    /// Fraction of jobs completed in the current run, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let counters = self.counters.lock();
        if counters.num_jobs == 0 {
            return 0.0;
        }
        (counters.completed as f64 / counters.num_jobs as f64).min(1.0)
    }

    /// Errors raised by jobs of this manager, in completion order.
    pub fn errors(&self) -> Vec<SharedJobError> {
        self.errors.lock().clone()
    }

    /// Lazy, single-pass sequence of this manager's jobs in FIFO order.
    ///
    /// Each call returns a fresh sequence starting at the first job. The
    /// manager's setup hook runs once per manager, on the first pull of the
    /// first sequence.
    pub fn jobs(self: &Arc<Self>) -> JobIter {
        JobIter {
            manager: Arc::clone(self),
            index: 0,
            finished: false,
        }
    }

    /// Record a finished job. Called by the runner exactly once per job,
    /// before the runner's own job-completed event.
    pub fn job_has_completed(&self, record: &JobCompletionRecord) {
        if let Some(error) = &record.error {
            self.errors.lock().push(Arc::clone(error));
        }

        let run_finished = {
            let mut counters = self.counters.lock();
            counters.completed += 1;
            counters.outstanding -= 1;
            if counters.outstanding < 0 {
                // Reuse across runs: this completion belongs to a new run of
                // the same jobs, so it counts as the first of `num_jobs`.
                counters.outstanding = counters.num_jobs - 1;
                counters.completed = 1;
                self.errors.lock().retain(|e| {
                    record
                        .error
                        .as_ref()
                        .is_some_and(|current| Arc::ptr_eq(e, current))
                });
            }
            counters.outstanding == 0
        };

        self.job_completed.emit(record);

        if run_finished {
            let elapsed = self
                .started
                .lock()
                .map(|s| s.elapsed())
                .unwrap_or_default();
            let failed = self.errors.lock().len();
            tracing::debug!(manager = %self.name, failed, "All jobs of manager completed");
            notify("after_all_jobs", || self.hooks.after_all_jobs(self));
            self.completed.emit(&ManagerCompletionRecord {
                manager: self.name.clone(),
                num_jobs: self.num_jobs(),
                failed,
                elapsed,
            });
        }
    }

    /// Subscribe to every job completion of this manager.
    pub fn on_job_completed<F>(&self, listener: F)
    where
        F: Fn(&JobCompletionRecord) + Send + Sync + 'static,
    {
        self.job_completed.subscribe(listener);
    }

    /// Subscribe to the "all jobs of this manager are done" event.
    pub fn on_completed<F>(&self, listener: F)
    where
        F: Fn(&ManagerCompletionRecord) + Send + Sync + 'static,
    {
        self.completed.subscribe(listener);
    }

    fn run_setup_once(&self) -> Result<(), JobError> {
        if self.setup_done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.started.lock() = Some(Instant::now());
        self.hooks.before_first_job(self)
    }
}

/// Sequence returned by [`JobManager::jobs`].
pub struct JobIter {
    manager: Arc<JobManager>,
    index: usize,
    finished: bool,
}

impl Iterator for JobIter {
    type Item = Result<Arc<dyn Runnable>, JobError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.index == 0 {
            if let Err(e) = self.manager.run_setup_once() {
                self.finished = true;
                return Some(Err(e));
            }
        }
        let next = self.manager.jobs.lock().get(self.index).cloned();
        match next {
            Some(job) => {
                self.index += 1;
                Some(Ok(job))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}
