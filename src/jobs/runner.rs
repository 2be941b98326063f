use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::error::{ExecError, Result};
use crate::jobs::events::{notify, EventHandlers};
use crate::jobs::manager::JobManager;
use crate::jobs::runnable::{
    guarded, panic_message, JobCompletionRecord, RunCompletionRecord, Runnable,
};

/// Spins before falling back to short sleeps while polling counters.
const SPIN_LIMIT: u32 = 64;
const POLL_SLEEP: Duration = Duration::from_millis(1);

/// A job currently executing, as seen in the running-jobs snapshot.
#[derive(Clone)]
pub struct RunningJob {
    pub id: Uuid,
    pub name: String,
    pub manager: String,
    pub started_at: DateTime<Utc>,
    pub job: Arc<dyn Runnable>,
}

impl std::fmt::Debug for RunningJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningJob")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("manager", &self.manager)
            .field("started_at", &self.started_at)
            .finish()
    }
}

struct RunnerInner {
    config: RunnerConfig,
    managers: Mutex<Vec<Arc<JobManager>>>,
    /// Copy-on-write list of in-flight jobs; replaced wholesale on mutation.
    running: ArcSwap<Vec<RunningJob>>,
    running_count: AtomicUsize,
    /// Serializes "check cancellation, then dispatch" against `stop`.
    dispatch_lock: Mutex<()>,
    cancel: Mutex<CancellationToken>,
    in_progress: AtomicBool,
    background: Mutex<Option<JoinHandle<RunCompletionRecord>>>,
    job_completed: EventHandlers<JobCompletionRecord>,
    all_completed: EventHandlers<RunCompletionRecord>,
}

/// Multiplexes jobs from one or more managers onto a bounded worker pool.
///
/// Managers are drained one after another in registration order; jobs of
/// the second manager start only once every job of the first has been
/// dispatched. Within a manager, jobs start in FIFO order.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("managers", &self.inner.managers.lock().len())
            .field("running", &self.inner.running_count.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl JobRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                config,
                managers: Mutex::new(Vec::new()),
                running: ArcSwap::from_pointee(Vec::new()),
                running_count: AtomicUsize::new(0),
                dispatch_lock: Mutex::new(()),
                cancel: Mutex::new(CancellationToken::new()),
                in_progress: AtomicBool::new(false),
                background: Mutex::new(None),
                job_completed: EventHandlers::default(),
                all_completed: EventHandlers::default(),
            }),
        }
    }

    /// Register a manager as a source of jobs.
    pub fn add(&self, manager: Arc<JobManager>) {
        self.inner.managers.lock().push(manager);
    }

    /// Subscribe to every job completion, fired after the owning manager
    /// has been told about the job.
    pub fn on_job_completed<F>(&self, listener: F)
    where
        F: Fn(&JobCompletionRecord) + Send + Sync + 'static,
    {
        self.inner.job_completed.subscribe(listener);
    }

    /// Subscribe to the single "all complete" event of each run.
    pub fn on_all_completed<F>(&self, listener: F)
    where
        F: Fn(&RunCompletionRecord) + Send + Sync + 'static,
    {
        self.inner.all_completed.subscribe(listener);
    }

    /// Start executing every registered manager's jobs.
    ///
    /// With one worker and `wait == true` the whole run happens on the
    /// calling thread. Otherwise a background scheduling thread is spawned;
    /// when `wait` is true the caller blocks until it finishes and gets the
    /// completion record back, else `None` is returned and [`JobRunner::wait`]
    /// can be used later.
    pub fn run(&self, wait: bool) -> Option<RunCompletionRecord> {
        if self.inner.in_progress.swap(true, Ordering::SeqCst) {
            tracing::warn!("Job runner is already running");
            return wait.then(|| RunCompletionRecord {
                error: Some(Arc::new(ExecError::Internal(
                    "job runner is already running".to_string(),
                ))),
                elapsed: Duration::ZERO,
            });
        }

        let workers = self.inner.config.worker_count();
        let token = CancellationToken::new();
        *self.inner.cancel.lock() = token.clone();
        tracing::debug!(workers, wait, "Starting job runner");

        if workers == 1 && wait {
            return Some(Arc::clone(&self.inner).run_to_completion(workers, token));
        }

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("job-scheduler".to_string())
            .spawn(move || inner.run_to_completion(workers, token));

        match spawned {
            Ok(handle) if wait => Some(Self::join(handle)),
            Ok(handle) => {
                *self.inner.background.lock() = Some(handle);
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn scheduling thread");
                let record = RunCompletionRecord {
                    error: Some(Arc::new(ExecError::Io(e))),
                    elapsed: Duration::ZERO,
                };
                self.inner.in_progress.store(false, Ordering::SeqCst);
                self.inner.all_completed.emit(&record);
                wait.then_some(record)
            }
        }
    }

    /// Block until a run started with `run(false)` finishes.
    pub fn wait(&self) -> Option<RunCompletionRecord> {
        let handle = self.inner.background.lock().take();
        handle.map(Self::join)
    }

    /// Cancel the current run, clean up every in-flight job and block until
    /// none are left running. Returns immediately when nothing is running.
    pub fn stop(&self) {
        let token = {
            let _dispatch = self.inner.dispatch_lock.lock();
            let token = self.inner.cancel.lock().clone();
            token.cancel();
            token
        };

        let snapshot = self.inner.running.load_full();
        if !snapshot.is_empty() {
            tracing::info!(running = snapshot.len(), "Stopping job runner");
        }
        for entry in snapshot.iter() {
            if let Err(e) = guarded(|| entry.job.cleanup(&token)) {
                tracing::warn!(job = %entry.name, error = %e, "Cleanup during stop failed");
            }
        }

        spin_until(|| self.inner.running_count.load(Ordering::SeqCst) == 0);
    }

    /// Point-in-time snapshot of the jobs currently executing.
    pub fn running_jobs(&self) -> Arc<Vec<RunningJob>> {
        self.inner.running.load_full()
    }

    pub fn num_running(&self) -> usize {
        self.inner.running_count.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.in_progress.load(Ordering::SeqCst)
    }

    /// Fraction of all registered jobs that have completed.
    pub fn progress(&self) -> f64 {
        let managers = self.inner.managers.lock();
        let total: usize = managers.iter().map(|m| m.num_jobs()).sum();
        if total == 0 {
            return 0.0;
        }
        let done: usize = managers
            .iter()
            .map(|m| m.num_jobs_completed().min(m.num_jobs()))
            .sum();
        done as f64 / total as f64
    }

    fn join(handle: JoinHandle<RunCompletionRecord>) -> RunCompletionRecord {
        handle.join().unwrap_or_else(|_| RunCompletionRecord {
            error: Some(Arc::new(ExecError::Internal(
                "scheduling thread panicked".to_string(),
            ))),
            elapsed: Duration::ZERO,
        })
    }
}

impl RunnerInner {
    fn run_to_completion(self: Arc<Self>, workers: usize, token: CancellationToken) -> RunCompletionRecord {
        let started = Instant::now();

        let outcome = if workers > 1 {
            rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("job-worker-{}", i))
                .panic_handler(|panic| {
                    tracing::error!(panic = %panic_message(panic.as_ref()), "Job worker panicked");
                })
                .build()
                .map_err(ExecError::from)
                .and_then(|pool| {
                    let result = self.schedule(workers, Some(&pool), &token);
                    // Dispatched jobs still hold pool threads; keep the pool
                    // alive until they are done.
                    self.wait_until_idle();
                    result
                })
        } else {
            let result = self.schedule(workers, None, &token);
            self.wait_until_idle();
            result
        };

        if let Err(e) = &outcome {
            tracing::error!(error = %e, "Job runner aborted");
        }

        let record = RunCompletionRecord {
            error: outcome.err().map(Arc::new),
            elapsed: started.elapsed(),
        };
        tracing::info!(elapsed_ms = record.elapsed.as_millis() as u64, "All jobs completed");
        self.in_progress.store(false, Ordering::SeqCst);
        self.all_completed.emit(&record);
        record
    }

    fn schedule(
        self: &Arc<Self>,
        workers: usize,
        pool: Option<&rayon::ThreadPool>,
        token: &CancellationToken,
    ) -> Result<()> {
        let managers: Vec<Arc<JobManager>> = self.managers.lock().clone();

        for manager in managers {
            for next in manager.jobs() {
                let job = next.map_err(|e| {
                    ExecError::JobSource(format!("manager {}: {}", manager.name(), e))
                })?;

                spin_until(|| {
                    token.is_cancelled() || self.running_count.load(Ordering::SeqCst) < workers
                });

                let Some(entry) = self.begin(job, &manager, token) else {
                    tracing::debug!("Run cancelled, no further jobs dispatched");
                    return Ok(());
                };

                match pool {
                    Some(pool) => {
                        let inner = Arc::clone(self);
                        let manager = Arc::clone(&manager);
                        let token = token.clone();
                        pool.spawn(move || inner.execute(entry, &manager, &token));
                    }
                    None => self.execute(entry, &manager, token),
                }
            }
        }
        Ok(())
    }

    /// Count the job as running and publish it, unless the run was cancelled.
    fn begin(
        &self,
        job: Arc<dyn Runnable>,
        manager: &JobManager,
        token: &CancellationToken,
    ) -> Option<RunningJob> {
        let _dispatch = self.dispatch_lock.lock();
        if token.is_cancelled() {
            return None;
        }
        let entry = RunningJob {
            id: Uuid::new_v4(),
            name: job.name().to_string(),
            manager: manager.name().to_string(),
            started_at: Utc::now(),
            job,
        };
        self.running_count.fetch_add(1, Ordering::SeqCst);
        self.running.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(entry.clone());
            next
        });
        tracing::debug!(job = %entry.name, manager = %entry.manager, "Job dispatched");
        Some(entry)
    }

    fn execute(&self, entry: RunningJob, manager: &JobManager, token: &CancellationToken) {
        let _finished = Finished {
            inner: self,
            id: entry.id,
        };
        let started = Instant::now();
        let job = Arc::clone(&entry.job);

        let result = guarded(|| job.prepare())
            .and_then(|_| guarded(|| job.run(token)))
            .and_then(|_| guarded(|| job.cleanup(token)));

        let record = JobCompletionRecord {
            job,
            error: result.err().map(Arc::from),
            elapsed: started.elapsed(),
        };

        match &record.error {
            Some(e) => tracing::warn!(job = %entry.name, error = %e, "Job failed"),
            None => tracing::debug!(
                job = %entry.name,
                elapsed_ms = record.elapsed.as_millis() as u64,
                "Job completed"
            ),
        }

        notify("job_has_completed", || manager.job_has_completed(&record));
        self.job_completed.emit(&record);
    }

    fn wait_until_idle(&self) {
        spin_until(|| self.running_count.load(Ordering::SeqCst) == 0);
    }
}

/// Takes a dispatched job out of the running set, even if a completion
/// callback unwinds.
struct Finished<'a> {
    inner: &'a RunnerInner,
    id: Uuid,
}

impl Drop for Finished<'_> {
    fn drop(&mut self) {
        let id = self.id;
        self.inner.running.rcu(|current| {
            current
                .iter()
                .filter(|r| r.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        self.inner.running_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Poll `done` until it holds: spin briefly, then sleep between polls.
fn spin_until(mut done: impl FnMut() -> bool) {
    let mut spins = 0u32;
    while !done() {
        if spins < SPIN_LIMIT {
            spins += 1;
            std::hint::spin_loop();
            std::thread::yield_now();
        } else {
            std::thread::sleep(POLL_SLEEP);
        }
    }
}
