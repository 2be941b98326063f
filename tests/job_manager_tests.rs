//! Job manager tests: counters, the single completion event, setup hooks
//! and reuse across runs.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sim_exec::config::RunnerConfig;
use sim_exec::jobs::{EmptyJob, JobError, JobManager, JobRunner, ManagerHooks};
use test_harness::{EventLog, TestJob};

fn single_worker_runner(manager: &Arc<JobManager>) -> JobRunner {
    let runner = JobRunner::new(RunnerConfig::with_workers(1));
    runner.add(Arc::clone(manager));
    runner
}

fn count_completions(manager: &JobManager) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    manager.on_completed(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    count
}

struct CountingHooks {
    setups: Arc<AtomicUsize>,
    teardowns: Arc<AtomicUsize>,
    extra_jobs: usize,
    log: EventLog,
}

impl ManagerHooks for CountingHooks {
    fn before_first_job(&self, manager: &JobManager) -> Result<(), JobError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        for i in 0..self.extra_jobs {
            manager.add(TestJob::new(format!("extra-{}", i), &self.log).shared());
        }
        Ok(())
    }

    fn after_all_jobs(&self, _manager: &JobManager) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct FailingSetup;

impl ManagerHooks for FailingSetup {
    fn before_first_job(&self, _manager: &JobManager) -> Result<(), JobError> {
        Err("missing input file".into())
    }
}

#[test]
fn test_add_increments_counters() {
    let log = EventLog::default();
    let manager = JobManager::new("counts");
    assert_eq!(manager.num_jobs(), 0);
    assert_eq!(manager.progress(), 0.0);

    for i in 0..3 {
        manager.add(TestJob::new(format!("job-{}", i), &log).shared());
    }

    assert_eq!(manager.num_jobs(), 3);
    assert_eq!(manager.outstanding(), 3);
    assert_eq!(manager.num_jobs_completed(), 0);
}

#[test]
fn test_jobs_are_yielded_in_fifo_order() {
    let log = EventLog::default();
    let manager = Arc::new(JobManager::new("fifo"));
    for name in ["first", "second", "third"] {
        manager.add(TestJob::new(name, &log).shared());
    }

    let names: Vec<String> = manager
        .jobs()
        .map(|job| job.unwrap().name().to_string())
        .collect();
    assert_eq!(names, vec!["first", "second", "third"]);

    // A second sequence starts from the beginning again.
    assert_eq!(manager.jobs().count(), 3);
}

#[test]
fn test_completed_fires_once_after_every_job() {
    let log = EventLog::default();
    let manager = Arc::new(JobManager::new("once"));
    manager.add(TestJob::new("a", &log).shared());
    manager.add(TestJob::new("b", &log).failing().shared());
    manager.add(TestJob::new("c", &log).shared());
    manager.add(TestJob::new("d", &log).shared());
    let completions = count_completions(&manager);

    let failed = Arc::new(AtomicUsize::new(usize::MAX));
    let f = Arc::clone(&failed);
    manager.on_completed(move |record| f.store(record.failed, Ordering::SeqCst));

    let record = single_worker_runner(&manager).run(true).unwrap();

    assert!(record.error.is_none());
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(failed.load(Ordering::SeqCst), 1);
    assert_eq!(manager.num_jobs_completed(), 4);
    assert_eq!(manager.outstanding(), 0);
    assert_eq!(manager.progress(), 1.0);
}

#[test]
fn test_job_completed_listener_sees_every_job() {
    let log = EventLog::default();
    let manager = Arc::new(JobManager::new("listener"));
    for i in 0..5 {
        manager.add(TestJob::new(format!("job-{}", i), &log).shared());
    }
    let seen = EventLog::default();
    let s = seen.clone();
    manager.on_job_completed(move |record| s.push(record.job.name()));

    single_worker_runner(&manager).run(true);

    assert_eq!(seen.entries(), vec!["job-0", "job-1", "job-2", "job-3", "job-4"]);
}

#[test]
fn test_errors_are_collected_in_completion_order() {
    let log = EventLog::default();
    let manager = Arc::new(JobManager::new("errors"));
    manager.add(TestJob::new("bad-1", &log).failing().shared());
    manager.add(TestJob::new("ok", &log).shared());
    manager.add(TestJob::new("bad-2", &log).failing().shared());

    single_worker_runner(&manager).run(true);

    let errors: Vec<String> = manager.errors().iter().map(|e| e.to_string()).collect();
    assert_eq!(errors, vec!["bad-1 failed", "bad-2 failed"]);
}

#[test]
fn test_setup_hook_runs_once_and_may_add_jobs() {
    let log = EventLog::default();
    let setups = Arc::new(AtomicUsize::new(0));
    let teardowns = Arc::new(AtomicUsize::new(0));
    let manager = Arc::new(JobManager::with_hooks(
        "hooks",
        CountingHooks {
            setups: Arc::clone(&setups),
            teardowns: Arc::clone(&teardowns),
            extra_jobs: 2,
            log: log.clone(),
        },
    ));
    manager.add(TestJob::new("seed", &log).shared());

    let runner = single_worker_runner(&manager);
    runner.run(true);

    assert_eq!(setups.load(Ordering::SeqCst), 1);
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(manager.num_jobs(), 3);
    assert_eq!(log.with_prefix("end:"), vec!["seed", "extra-0", "extra-1"]);

    // Pulling the jobs again does not repeat the setup.
    assert_eq!(manager.jobs().count(), 3);
    assert_eq!(setups.load(Ordering::SeqCst), 1);
}

#[test]
fn test_setup_failure_is_yielded_once() {
    let log = EventLog::default();
    let manager = Arc::new(JobManager::with_hooks("broken", FailingSetup));
    manager.add(TestJob::new("never", &log).shared());

    let mut jobs = manager.jobs();
    let first = jobs.next().unwrap();
    assert!(first.is_err());
    assert!(jobs.next().is_none());
}

#[test]
fn test_manager_reused_across_runs_completes_each_time() {
    let log = EventLog::default();
    let manager = Arc::new(JobManager::new("reused"));
    manager.add(TestJob::new("a", &log).shared());
    manager.add(TestJob::new("b", &log).failing().shared());
    let completions = count_completions(&manager);

    let runner = single_worker_runner(&manager);
    runner.run(true);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(manager.errors().len(), 1);

    runner.run(true);
    assert_eq!(completions.load(Ordering::SeqCst), 2);
    assert_eq!(manager.num_jobs_completed(), 2);
    assert_eq!(manager.outstanding(), 0);
    // Errors from the previous run are dropped when the new run starts.
    assert_eq!(manager.errors().len(), 1);
    assert_eq!(log.with_prefix("end:"), vec!["a", "a"]);
}

#[test]
fn test_empty_job_lets_an_empty_run_complete() {
    let manager = Arc::new(JobManager::new("empty"));
    manager.add_job(EmptyJob);
    let completions = count_completions(&manager);

    let record = single_worker_runner(&manager).run(true).unwrap();

    assert!(record.error.is_none());
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(manager.progress(), 1.0);
}
