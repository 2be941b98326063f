//! Process workload tests. Simulations are small `sh` scripts that print a
//! CSV report on stdout.

#![cfg(unix)]


use std::sync::Arc;
use std::time::{Duration, Instant};

use sim_exec::cluster::WorkerChunk;
use sim_exec::config::RunnerConfig;
use sim_exec::error::ExecError;
use sim_exec::jobs::{JobManager, JobRunner};
use sim_exec::protocol::{ColumnValues, Override, ParamValue};
use sim_exec::workload::{
    Partition, ProcessWorkload, SimulationSpec, Workload, SIMULATION_COLUMN,
};
use test_harness::wait_until;

fn script(name: &str, body: &str) -> SimulationSpec {
    SimulationSpec {
        name: name.to_string(),
        program: "sh".to_string(),
        args: vec!["-c".to_string(), body.to_string()],
        table: "Report".to_string(),
    }
}

/// Run every job of `workload` once, in order, and return the manager for
/// inspection.
fn run_workload(workload: &ProcessWorkload, overrides: &[Override]) -> Arc<JobManager> {
    let manager = Arc::new(JobManager::new("test"));
    for job in workload.jobs(overrides).unwrap() {
        manager.add(job);
    }
    let runner = JobRunner::new(RunnerConfig::with_workers(1));
    runner.add(Arc::clone(&manager));
    let record = runner.run(true).unwrap();
    assert!(record.error.is_none());
    manager
}

fn names(specs: &[SimulationSpec]) -> Vec<&str> {
    specs.iter().map(|s| s.name.as_str()).collect()
}

#[test]
fn test_simulation_report_is_stored_and_typed() {
    let workload = ProcessWorkload::new(vec![
        script("north", "printf 'Year,Yield,Irrigated\\n2020,1.5,true\\n2021,2,false\\n'"),
        script("south", "printf 'Year,Yield,Irrigated\\n2020,3.25,true\\n'"),
    ]);

    let manager = run_workload(&workload, &[]);
    assert!(manager.errors().is_empty());

    let table = workload.read_table("Report").unwrap();
    assert_eq!(table.num_rows(), 3);
    assert_eq!(
        table.column_names(),
        vec![SIMULATION_COLUMN, "Year", "Yield", "Irrigated"]
    );
    assert_eq!(
        table.column(SIMULATION_COLUMN).unwrap().values,
        ColumnValues::String(vec!["north".into(), "north".into(), "south".into()])
    );
    assert_eq!(
        table.column("Year").unwrap().values,
        ColumnValues::Int32(vec![2020, 2021, 2020])
    );
    assert_eq!(
        table.column("Yield").unwrap().values,
        ColumnValues::Double(vec![1.5, 2.0, 3.25])
    );
    assert_eq!(
        table.column("Irrigated").unwrap().values,
        ColumnValues::Boolean(vec![true, false, true])
    );
}

#[test]
fn test_overrides_reach_the_process_environment() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("overrides.json");
    let spec = SimulationSpec {
        name: "env".to_string(),
        program: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            "printf '%s' \"$SIM_EXEC_OVERRIDES\" > \"$0\"".to_string(),
            out.display().to_string(),
        ],
        table: "Report".to_string(),
    };
    let workload = ProcessWorkload::new(vec![spec]);
    let overrides = vec![
        Override::new("[Clock].Years", ParamValue::Integer(30)),
        Override::new("[Soil].Layers", ParamValue::DoubleArray(vec![0.1, 0.3])),
    ];

    let manager = run_workload(&workload, &overrides);
    assert!(manager.errors().is_empty());

    let written = std::fs::read_to_string(&out).unwrap();
    let received: Vec<Override> = serde_json::from_str(&written).unwrap();
    assert_eq!(received, overrides);
}

#[test]
fn test_failing_process_is_a_job_error() {
    let workload = ProcessWorkload::new(vec![
        script("broken", "echo 'weather file missing' >&2; exit 3"),
        script("fine", "printf 'Day\\n1\\n'"),
    ]);

    let manager = run_workload(&workload, &[]);

    let errors = manager.errors();
    assert_eq!(errors.len(), 1);
    let message = errors[0].to_string();
    assert!(message.contains("simulation broken failed"));
    assert!(message.contains("weather file missing"));
    // The other simulation still produced its report.
    assert_eq!(workload.read_table("Report").unwrap().num_rows(), 1);
}

#[test]
fn test_missing_program_is_a_job_error() {
    let workload = ProcessWorkload::new(vec![SimulationSpec {
        name: "ghost".to_string(),
        program: "/definitely/not/a/real/engine".to_string(),
        args: vec![],
        table: "Report".to_string(),
    }]);

    let manager = run_workload(&workload, &[]);

    let errors = manager.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].to_string().contains("failed to start"));
}

#[test]
fn test_rerun_replaces_previous_rows() {
    let workload = ProcessWorkload::new(vec![script(
        "repeat",
        "printf 'Year\\n2020\\n2021\\n'",
    )]);

    run_workload(&workload, &[]);
    run_workload(&workload, &[]);

    assert_eq!(workload.read_table("Report").unwrap().num_rows(), 2);
}

#[test]
fn test_unknown_table_before_any_run() {
    let workload = ProcessWorkload::new(vec![script("idle", "true")]);
    let err = workload.read_table("Report").unwrap_err();
    assert!(matches!(err, ExecError::TableNotFound(ref t) if t == "Report"));
}

#[test]
fn test_stop_kills_running_process() {
    let workload = ProcessWorkload::new(vec![script("slow", "sleep 30")]);
    let manager = Arc::new(JobManager::new("slow"));
    for job in workload.jobs(&[]).unwrap() {
        manager.add(job);
    }
    let runner = JobRunner::new(RunnerConfig::with_workers(2));
    runner.add(Arc::clone(&manager));

    runner.run(false);
    assert!(wait_until(Duration::from_secs(5), || runner.num_running() == 1));
    // Give the child a moment to start.
    std::thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    runner.stop();
    runner.wait();

    assert!(started.elapsed() < Duration::from_secs(5));
    let errors = manager.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].to_string().contains("simulation slow was cancelled"));
}

#[test]
fn test_partition_deals_round_robin() {
    let staging = tempfile::tempdir().unwrap();
    let workload = ProcessWorkload::new(
        (0..5)
            .map(|i| script(&format!("sim-{}", i), "true"))
            .collect(),
    );

    let chunks = workload.partition(2, staging.path()).unwrap();

    assert_eq!(
        chunks,
        vec![
            WorkerChunk {
                index: 0,
                path: staging.path().join("chunk-0.json"),
            },
            WorkerChunk {
                index: 1,
                path: staging.path().join("chunk-1.json"),
            },
        ]
    );
    let first = ProcessWorkload::load(&chunks[0].path).unwrap();
    let second = ProcessWorkload::load(&chunks[1].path).unwrap();
    assert_eq!(names(first.simulations()), vec!["sim-0", "sim-2", "sim-4"]);
    assert_eq!(names(second.simulations()), vec!["sim-1", "sim-3"]);
}

#[test]
fn test_partition_never_creates_empty_chunks() {
    let staging = tempfile::tempdir().unwrap();
    let workload = ProcessWorkload::new(vec![script("a", "true"), script("b", "true")]);

    let chunks = workload.partition(5, staging.path()).unwrap();
    assert_eq!(chunks.len(), 2);

    let chunks = workload.partition(0, staging.path()).unwrap();
    assert_eq!(chunks.len(), 1);
    let only = ProcessWorkload::load(&chunks[0].path).unwrap();
    assert_eq!(names(only.simulations()), vec!["a", "b"]);
}

#[test]
fn test_partition_of_empty_workload_fails() {
    let staging = tempfile::tempdir().unwrap();
    let err = ProcessWorkload::new(vec![])
        .partition(3, staging.path())
        .unwrap_err();
    assert!(matches!(err, ExecError::Provisioning(_)));
}

#[test]
fn test_load_applies_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("workload.json");
    std::fs::write(
        &path,
        r#"{"simulations": [{"name": "plain", "program": "engine"}]}"#,
    )
    .unwrap();

    let workload = ProcessWorkload::load(&path).unwrap();
    let spec = &workload.simulations()[0];
    assert_eq!(spec.name, "plain");
    assert!(spec.args.is_empty());
    assert_eq!(spec.table, "Report");
}

#[test]
fn test_load_rejects_malformed_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("workload.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = ProcessWorkload::load(&path).unwrap_err();
    assert!(matches!(err, ExecError::Workload(_)));
}
