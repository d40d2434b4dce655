//! End-to-end phase scheduling against real pools.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use batchcore::config::ParallelConfig;
use batchcore::error::{ExecutionError, PhaseError};
use batchcore::execution::{CommandExecutor, Interrupt, ProcessCommandExecutor, RemoteSession};
use batchcore::scheduler::{
    CommandJob, ExecutionContext, ExecutionMonitor, ExecutionPhase, Job, JobScheduler,
};

/// Tracks how many sessions run at once.
#[derive(Default)]
struct Gauge {
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// Sleeps for a fixed time, then exits with a fixed code.
struct SleepJob {
    label: String,
    resource: String,
    sleep: Duration,
    code: i32,
    gauge: Arc<Gauge>,
}

impl SleepJob {
    fn new(label: &str, resource: &str, millis: u64, code: i32, gauge: &Arc<Gauge>) -> Arc<dyn Job> {
        Arc::new(Self {
            label: label.to_string(),
            resource: resource.to_string(),
            sleep: Duration::from_millis(millis),
            code,
            gauge: Arc::clone(gauge),
        })
    }
}

struct SleepSession {
    sleep: Duration,
    code: i32,
    gauge: Arc<Gauge>,
}

impl RemoteSession for SleepSession {
    fn command(&self) -> &str {
        "sleep"
    }

    fn input(&mut self) -> Option<&mut dyn Write> {
        None
    }

    fn close_input(&mut self) -> Result<(), ExecutionError> {
        Ok(())
    }

    fn wait_for(&mut self, interrupt: &Interrupt) -> Result<i32, ExecutionError> {
        let now = self.gauge.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);

        let deadline = Instant::now() + self.sleep;
        let result = loop {
            if interrupt.is_interrupted() {
                break Err(ExecutionError::Interrupted {
                    command: "sleep".to_string(),
                });
            }
            if Instant::now() >= deadline {
                break Ok(self.code);
            }
            thread::sleep(Duration::from_millis(5));
        };

        self.gauge.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn close(&mut self) {}
}

impl Job for SleepJob {
    fn label(&self) -> &str {
        &self.label
    }

    fn resource_id(&self, _context: &ExecutionContext) -> String {
        self.resource.clone()
    }

    fn command_line(&self, _context: &ExecutionContext) -> Vec<String> {
        vec!["sleep".to_string()]
    }

    fn launch(
        &self,
        _monitor: &ExecutionMonitor,
        _context: &ExecutionContext,
    ) -> Result<Box<dyn RemoteSession>, ExecutionError> {
        Ok(Box::new(SleepSession {
            sleep: self.sleep,
            code: self.code,
            gauge: Arc::clone(&self.gauge),
        }))
    }
}

fn scheduler(limits: &[(&str, usize)]) -> JobScheduler {
    let limits: BTreeMap<String, usize> = limits
        .iter()
        .map(|(name, size)| (name.to_string(), *size))
        .collect();
    let mut scheduler = JobScheduler::new();
    scheduler.configure(&ParallelConfig::new(limits).unwrap()).unwrap();
    scheduler
}

fn context() -> ExecutionContext {
    ExecutionContext::new("batch", "flow", "exec", ExecutionPhase::Main)
}

#[test]
fn test_pool_size_bounds_concurrency() {
    let scheduler = scheduler(&[("default", 4), ("db", 2)]);
    let gauge = Arc::new(Gauge::default());
    let jobs: Vec<Arc<dyn Job>> = (0..6)
        .map(|i| SleepJob::new(&format!("db-{}", i), "db", 40, 0, &gauge))
        .collect();

    let report = scheduler
        .execute(&Arc::new(ExecutionMonitor::new()), &context(), jobs)
        .unwrap();

    assert_eq!(report.jobs, 6);
    assert_eq!(report.fallbacks, 0);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    assert!(report.elapsed >= Duration::from_millis(120));
}

#[test]
fn test_unknown_resource_uses_default_pool() {
    let scheduler = scheduler(&[("default", 1)]);
    let gauge = Arc::new(Gauge::default());
    let jobs = vec![
        SleepJob::new("known", "default", 10, 0, &gauge),
        SleepJob::new("stray", "no-such-pool", 10, 0, &gauge),
    ];

    let report = scheduler
        .execute(&Arc::new(ExecutionMonitor::new()), &context(), jobs)
        .unwrap();

    assert_eq!(report.fallbacks, 1);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
}

#[test]
fn test_one_failure_waits_for_all_jobs() {
    let scheduler = scheduler(&[("default", 4)]);
    let gauge = Arc::new(Gauge::default());
    let jobs = vec![
        SleepJob::new("ok-1", "default", 100, 0, &gauge),
        SleepJob::new("broken", "default", 10, 5, &gauge),
        SleepJob::new("ok-2", "default", 100, 0, &gauge),
    ];

    let failure = scheduler
        .execute(&Arc::new(ExecutionMonitor::new()), &context(), jobs)
        .unwrap_err();

    match failure.error {
        PhaseError::JobFailed {
            ref label,
            exit_code,
            ..
        } => {
            assert_eq!(label, "broken");
            assert_eq!(exit_code, 5);
        }
        ref other => panic!("unexpected error: {}", other),
    }

    // The failing job finished first, but the siblings still ran to the end.
    assert_eq!(failure.report.timeline.get_durations().len(), 3);
    assert!(failure.report.elapsed >= Duration::from_millis(100));
    assert_eq!(gauge.running.load(Ordering::SeqCst), 0);
}

#[test]
fn test_two_workers_three_local_jobs() {
    let scheduler = scheduler(&[("default", 2)]);
    let local: Arc<dyn CommandExecutor> = Arc::new(ProcessCommandExecutor::new());
    let command = |script: &str| vec!["sh".to_string(), "-c".to_string(), script.to_string()];
    let jobs: Vec<Arc<dyn Job>> = vec![
        Arc::new(CommandJob::new("slow-1", command("sleep 0.2"), Arc::clone(&local))),
        Arc::new(CommandJob::new("slow-2", command("sleep 0.2"), Arc::clone(&local))),
        Arc::new(CommandJob::new("quick", command("exit 0"), Arc::clone(&local))),
    ];

    let start = Instant::now();
    let report = scheduler
        .execute(&Arc::new(ExecutionMonitor::new()), &context(), jobs)
        .unwrap();

    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(report.jobs, 3);
    assert_eq!(report.timeline.failed_jobs().len(), 0);

    // Both workers were busy with the sleepers, so the quick job had to wait
    // for one of them to finish.
    let spans = report.timeline.spans();
    let quick = spans.iter().find(|span| span.job == "quick").unwrap();
    let first_slow_end = spans
        .iter()
        .filter(|span| span.job.starts_with("slow-"))
        .map(|span| span.end_ms)
        .min()
        .unwrap();
    assert!(quick.start_ms >= 150, "quick started at {} ms", quick.start_ms);
    assert!(quick.start_ms + 20 >= first_slow_end);
}

#[test]
fn test_local_exit_code_is_reported() {
    let local = ProcessCommandExecutor::new();
    let code = local
        .execute(
            &["sh".to_string(), "-c".to_string(), "exit 7".to_string()],
            &BTreeMap::new(),
        )
        .unwrap();
    assert_eq!(code, 7);
}

#[test]
fn test_environment_reaches_local_process() {
    let scheduler = scheduler(&[("default", 1)]);
    let local: Arc<dyn CommandExecutor> = Arc::new(ProcessCommandExecutor::new());
    let job = CommandJob::new(
        "check-env",
        vec![
            "sh".to_string(),
            "-c".to_string(),
            "test \"$FLOW\" = flow-main".to_string(),
        ],
        local,
    )
    .with_env("FLOW", "{flow_id}-{phase}");

    let context = ExecutionContext::new("batch", "flow", "exec", ExecutionPhase::Main);
    scheduler
        .execute(&Arc::new(ExecutionMonitor::new()), &context, vec![Arc::new(job)])
        .unwrap();
}

#[test]
fn test_cancellation_interrupts_running_jobs() {
    let mut scheduler = scheduler(&[("default", 2)]);
    scheduler.set_cancel_check_interval(Duration::from_millis(10));
    let gauge = Arc::new(Gauge::default());
    let jobs = vec![
        SleepJob::new("long-1", "default", 10_000, 0, &gauge),
        SleepJob::new("long-2", "default", 10_000, 0, &gauge),
    ];

    let monitor = Arc::new(ExecutionMonitor::new());
    let canceller = Arc::clone(&monitor);
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        canceller.cancel();
    });

    let start = Instant::now();
    let failure = scheduler.execute(&monitor, &context(), jobs).unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(5));
    match failure.error {
        PhaseError::JobError { ref source, .. } => assert!(source.is_interrupted()),
        ref other => panic!("unexpected error: {}", other),
    }
    assert_eq!(failure.report.jobs, 2);
}
