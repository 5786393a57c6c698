// Prometheus metrics, one process-wide registry

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use pyexec_common::types::ExecutionOutcome;

const DURATION_BUCKETS_MS: &[f64] = &[50.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2000.0, 5000.0];
const QUEUE_WAIT_BUCKETS_MS: &[f64] = &[10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref EXECUTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("executor_execution_total", "Total number of executed test cases"),
        &["outcome"]
    )
    .expect("valid metric definition");

    pub static ref EXECUTION_DURATION_MS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "executor_execution_duration_ms",
            "Execution duration per test case in milliseconds"
        )
        .buckets(DURATION_BUCKETS_MS.to_vec())
    )
    .expect("valid metric definition");

    pub static ref QUEUE_WAIT_MS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "executor_queue_wait_ms",
            "Time from enqueue until a worker picked the job up, in milliseconds"
        )
        .buckets(QUEUE_WAIT_BUCKETS_MS.to_vec())
    )
    .expect("valid metric definition");

    pub static ref JOBS_IN_FLIGHT: IntGauge = IntGauge::new(
        "executor_jobs_in_flight",
        "Jobs currently being executed by the worker pool"
    )
    .expect("valid metric definition");

    pub static ref ADMISSION_REJECTED: IntCounterVec = IntCounterVec::new(
        Opts::new("executor_admission_rejected_total", "Submissions rejected before queuing"),
        &["reason"]
    )
    .expect("valid metric definition");

    pub static ref QUEUE_TIMEOUTS: IntCounter = IntCounter::new(
        "executor_queue_timeouts_total",
        "Submissions whose result did not arrive within the result wait"
    )
    .expect("valid metric definition");
}

/// Register every collector with the registry. Call once at startup.
pub fn register() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(EXECUTIONS.clone()))?;
    REGISTRY.register(Box::new(EXECUTION_DURATION_MS.clone()))?;
    REGISTRY.register(Box::new(QUEUE_WAIT_MS.clone()))?;
    REGISTRY.register(Box::new(JOBS_IN_FLIGHT.clone()))?;
    REGISTRY.register(Box::new(ADMISSION_REJECTED.clone()))?;
    REGISTRY.register(Box::new(QUEUE_TIMEOUTS.clone()))?;

    #[cfg(target_os = "linux")]
    REGISTRY.register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))?;

    Ok(())
}

/// Count and time every outcome of a completed batch
pub fn record_outcomes(outcomes: &[ExecutionOutcome]) {
    for outcome in outcomes {
        EXECUTIONS
            .with_label_values(&[outcome.outcome_class().as_str()])
            .inc();
        EXECUTION_DURATION_MS.observe(outcome.duration_ms as f64);
    }
}

/// Text exposition of the registry
pub fn gather() -> prometheus::Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}
