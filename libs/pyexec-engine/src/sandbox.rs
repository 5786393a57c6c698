use async_trait::async_trait;
use pyexec_common::types::ExecutionOutcome;
use std::time::Duration;

/// Extra wall-clock time granted past the requested timeout before the
/// host-side timer force-kills the sandboxed process
pub const KILL_GRACE: Duration = Duration::from_millis(250);

/// One test case to run
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub source: &'a str,
    pub stdin: &'a str,
    pub timeout: Duration,
    /// Position within the batch, for logging only
    pub test_index: usize,
}

/// An isolated place to run submitted code.
///
/// Implementations return `Ok` for every run that produced an outcome,
/// including crashes and timeouts. `Err` is reserved for infrastructure
/// failures (daemon gone, process could not be spawned) and fails the batch.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Short name for logs and readiness output
    fn name(&self) -> &'static str;

    /// Liveness probe; called once per batch
    async fn ping(&self) -> bool;

    async fn run(&self, request: &RunRequest<'_>) -> anyhow::Result<ExecutionOutcome>;
}
