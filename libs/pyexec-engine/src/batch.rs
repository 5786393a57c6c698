/// Batch Runner - Sequential Test Execution
///
/// **Core Responsibility:**
/// Drive every test case of one job through a sandbox, in submission order,
/// and grade each outcome.
///
/// **Invariants:**
/// - Tests run one at a time. Parallelism inside a batch is deliberately
///   excluded: all tests share the same host limits, and running them side by
///   side would change what those limits mean.
/// - `results[i]` belongs to `tests[i]`; zero tests yields exactly one
///   implicit run with empty stdin.
/// - The sandbox is chosen once per batch, not per test.
/// - A timed-out outcome never carries stdout.

use crate::evaluator;
use crate::sandbox::{RunRequest, Sandbox};
use pyexec_common::types::{ExecutionOutcome, TestSpec};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Lower bound on the per-test wall clock, whatever the request asks for
pub const MIN_EFFECTIVE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("sandbox runtime unavailable and local fallback disabled")]
    SandboxUnavailable,

    #[error("{backend} sandbox failed on test {test_index}: {source:#}")]
    Sandbox {
        backend: &'static str,
        test_index: usize,
        #[source]
        source: anyhow::Error,
    },
}

pub struct BatchRunner {
    primary: Arc<dyn Sandbox>,
    fallback: Option<Arc<dyn Sandbox>>,
    default_timeout: Duration,
}

impl BatchRunner {
    pub fn new(
        primary: Arc<dyn Sandbox>,
        fallback: Option<Arc<dyn Sandbox>>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            default_timeout,
        }
    }

    /// Readiness: whichever sandbox the next batch would use, if any
    pub async fn ping(&self) -> Option<&'static str> {
        if self.primary.ping().await {
            return Some(self.primary.name());
        }
        self.fallback.as_ref().map(|fallback| fallback.name())
    }

    async fn select_sandbox(&self) -> Result<&Arc<dyn Sandbox>, BatchError> {
        if self.primary.ping().await {
            return Ok(&self.primary);
        }
        match &self.fallback {
            Some(fallback) => {
                warn!(
                    primary = self.primary.name(),
                    fallback = fallback.name(),
                    "Primary sandbox unreachable, using fallback"
                );
                Ok(fallback)
            }
            None => Err(BatchError::SandboxUnavailable),
        }
    }

    fn effective_timeout(&self, test: &TestSpec) -> Duration {
        test.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
            .max(MIN_EFFECTIVE_TIMEOUT)
    }

    /// Run all tests for `source`, returning one graded outcome per test
    pub async fn run(
        &self,
        source: &str,
        tests: &[TestSpec],
    ) -> Result<Vec<ExecutionOutcome>, BatchError> {
        let sandbox = self.select_sandbox().await?;

        let tests: Cow<'_, [TestSpec]> = if tests.is_empty() {
            Cow::Owned(vec![TestSpec::default()])
        } else {
            Cow::Borrowed(tests)
        };

        let mut outcomes = Vec::with_capacity(tests.len());
        for (test_index, test) in tests.iter().enumerate() {
            let request = RunRequest {
                source,
                stdin: &test.stdin,
                timeout: self.effective_timeout(test),
                test_index,
            };

            let mut outcome = sandbox
                .run(&request)
                .await
                .map_err(|e| BatchError::Sandbox {
                    backend: sandbox.name(),
                    test_index,
                    source: e,
                })?;

            if outcome.timed_out {
                outcome.stdout.clear();
            }
            evaluator::evaluate(&mut outcome, test);

            info!(
                backend = sandbox.name(),
                test_index,
                duration_ms = outcome.duration_ms,
                exit_code = ?outcome.exit_code,
                timed_out = outcome.timed_out,
                passed = ?outcome.passed,
                container_id = outcome.container_id.as_deref().unwrap_or("-"),
                "container_execution_finished"
            );
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }
}
