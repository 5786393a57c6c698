/// Local Sandbox - Subprocess Fallback
///
/// Runs the embedded runner under a host Python interpreter when the
/// container daemon is unreachable. Isolation is limited to what the runner
/// applies to itself (rlimits, import allow-list, socket stubs), so this path
/// must be explicitly enabled.

use crate::runtime::{
    parse_runner_output, runner_env, signal_name, CappedBuffer, RUNNER_SCRIPT, TIMEOUT_MARKER,
};
use crate::sandbox::{RunRequest, Sandbox, KILL_GRACE};
use anyhow::{Context, Result};
use async_trait::async_trait;
use pyexec_common::config::SandboxLimits;
use pyexec_common::types::ExecutionOutcome;
use serde_json::json;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SIGKILL: i32 = 9;

pub struct LocalSandbox {
    python_bin: String,
    limits: SandboxLimits,
}

impl LocalSandbox {
    pub fn new(python_bin: impl Into<String>, limits: SandboxLimits) -> Self {
        Self {
            python_bin: python_bin.into(),
            limits,
        }
    }
}

fn spawn_reader<R>(mut reader: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = CappedBuffer::default();
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.push(&chunk[..n]),
            }
        }
        buffer.into_string()
    })
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn run(&self, request: &RunRequest<'_>) -> Result<ExecutionOutcome> {
        let mut child = Command::new(&self.python_bin)
            .arg("-I")
            .arg("-c")
            .arg(RUNNER_SCRIPT)
            .env_clear()
            .envs(runner_env(&self.limits, request.timeout))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.python_bin))?;

        let started = Instant::now();

        let payload = json!({ "source": request.source, "stdin": request.stdin }).to_string();
        if let Some(mut stdin) = child.stdin.take() {
            // A program that exits early closes the pipe; that is not an error
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                debug!(error = %e, "Runner closed stdin early");
            }
            drop(stdin);
        }

        let stdout_task = child.stdout.take().map(spawn_reader);
        let stderr_task = child.stderr.take().map(spawn_reader);

        let (status, killed) =
            match tokio::time::timeout(request.timeout + KILL_GRACE, child.wait()).await {
                Ok(status) => (Some(status.context("Failed to wait for runner process")?), false),
                Err(_) => {
                    warn!(
                        timeout_ms = request.timeout.as_millis() as u64,
                        test_index = request.test_index,
                        "Local execution timed out, killing"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill runner process");
                    }
                    (None, true)
                }
            };
        let duration_ms = started.elapsed().as_millis() as u64;

        let raw_stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let raw_stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if killed {
            return Ok(ExecutionOutcome {
                stdout: String::new(),
                stderr: TIMEOUT_MARKER.to_string(),
                exit_code: Some(128 + SIGKILL as i64),
                timed_out: true,
                signal: Some(signal_name(SIGKILL)),
                duration_ms,
                ..Default::default()
            });
        }

        let parsed = parse_runner_output(&raw_stdout, &raw_stderr);
        let (exit_code, signal) = match status {
            Some(status) => match (status.code(), exit_signal(&status)) {
                (Some(code), _) => (Some(code as i64), None),
                (None, Some(sig)) => (Some(128 + sig as i64), Some(signal_name(sig))),
                (None, None) => (None, None),
            },
            None => (None, None),
        };

        Ok(ExecutionOutcome {
            stdout: if parsed.timed_out { String::new() } else { parsed.stdout },
            stderr: parsed.stderr,
            exit_code,
            timed_out: parsed.timed_out,
            signal,
            duration_ms,
            resource_usage: parsed.usage,
            container_id: None,
            passed: None,
        })
    }
}
