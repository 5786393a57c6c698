/// Runner Script Protocol
///
/// Both sandboxes execute submissions through the same embedded Python
/// runner. The runner captures the program's own stdout/stderr in memory
/// and reports them as one JSON line on its real stdout:
///
/// `{"stdout": str, "stderr": str, "timeout": bool, "usage": {"cpu_seconds": f64, "max_rss": u64}}`
///
/// Anything that does not parse as that line is surfaced to the caller as
/// diagnostic stderr rather than dropped.

use pyexec_common::config::SandboxLimits;
use pyexec_common::types::ResourceUsage;
use serde::Deserialize;
use std::time::Duration;

/// Embedded runner source, shipped into containers and fed to `python -c`
pub const RUNNER_SCRIPT: &str = include_str!("../runtime/python_runner.py");

pub const RUNNER_FILE_NAME: &str = "python_runner.py";

/// Slack added to the runner's own wall-clock alarm. The host-side kill
/// fires first; the runner alarm only backs it up.
pub const RUNNER_BACKSTOP: Duration = Duration::from_secs(1);

/// CPU rlimit for a run, in whole seconds. Kept above every wall-clock
/// deadline (host kill and runner alarm) so a busy loop is always reported
/// as a timeout rather than dying of the rlimit first.
pub fn cpu_limit_seconds(timeout: Duration) -> u64 {
    (timeout + RUNNER_BACKSTOP).as_millis().div_ceil(1000) as u64 + 1
}

/// Cap per captured stream
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

pub const TIMEOUT_MARKER: &str = "[Execution timed out]";
pub const UNPARSEABLE_PREFIX: &str = "[runner output could not be parsed]";
const TRUNCATED_MARKER: &str = "\n[output truncated]";

/// Environment handed to the runner for one run
pub fn runner_env(limits: &SandboxLimits, timeout: Duration) -> Vec<(String, String)> {
    let allowed = serde_json::to_string(&limits.allowed_modules).unwrap_or_else(|_| "[]".to_string());
    vec![
        (
            "EXECUTOR_TIMEOUT".to_string(),
            format!("{:.3}", (timeout + RUNNER_BACKSTOP).as_secs_f64()),
        ),
        (
            "EXECUTOR_CPU_LIMIT".to_string(),
            cpu_limit_seconds(timeout).to_string(),
        ),
        ("EXECUTOR_MEM_LIMIT".to_string(), limits.memory_bytes.to_string()),
        ("EXECUTOR_ALLOWED_MODULES".to_string(), allowed),
        ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
    ]
}

#[derive(Debug, Deserialize)]
struct RunnerReport {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    timeout: bool,
    #[serde(default)]
    usage: Option<RunnerUsage>,
}

#[derive(Debug, Deserialize)]
struct RunnerUsage {
    cpu_seconds: Option<f64>,
    max_rss: Option<u64>,
}

/// Interpreted runner output
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRun {
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub usage: Option<ResourceUsage>,
}

/// Interpret raw runner output.
///
/// The report is the last non-empty line of stdout. If it cannot be parsed,
/// the raw stdout becomes stderr behind a diagnostic prefix, followed by
/// whatever the runner itself wrote to stderr.
pub fn parse_runner_output(raw_stdout: &str, raw_stderr: &str) -> ParsedRun {
    let report_line = raw_stdout.lines().rev().find(|line| !line.trim().is_empty());

    match report_line.map(|line| serde_json::from_str::<RunnerReport>(line.trim())) {
        Some(Ok(report)) => {
            let mut stderr = report.stderr;
            if !raw_stderr.is_empty() {
                stderr.push_str(raw_stderr);
            }
            ParsedRun {
                stdout: report.stdout,
                stderr,
                timed_out: report.timeout,
                usage: report.usage.and_then(convert_usage),
            }
        }
        _ => {
            let mut stderr = format!("{} {}", UNPARSEABLE_PREFIX, raw_stdout.trim_end());
            if !raw_stderr.is_empty() {
                stderr.push('\n');
                stderr.push_str(raw_stderr);
            }
            ParsedRun {
                stdout: String::new(),
                stderr,
                timed_out: false,
                usage: None,
            }
        }
    }
}

fn convert_usage(usage: RunnerUsage) -> Option<ResourceUsage> {
    if usage.cpu_seconds.is_none() && usage.max_rss.is_none() {
        return None;
    }
    Some(ResourceUsage {
        cpu_seconds: usage.cpu_seconds,
        // ru_maxrss is kilobytes on Linux
        memory_bytes: usage.max_rss.map(|kb| kb.saturating_mul(1024)),
    })
}

/// Conventional name for the signals a sandboxed process typically dies of
pub fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        15 => "SIGTERM".to_string(),
        24 => "SIGXCPU".to_string(),
        25 => "SIGXFSZ".to_string(),
        other => format!("SIG{}", other),
    }
}

/// Signal implied by a shell-style exit status (128 + n)
pub fn signal_from_exit_code(code: i64) -> Option<String> {
    if (129..=159).contains(&code) {
        Some(signal_name((code - 128) as i32))
    } else {
        None
    }
}

/// Byte sink with a hard cap; excess input is counted and dropped
#[derive(Debug, Default)]
pub struct CappedBuffer {
    bytes: Vec<u8>,
    dropped: usize,
}

impl CappedBuffer {
    pub fn push(&mut self, chunk: &[u8]) {
        let room = MAX_OUTPUT_BYTES.saturating_sub(self.bytes.len());
        let take = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    pub fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.dropped > 0 {
            text.push_str(TRUNCATED_MARKER);
        }
        text
    }
}
