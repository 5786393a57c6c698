use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Upper bound on test cases accepted for a single job
pub const MAX_TESTS_PER_JOB: usize = 10;

/// Upper bound on submitted source size
pub const MAX_SOURCE_BYTES: usize = 64 * 1024;

/// Accepted range for a per-test timeout override
pub const MIN_TEST_TIMEOUT_MS: u64 = 200;
pub const MAX_TEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
}

impl Language {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "python" => Some(Language::Python),
            _ => None,
        }
    }

    /// File name the submitted source is stored under inside a sandbox
    pub fn source_file_name(&self) -> &'static str {
        match self {
            Language::Python => "main.py",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
        }
    }
}

/// One stdin input plus optional grading and timeout override
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSpec {
    #[serde(default)]
    pub stdin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_stdout: Option<String>,
}

/// A job as handed to the queue, before it has an id or timestamp
#[derive(Debug, Clone)]
pub struct NewJob {
    pub language: Language,
    pub source: String,
    pub tests: Vec<TestSpec>,
    pub trace_id: String,
    pub submitter_id: Option<String>,
}

impl NewJob {
    /// Assign identity. The returned job is immutable from here on.
    pub fn into_job(self) -> Job {
        Job {
            job_id: Uuid::new_v4(),
            language: self.language,
            source: self.source,
            tests: self.tests,
            created_at: Utc::now(),
            trace_id: self.trace_id,
            submitter_id: self.submitter_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: Uuid,
    pub language: Language,
    pub source: String,
    pub tests: Vec<TestSpec>,
    pub created_at: DateTime<Utc>,
    pub trace_id: String,
    pub submitter_id: Option<String>,
}

impl Job {
    /// Milliseconds elapsed since the job was created
    pub fn age_ms(&self) -> u64 {
        (Utc::now() - self.created_at).num_milliseconds().max(0) as u64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

/// Recorded result of running one test case
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub signal: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Present only when the test supplied an expected stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
}

impl ExecutionOutcome {
    /// Metrics bucket for this outcome
    pub fn outcome_class(&self) -> OutcomeClass {
        if self.timed_out {
            OutcomeClass::Timeout
        } else if self.exit_code.map_or(false, |code| code != 0) || !self.stderr.is_empty() {
            OutcomeClass::Error
        } else {
            OutcomeClass::Success
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeClass {
    Success,
    Error,
    Timeout,
}

impl OutcomeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeClass::Success => "success",
            OutcomeClass::Error => "error",
            OutcomeClass::Timeout => "timeout",
        }
    }
}

/// Per-job result published by a worker. `results[i]` belongs to `tests[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub job_id: Uuid,
    pub ok: bool,
    pub results: Vec<ExecutionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub trace_id: String,
    pub submitter_id: Option<String>,
}

impl ResultPayload {
    pub fn completed(job: &Job, results: Vec<ExecutionOutcome>) -> Self {
        Self {
            job_id: job.job_id,
            ok: true,
            results,
            error: None,
            trace_id: job.trace_id.clone(),
            submitter_id: job.submitter_id.clone(),
        }
    }

    pub fn failed(job: &Job, error: impl Into<String>) -> Self {
        Self {
            job_id: job.job_id,
            ok: false,
            results: Vec::new(),
            error: Some(error.into()),
            trace_id: job.trace_id.clone(),
            submitter_id: job.submitter_id.clone(),
        }
    }
}
