// CLI commands for running submissions outside the service
use anyhow::{bail, Context, Result};
use pyexec_common::config::ExecutorConfig;
use pyexec_common::screening::{check_imports, find_blacklisted_tokens};
use pyexec_common::types::{TestSpec, MAX_TESTS_PER_JOB};
use pyexec_engine::{BatchRunner, DockerSandbox, LocalSandbox, Sandbox};
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn read_source(path: &Path) -> Result<String> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if source.trim().is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(source)
}

/// Pair stdin values with expected outputs; an empty stdin list means one bare run
fn build_tests(stdin: Vec<String>, expect: Vec<String>, timeout_ms: Option<u64>) -> Result<Vec<TestSpec>> {
    if expect.len() > stdin.len().max(1) {
        bail!("Got {} --expect values for {} test cases", expect.len(), stdin.len().max(1));
    }

    let stdin = if stdin.is_empty() { vec![String::new()] } else { stdin };
    if stdin.len() > MAX_TESTS_PER_JOB {
        bail!("At most {} test cases are allowed", MAX_TESTS_PER_JOB);
    }

    let mut expect = expect.into_iter();
    Ok(stdin
        .into_iter()
        .map(|stdin| TestSpec {
            stdin: unescape(&stdin),
            timeout_ms,
            expected_stdout: expect.next().map(|e| unescape(&e)),
        })
        .collect())
}

/// Shell-friendly `\n` and `\t` escapes
fn unescape(value: &str) -> String {
    value.replace("\\n", "\n").replace("\\t", "\t")
}

fn build_runner(config: &ExecutorConfig, local: bool) -> Result<BatchRunner> {
    let local_sandbox: Arc<dyn Sandbox> =
        Arc::new(LocalSandbox::new(config.python_bin.clone(), config.limits.clone()));
    if local {
        return Ok(BatchRunner::new(local_sandbox, None, config.limits.default_timeout));
    }

    let docker = DockerSandbox::connect(&config.docker_socket_path, config.limits.clone())
        .context("Failed to connect to Docker (use --local to skip it)")?;
    let fallback = config.enable_local_fallback.then_some(local_sandbox);
    Ok(BatchRunner::new(Arc::new(docker), fallback, config.limits.default_timeout))
}

/// Run a file through the batch runner and print outcomes as JSON.
/// Returns false when any graded test failed or timed out.
pub async fn run_file(
    path: &Path,
    stdin: Vec<String>,
    expect: Vec<String>,
    timeout_ms: Option<u64>,
    local: bool,
) -> Result<bool> {
    let source = read_source(path)?;
    let tests = build_tests(stdin, expect, timeout_ms)?;

    let config = ExecutorConfig::from_env().context("Invalid executor configuration")?;
    let runner = build_runner(&config, local)?;

    let outcomes = runner.run(&source, &tests).await?;
    println!("{}", serde_json::to_string_pretty(&outcomes)?);

    Ok(outcomes
        .iter()
        .all(|outcome| !outcome.timed_out && outcome.passed != Some(false)))
}

/// Report blacklisted tokens and disallowed imports. Returns true when clean.
pub fn scan_file(path: &Path) -> Result<bool> {
    let source = read_source(path)?;
    let config = ExecutorConfig::from_env().context("Invalid executor configuration")?;

    let tokens = find_blacklisted_tokens(&source);
    let issues = check_imports(&source, &config.limits.allowed_modules);

    for token in &tokens {
        println!("forbidden token: {}", token);
    }
    for issue in &issues {
        println!("{}", issue);
    }

    let clean = tokens.is_empty() && issues.is_empty();
    if clean {
        println!("{}: no issues", path.display());
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_build_tests_pairs_positionally() {
        let tests = build_tests(
            vec!["2\\n".to_string(), "5".to_string()],
            vec!["4\\n".to_string()],
            Some(800),
        )
        .unwrap();
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].stdin, "2\n");
        assert_eq!(tests[0].expected_stdout.as_deref(), Some("4\n"));
        assert_eq!(tests[1].expected_stdout, None);
        assert!(tests.iter().all(|t| t.timeout_ms == Some(800)));
    }

    #[test]
    fn test_build_tests_bare_run() {
        let tests = build_tests(vec![], vec!["hi".to_string()], None).unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].stdin, "");
        assert_eq!(tests[0].expected_stdout.as_deref(), Some("hi"));
    }

    #[test]
    fn test_build_tests_rejects_extra_expectations() {
        assert!(build_tests(vec!["1".to_string()], vec!["a".to_string(), "b".to_string()], None).is_err());
        assert!(build_tests(vec!["1".to_string(); MAX_TESTS_PER_JOB + 1], vec![], None).is_err());
    }

    #[test]
    fn test_scan_file() {
        let mut clean = tempfile::NamedTempFile::new().unwrap();
        writeln!(clean, "import math\nprint(math.sqrt(4))").unwrap();
        assert!(scan_file(clean.path()).unwrap());

        let mut dirty = tempfile::NamedTempFile::new().unwrap();
        writeln!(dirty, "import os\nos.fork()").unwrap();
        assert!(!scan_file(dirty.path()).unwrap());
    }

    #[test]
    fn test_empty_file_rejected() {
        let empty = tempfile::NamedTempFile::new().unwrap();
        assert!(read_source(empty.path()).is_err());
    }
}
