/// Output Evaluator - Exact-Match Grading
///
/// **Core Responsibility:**
/// Decide whether one outcome's stdout matches the expected stdout of its test.
///
/// **Critical Properties:**
/// - Knows nothing about Docker or subprocesses
/// - Pure function: (actual stdout, expected stdout) → passed
/// - Ungraded tests stay ungraded: no expectation means `None`, never `false`
///
/// **Normalization Rules:**
/// - Trim leading whitespace: YES
/// - Trim trailing whitespace: YES
/// - Internal whitespace: preserved
/// - Case sensitivity: YES (exact match required)
/// - Partial credit: NO

use pyexec_common::types::{ExecutionOutcome, TestSpec};

/// Normalize output string for comparison
fn normalize_output(output: &str) -> &str {
    output.trim()
}

/// Grade actual stdout against an optional expectation
pub fn grade(actual_stdout: &str, expected_stdout: Option<&str>) -> Option<bool> {
    expected_stdout.map(|expected| normalize_output(actual_stdout) == normalize_output(expected))
}

/// Fill in `passed` on an outcome from its test spec
pub fn evaluate(outcome: &mut ExecutionOutcome, test: &TestSpec) {
    outcome.passed = grade(&outcome.stdout, test.expected_stdout.as_deref());
}
