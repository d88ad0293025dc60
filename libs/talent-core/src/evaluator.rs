//! Test-Case Runner - grades one submission against its test cases
//!
//! **Core Responsibility:**
//! Drive the sandbox once per test case, compare outputs, aggregate a score.
//!
//! **Properties:**
//! - Knows nothing about Docker; talks to a [`CodeExecutor`]
//! - Knows nothing about Redis or queues
//! - One failing test case never stops the rest
//! - Result order always matches test-case order
//!
//! **Scoring Rules:**
//! - A test passes iff the program exited 0 AND trimmed output == trimmed expected
//! - total_score = sum of marks of passed tests
//! - percentage = passed_count / total_test_cases * 100
//!
//! **Normalization Rules:**
//! - Trim leading and trailing whitespace: YES
//! - Ignore trailing newline differences: YES (via trim)
//! - Case sensitivity: YES (exact match required)

use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use talent_common::types::{
    ExecutionResult, FailureKind, Language, ScoreSummary, TestCase, TestResult, TestRunOutcome,
    Verdict,
};
use tracing::{debug, info, instrument, warn};

use crate::engine::CodeExecutor;
use crate::error::RunError;

fn normalize_output(output: &str) -> &str {
    output.trim()
}

/// Grade one execution against its test case.
pub fn evaluate_test(index: usize, test_case: &TestCase, execution: &ExecutionResult) -> TestResult {
    let actual = execution.stdout.clone().unwrap_or_default();
    let exited_cleanly = execution.success && execution.exit_code == Some(0);

    let verdict = match execution.failure {
        Some(FailureKind::Timeout) => Verdict::TimeLimitExceeded,
        Some(FailureKind::Infrastructure) => Verdict::InternalError,
        Some(FailureKind::NonZeroExit) => Verdict::RuntimeError,
        None if !exited_cleanly => Verdict::RuntimeError,
        None if normalize_output(&actual) == normalize_output(&test_case.expected_output) => {
            Verdict::Passed
        }
        None => Verdict::WrongAnswer,
    };

    TestResult {
        test_case_id: test_case
            .id
            .clone()
            .unwrap_or_else(|| index.to_string()),
        passed: verdict == Verdict::Passed,
        verdict,
        actual_output: actual,
        error: execution.error_message.clone(),
        execution_time_ms: execution.execution_time_ms,
        // docker does not report peak usage once the container is gone
        memory_used_mb: 0.0,
    }
}

/// Sum up graded results. `results` and `test_cases` are index-aligned.
pub fn aggregate_results(test_cases: &[TestCase], results: Vec<TestResult>) -> TestRunOutcome {
    let mut total_score = 0.0;
    let mut passed_count = 0;
    for (test_case, result) in test_cases.iter().zip(&results) {
        if result.passed {
            total_score += test_case.marks;
            passed_count += 1;
        }
    }

    TestRunOutcome {
        total_test_cases: results.len(),
        results,
        total_score,
        passed_count,
    }
}

pub fn calculate_score(outcome: &TestRunOutcome) -> ScoreSummary {
    ScoreSummary::from_outcome(outcome)
}

pub struct TestRunner {
    executor: Arc<dyn CodeExecutor>,
    parallelism: usize,
}

impl TestRunner {
    pub fn new(executor: Arc<dyn CodeExecutor>) -> Self {
        Self {
            executor,
            parallelism: 1,
        }
    }

    /// Run up to `parallelism` test cases at once. Results keep input order.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Grade `code` against every test case.
    ///
    /// Only an unreachable sandbox subsystem fails the whole run; crashes,
    /// timeouts and wrong answers are recorded per test case.
    #[instrument(skip_all, fields(language = %language, test_count = test_cases.len()))]
    pub async fn run(
        &self,
        code: &str,
        language: Language,
        test_cases: &[TestCase],
    ) -> Result<TestRunOutcome, RunError> {
        if let Err(e) = self.executor.health_check().await {
            warn!(error = %e, "Sandbox unavailable, aborting run");
            return Err(RunError::SandboxUnavailable(e.to_string()));
        }

        let executor = &self.executor;
        let pending: Vec<_> = test_cases
            .iter()
            .enumerate()
            .map(move |(index, test_case)| async move {
                let execution = executor.execute(code, language, &test_case.input).await;
                let result = evaluate_test(index, test_case, &execution);
                debug!(
                    test_num = index + 1,
                    verdict = ?result.verdict,
                    execution_ms = result.execution_time_ms,
                    "Test result"
                );
                result
            })
            .collect();
        let results: Vec<TestResult> = stream::iter(pending)
            .buffered(self.parallelism)
            .collect()
            .await;

        let outcome = aggregate_results(test_cases, results);
        info!(
            passed = outcome.passed_count,
            total = outcome.total_test_cases,
            score = outcome.total_score,
            "Submission graded"
        );
        Ok(outcome)
    }
}
