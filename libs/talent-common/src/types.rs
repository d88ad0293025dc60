use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Runtimes a candidate may submit code in.
///
/// Closed set: anything else is rejected with [`UnsupportedLanguage`] before
/// a sandbox is ever created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Javascript,
    Python,
    Java,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported programming language: {0}")]
pub struct UnsupportedLanguage(pub String);

impl Language {
    pub const ALL: [Language; 3] = [Language::Javascript, Language::Python, Language::Java];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Javascript => "javascript",
            Language::Python => "python",
            Language::Java => "java",
        }
    }
}

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            "python" | "py" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            other => Err(UnsupportedLanguage(other.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate source code for one problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub code: String,
    pub language: Language,
    pub problem_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: String,
    pub expected_output: String,
    #[serde(default = "default_public")]
    pub is_public: bool,
    #[serde(default = "default_marks")]
    pub marks: f64,
}

fn default_public() -> bool {
    true
}

fn default_marks() -> f64 {
    1.0
}

/// Why a sandboxed run did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NonZeroExit,
    Timeout,
    Infrastructure,
}

/// Outcome of exactly one sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    /// Combined stdout and stderr. `None` when the program never ran.
    pub stdout: Option<String>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
    pub failure: Option<FailureKind>,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    pub fn exited(exit_code: i64, output: String, execution_time_ms: u64) -> Self {
        let success = exit_code == 0;
        Self {
            success,
            stdout: Some(output),
            exit_code: Some(exit_code),
            error_message: (!success).then(|| "Execution failed".to_string()),
            failure: (!success).then_some(FailureKind::NonZeroExit),
            execution_time_ms,
        }
    }

    pub fn timed_out(partial_output: String, timeout_ms: u64, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            stdout: Some(partial_output),
            exit_code: None,
            error_message: Some(format!("Execution timed out after {}ms", timeout_ms)),
            failure: Some(FailureKind::Timeout),
            execution_time_ms,
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: None,
            exit_code: None,
            error_message: Some(message.into()),
            failure: Some(FailureKind::Infrastructure),
            execution_time_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    WrongAnswer,
    RuntimeError,
    TimeLimitExceeded,
    InternalError,
}

/// Graded outcome of one test case. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_case_id: String,
    pub passed: bool,
    pub verdict: Verdict,
    pub actual_output: String,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub memory_used_mb: f64,
}

/// Per-test results for one submission plus the raw totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunOutcome {
    pub results: Vec<TestResult>,
    pub total_score: f64,
    pub passed_count: usize,
    pub total_test_cases: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSummary {
    pub total_score: f64,
    pub passed_count: usize,
    pub total_test_cases: usize,
    pub percentage: f64,
    pub passed: bool,
}

impl ScoreSummary {
    /// Derive the summary from a run. An empty test set scores 0% and does
    /// not count as passed.
    pub fn from_outcome(outcome: &TestRunOutcome) -> Self {
        let total = outcome.total_test_cases;
        let passed_count = outcome.passed_count;
        let percentage = if total > 0 {
            100.0 * passed_count as f64 / total as f64
        } else {
            0.0
        };

        Self {
            total_score: outcome.total_score,
            passed_count,
            total_test_cases: total,
            percentage,
            passed: total > 0 && passed_count == total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(passed_count: usize, total: usize, score: f64) -> TestRunOutcome {
        TestRunOutcome {
            results: Vec::new(),
            total_score: score,
            passed_count,
            total_test_cases: total,
        }
    }

    #[test]
    fn test_language_parsing() {
        assert_eq!("python".parse::<Language>(), Ok(Language::Python));
        assert_eq!(" Java ".parse::<Language>(), Ok(Language::Java));
        assert_eq!("js".parse::<Language>(), Ok(Language::Javascript));
        assert_eq!(
            "cobol".parse::<Language>(),
            Err(UnsupportedLanguage("cobol".to_string()))
        );
    }

    #[test]
    fn test_language_serde_is_lowercase() {
        let json = serde_json::to_string(&Language::Javascript).unwrap();
        assert_eq!(json, "\"javascript\"");
        let lang: Language = serde_json::from_str("\"java\"").unwrap();
        assert_eq!(lang, Language::Java);
        assert!(serde_json::from_str::<Language>("\"ruby\"").is_err());
    }

    #[test]
    fn test_exited_result() {
        let ok = ExecutionResult::exited(0, "hi\n".to_string(), 12);
        assert!(ok.success);
        assert_eq!(ok.error_message, None);
        assert_eq!(ok.failure, None);

        let crashed = ExecutionResult::exited(1, "Traceback".to_string(), 12);
        assert!(!crashed.success);
        assert_eq!(crashed.error_message.as_deref(), Some("Execution failed"));
        assert_eq!(crashed.failure, Some(FailureKind::NonZeroExit));
    }

    #[test]
    fn test_infrastructure_result_has_no_output() {
        let result = ExecutionResult::infrastructure("cannot create sandbox");
        assert!(!result.success);
        assert_eq!(result.stdout, None);
        assert_eq!(result.failure, Some(FailureKind::Infrastructure));
    }

    #[test]
    fn test_score_summary_consistency() {
        for total in 1..=6usize {
            for passed in 0..=total {
                let summary = ScoreSummary::from_outcome(&outcome(passed, total, passed as f64));
                let expected = passed as f64 / total as f64 * 100.0;
                assert!((summary.percentage - expected).abs() < 1e-9, "{} vs {}", summary.percentage, expected);
                assert_eq!(summary.passed, passed == total);
            }
        }
    }

    #[test]
    fn test_score_summary_half() {
        let summary = ScoreSummary::from_outcome(&outcome(1, 2, 5.0));
        assert_eq!(summary.percentage, 50.0);
        assert!(!summary.passed);
        assert_eq!(summary.total_score, 5.0);
    }

    #[test]
    fn test_score_summary_empty_set() {
        let summary = ScoreSummary::from_outcome(&outcome(0, 0, 0.0));
        assert_eq!(summary.percentage, 0.0);
        assert!(!summary.passed);
    }

    #[test]
    fn test_test_case_defaults() {
        let tc: TestCase = serde_json::from_str(r#"{"expectedOutput":"hello"}"#).unwrap();
        assert_eq!(tc.input, "");
        assert!(tc.is_public);
        assert_eq!(tc.marks, 1.0);
        assert_eq!(tc.id, None);
    }
}
