use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::exam::{ExamReport, ExamSubmission};
use crate::types::{Language, ScoreSummary, TestCase, TestRunOutcome};

/// The two named queues. Doubles as the job kind, one queue per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    CodeExecution,
    ExamProcessing,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::CodeExecution, JobKind::ExamProcessing];

    pub fn queue_name(&self) -> &'static str {
        match self {
            JobKind::CodeExecution => "code-execution",
            JobKind::ExamProcessing => "exam-processing",
        }
    }

    pub fn from_queue_name(name: &str) -> Option<Self> {
        match name {
            "code-execution" => Some(JobKind::CodeExecution),
            "exam-processing" => Some(JobKind::ExamProcessing),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeExecutionPayload {
    pub code: String,
    pub language: Language,
    pub problem_id: String,
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum JobPayload {
    CodeExecution(CodeExecutionPayload),
    ExamProcessing(ExamSubmission),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::CodeExecution(_) => JobKind::CodeExecution,
            JobPayload::ExamProcessing(_) => JobKind::ExamProcessing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeExecutionReport {
    #[serde(flatten)]
    pub outcome: TestRunOutcome,
    pub summary: ScoreSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum JobOutput {
    CodeExecution(CodeExecutionReport),
    ExamProcessing(ExamReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    pub delay_ms: u64,
}

impl Backoff {
    pub fn exponential(delay_ms: u64) -> Self {
        Self { delay_ms }
    }

    /// Delay before the retry that follows a failure, given how many attempts
    /// had been made before that failure: `delay * 2^attempts_made`.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempts_made);
        Duration::from_millis(self.delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::exponential(1000),
            remove_on_complete: true,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("job {job_id}: illegal transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub job_id: Uuid,
    pub from: JobState,
    pub to: JobState,
}

/// What happens to a job after its processor failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retry { delay: Duration },
    Exhausted,
}

/// A unit of queued work. Only the queue service moves it between states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub progress: u8,
    pub result: Option<JobOutput>,
    pub failed_reason: Option<String>,
    pub options: JobOptions,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(payload: JobPayload, options: JobOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: payload.kind(),
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: options.attempts.max(1),
            progress: 0,
            result: None,
            failed_reason: None,
            options,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, to: JobState) -> Result<(), TransitionError> {
        let allowed = matches!(
            (self.state, to),
            (JobState::Waiting, JobState::Active)
                | (JobState::Active, JobState::Completed)
                | (JobState::Active, JobState::Failed)
                | (JobState::Active, JobState::Waiting)
        );
        if !allowed {
            return Err(TransitionError {
                job_id: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// waiting -> active
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Active)?;
        self.processed_at = Some(Utc::now());
        Ok(())
    }

    /// active -> waiting for a job whose worker vanished mid-run. The lost
    /// run does not count against the retry budget.
    pub fn recover_stalled(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Waiting)?;
        self.processed_at = None;
        Ok(())
    }

    /// active -> completed
    pub fn complete(&mut self, output: JobOutput) -> Result<(), TransitionError> {
        self.transition(JobState::Completed)?;
        self.progress = 100;
        self.result = Some(output);
        self.failed_reason = None;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Count a failed attempt. Goes back to waiting while the retry budget
    /// lasts, otherwise fails terminally.
    pub fn record_failure(
        &mut self,
        reason: impl Into<String>,
    ) -> Result<FailureDisposition, TransitionError> {
        let attempts_before = self.attempts_made;
        let next = if attempts_before + 1 >= self.max_attempts {
            JobState::Failed
        } else {
            JobState::Waiting
        };
        self.transition(next)?;
        self.attempts_made = (attempts_before + 1).min(self.max_attempts);
        self.failed_reason = Some(reason.into());

        if next == JobState::Failed {
            self.finished_at = Some(Utc::now());
            Ok(FailureDisposition::Exhausted)
        } else {
            Ok(FailureDisposition::Retry {
                delay: self.options.backoff.delay_for(attempts_before),
            })
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            queue: self.kind,
            state: self.state,
            progress: self.progress,
            result: self.result.clone(),
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
            failed_reason: self.failed_reason.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// Point-in-time view of a job, as reported to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: Uuid,
    pub queue: JobKind,
    pub state: JobState,
    pub progress: u8,
    pub result: Option<JobOutput>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exam::ExamSubmission;

    fn exam_payload() -> JobPayload {
        JobPayload::ExamProcessing(ExamSubmission {
            exam_id: "exam-1".to_string(),
            user_id: "user-1".to_string(),
            answers: Vec::new(),
            answer_key: Vec::new(),
            negative_marking: false,
            passing_score: 0.0,
        })
    }

    fn exam_output() -> JobOutput {
        JobOutput::ExamProcessing(ExamReport {
            exam_id: "exam-1".to_string(),
            user_id: "user-1".to_string(),
            answers: Vec::new(),
            total_score: 0.0,
            passed: true,
        })
    }

    #[test]
    fn test_queue_names() {
        assert_eq!(JobKind::CodeExecution.queue_name(), "code-execution");
        assert_eq!(JobKind::ExamProcessing.queue_name(), "exam-processing");
        assert_eq!(
            JobKind::from_queue_name("exam-processing"),
            Some(JobKind::ExamProcessing)
        );
        assert_eq!(JobKind::from_queue_name("mail"), None);
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::exponential(1000);
        assert_eq!(backoff.delay_for(0), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(4000));
        // saturates instead of overflowing
        assert_eq!(backoff.delay_for(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = Job::new(exam_payload(), JobOptions::default());
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.kind, JobKind::ExamProcessing);

        job.start().unwrap();
        assert_eq!(job.state, JobState::Active);
        assert!(job.processed_at.is_some());

        job.complete(exam_output()).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.result.is_some());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let mut job = Job::new(exam_payload(), JobOptions::default());
        job.start().unwrap();
        job.complete(exam_output()).unwrap();

        assert!(job.start().is_err());
        assert!(job.record_failure("late").is_err());
        assert!(job.complete(exam_output()).is_err());
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn test_recover_stalled_keeps_retry_budget() {
        let mut job = Job::new(exam_payload(), JobOptions::default());
        job.start().unwrap();
        job.recover_stalled().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert!(job.processed_at.is_none());

        // only an active job can be recovered
        assert!(job.recover_stalled().is_err());
        job.start().unwrap();
        job.complete(exam_output()).unwrap();
        assert!(job.recover_stalled().is_err());
    }

    #[test]
    fn test_cannot_complete_waiting_job() {
        let mut job = Job::new(exam_payload(), JobOptions::default());
        let err = job.complete(exam_output()).unwrap_err();
        assert_eq!(err.from, JobState::Waiting);
        assert_eq!(err.to, JobState::Completed);
    }

    #[test]
    fn test_retry_budget() {
        let mut job = Job::new(exam_payload(), JobOptions::default());

        job.start().unwrap();
        assert_eq!(
            job.record_failure("boom").unwrap(),
            FailureDisposition::Retry { delay: Duration::from_millis(1000) }
        );
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 1);

        job.start().unwrap();
        assert_eq!(
            job.record_failure("boom").unwrap(),
            FailureDisposition::Retry { delay: Duration::from_millis(2000) }
        );

        job.start().unwrap();
        assert_eq!(job.record_failure("boom").unwrap(), FailureDisposition::Exhausted);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, job.max_attempts);
        assert_eq!(job.failed_reason.as_deref(), Some("boom"));
        assert!(job.start().is_err());
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let options = JobOptions {
            attempts: 0,
            ..JobOptions::default()
        };
        let mut job = Job::new(exam_payload(), options);
        assert_eq!(job.max_attempts, 1);
        job.start().unwrap();
        assert_eq!(job.record_failure("x").unwrap(), FailureDisposition::Exhausted);
        assert_eq!(job.attempts_made, 1);
    }

    #[test]
    fn test_job_json_shape() {
        let job = Job::new(exam_payload(), JobOptions::default());
        let value = serde_json::to_value(job.status()).unwrap();
        assert_eq!(value["state"], "waiting");
        assert_eq!(value["queue"], "exam-processing");
        assert_eq!(value["attemptsMade"], 0);

        let raw = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, job);
    }
}
