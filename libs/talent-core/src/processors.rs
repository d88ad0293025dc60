// Job processors: the work behind each queue

use async_trait::async_trait;
use std::sync::Arc;
use talent_common::job::{CodeExecutionReport, JobKind, JobOutput, JobPayload};
use tracing::instrument;

use crate::error::ProcessError;
use crate::evaluator::{calculate_score, TestRunner};
use crate::exam::grade_aptitude;

/// Work performed for one job payload. Used both by queue workers and by the
/// in-process fallback path.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, payload: &JobPayload) -> Result<JobOutput, ProcessError>;
}

pub struct CodeExecutionProcessor {
    runner: Arc<TestRunner>,
}

impl CodeExecutionProcessor {
    pub fn new(runner: Arc<TestRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl JobProcessor for CodeExecutionProcessor {
    #[instrument(skip_all)]
    async fn process(&self, payload: &JobPayload) -> Result<JobOutput, ProcessError> {
        let JobPayload::CodeExecution(job) = payload else {
            return Err(ProcessError::WrongQueue(JobKind::CodeExecution));
        };
        let outcome = self.runner.run(&job.code, job.language, &job.test_cases).await?;
        let summary = calculate_score(&outcome);
        Ok(JobOutput::CodeExecution(CodeExecutionReport { outcome, summary }))
    }
}

pub struct ExamProcessor;

#[async_trait]
impl JobProcessor for ExamProcessor {
    async fn process(&self, payload: &JobPayload) -> Result<JobOutput, ProcessError> {
        let JobPayload::ExamProcessing(submission) = payload else {
            return Err(ProcessError::WrongQueue(JobKind::ExamProcessing));
        };
        grade_aptitude(submission).map(JobOutput::ExamProcessing)
    }
}

/// One processor per queue.
#[derive(Clone)]
pub struct Processors {
    pub code_execution: Arc<dyn JobProcessor>,
    pub exam_processing: Arc<dyn JobProcessor>,
}

impl Processors {
    pub fn new(code_execution: Arc<dyn JobProcessor>, exam_processing: Arc<dyn JobProcessor>) -> Self {
        Self {
            code_execution,
            exam_processing,
        }
    }

    pub fn standard(runner: Arc<TestRunner>) -> Self {
        Self::new(
            Arc::new(CodeExecutionProcessor::new(runner)),
            Arc::new(ExamProcessor),
        )
    }

    pub fn for_queue(&self, queue: JobKind) -> &Arc<dyn JobProcessor> {
        match queue {
            JobKind::CodeExecution => &self.code_execution,
            JobKind::ExamProcessing => &self.exam_processing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talent_common::exam::ExamSubmission;

    #[tokio::test]
    async fn test_exam_processor_rejects_code_payload() {
        let payload = JobPayload::CodeExecution(talent_common::job::CodeExecutionPayload {
            code: String::new(),
            language: talent_common::types::Language::Python,
            problem_id: "p1".to_string(),
            test_cases: Vec::new(),
        });
        let err = ExamProcessor.process(&payload).await.unwrap_err();
        assert!(matches!(err, ProcessError::WrongQueue(JobKind::ExamProcessing)));
    }

    #[tokio::test]
    async fn test_exam_processor_grades() {
        let payload = JobPayload::ExamProcessing(ExamSubmission {
            exam_id: "e1".to_string(),
            user_id: "u1".to_string(),
            answers: Vec::new(),
            answer_key: Vec::new(),
            negative_marking: false,
            passing_score: 0.0,
        });
        let output = ExamProcessor.process(&payload).await.unwrap();
        match output {
            JobOutput::ExamProcessing(report) => assert!(report.passed),
            other => panic!("unexpected output {:?}", other),
        }
    }
}
