// Entry points for the HTTP layer: validated input in, job handles out

use std::sync::Arc;
use talent_common::exam::ExamSubmission;
use talent_common::job::{CodeExecutionPayload, JobKind, JobPayload, JobStatus};
use talent_common::types::Submission;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::ControllerError;
use crate::problems::ProblemStore;
use crate::queue::QueueService;

pub struct CodeExecutionController {
    queue: Arc<QueueService>,
    problems: Arc<dyn ProblemStore>,
}

impl CodeExecutionController {
    pub fn new(queue: Arc<QueueService>, problems: Arc<dyn ProblemStore>) -> Self {
        Self { queue, problems }
    }

    /// Resolve the problem's test cases and queue the submission for grading.
    #[instrument(skip_all, fields(problem_id = %submission.problem_id, language = %submission.language))]
    pub async fn submit(&self, submission: Submission) -> Result<JobStatus, ControllerError> {
        let problem = self
            .problems
            .get_problem(&submission.problem_id)
            .await
            .map_err(|e| ControllerError::ProblemStore(format!("{:#}", e)))?
            .ok_or_else(|| ControllerError::ProblemNotFound(submission.problem_id.clone()))?;

        if !problem.allows(submission.language) {
            return Err(ControllerError::LanguageNotAllowed {
                language: submission.language,
                problem_id: problem.id,
            });
        }

        let payload = JobPayload::CodeExecution(CodeExecutionPayload {
            code: submission.code,
            language: submission.language,
            problem_id: problem.id,
            test_cases: problem.test_cases,
        });
        let status = self.queue.enqueue(payload).await?;
        info!(job_id = %status.id, state = ?status.state, "Code submission accepted");
        Ok(status)
    }

    pub async fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.queue.get_status(job_id, JobKind::CodeExecution).await
    }
}

pub struct ExamController {
    queue: Arc<QueueService>,
}

impl ExamController {
    pub fn new(queue: Arc<QueueService>) -> Self {
        Self { queue }
    }

    #[instrument(skip_all, fields(exam_id = %submission.exam_id, user_id = %submission.user_id))]
    pub async fn submit(&self, submission: ExamSubmission) -> Result<JobStatus, ControllerError> {
        let status = self.queue.enqueue(JobPayload::ExamProcessing(submission)).await?;
        info!(job_id = %status.id, state = ?status.state, "Exam submission accepted");
        Ok(status)
    }

    pub async fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.queue.get_status(job_id, JobKind::ExamProcessing).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CodeExecutor;
    use crate::error::SandboxError;
    use crate::evaluator::TestRunner;
    use crate::problems::InMemoryProblemStore;
    use crate::processors::Processors;
    use crate::queue::{MemoryBroker, MemoryConnector};
    use async_trait::async_trait;
    use talent_common::config::QueueConfig;
    use talent_common::job::{JobOutput, JobState};
    use talent_common::types::{ExecutionResult, Language};

    struct EchoExecutor;

    #[async_trait]
    impl CodeExecutor for EchoExecutor {
        async fn health_check(&self) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn execute(&self, _code: &str, _language: Language, input: &str) -> ExecutionResult {
            ExecutionResult::exited(0, input.to_string(), 3)
        }
    }

    const PROBLEMS: &str = r#"[
        {
            "id": "echo",
            "testCases": [
                {"input": "a", "expectedOutput": "a", "marks": 2},
                {"input": "b", "expectedOutput": "c", "marks": 3}
            ],
            "allowedLanguages": ["python"]
        }
    ]"#;

    fn queue(connector: MemoryConnector) -> Arc<QueueService> {
        let runner = Arc::new(TestRunner::new(Arc::new(EchoExecutor)));
        let config = QueueConfig {
            connect_retries: 0,
            ..QueueConfig::default()
        };
        Arc::new(QueueService::new(Arc::new(connector), Processors::standard(runner), config))
    }

    fn problems() -> Arc<dyn ProblemStore> {
        Arc::new(InMemoryProblemStore::from_json(PROBLEMS).unwrap())
    }

    fn submission(problem_id: &str, language: Language) -> Submission {
        Submission {
            code: "print(input())".to_string(),
            language,
            problem_id: problem_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_unknown_problem() {
        let controller = CodeExecutionController::new(queue(MemoryConnector::refusing()), problems());
        let err = controller.submit(submission("missing", Language::Python)).await.unwrap_err();
        assert!(matches!(err, ControllerError::ProblemNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_language_not_allowed() {
        let controller = CodeExecutionController::new(queue(MemoryConnector::refusing()), problems());
        let err = controller.submit(submission("echo", Language::Java)).await.unwrap_err();
        assert!(matches!(err, ControllerError::LanguageNotAllowed { language: Language::Java, .. }));
    }

    #[tokio::test]
    async fn test_fallback_submission_is_graded_immediately() {
        let service = queue(MemoryConnector::refusing());
        service.connect().await;
        let controller = CodeExecutionController::new(service, problems());

        let status = controller.submit(submission("echo", Language::Python)).await.unwrap();
        assert_eq!(status.state, JobState::Completed);
        match status.result {
            Some(JobOutput::CodeExecution(report)) => {
                assert_eq!(report.summary.passed_count, 1);
                assert_eq!(report.summary.total_test_cases, 2);
                assert_eq!(report.summary.percentage, 50.0);
                assert_eq!(report.summary.total_score, 2.0);
                assert!(!report.summary.passed);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_queued_submission_is_pollable() {
        let broker = Arc::new(MemoryBroker::new());
        let service = queue(MemoryConnector::new(broker));
        service.connect().await;
        let controller = CodeExecutionController::new(service.clone(), problems());

        let status = controller.submit(submission("echo", Language::Python)).await.unwrap();
        assert_eq!(status.state, JobState::Waiting);
        let polled = controller.status(status.id).await.unwrap();
        assert_eq!(polled.id, status.id);

        let exams = ExamController::new(service.clone());
        // a code job is not visible through the exam queue
        assert!(exams.status(status.id).await.is_none());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_exam_submission() {
        let service = queue(MemoryConnector::refusing());
        service.connect().await;
        let controller = ExamController::new(service);

        let submission = ExamSubmission {
            exam_id: "e1".to_string(),
            user_id: "u1".to_string(),
            answers: Vec::new(),
            answer_key: Vec::new(),
            negative_marking: false,
            passing_score: 0.0,
        };
        let status = controller.submit(submission).await.unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert!(matches!(status.result, Some(JobOutput::ExamProcessing(_))));
    }
}
