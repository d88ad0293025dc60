/// Queue service scenarios against the in-memory broker:
/// retry bound, fallback transparency, refused connections at startup,
/// redelivery after lost workers, rate limiting and shutdown.

#[cfg(test)]
mod service_tests {
    use crate::engine::CodeExecutor;
    use crate::error::{ProcessError, QueueError, SandboxError};
    use crate::evaluator::TestRunner;
    use crate::processors::{ExamProcessor, JobProcessor, Processors};
    use crate::queue::{Broker, ConnectionState, MemoryBroker, MemoryConnector, QueueService};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use talent_common::config::{QueueConfig, QueueLimits};
    use talent_common::exam::{ExamReport, ExamSubmission};
    use talent_common::job::{
        Backoff, CodeExecutionPayload, JobKind, JobOptions, JobOutput, JobPayload, JobState,
        JobStatus,
    };
    use talent_common::types::{ExecutionResult, Language, TestCase};

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyProcessor {
        calls: AtomicU32,
        failures: u32,
    }

    impl FlakyProcessor {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobProcessor for FlakyProcessor {
        async fn process(&self, payload: &JobPayload) -> Result<JobOutput, ProcessError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(ProcessError::InvalidPayload(format!("boom #{}", call)));
            }
            match payload {
                JobPayload::ExamProcessing(sub) => Ok(JobOutput::ExamProcessing(ExamReport {
                    exam_id: sub.exam_id.clone(),
                    user_id: sub.user_id.clone(),
                    answers: Vec::new(),
                    total_score: 0.0,
                    passed: true,
                })),
                JobPayload::CodeExecution(_) => Err(ProcessError::WrongQueue(JobKind::ExamProcessing)),
            }
        }
    }

    /// Succeeds, but knocks the broker out while doing so, as if Redis
    /// dropped right after the work was done.
    struct OutageProcessor {
        broker: Arc<MemoryBroker>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobProcessor for OutageProcessor {
        async fn process(&self, payload: &JobPayload) -> Result<JobOutput, ProcessError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.broker.set_reachable(false);
            }
            ExamProcessor.process(payload).await
        }
    }

    /// Prints "hello" for every input.
    struct HelloExecutor;

    #[async_trait]
    impl CodeExecutor for HelloExecutor {
        async fn health_check(&self) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn execute(&self, _code: &str, _language: Language, _input: &str) -> ExecutionResult {
            ExecutionResult::exited(0, "hello\n".to_string(), 7)
        }
    }

    fn test_config() -> QueueConfig {
        let fast = QueueLimits {
            max_per_window: 100,
            window_ms: 1000,
            concurrency: 1,
        };
        QueueConfig {
            code_execution: fast,
            exam_processing: fast,
            job_options: JobOptions {
                attempts: 3,
                backoff: Backoff::exponential(10),
                remove_on_complete: true,
            },
            completed_retention_secs: 60,
            connect_retries: 0,
            poll_interval_ms: 20,
            lease_ms: 200,
        }
    }

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

    fn code_payload() -> JobPayload {
        JobPayload::CodeExecution(CodeExecutionPayload {
            code: "print(\"hello\")".to_string(),
            language: Language::Python,
            problem_id: "p1".to_string(),
            test_cases: vec![TestCase {
                id: None,
                input: String::new(),
                expected_output: "hello".to_string(),
                is_public: true,
                marks: 10.0,
            }],
        })
    }

    fn standard_processors() -> Processors {
        Processors::standard(Arc::new(TestRunner::new(Arc::new(HelloExecutor))))
    }

    fn exam_processors(processor: Arc<FlakyProcessor>) -> Processors {
        let code: Arc<dyn JobProcessor> = standard_processors().code_execution;
        Processors::new(code, processor)
    }

    async fn connected_service(processors: Processors, config: QueueConfig) -> (Arc<QueueService>, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new());
        let connector = Arc::new(MemoryConnector::new(broker.clone()));
        let service = Arc::new(QueueService::new(connector, processors, config));
        assert_eq!(service.connect().await, ConnectionState::Connected);
        (service, broker)
    }

    async fn wait_for_terminal(service: &QueueService, status: &JobStatus) -> JobStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(current) = service.get_status(status.id, status.queue).await {
                if current.state.is_terminal() {
                    return current;
                }
            }
            assert!(Instant::now() < deadline, "job {} never finished", status.id);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_enqueue_returns_waiting_handle() {
        let (service, broker) = connected_service(standard_processors(), test_config()).await;

        let status = service.enqueue(exam_payload()).await.unwrap();
        assert_eq!(status.state, JobState::Waiting);
        assert_eq!(status.queue, JobKind::ExamProcessing);
        assert!(status.result.is_none());
        assert_eq!(broker.waiting_len(JobKind::ExamProcessing).await, 1);

        let polled = service.get_status(status.id, status.queue).await.unwrap();
        assert_eq!(polled.state, JobState::Waiting);
        // wrong queue name is a miss
        assert!(service.get_status(status.id, JobKind::CodeExecution).await.is_none());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_completes_job() {
        let (service, _broker) = connected_service(standard_processors(), test_config()).await;
        service.start_workers().await;

        let status = service.enqueue(code_payload()).await.unwrap();
        let done = wait_for_terminal(&service, &status).await;
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.attempts_made, 0);
        match done.result {
            Some(JobOutput::CodeExecution(report)) => {
                assert_eq!(report.summary.passed_count, 1);
                assert_eq!(report.summary.total_score, 10.0);
                assert!(report.summary.passed);
            }
            other => panic!("unexpected result {:?}", other),
        }
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let processor = FlakyProcessor::new(1);
        let (service, _broker) = connected_service(exam_processors(processor.clone()), test_config()).await;
        service.start_workers().await;

        let status = service.enqueue(exam_payload()).await.unwrap();
        let done = wait_for_terminal(&service, &status).await;
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempts_made, 1);
        assert_eq!(processor.calls(), 2);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_always_failing_job_attempted_exactly_max_attempts() {
        let processor = FlakyProcessor::new(u32::MAX);
        let (service, broker) = connected_service(exam_processors(processor.clone()), test_config()).await;
        service.start_workers().await;

        let status = service.enqueue(exam_payload()).await.unwrap();
        let done = wait_for_terminal(&service, &status).await;
        assert_eq!(done.state, JobState::Failed);
        assert_eq!(done.attempts_made, 3);
        assert_eq!(done.max_attempts, 3);
        assert_eq!(done.failed_reason.as_deref(), Some("invalid payload: boom #3"));
        assert_eq!(processor.calls(), 3);

        // never picked up again
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(processor.calls(), 3);
        assert_eq!(broker.delayed_len(JobKind::ExamProcessing).await, 0);
        assert_eq!(broker.waiting_len(JobKind::ExamProcessing).await, 0);
        assert_eq!(broker.active_len(JobKind::ExamProcessing).await, 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_job_finished_during_outage_is_redelivered() {
        let broker = Arc::new(MemoryBroker::new());
        let processor = Arc::new(OutageProcessor {
            broker: broker.clone(),
            calls: AtomicU32::new(0),
        });
        let processors = Processors::new(standard_processors().code_execution, processor.clone());
        let service = Arc::new(QueueService::new(
            Arc::new(MemoryConnector::new(broker.clone())),
            processors,
            test_config(),
        ));
        assert_eq!(service.connect().await, ConnectionState::Connected);
        let status = service.enqueue(exam_payload()).await.unwrap();
        service.start_workers().await;

        // the result could not be written, so the worker drops to fallback
        let deadline = Instant::now() + Duration::from_secs(5);
        while processor.calls.load(Ordering::SeqCst) == 0 || service.state() != ConnectionState::Disconnected {
            assert!(Instant::now() < deadline, "worker never lost the broker");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.active_len(JobKind::ExamProcessing).await, 1);

        broker.set_reachable(true);
        assert_eq!(service.connect().await, ConnectionState::Connected);
        let done = wait_for_terminal(&service, &status).await;
        assert_eq!(done.state, JobState::Completed);
        // the lost run does not use up an attempt
        assert_eq!(done.attempts_made, 0);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(broker.active_len(JobKind::ExamProcessing).await, 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_job_held_by_dead_worker_is_redelivered() {
        let (service, broker) = connected_service(standard_processors(), test_config()).await;
        let status = service.enqueue(exam_payload()).await.unwrap();

        // taken by a worker that never comes back
        let taken = broker
            .pop_waiting(JobKind::ExamProcessing, Duration::from_millis(10), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(taken, Some(status.id));

        service.start_workers().await;
        let done = wait_for_terminal(&service, &status).await;
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(broker.active_len(JobKind::ExamProcessing).await, 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_during_rate_wait_returns_job() {
        let mut config = test_config();
        config.exam_processing = QueueLimits {
            max_per_window: 1,
            window_ms: 60_000,
            concurrency: 1,
        };
        let (service, broker) = connected_service(
            Processors::new(standard_processors().code_execution, Arc::new(ExamProcessor)),
            config,
        )
        .await;
        let first = service.enqueue(exam_payload()).await.unwrap();
        let second = service.enqueue(exam_payload()).await.unwrap();
        service.start_workers().await;
        assert_eq!(wait_for_terminal(&service, &first).await.state, JobState::Completed);

        // the worker now holds the second job while the window is full
        let deadline = Instant::now() + Duration::from_secs(5);
        while broker.active_len(JobKind::ExamProcessing).await == 0 {
            assert!(Instant::now() < deadline, "second job never dispatched");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let polled = service.get_status(second.id, second.queue).await.unwrap();
        assert_eq!(polled.state, JobState::Waiting);

        tokio::time::timeout(Duration::from_secs(2), service.shutdown())
            .await
            .expect("shutdown must not wait out the rate window");
        assert_eq!(broker.active_len(JobKind::ExamProcessing).await, 0);
        assert_eq!(broker.waiting_len(JobKind::ExamProcessing).await, 1);
    }

    #[tokio::test]
    async fn test_refused_connection_enters_fallback() {
        let connector = Arc::new(MemoryConnector::refusing());
        let config = QueueConfig {
            connect_retries: 2,
            ..test_config()
        };
        let service = QueueService::new(connector.clone(), standard_processors(), config);

        assert_eq!(service.connect().await, ConnectionState::Disconnected);
        assert!(service.is_fallback());
        assert_eq!(connector.attempts(), 3);

        // runs synchronously, never waits on a queue
        let status = tokio::time::timeout(Duration::from_secs(1), service.enqueue(code_payload()))
            .await
            .expect("enqueue must not hang in fallback mode")
            .unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.progress, 100);
        assert!(service.get_status(status.id, status.queue).await.is_none());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_fallback_result_matches_queued_result() {
        let (queued, _broker) = connected_service(standard_processors(), test_config()).await;
        queued.start_workers().await;
        let handle = queued.enqueue(code_payload()).await.unwrap();
        let via_queue = wait_for_terminal(&queued, &handle).await;

        let fallback = QueueService::new(Arc::new(MemoryConnector::refusing()), standard_processors(), test_config());
        fallback.connect().await;
        let in_process = fallback.enqueue(code_payload()).await.unwrap();

        assert_eq!(via_queue.state, in_process.state);
        assert_eq!(via_queue.queue, in_process.queue);
        assert_eq!(via_queue.result, in_process.result);
        assert_eq!(
            serde_json::to_value(&via_queue).unwrap().as_object().unwrap().keys().collect::<Vec<_>>(),
            serde_json::to_value(&in_process).unwrap().as_object().unwrap().keys().collect::<Vec<_>>()
        );
        queued.shutdown().await;
        fallback.shutdown().await;
    }

    #[tokio::test]
    async fn test_fallback_processor_failure_is_reported() {
        let processors = exam_processors(FlakyProcessor::new(u32::MAX));
        let service = QueueService::new(Arc::new(MemoryConnector::refusing()), processors, test_config());
        service.connect().await;

        let err = service.enqueue(exam_payload()).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::Fallback {
                queue: JobKind::ExamProcessing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_lost_broker_switches_to_fallback() {
        let (service, broker) = connected_service(standard_processors(), test_config()).await;
        broker.set_reachable(false);

        let status = service.enqueue(exam_payload()).await.unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(service.state(), ConnectionState::Disconnected);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_leaves_fallback() {
        let connector = Arc::new(MemoryConnector::refusing());
        let service = QueueService::new(connector.clone(), standard_processors(), test_config());
        assert_eq!(service.connect().await, ConnectionState::Disconnected);

        connector.set_refusing(false);
        assert_eq!(service.connect().await, ConnectionState::Connected);
        let status = service.enqueue(exam_payload()).await.unwrap();
        assert_eq!(status.state, JobState::Waiting);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_rate_limit_spreads_dispatches() {
        let mut config = test_config();
        config.exam_processing = QueueLimits {
            max_per_window: 2,
            window_ms: 300,
            concurrency: 2,
        };
        let (service, _broker) = connected_service(
            Processors::new(standard_processors().code_execution, Arc::new(ExamProcessor)),
            config,
        )
        .await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(service.enqueue(exam_payload()).await.unwrap());
        }
        let started = Instant::now();
        service.start_workers().await;
        for handle in &handles {
            assert_eq!(wait_for_terminal(&service, handle).await.state, JobState::Completed);
        }
        // the second pair has to wait for a fresh window
        assert!(started.elapsed() >= Duration::from_millis(250), "took {:?}", started.elapsed());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_without_broker_is_safe() {
        let service = QueueService::new(Arc::new(MemoryConnector::refusing()), standard_processors(), test_config());
        // never connected at all
        service.shutdown().await;
        service.shutdown().await;
        assert_eq!(service.state(), ConnectionState::Disconnected);
        assert!(matches!(service.enqueue(exam_payload()).await, Err(QueueError::ShutDown)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers_and_closes_broker() {
        let (service, broker) = connected_service(standard_processors(), test_config()).await;
        service.start_workers().await;
        service.spawn_reconnect_loop().await;

        tokio::time::timeout(Duration::from_secs(2), service.shutdown())
            .await
            .expect("shutdown must not hang");
        assert!(broker.is_closed());
        assert_eq!(service.state(), ConnectionState::Disconnected);
    }
}
