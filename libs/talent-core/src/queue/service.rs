use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use talent_common::config::QueueConfig;
use talent_common::job::{FailureDisposition, Job, JobKind, JobPayload, JobState, JobStatus};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::broker::{Broker, BrokerConnector};
use crate::error::{BrokerError, QueueError};
use crate::metrics;
use crate::processors::Processors;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const MAX_CONNECT_DELAY_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Delay before connect retry `attempt` (1-based): `min(attempt * 50ms, 2s)`.
fn connect_delay(attempt: u32) -> Duration {
    Duration::from_millis((u64::from(attempt) * 50).min(MAX_CONNECT_DELAY_MS))
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Owns the broker connection and both queues.
///
/// Constructed once per process and shared behind an `Arc`. While the broker
/// is unreachable the service is in fallback mode: `enqueue` runs the job's
/// processor in-process and answers with the completed status straight away.
pub struct QueueService {
    connector: Arc<dyn BrokerConnector>,
    broker: RwLock<Option<Arc<dyn Broker>>>,
    state: watch::Sender<ConnectionState>,
    processors: Processors,
    config: QueueConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reconnecting: Mutex<()>,
    closed: AtomicBool,
}

impl QueueService {
    pub fn new(connector: Arc<dyn BrokerConnector>, processors: Processors, config: QueueConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            broker: RwLock::new(None),
            state,
            processors,
            config,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            reconnecting: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_fallback(&self) -> bool {
        self.state() != ConnectionState::Connected
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Try to reach the broker, retrying `connect_retries` times before
    /// settling into fallback mode. Never fails; the outcome is the state.
    #[instrument(skip_all)]
    pub async fn connect(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            return self.state();
        }
        self.state.send_replace(ConnectionState::Connecting);

        let mut attempt: u32 = 0;
        loop {
            let outcome = match self.connector.connect().await {
                Ok(broker) => broker.ping().await.map(|_| broker),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(broker) => {
                    *self.broker.write().await = Some(broker);
                    self.state.send_replace(ConnectionState::Connected);
                    info!(attempts = attempt + 1, "Connected to broker");
                    return ConnectionState::Connected;
                }
                Err(e) if attempt < self.config.connect_retries => {
                    attempt += 1;
                    let delay = connect_delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Broker connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    *self.broker.write().await = None;
                    self.state.send_replace(ConnectionState::Disconnected);
                    if matches!(e, BrokerError::ConnectionRefused(_)) {
                        warn!(error = %e, "Broker refused connection, running in fallback mode");
                    } else {
                        warn!(error = %e, "Broker unavailable, running in fallback mode");
                    }
                    return ConnectionState::Disconnected;
                }
            }
        }
    }

    async fn available_broker(&self) -> Option<Arc<dyn Broker>> {
        self.broker.read().await.clone()
    }

    async fn mark_unavailable(&self, error: &BrokerError) {
        let mut broker = self.broker.write().await;
        if broker.take().is_some() {
            self.state.send_replace(ConnectionState::Disconnected);
            warn!(error = %error, "Lost broker connection, running in fallback mode");
        }
    }

    /// Accept a job. Queued jobs come back `waiting`; in fallback mode the
    /// job has already run and comes back `completed`.
    #[instrument(skip_all, fields(queue = %payload.kind()))]
    pub async fn enqueue(&self, payload: JobPayload) -> Result<JobStatus, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::ShutDown);
        }
        let job = Job::new(payload, self.config.job_options);

        let job = match self.available_broker().await {
            Some(broker) => match Self::submit(broker.as_ref(), &job).await {
                Ok(()) => {
                    metrics::record_enqueued(job.kind, "queued");
                    info!(job_id = %job.id, queue = %job.kind, "Job enqueued");
                    return Ok(job.status());
                }
                Err(e) if e.is_connectivity() => {
                    self.mark_unavailable(&e).await;
                    job
                }
                Err(e) => return Err(e.into()),
            },
            None => job,
        };

        self.run_in_process(job).await
    }

    async fn submit(broker: &dyn Broker, job: &Job) -> Result<(), BrokerError> {
        broker.save_job(job, None).await?;
        broker.push_waiting(job.kind, job.id).await
    }

    async fn run_in_process(&self, mut job: Job) -> Result<JobStatus, QueueError> {
        let queue = job.kind;
        job.start()?;
        let processor = self.processors.for_queue(queue);
        match processor.process(&job.payload).await {
            Ok(output) => {
                job.complete(output)?;
                metrics::record_enqueued(queue, "fallback");
                metrics::record_completed(queue);
                info!(job_id = %job.id, queue = %queue, "Job processed in fallback mode");
                Ok(job.status())
            }
            Err(source) => {
                metrics::record_failed(queue);
                error!(job_id = %job.id, queue = %queue, error = %source, "Fallback processing failed");
                Err(QueueError::Fallback { queue, source })
            }
        }
    }

    /// Point-in-time status. `None` when the job is unknown, has expired, or
    /// the broker cannot be asked.
    pub async fn get_status(&self, id: Uuid, queue: JobKind) -> Option<JobStatus> {
        let broker = self.available_broker().await?;
        match broker.load_job(queue, id).await {
            Ok(job) => job.map(|job| job.status()),
            Err(e) => {
                warn!(job_id = %id, queue = %queue, error = %e, "Status lookup failed");
                if e.is_connectivity() {
                    self.mark_unavailable(&e).await;
                }
                None
            }
        }
    }

    /// Spawn the configured number of workers for each queue.
    pub async fn start_workers(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        for queue in JobKind::ALL {
            let concurrency = self.config.limits(queue).concurrency.max(1);
            for worker_id in 0..concurrency {
                let service = Arc::clone(self);
                tasks.push(tokio::spawn(async move {
                    service.worker_loop(queue, worker_id).await;
                }));
            }
            info!(queue = %queue, concurrency, "Workers started");
        }
    }

    /// Periodically re-run [`connect`](Self::connect) while in fallback mode.
    pub async fn spawn_reconnect_loop(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
                }
                if service.is_fallback() {
                    service.try_reconnect().await;
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }

    async fn try_reconnect(&self) {
        // one reconnect in flight at a time
        let Ok(_guard) = self.reconnecting.try_lock() else {
            return;
        };
        if self.is_fallback() {
            self.connect().await;
        }
    }

    async fn worker_loop(self: Arc<Self>, queue: JobKind, worker_id: usize) {
        let idle = Duration::from_millis(self.config.poll_interval_ms);
        debug!(queue = %queue, worker_id, "Worker running");

        while !self.cancel.is_cancelled() {
            let Some(broker) = self.available_broker().await else {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(idle) => {}
                }
                continue;
            };

            match self.dispatch_next(broker.as_ref(), queue, idle).await {
                Ok(_) => {}
                Err(QueueError::Broker(e)) if e.is_connectivity() => {
                    self.mark_unavailable(&e).await;
                }
                Err(e) => {
                    error!(queue = %queue, worker_id, error = %e, "Worker iteration failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
            }
        }
        debug!(queue = %queue, worker_id, "Worker stopped");
    }

    /// Promote due retries and recover stalled jobs, then take and process at
    /// most one job. Returns whether a job was processed.
    async fn dispatch_next(&self, broker: &dyn Broker, queue: JobKind, idle: Duration) -> Result<bool, QueueError> {
        let now = now_ms();
        broker.promote_delayed(queue, now).await?;
        let recovered = broker.requeue_stalled(queue, now).await?;
        if recovered > 0 {
            warn!(queue = %queue, recovered, "Re-queued jobs with expired leases");
        }

        let lease = Duration::from_millis(self.config.lease_ms);
        let popped = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(false),
            popped = broker.pop_waiting(queue, idle, lease) => popped?,
        };
        let Some(id) = popped else {
            return Ok(false);
        };

        match self.wait_for_rate_slot(broker, queue).await {
            Ok(true) => {}
            Ok(false) => {
                // shutting down before the job started
                broker.release(queue, id).await?;
                return Ok(false);
            }
            Err(e) => {
                if let Err(release_err) = broker.release(queue, id).await {
                    debug!(job_id = %id, error = %release_err, "Release failed, lease expiry will recover the job");
                }
                return Err(e.into());
            }
        }

        self.process_job(broker, queue, id).await?;
        Ok(true)
    }

    /// `Ok(false)` when shutdown interrupted the wait.
    async fn wait_for_rate_slot(&self, broker: &dyn Broker, queue: JobKind) -> Result<bool, BrokerError> {
        let limits = self.config.limits(queue);
        while let Some(wait) = broker.acquire_rate_slot(queue, limits).await? {
            debug!(queue = %queue, wait_ms = wait.as_millis() as u64, "Rate limit reached");
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep(wait) => {}
            }
        }
        Ok(true)
    }

    /// Run one leased job to its next state. The id stays in the active set
    /// until that state is saved, so a crash anywhere before the final write
    /// ends in redelivery rather than loss.
    #[instrument(skip(self, broker, queue), fields(queue = %queue))]
    async fn process_job(&self, broker: &dyn Broker, queue: JobKind, job_id: Uuid) -> Result<(), QueueError> {
        let mut job = match broker.load_job(queue, job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!("Job record missing, dropping");
                broker.ack(queue, job_id).await?;
                return Ok(());
            }
            Err(e) if e.is_connectivity() => return Err(e.into()),
            Err(e) => {
                error!(error = %e, "Unreadable job record, dropping");
                broker.ack(queue, job_id).await?;
                return Ok(());
            }
        };
        match job.state {
            JobState::Completed | JobState::Failed => {
                // finished before the previous worker could acknowledge it
                debug!(state = ?job.state, "Job already finished");
                broker.ack(queue, job_id).await?;
                return Ok(());
            }
            JobState::Active => {
                warn!("Recovering job from a stalled worker");
                job.recover_stalled()?;
            }
            JobState::Waiting => {}
        }
        job.start()?;
        broker.save_job(&job, None).await?;
        info!(attempt = job.attempts_made + 1, max_attempts = job.max_attempts, "Processing job");

        let started = std::time::Instant::now();
        let processed = {
            let processing = self.processors.for_queue(queue).process(&job.payload);
            tokio::pin!(processing);
            let renew_every = Duration::from_millis((self.config.lease_ms / 3).max(1));
            let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);
            loop {
                tokio::select! {
                    processed = &mut processing => break processed,
                    _ = heartbeat.tick() => {
                        let lease_until = now_ms().saturating_add(self.config.lease_ms as i64);
                        if let Err(e) = broker.extend_lease(queue, job_id, lease_until).await {
                            warn!(error = %e, "Failed to extend job lease");
                        }
                    }
                }
            }
        };

        match processed {
            Ok(output) => {
                job.complete(output)?;
                let ttl = job
                    .options
                    .remove_on_complete
                    .then(|| Duration::from_secs(self.config.completed_retention_secs));
                broker.save_job(&job, ttl).await?;
                broker.ack(queue, job_id).await?;
                metrics::record_completed(queue);
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Job completed");
            }
            Err(e) => {
                error!(job_id = %job.id, queue = %queue, error = %e, "Job processing failed");
                match job.record_failure(e.to_string())? {
                    FailureDisposition::Retry { delay } => {
                        broker.save_job(&job, None).await?;
                        let ready_at = now_ms().saturating_add(delay.as_millis() as i64);
                        broker.schedule_delayed(queue, job.id, ready_at).await?;
                        metrics::record_retry(queue);
                        warn!(
                            attempts_made = job.attempts_made,
                            delay_ms = delay.as_millis() as u64,
                            "Job scheduled for retry"
                        );
                    }
                    FailureDisposition::Exhausted => {
                        broker.save_job(&job, None).await?;
                        broker.ack(queue, job_id).await?;
                        metrics::record_failed(queue);
                        error!(attempts_made = job.attempts_made, "Job failed after exhausting attempts");
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop workers after their current job, then close the broker. Safe to
    /// call in fallback mode and more than once.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Queue task ended abnormally");
            }
        }

        if let Some(broker) = self.broker.write().await.take() {
            if let Err(e) = broker.close().await {
                warn!(error = %e, "Failed to close broker connection");
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
        info!("Queue service shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_delay_is_capped() {
        assert_eq!(connect_delay(1), Duration::from_millis(50));
        assert_eq!(connect_delay(3), Duration::from_millis(150));
        assert_eq!(connect_delay(40), Duration::from_millis(2000));
        assert_eq!(connect_delay(1000), Duration::from_millis(2000));
    }
}
