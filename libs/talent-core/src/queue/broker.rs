use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use talent_common::config::QueueLimits;
use talent_common::job::{Job, JobKind};
use uuid::Uuid;

use crate::error::BrokerError;

/// Storage and dispatch primitives the queue service needs from a message
/// broker. The broker holds the only authoritative copy of every job.
///
/// A job id lives in exactly one of three places: the waiting list, the
/// active set (leased to a worker) or the delayed set. Every move between
/// them is atomic, so an id is never dropped on the way. A worker that dies
/// leaves its id in the active set until [`requeue_stalled`](Broker::requeue_stalled)
/// hands it out again, which makes dispatch at-least-once.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn ping(&self) -> Result<(), BrokerError>;

    /// Write the job record, optionally expiring it after `ttl`.
    async fn save_job(&self, job: &Job, ttl: Option<Duration>) -> Result<(), BrokerError>;

    async fn load_job(&self, queue: JobKind, id: Uuid) -> Result<Option<Job>, BrokerError>;

    /// Append a job id to the tail of the waiting list.
    async fn push_waiting(&self, queue: JobKind, id: Uuid) -> Result<(), BrokerError>;

    /// Move the head of the waiting list into the active set under a lease
    /// of `lease`, waiting at most `timeout` for one to arrive.
    async fn pop_waiting(
        &self,
        queue: JobKind,
        timeout: Duration,
        lease: Duration,
    ) -> Result<Option<Uuid>, BrokerError>;

    /// Push the lease of an active job out to `lease_until_ms` (unix millis).
    /// No-op for ids that are not active.
    async fn extend_lease(&self, queue: JobKind, id: Uuid, lease_until_ms: i64) -> Result<(), BrokerError>;

    /// Drop a finished job from the active set.
    async fn ack(&self, queue: JobKind, id: Uuid) -> Result<(), BrokerError>;

    /// Give an active job back, ahead of everything else waiting.
    async fn release(&self, queue: JobKind, id: Uuid) -> Result<(), BrokerError>;

    /// Move a job id from the active set to the delayed set until
    /// `ready_at_ms` (unix millis).
    async fn schedule_delayed(&self, queue: JobKind, id: Uuid, ready_at_ms: i64) -> Result<(), BrokerError>;

    /// Move every delayed job that is due onto the waiting list. Returns how
    /// many were moved.
    async fn promote_delayed(&self, queue: JobKind, now_ms: i64) -> Result<usize, BrokerError>;

    /// Move every active job whose lease ran out onto the waiting list.
    /// Returns how many were moved.
    async fn requeue_stalled(&self, queue: JobKind, now_ms: i64) -> Result<usize, BrokerError>;

    /// Claim one dispatch in the current rate-limit window. `Some(wait)` means
    /// the window is full and the caller should retry after `wait`.
    async fn acquire_rate_slot(
        &self,
        queue: JobKind,
        limits: &QueueLimits,
    ) -> Result<Option<Duration>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Opens a broker connection. Called again on every reconnect attempt.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError>;
}
