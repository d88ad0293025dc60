// In-process broker for tests and single-node development

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use talent_common::config::QueueLimits;
use talent_common::job::{Job, JobKind};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::broker::{Broker, BrokerConnector};
use crate::error::BrokerError;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct StoredJob {
    raw: String,
    expires_at: Option<Instant>,
}

struct RateWindow {
    started: Instant,
    count: u32,
}

#[derive(Default)]
struct State {
    jobs: HashMap<(JobKind, Uuid), StoredJob>,
    waiting: HashMap<JobKind, VecDeque<Uuid>>,
    /// id -> lease expiry millis
    active: HashMap<JobKind, HashMap<Uuid, i64>>,
    delayed: HashMap<JobKind, Vec<(i64, Uuid)>>,
    windows: HashMap<JobKind, RateWindow>,
}

/// Broker state kept in memory. Job records are stored as JSON so they go
/// through the same serialization as the Redis broker.
pub struct MemoryBroker {
    state: Mutex<State>,
    pushed: Notify,
    reachable: AtomicBool,
    closed: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            pushed: Notify::new(),
            reachable: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate the broker going away (or coming back). While unreachable,
    /// every command fails with a refused connection.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn waiting_len(&self, queue: JobKind) -> usize {
        let state = self.state.lock().await;
        state.waiting.get(&queue).map_or(0, VecDeque::len)
    }

    pub async fn active_len(&self, queue: JobKind) -> usize {
        let state = self.state.lock().await;
        state.active.get(&queue).map_or(0, HashMap::len)
    }

    pub async fn delayed_len(&self, queue: JobKind) -> usize {
        let state = self.state.lock().await;
        state.delayed.get(&queue).map_or(0, Vec::len)
    }

    fn check(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("connection closed".to_string()));
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionRefused("connect ECONNREFUSED".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        self.check()
    }

    async fn save_job(&self, job: &Job, ttl: Option<Duration>) -> Result<(), BrokerError> {
        self.check()?;
        let raw = serde_json::to_string(job)?;
        let mut state = self.state.lock().await;
        state.jobs.insert(
            (job.kind, job.id),
            StoredJob {
                raw,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn load_job(&self, queue: JobKind, id: Uuid) -> Result<Option<Job>, BrokerError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let expired = match state.jobs.get(&(queue, id)) {
            None => return Ok(None),
            Some(stored) => stored.expires_at.is_some_and(|at| at <= Instant::now()),
        };
        if expired {
            state.jobs.remove(&(queue, id));
            return Ok(None);
        }
        match state.jobs.get(&(queue, id)) {
            Some(stored) => Ok(Some(serde_json::from_str(&stored.raw)?)),
            None => Ok(None),
        }
    }

    async fn push_waiting(&self, queue: JobKind, id: Uuid) -> Result<(), BrokerError> {
        self.check()?;
        self.state.lock().await.waiting.entry(queue).or_default().push_back(id);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop_waiting(
        &self,
        queue: JobKind,
        timeout: Duration,
        lease: Duration,
    ) -> Result<Option<Uuid>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            // registered before the check so a push in between is not missed
            let pushed = self.pushed.notified();
            self.check()?;
            {
                let mut state = self.state.lock().await;
                if let Some(id) = state.waiting.get_mut(&queue).and_then(VecDeque::pop_front) {
                    let lease_until = now_ms().saturating_add(lease.as_millis() as i64);
                    state.active.entry(queue).or_default().insert(id, lease_until);
                    return Ok(Some(id));
                }
            }
            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn extend_lease(&self, queue: JobKind, id: Uuid, lease_until_ms: i64) -> Result<(), BrokerError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if let Some(lease) = state.active.get_mut(&queue).and_then(|active| active.get_mut(&id)) {
            *lease = lease_until_ms;
        }
        Ok(())
    }

    async fn ack(&self, queue: JobKind, id: Uuid) -> Result<(), BrokerError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if let Some(active) = state.active.get_mut(&queue) {
            active.remove(&id);
        }
        Ok(())
    }

    async fn release(&self, queue: JobKind, id: Uuid) -> Result<(), BrokerError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let was_active = state
            .active
            .get_mut(&queue)
            .is_some_and(|active| active.remove(&id).is_some());
        if was_active {
            state.waiting.entry(queue).or_default().push_front(id);
            drop(state);
            self.pushed.notify_waiters();
        }
        Ok(())
    }

    async fn schedule_delayed(&self, queue: JobKind, id: Uuid, ready_at_ms: i64) -> Result<(), BrokerError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if let Some(active) = state.active.get_mut(&queue) {
            active.remove(&id);
        }
        state.delayed.entry(queue).or_default().push((ready_at_ms, id));
        Ok(())
    }

    async fn promote_delayed(&self, queue: JobKind, now_ms: i64) -> Result<usize, BrokerError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let parked = state.delayed.remove(&queue).unwrap_or_default();
        let (mut due, pending): (Vec<_>, Vec<_>) =
            parked.into_iter().partition(|(ready_at, _)| *ready_at <= now_ms);
        if !pending.is_empty() {
            state.delayed.insert(queue, pending);
        }
        due.sort_by_key(|(ready_at, _)| *ready_at);
        let moved = due.len();
        state
            .waiting
            .entry(queue)
            .or_default()
            .extend(due.into_iter().map(|(_, id)| id));
        drop(state);

        if moved > 0 {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn requeue_stalled(&self, queue: JobKind, now_ms: i64) -> Result<usize, BrokerError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let Some(active) = state.active.get_mut(&queue) else {
            return Ok(0);
        };
        let mut expired: Vec<(i64, Uuid)> = active
            .iter()
            .filter(|(_, lease_until)| **lease_until <= now_ms)
            .map(|(id, lease_until)| (*lease_until, *id))
            .collect();
        for (_, id) in &expired {
            active.remove(id);
        }
        expired.sort();
        let moved = expired.len();
        state
            .waiting
            .entry(queue)
            .or_default()
            .extend(expired.into_iter().map(|(_, id)| id));
        drop(state);

        if moved > 0 {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn acquire_rate_slot(
        &self,
        queue: JobKind,
        limits: &QueueLimits,
    ) -> Result<Option<Duration>, BrokerError> {
        self.check()?;
        let window = Duration::from_millis(limits.window_ms);
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let slot = state.windows.entry(queue).or_insert(RateWindow { started: now, count: 0 });
        if now.duration_since(slot.started) >= window {
            slot.started = now;
            slot.count = 0;
        }
        slot.count += 1;
        if slot.count > limits.max_per_window {
            Ok(Some(window.saturating_sub(now.duration_since(slot.started))))
        } else {
            Ok(None)
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.pushed.notify_waiters();
        Ok(())
    }
}

/// Hands out a shared [`MemoryBroker`], or refuses like an absent Redis would.
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
    refusing: AtomicBool,
    attempts: AtomicU32,
}

impl MemoryConnector {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            refusing: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn refusing() -> Self {
        let connector = Self::new(Arc::new(MemoryBroker::new()));
        connector.set_refusing(true);
        connector
    }

    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of `connect` calls so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn broker(&self) -> Arc<MemoryBroker> {
        Arc::clone(&self.broker)
    }
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refusing.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionRefused("connect ECONNREFUSED 127.0.0.1:6379".to_string()));
        }
        Ok(self.broker.clone())
    }
}
