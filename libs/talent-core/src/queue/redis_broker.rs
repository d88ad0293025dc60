use async_trait::async_trait;
use lazy_static::lazy_static;
use redis::aio::ConnectionManager;
use redis::{ConnectionInfo, Script};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use talent_common::config::QueueLimits;
use talent_common::job::{Job, JobKind};
use talent_common::redis as keys;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::broker::{Broker, BrokerConnector};
use crate::error::BrokerError;

/// LPOP retry interval while waiting for work. BLPOP would hold the shared
/// multiplexed connection for every other command.
const POP_POLL_INTERVAL: Duration = Duration::from_millis(100);

lazy_static! {
    /// LPOP waiting, ZADD active with the lease expiry.
    static ref POP_SCRIPT: Script = Script::new(
        r"
        local id = redis.call('LPOP', KEYS[1])
        if id then
            redis.call('ZADD', KEYS[2], ARGV[1], id)
        end
        return id
        ",
    );

    /// Move every member of KEYS[1] scored at or below ARGV[1] to the tail of KEYS[2].
    static ref MOVE_DUE_SCRIPT: Script = Script::new(
        r"
        local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        for _, id in ipairs(due) do
            redis.call('ZREM', KEYS[1], id)
            redis.call('RPUSH', KEYS[2], id)
        end
        return #due
        ",
    );

    /// ZREM active, LPUSH waiting, only if the id was active.
    static ref RELEASE_SCRIPT: Script = Script::new(
        r"
        if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
            redis.call('LPUSH', KEYS[2], ARGV[1])
        end
        return 1
        ",
    );
}

fn lease_deadline(lease: Duration) -> i64 {
    chrono::Utc::now()
        .timestamp_millis()
        .saturating_add(lease.as_millis() as i64)
}

/// Broker backed by Redis. All queues share one multiplexed connection.
pub struct RedisBroker {
    conn: ConnectionManager,
    closed: AtomicBool,
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            closed: AtomicBool::new(false),
        }
    }

    /// Cloning a ConnectionManager is cheap and shares the connection.
    fn conn(&self) -> Result<ConnectionManager, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("connection closed".to_string()));
        }
        Ok(self.conn.clone())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn save_job(&self, job: &Job, ttl: Option<Duration>) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        let key = keys::job_key(job.kind, &job.id);
        let payload = serde_json::to_string(job)?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(payload);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn load_job(&self, queue: JobKind, id: Uuid) -> Result<Option<Job>, BrokerError> {
        let mut conn = self.conn()?;
        let payload: Option<String> = redis::cmd("GET")
            .arg(keys::job_key(queue, &id))
            .query_async(&mut conn)
            .await?;
        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn push_waiting(&self, queue: JobKind, id: Uuid) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        let _: i64 = redis::cmd("RPUSH")
            .arg(keys::waiting_key(queue))
            .arg(id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop_waiting(
        &self,
        queue: JobKind,
        timeout: Duration,
        lease: Duration,
    ) -> Result<Option<Uuid>, BrokerError> {
        let waiting = keys::waiting_key(queue);
        let active = keys::active_key(queue);
        let deadline = Instant::now() + timeout;
        loop {
            let mut conn = self.conn()?;
            let popped: Option<String> = POP_SCRIPT
                .key(&waiting)
                .key(&active)
                .arg(lease_deadline(lease))
                .invoke_async(&mut conn)
                .await?;
            if let Some(raw) = popped {
                match Uuid::parse_str(&raw) {
                    Ok(id) => return Ok(Some(id)),
                    Err(e) => {
                        debug!(queue = %queue, value = %raw, error = %e, "Dropping malformed job id");
                        let _: i64 = redis::cmd("ZREM").arg(&active).arg(&raw).query_async(&mut conn).await?;
                        continue;
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn extend_lease(&self, queue: JobKind, id: Uuid, lease_until_ms: i64) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        let _: i64 = redis::cmd("ZADD")
            .arg(keys::active_key(queue))
            .arg("XX")
            .arg(lease_until_ms)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ack(&self, queue: JobKind, id: Uuid) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        let _: i64 = redis::cmd("ZREM")
            .arg(keys::active_key(queue))
            .arg(id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn release(&self, queue: JobKind, id: Uuid) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        let _: i64 = RELEASE_SCRIPT
            .key(keys::active_key(queue))
            .key(keys::waiting_key(queue))
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn schedule_delayed(&self, queue: JobKind, id: Uuid, ready_at_ms: i64) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        let id = id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("ZREM").arg(keys::active_key(queue)).arg(&id).ignore();
        pipe.cmd("ZADD").arg(keys::delayed_key(queue)).arg(ready_at_ms).arg(&id).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn promote_delayed(&self, queue: JobKind, now_ms: i64) -> Result<usize, BrokerError> {
        let mut conn = self.conn()?;
        let moved: usize = MOVE_DUE_SCRIPT
            .key(keys::delayed_key(queue))
            .key(keys::waiting_key(queue))
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn requeue_stalled(&self, queue: JobKind, now_ms: i64) -> Result<usize, BrokerError> {
        let mut conn = self.conn()?;
        let moved: usize = MOVE_DUE_SCRIPT
            .key(keys::active_key(queue))
            .key(keys::waiting_key(queue))
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn acquire_rate_slot(
        &self,
        queue: JobKind,
        limits: &QueueLimits,
    ) -> Result<Option<Duration>, BrokerError> {
        let mut conn = self.conn()?;
        let key = keys::limiter_key(queue);
        let count: i64 = redis::cmd("INCR").arg(&key).query_async(&mut conn).await?;

        let mut ttl_ms: i64 = if count == 1 {
            -1
        } else {
            redis::cmd("PTTL").arg(&key).query_async(&mut conn).await?
        };
        if ttl_ms < 0 {
            // first hit of the window, or a counter left without expiry
            let _: i64 = redis::cmd("PEXPIRE")
                .arg(&key)
                .arg(limits.window_ms)
                .query_async(&mut conn)
                .await?;
            ttl_ms = limits.window_ms as i64;
        }

        if count > i64::from(limits.max_per_window) {
            Ok(Some(Duration::from_millis(ttl_ms.max(1) as u64)))
        } else {
            Ok(None)
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct RedisConnector {
    info: ConnectionInfo,
}

impl RedisConnector {
    pub fn new(info: ConnectionInfo) -> Self {
        Self { info }
    }
}

#[async_trait]
impl BrokerConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        let client = redis::Client::open(self.info.clone())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Arc::new(RedisBroker::new(conn)))
    }
}
