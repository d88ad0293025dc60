// Best-effort cache over Redis for slow-changing entities

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::ConnectionInfo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use talent_common::config::CacheTtl;
use talent_common::redis as keys;
use tracing::{debug, warn};

use crate::error::CacheError;

/// Raw string storage behind [`ResultCache`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), CacheError>;
    async fn del(&self, key: &str) -> Result<(), CacheError>;
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;
    async fn mset(&self, entries: &[(String, String)], ttl_secs: u64) -> Result<(), CacheError>;
}

pub struct RedisCacheStore {
    conn: ConnectionManager,
}

impl RedisCacheStore {
    pub async fn connect(info: ConnectionInfo) -> Result<Self, CacheError> {
        let client = redis::Client::open(info)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        Ok(redis::cmd("MGET").arg(keys).query_async(&mut conn).await?)
    }

    async fn mset(&self, entries: &[(String, String)], ttl_secs: u64) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.cmd("SET").arg(key).arg(value).arg("EX").arg(ttl_secs.max(1)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-process store with expiry. `set_failing(true)` makes every call error,
/// as a dead Redis would.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    failing: AtomicBool,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::Backend("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    /// Runs `f` under the lock. Keeps the guard out of async bodies.
    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<String, (String, Instant)>) -> R) -> Result<R, CacheError> {
        self.check()?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CacheError::Backend("cache lock poisoned".to_string()))?;
        Ok(f(&mut entries))
    }

    fn read(entries: &HashMap<String, (String, Instant)>, key: &str) -> Option<String> {
        entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone())
    }

    // Redis rejects EX 0, both stores clamp to one second
    fn expiry(ttl_secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(ttl_secs.max(1))
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.with_entries(|entries| Self::read(entries, key))
    }

    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), CacheError> {
        let expires_at = Self::expiry(ttl_secs);
        self.with_entries(|entries| {
            entries.insert(key.to_string(), (value, expires_at));
        })
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.with_entries(|entries| {
            entries.remove(key);
        })
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        self.with_entries(|entries| keys.iter().map(|key| Self::read(entries, key)).collect())
    }

    async fn mset(&self, entries: &[(String, String)], ttl_secs: u64) -> Result<(), CacheError> {
        let expires_at = Self::expiry(ttl_secs);
        self.with_entries(|stored| {
            for (key, value) in entries {
                stored.insert(key.clone(), (value.clone(), expires_at));
            }
        })
    }
}

/// Advisory JSON cache.
///
/// Never fails: backend errors and undecodable values read as misses, and
/// writes report success as a bool. Callers must always be able to go to the
/// source of truth.
pub struct ResultCache {
    store: Option<Arc<dyn CacheStore>>,
    ttl: CacheTtl,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: CacheTtl) -> Self {
        Self {
            store: Some(store),
            ttl,
        }
    }

    /// A cache that misses on every read and drops every write.
    pub fn disabled(ttl: CacheTtl) -> Self {
        Self { store: None, ttl }
    }

    pub fn ttl(&self) -> &CacheTtl {
        &self.ttl
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let store = self.store.as_ref()?;
        let raw = match store.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, error = %e, "Cache get failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "Cache value not serializable");
                return false;
            }
        };
        match store.set(key, raw, ttl_secs).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Cache set failed");
                false
            }
        }
    }

    pub async fn del(&self, key: &str) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        match store.del(key).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Cache del failed");
                false
            }
        }
    }

    /// One slot per key, in key order. A failed lookup is all misses.
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        let misses = || -> Vec<Option<T>> { keys.iter().map(|_| None).collect() };
        let Some(store) = self.store.as_ref() else {
            return misses();
        };
        match store.mget(keys).await {
            Ok(values) if values.len() == keys.len() => values
                .into_iter()
                .map(|raw| raw.and_then(|raw| serde_json::from_str(&raw).ok()))
                .collect(),
            Ok(values) => {
                warn!(expected = keys.len(), got = values.len(), "Cache mget returned wrong arity");
                misses()
            }
            Err(e) => {
                warn!(error = %e, "Cache mget failed");
                misses()
            }
        }
    }

    pub async fn mset<T: Serialize>(&self, entries: &[(String, T)], ttl_secs: u64) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        let encoded: Result<Vec<(String, String)>, _> = entries
            .iter()
            .map(|(key, value)| serde_json::to_string(value).map(|raw| (key.clone(), raw)))
            .collect();
        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "Cache value not serializable");
                return false;
            }
        };
        match store.mset(&encoded, ttl_secs).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Cache mset failed");
                false
            }
        }
    }

    /// Read-through: return the cached value, or load it and cache it when the
    /// loader finds one. Loader errors pass through untouched.
    pub async fn get_or_load<T, E, F, Fut>(&self, key: &str, ttl_secs: u64, load: F) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        if let Some(hit) = self.get(key).await {
            debug!(key, "Cache hit");
            return Ok(Some(hit));
        }
        let loaded = load().await?;
        if let Some(value) = &loaded {
            self.set(key, value, ttl_secs).await;
        }
        Ok(loaded)
    }

    pub async fn get_question<T: DeserializeOwned>(&self, question_id: &str) -> Option<T> {
        self.get(&keys::question_cache_key(question_id)).await
    }

    pub async fn set_question<T: Serialize>(&self, question_id: &str, question: &T) -> bool {
        self.set(&keys::question_cache_key(question_id), question, self.ttl.questions)
            .await
    }

    pub async fn get_exam<T: DeserializeOwned>(&self, exam_id: &str) -> Option<T> {
        self.get(&keys::exam_cache_key(exam_id)).await
    }

    pub async fn set_exam<T: Serialize>(&self, exam_id: &str, exam: &T) -> bool {
        self.set(&keys::exam_cache_key(exam_id), exam, self.ttl.exams).await
    }

    pub async fn get_results<T: DeserializeOwned>(&self, user_id: &str, exam_id: &str) -> Option<T> {
        self.get(&keys::results_cache_key(user_id, exam_id)).await
    }

    pub async fn set_results<T: Serialize>(&self, user_id: &str, exam_id: &str, results: &T) -> bool {
        self.set(&keys::results_cache_key(user_id, exam_id), results, self.ttl.results)
            .await
    }

    pub async fn get_session<T: DeserializeOwned>(&self, user_id: &str) -> Option<T> {
        self.get(&keys::session_cache_key(user_id)).await
    }

    pub async fn set_session<T: Serialize>(&self, user_id: &str, session: &T) -> bool {
        self.set(&keys::session_cache_key(user_id), session, self.ttl.sessions)
            .await
    }
}
