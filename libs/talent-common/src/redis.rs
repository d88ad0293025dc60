use crate::job::JobKind;

// Redis key semantics only, no runtime logic.
// API and worker derive every key from here so the two never drift.

pub const KEY_PREFIX: &str = "talent";

/// JSON record of one job
pub fn job_key(queue: JobKind, job_id: &uuid::Uuid) -> String {
    format!("{}:{}:job:{}", KEY_PREFIX, queue, job_id)
}

/// FIFO list of job ids ready for dispatch (RPUSH / LPOP)
pub fn waiting_key(queue: JobKind) -> String {
    format!("{}:{}:waiting", KEY_PREFIX, queue)
}

/// Sorted set of dispatched job ids, scored by lease expiry millis
pub fn active_key(queue: JobKind) -> String {
    format!("{}:{}:active", KEY_PREFIX, queue)
}

/// Sorted set of job ids waiting out a retry backoff, scored by ready-at millis
pub fn delayed_key(queue: JobKind) -> String {
    format!("{}:{}:delayed", KEY_PREFIX, queue)
}

/// Dispatch counter for the current rate-limit window
pub fn limiter_key(queue: JobKind) -> String {
    format!("{}:{}:limiter", KEY_PREFIX, queue)
}

pub fn question_cache_key(question_id: &str) -> String {
    format!("question:{}", question_id)
}

pub fn exam_cache_key(exam_id: &str) -> String {
    format!("exam:{}", exam_id)
}

pub fn results_cache_key(user_id: &str, exam_id: &str) -> String {
    format!("results:{}:{}", user_id, exam_id)
}

pub fn session_cache_key(user_id: &str) -> String {
    format!("session:{}", user_id)
}
