use crate::types::{Job, ResultPayload};
use redis::{AsyncCommands, RedisResult};

/// Redis key semantics shared by every component that touches Redis.
/// Keeps the admission path, the workers and the abuse store agreeing on
/// names, so a second instance pointed at the same Redis sees the same state.

pub const DEFAULT_QUEUE_KEY: &str = "executor:tasks";
pub const ABUSE_PREFIX: &str = "executor:abuse";

/// Key of the rate-limit window counter for a scope (`submitter`, `origin`)
pub fn rate_key(scope: &str, id: &str) -> String {
    format!("{}:rate:{}:{}", ABUSE_PREFIX, scope, id)
}

/// Key of the timeout-streak counter for a submitter
pub fn streak_key(submitter_id: &str) -> String {
    format!("{}:streak:{}", ABUSE_PREFIX, submitter_id)
}

/// Key whose presence (and TTL) marks a blocked submitter
pub fn block_key(submitter_id: &str) -> String {
    format!("{}:block:{}", ABUSE_PREFIX, submitter_id)
}

/// List a job's result is delivered through, scoped under the queue key
pub fn result_key(queue_key: &str, job_id: &uuid::Uuid) -> String {
    format!("{}:result:{}", queue_key, job_id)
}

fn codec_error(what: &'static str, e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, what, e.to_string()))
}

/// Append a job to the queue.
/// RPUSH here plus BLPOP in `pop_job` gives FIFO order.
pub async fn push_job<C>(conn: &mut C, queue_key: &str, job: &Job) -> RedisResult<()>
where
    C: redis::aio::ConnectionLike + Send,
{
    let payload = serde_json::to_string(job).map_err(|e| codec_error("serialization error", e))?;
    conn.rpush(queue_key, payload).await
}

/// Pop one job, blocking up to `timeout_seconds`.
/// Returns `None` on timeout so callers can re-check shutdown.
/// BLPOP parks the whole connection, so pass a connection dedicated to the caller.
pub async fn pop_job<C>(conn: &mut C, queue_key: &str, timeout_seconds: f64) -> RedisResult<Option<Job>>
where
    C: redis::aio::ConnectionLike + Send,
{
    let result: Option<(String, String)> = conn.blpop(queue_key, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let job: Job = serde_json::from_str(&payload)
                .map_err(|e| codec_error("deserialization error", e))?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

/// Deliver a job result. The list expires after `retention_ms` whether or
/// not anyone reads it, so unclaimed results do not accumulate.
pub async fn push_result<C>(
    conn: &mut C,
    key: &str,
    payload: &ResultPayload,
    retention_ms: u64,
) -> RedisResult<()>
where
    C: redis::aio::ConnectionLike + Send,
{
    let body = serde_json::to_string(payload).map_err(|e| codec_error("serialization error", e))?;
    redis::pipe()
        .atomic()
        .rpush(key, body)
        .ignore()
        .cmd("PEXPIRE")
        .arg(key)
        .arg(retention_ms)
        .ignore()
        .query_async(conn)
        .await
}

/// Wait up to `timeout_seconds` for a job result.
/// A result pushed before the call is returned immediately.
pub async fn wait_result<C>(
    conn: &mut C,
    key: &str,
    timeout_seconds: f64,
) -> RedisResult<Option<ResultPayload>>
where
    C: redis::aio::ConnectionLike + Send,
{
    let result: Option<(String, String)> = conn.blpop(key, timeout_seconds).await?;

    match result {
        Some((_key, body)) => {
            let payload = serde_json::from_str(&body)
                .map_err(|e| codec_error("deserialization error", e))?;
            Ok(Some(payload))
        }
        None => Ok(None),
    }
}

/// Current queue depth
pub async fn queue_len<C>(conn: &mut C, queue_key: &str) -> RedisResult<usize>
where
    C: redis::aio::ConnectionLike + Send,
{
    conn.llen(queue_key).await
}
