// Job queue: competing-consumer FIFO plus a per-job result channel

use async_trait::async_trait;
use pyexec_common::config::{ExecutorConfig, QueueBackend};
use pyexec_common::redis as keys;
use pyexec_common::types::{Job, NewJob, ResultPayload};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How long a published result is kept for a subscriber that has not shown up
pub const RESULT_RETENTION: Duration = Duration::from_secs(300);

/// BLPOP timeout for workers; bounds how long shutdown waits on an idle worker
const TAKE_POLL_SECONDS: f64 = 5.0;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Execution timed out waiting for worker result after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("queue backend error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("result channel closed before a result arrived")]
    Closed,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Assign id and timestamp, append, and return without waiting for execution
    async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError>;

    /// Block until a job is available; each job goes to exactly one caller
    async fn take(&self) -> Result<Job, QueueError>;

    /// Hand a result to whoever waits on its job id, or keep it for a late subscriber
    async fn publish_result(&self, payload: ResultPayload) -> Result<(), QueueError>;

    /// Wait for a job's result, bounded by the configured result wait
    async fn subscribe(&self, job_id: Uuid) -> Result<ResultPayload, QueueError>;

    async fn depth(&self) -> Result<usize, QueueError>;
}

enum Slot {
    Waiting(oneshot::Sender<ResultPayload>),
    Ready { payload: ResultPayload, at: Instant },
}

/// In-process one-shot delivery of results, keyed by job id
pub struct ResultHub {
    slots: Mutex<HashMap<Uuid, Slot>>,
    wait_limit: Duration,
    retention: Duration,
}

impl ResultHub {
    pub fn new(wait_limit: Duration, retention: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            wait_limit,
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sweep(&self, slots: &mut HashMap<Uuid, Slot>) {
        let retention = self.retention;
        slots.retain(|_, slot| match slot {
            Slot::Waiting(tx) => !tx.is_closed(),
            Slot::Ready { at, .. } => at.elapsed() < retention,
        });
    }

    pub fn publish(&self, payload: ResultPayload) {
        let mut slots = self.lock();
        self.sweep(&mut slots);

        let job_id = payload.job_id;
        let payload = match slots.remove(&job_id) {
            Some(Slot::Waiting(tx)) => match tx.send(payload) {
                Ok(()) => return,
                // Subscriber gave up between our check and the send
                Err(payload) => payload,
            },
            _ => payload,
        };
        slots.insert(
            job_id,
            Slot::Ready {
                payload,
                at: Instant::now(),
            },
        );
    }

    pub async fn subscribe(&self, job_id: Uuid) -> Result<ResultPayload, QueueError> {
        let rx = {
            let mut slots = self.lock();
            self.sweep(&mut slots);
            if let Some(Slot::Ready { .. }) = slots.get(&job_id) {
                if let Some(Slot::Ready { payload, .. }) = slots.remove(&job_id) {
                    return Ok(payload);
                }
            }
            let (tx, rx) = oneshot::channel();
            slots.insert(job_id, Slot::Waiting(tx));
            rx
        };

        match tokio::time::timeout(self.wait_limit, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(QueueError::Closed),
            Err(_) => {
                let mut slots = self.lock();
                if let Some(Slot::Waiting(_)) = slots.get(&job_id) {
                    slots.remove(&job_id);
                }
                Err(QueueError::Timeout(self.wait_limit))
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Process-local queue. Not crash-durable: queued jobs die with the process.
pub struct MemoryJobQueue {
    jobs: Mutex<VecDeque<Job>>,
    available: Notify,
    results: ResultHub,
}

impl MemoryJobQueue {
    pub fn new(result_wait: Duration) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            results: ResultHub::new(result_wait, RESULT_RETENTION),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        let job = job.into_job();
        self.jobs().push_back(job.clone());
        self.available.notify_one();
        Ok(job)
    }

    async fn take(&self) -> Result<Job, QueueError> {
        loop {
            let notified = self.available.notified();
            if let Some(job) = self.jobs().pop_front() {
                return Ok(job);
            }
            notified.await;
        }
    }

    async fn publish_result(&self, payload: ResultPayload) -> Result<(), QueueError> {
        self.results.publish(payload);
        Ok(())
    }

    async fn subscribe(&self, job_id: Uuid) -> Result<ResultPayload, QueueError> {
        self.results.subscribe(job_id).await
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        Ok(self.jobs().len())
    }
}

/// Redis-backed queue. Jobs survive a process restart, and results travel
/// through per-job Redis lists, so any instance sharing the Redis can serve
/// a submission that another instance's worker executed.
pub struct RedisJobQueue {
    client: redis::Client,
    conn: ConnectionManager,
    /// Idle connections for BLPOP callers. A blocked BLPOP parks its
    /// connection, so each concurrent caller holds one of its own.
    blocking: Mutex<Vec<MultiplexedConnection>>,
    queue_key: String,
    result_wait: Duration,
}

impl RedisJobQueue {
    pub async fn connect(redis_url: &str, queue_key: &str, result_wait: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            queue_key: queue_key.to_string(),
            result_wait,
        })
    }

    fn idle(&self) -> MutexGuard<'_, Vec<MultiplexedConnection>> {
        self.blocking.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn checkout(&self) -> Result<MultiplexedConnection, QueueError> {
        let idle = self.idle().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_async_connection().await?),
        }
    }

    /// Connections that hit an error are dropped instead of returned
    fn checkin(&self, conn: MultiplexedConnection) {
        self.idle().push(conn);
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        let job = job.into_job();
        let mut conn = self.conn.clone();
        keys::push_job(&mut conn, &self.queue_key, &job).await?;
        Ok(job)
    }

    async fn take(&self) -> Result<Job, QueueError> {
        let mut conn = self.checkout().await?;
        loop {
            match keys::pop_job(&mut conn, &self.queue_key, TAKE_POLL_SECONDS).await {
                Ok(Some(job)) => {
                    self.checkin(conn);
                    return Ok(job);
                }
                Ok(None) => continue,
                Err(e) if e.kind() == redis::ErrorKind::TypeError => {
                    // The payload is already off the list; drop it and move on
                    error!(error = %e, "Discarding undecodable job payload");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn publish_result(&self, payload: ResultPayload) -> Result<(), QueueError> {
        let key = keys::result_key(&self.queue_key, &payload.job_id);
        let mut conn = self.conn.clone();
        keys::push_result(&mut conn, &key, &payload, RESULT_RETENTION.as_millis() as u64).await?;
        Ok(())
    }

    async fn subscribe(&self, job_id: Uuid) -> Result<ResultPayload, QueueError> {
        let key = keys::result_key(&self.queue_key, &job_id);
        let mut conn = self.checkout().await?;
        let waited = keys::wait_result(&mut conn, &key, self.result_wait.as_secs_f64()).await?;
        self.checkin(conn);
        waited.ok_or(QueueError::Timeout(self.result_wait))
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        Ok(keys::queue_len(&mut conn, &self.queue_key).await?)
    }
}

/// Build the configured queue. A Redis queue that cannot be reached at
/// startup degrades to the in-process queue when the fallback is enabled.
pub async fn connect_queue(config: &ExecutorConfig) -> anyhow::Result<Arc<dyn JobQueue>> {
    match config.queue_backend {
        QueueBackend::Memory => {
            info!("Using in-process job queue");
            Ok(Arc::new(MemoryJobQueue::new(config.result_wait)))
        }
        QueueBackend::Redis => {
            match RedisJobQueue::connect(&config.redis_url, &config.queue_key, config.result_wait).await {
                Ok(queue) => {
                    info!(redis_url = %config.redis_url, queue_key = %config.queue_key, "Connected to Redis job queue");
                    Ok(Arc::new(queue))
                }
                Err(e) if config.queue_memory_fallback => {
                    warn!(
                        redis_url = %config.redis_url,
                        error = %e,
                        "Redis unreachable, falling back to in-process queue; queued jobs will not survive a restart"
                    );
                    Ok(Arc::new(MemoryJobQueue::new(config.result_wait)))
                }
                Err(e) => Err(anyhow::Error::new(e).context("Failed to connect to Redis job queue")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyexec_common::types::{ExecutionOutcome, Language};

    fn new_job(source: &str) -> NewJob {
        NewJob {
            language: Language::Python,
            source: source.to_string(),
            tests: vec![],
            trace_id: "trace-1".to_string(),
            submitter_id: Some("alice".to_string()),
        }
    }

    #[tokio::test]
    async fn test_enqueue_assigns_identity() {
        let queue = MemoryJobQueue::new(Duration::from_secs(1));
        let a = queue.enqueue(new_job("a")).await.unwrap();
        let b = queue.enqueue(new_job("b")).await.unwrap();
        assert_ne!(a.job_id, b.job_id);
        assert_eq!(a.trace_id, "trace-1");
        assert_eq!(queue.depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_take_is_fifo() {
        let queue = MemoryJobQueue::new(Duration::from_secs(1));
        for source in ["first", "second", "third"] {
            queue.enqueue(new_job(source)).await.unwrap();
        }
        assert_eq!(queue.take().await.unwrap().source, "first");
        assert_eq!(queue.take().await.unwrap().source, "second");
        assert_eq!(queue.take().await.unwrap().source, "third");
    }

    #[tokio::test]
    async fn test_take_blocks_until_enqueue() {
        let queue = Arc::new(MemoryJobQueue::new(Duration::from_secs(1)));
        let taker = tokio::spawn({
            let queue = queue.clone();
            async move { queue.take().await }
        });
        tokio::task::yield_now().await;
        assert!(!taker.is_finished());

        queue.enqueue(new_job("late")).await.unwrap();
        let job = taker.await.unwrap().unwrap();
        assert_eq!(job.source, "late");
    }

    #[tokio::test]
    async fn test_each_job_delivered_once() {
        let queue = Arc::new(MemoryJobQueue::new(Duration::from_secs(1)));
        for i in 0..20 {
            queue.enqueue(new_job(&i.to_string())).await.unwrap();
        }
        let mut takers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            takers.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..5 {
                    got.push(queue.take().await.unwrap().job_id);
                }
                got
            }));
        }
        let mut all = Vec::new();
        for taker in takers {
            all.extend(taker.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_before_publish() {
        let queue = Arc::new(MemoryJobQueue::new(Duration::from_secs(5)));
        let job = queue.enqueue(new_job("x")).await.unwrap();

        let waiter = tokio::spawn({
            let queue = queue.clone();
            let job_id = job.job_id;
            async move { queue.subscribe(job_id).await }
        });
        tokio::task::yield_now().await;

        let outcome = ExecutionOutcome {
            stdout: "4\n".to_string(),
            ..Default::default()
        };
        queue
            .publish_result(ResultPayload::completed(&job, vec![outcome]))
            .await
            .unwrap();

        let payload = waiter.await.unwrap().unwrap();
        assert!(payload.ok);
        assert_eq!(payload.results[0].stdout, "4\n");
    }

    #[tokio::test]
    async fn test_late_subscribe_gets_cached_result() {
        let queue = MemoryJobQueue::new(Duration::from_secs(5));
        let job = queue.enqueue(new_job("x")).await.unwrap();

        queue
            .publish_result(ResultPayload::failed(&job, "boom"))
            .await
            .unwrap();
        let payload = queue.subscribe(job.job_id).await.unwrap();
        assert!(!payload.ok);
        assert_eq!(payload.error.as_deref(), Some("boom"));
        assert_eq!(payload.job_id, job.job_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_times_out() {
        let hub = ResultHub::new(Duration::from_secs(30), RESULT_RETENTION);
        let err = hub.subscribe(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, QueueError::Timeout(d) if d == Duration::from_secs(30)));
        assert_eq!(hub.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_after_timeout_is_evicted() {
        let hub = ResultHub::new(Duration::from_secs(1), Duration::from_secs(10));
        let job = new_job("x").into_job();

        assert!(hub.subscribe(job.job_id).await.is_err());
        hub.publish(ResultPayload::completed(&job, vec![]));
        assert_eq!(hub.len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        let other = new_job("y").into_job();
        hub.publish(ResultPayload::completed(&other, vec![]));
        assert_eq!(hub.len(), 1);
        assert_eq!(hub.subscribe(other.job_id).await.unwrap().job_id, other.job_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_sweeps_uncollected_results() {
        let hub = ResultHub::new(Duration::from_secs(1), Duration::from_secs(10));
        for source in ["a", "b", "c"] {
            hub.publish(ResultPayload::completed(&new_job(source).into_job(), vec![]));
        }
        assert_eq!(hub.len(), 3);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(hub.subscribe(Uuid::new_v4()).await.is_err());
        assert_eq!(hub.len(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_takers_reuse_connections() {
        let key = format!("executor:test:{}", Uuid::new_v4());
        let queue = RedisJobQueue::connect("redis://127.0.0.1:6379", &key, Duration::from_secs(2))
            .await
            .unwrap();

        for source in ["a", "b", "c"] {
            queue.enqueue(new_job(source)).await.unwrap();
        }
        for _ in 0..3 {
            queue.take().await.unwrap();
            assert_eq!(queue.idle().len(), 1);
        }
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_queue_roundtrip() {
        let key = format!("executor:test:{}", Uuid::new_v4());
        let queue = RedisJobQueue::connect("redis://127.0.0.1:6379", &key, Duration::from_secs(2))
            .await
            .unwrap();

        let job = queue.enqueue(new_job("print(1)")).await.unwrap();
        let taken = queue.take().await.unwrap();
        assert_eq!(taken.job_id, job.job_id);

        queue
            .publish_result(ResultPayload::completed(&taken, vec![]))
            .await
            .unwrap();
        let payload = queue.subscribe(job.job_id).await.unwrap();
        assert_eq!(payload.job_id, job.job_id);
    }
}
