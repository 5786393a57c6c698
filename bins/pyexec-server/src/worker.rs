/// Worker Pool - Bounded Job Consumers
///
/// `N` independent loops, each: take a job, run its batch, publish the result.
/// Every job resolves: a batch error or a panic inside the batch is published
/// as `ok: false` and the loop moves on to the next job.
///
/// Job lifecycle seen from here: queued -> in-flight -> completed | failed.
/// There is no cancellation once a job has been taken.

use crate::guard::AbuseGuard;
use crate::metrics;
use crate::queue::JobQueue;
use pyexec_common::types::{Job, ResultPayload};
use pyexec_engine::BatchRunner;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

const TAKE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What a worker needs to process a job
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn JobQueue>,
    pub runner: Arc<BatchRunner>,
    pub guard: Arc<AbuseGuard>,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn start(concurrency: usize, context: WorkerContext) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let handles = (1..=concurrency)
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, context.clone(), signal.clone())))
            .collect();

        info!(concurrency, "Worker pool started");
        Self { handles, shutdown }
    }

    /// Stop taking new jobs and wait for in-flight jobs to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in futures_util::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker loop ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(worker_id: usize, context: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let taken = tokio::select! {
            _ = shutdown.changed() => break,
            taken = context.queue.take() => taken,
        };

        match taken {
            Ok(job) => process_job(worker_id, job, &context).await,
            Err(e) => {
                error!(worker_id, error = %e, "Failed to take job from queue");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(TAKE_RETRY_DELAY) => {}
                }
            }
        }
    }
}

async fn process_job(worker_id: usize, job: Job, context: &WorkerContext) {
    let span = info_span!(
        "job",
        trace_id = %job.trace_id,
        job_id = %job.job_id,
        worker_id,
        submitter_id = job.submitter_id.as_deref().unwrap_or("-"),
    );

    async move {
        let queue_wait_ms = job.age_ms();
        metrics::QUEUE_WAIT_MS.observe(queue_wait_ms as f64);
        info!(queue_wait_ms, tests = job.tests.len(), "worker_job_started");

        metrics::JOBS_IN_FLIGHT.inc();
        let started = Instant::now();

        // Own task so a panic in the batch cannot take the loop down
        let batch = tokio::spawn({
            let runner = context.runner.clone();
            let source = job.source.clone();
            let tests = job.tests.clone();
            async move { runner.run(&source, &tests).await }.in_current_span()
        });

        let payload = match batch.await {
            Ok(Ok(results)) => {
                metrics::record_outcomes(&results);
                let streak = context
                    .guard
                    .record_outcomes(job.submitter_id.as_deref(), &results)
                    .await;
                info!(timeout_streak = streak, "Batch finished");
                ResultPayload::completed(&job, results)
            }
            Ok(Err(e)) => {
                error!(error = %e, "worker_execution_failed");
                ResultPayload::failed(&job, e.to_string())
            }
            Err(e) => {
                error!(error = %e, "worker_execution_failed");
                ResultPayload::failed(&job, "Execution worker crashed")
            }
        };
        metrics::JOBS_IN_FLIGHT.dec();

        let ok = payload.ok;
        if let Err(e) = context.queue.publish_result(payload).await {
            error!(error = %e, "Failed to publish job result");
        }
        info!(ok, duration_ms = started.elapsed().as_millis() as u64, "worker_job_completed");
    }
    .instrument(span)
    .await
}
