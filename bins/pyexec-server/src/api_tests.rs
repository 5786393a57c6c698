/// End-to-end tests through the HTTP router
///
/// These drive the full admission path (validation, screening, rate limits,
/// queue, worker pool, result delivery) against an in-process queue and a
/// scripted sandbox, so they run without Docker or Redis:
/// 1. Graded doubling program returns ordered, passing outcomes
/// 2. Forbidden tokens are rejected before the sandbox is touched
/// 3. Repeated timeouts block the submitter
/// 4. A stalled worker pool surfaces as a queue timeout, not an execution timeout

#[cfg(test)]
mod execute_endpoint_tests {
    use crate::guard::AbuseGuard;
    use crate::queue::MemoryJobQueue;
    use crate::store::{MemoryStateStore, StateStore};
    use crate::worker::{WorkerContext, WorkerPool};
    use crate::{app, AppState};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use pyexec_common::config::AbusePolicy;
    use pyexec_common::redis::streak_key;
    use pyexec_common::types::ExecutionOutcome;
    use pyexec_engine::{BatchRunner, RunRequest, Sandbox};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Doubles numeric stdin; anything with an infinite loop times out
    struct ScriptedSandbox {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Sandbox for ScriptedSandbox {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn ping(&self) -> bool {
            true
        }

        async fn run(&self, request: &RunRequest<'_>) -> anyhow::Result<ExecutionOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if request.source.contains("while True") {
                return Ok(ExecutionOutcome {
                    stdout: "partial".to_string(),
                    stderr: "[Execution timed out]".to_string(),
                    exit_code: Some(137),
                    timed_out: true,
                    signal: Some("SIGKILL".to_string()),
                    duration_ms: request.timeout.as_millis() as u64,
                    ..Default::default()
                });
            }
            let stdout = match request.stdin.trim() {
                "" => String::new(),
                stdin => format!("{}\n", stdin.parse::<i64>()? * 2),
            };
            Ok(ExecutionOutcome {
                stdout,
                exit_code: Some(0),
                duration_ms: 12,
                ..Default::default()
            })
        }
    }

    struct Harness {
        app: Router,
        sandbox: Arc<ScriptedSandbox>,
        store: Arc<MemoryStateStore>,
        pool: Option<WorkerPool>,
    }

    fn harness(workers: usize, result_wait: Duration) -> Harness {
        harness_with(workers, result_wait, AbusePolicy::default(), false)
    }

    fn harness_with(workers: usize, result_wait: Duration, policy: AbusePolicy, trust_proxy: bool) -> Harness {
        let _ = crate::metrics::register();

        let sandbox = Arc::new(ScriptedSandbox {
            runs: AtomicUsize::new(0),
        });
        let store = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(MemoryJobQueue::new(result_wait));
        let runner = Arc::new(BatchRunner::new(sandbox.clone(), None, Duration::from_secs(3)));
        let guard = Arc::new(AbuseGuard::new(store.clone(), policy));

        let pool = (workers > 0).then(|| {
            WorkerPool::start(
                workers,
                WorkerContext {
                    queue: queue.clone(),
                    runner: runner.clone(),
                    guard: guard.clone(),
                },
            )
        });

        let state = Arc::new(AppState {
            queue,
            guard,
            runner,
            allowed_modules: vec!["math".to_string(), "random".to_string(), "statistics".to_string()],
            trust_proxy,
        });

        Harness {
            app: app(state),
            sandbox,
            store,
            pool,
        }
    }

    async fn post_execute(app: &Router, submitter: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .header("x-trace-id", "trace-abc");
        if let Some(submitter) = submitter {
            request = request.header("x-user-id", submitter);
        }

        let response = app
            .clone()
            .oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    /// POST /execute as if from `peer`, with a caller-chosen X-Forwarded-For
    async fn post_forwarded(app: &Router, peer: &str, forwarded: &str) -> StatusCode {
        let peer: SocketAddr = peer.parse().unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .header("x-forwarded-for", forwarded)
            .extension(ConnectInfo(peer))
            .body(Body::from(json!({ "source": "print(1)" }).to_string()))
            .unwrap();
        app.clone().oneshot(request).await.unwrap().status()
    }

    async fn stop(harness: Harness) {
        if let Some(pool) = harness.pool {
            pool.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_doubling_program_passes_both_tests() {
        let harness = harness(2, Duration::from_secs(5));

        let (status, body) = post_execute(
            &harness.app,
            Some("alice"),
            json!({
                "source": "n = int(input()); print(n*2)",
                "tests": [
                    { "stdin": "2\n", "expectedStdout": "4\n" },
                    { "stdin": "5\n", "expectedStdout": "10\n" }
                ]
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["traceId"], "trace-abc");
        assert_eq!(body["submitterId"], "alice");
        assert!(body["jobId"].is_string());
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["passed"], true);
        assert_eq!(results[1]["passed"], true);
        assert_eq!(results[1]["stdout"], "10\n");
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_no_tests_runs_once_ungraded() {
        let harness = harness(1, Duration::from_secs(5));

        let (status, body) = post_execute(&harness.app, None, json!({ "source": "print(0)" })).await;

        assert_eq!(status, StatusCode::OK);
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].get("passed").is_none());
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_forbidden_token_never_reaches_sandbox() {
        let harness = harness(1, Duration::from_secs(5));

        let (status, body) = post_execute(
            &harness.app,
            Some("mallory"),
            json!({ "source": "import subprocess\nsubprocess.run(['sh'])" }),
        )
        .await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "FORBIDDEN_TOKEN");
        assert!(body.get("jobId").is_none());
        assert_eq!(harness.sandbox.runs.load(Ordering::SeqCst), 0);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_disallowed_import_rejected_as_unsafe() {
        let harness = harness(1, Duration::from_secs(5));

        let (status, body) = post_execute(&harness.app, None, json!({ "source": "import os\nprint(1)" })).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Source failed safety checks");
        assert!(!body["issues"].as_array().unwrap().is_empty());
        assert_eq!(harness.sandbox.runs.load(Ordering::SeqCst), 0);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_invalid_body_is_structured_client_error() {
        let harness = harness(0, Duration::from_secs(1));

        let (status, body) = post_execute(
            &harness.app,
            None,
            json!({ "language": "ruby", "source": "", "tests": [{ "timeoutMs": 50 }] }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "INVALID_REQUEST");
        assert_eq!(body["problems"].as_array().unwrap().len(), 3);

        let (status, _) = post_execute(&harness.app, None, json!({ "source": 42 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_timeouts_increment_streak_then_block() {
        let harness = harness(1, Duration::from_secs(5));
        let looping = json!({
            "source": "while True:\n    pass",
            "tests": [{ "timeoutMs": 500 }]
        });

        let (status, body) = post_execute(&harness.app, Some("bob"), looping.clone()).await;
        assert_eq!(status, StatusCode::OK);
        let outcome = &body["results"][0];
        assert_eq!(outcome["timedOut"], true);
        assert_eq!(outcome["exitCode"], 137);
        assert_eq!(outcome["stdout"], "");
        assert_eq!(harness.store.get(&streak_key("bob")).await.unwrap(), Some(1));

        for _ in 0..2 {
            let (status, _) = post_execute(&harness.app, Some("bob"), looping.clone()).await;
            assert_eq!(status, StatusCode::OK);
        }

        let runs_before = harness.sandbox.runs.load(Ordering::SeqCst);
        let (status, body) = post_execute(
            &harness.app,
            Some("bob"),
            json!({ "source": "n = int(input()); print(n*2)", "tests": [{ "stdin": "1" }] }),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["code"], "TIMEOUT_BLOCK");
        assert_eq!(harness.sandbox.runs.load(Ordering::SeqCst), runs_before);

        let (status, _) = post_execute(
            &harness.app,
            Some("carol"),
            json!({ "source": "n = int(input()); print(n*2)", "tests": [{ "stdin": "1" }] }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_stalled_pool_is_queue_timeout() {
        // No workers: the job is accepted but nobody picks it up
        let harness = harness(0, Duration::from_millis(100));

        let (status, body) = post_execute(
            &harness.app,
            None,
            json!({ "source": "n = int(input()); print(n*2)", "tests": [{ "stdin": "3" }] }),
        )
        .await;

        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"], "Execution timed out while waiting for results.");
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_batch_failure_is_server_error() {
        let harness = harness(1, Duration::from_secs(5));

        // The scripted sandbox cannot parse this stdin and reports an infrastructure error
        let (status, body) = post_execute(
            &harness.app,
            None,
            json!({ "source": "print(int(input()))", "tests": [{ "stdin": "not a number" }] }),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["ok"], false);
        assert_eq!(body["results"].as_array().unwrap().len(), 0);
        assert!(body["error"].is_string());
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_health_ready_and_metrics() {
        let harness = harness(0, Duration::from_secs(1));

        let get = |uri: &'static str| {
            let app = harness.app.clone();
            async move {
                app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                    .await
                    .unwrap()
            }
        };

        assert_eq!(get("/health").await.status(), StatusCode::OK);

        let ready = get("/ready").await;
        assert_eq!(ready.status(), StatusCode::OK);
        let bytes = ready.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["services"]["sandbox"], "scripted");
        assert_eq!(body["services"]["queueBackend"], "memory");

        let metrics = get("/metrics").await;
        assert_eq!(metrics.status(), StatusCode::OK);
        let bytes = metrics.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("executor_jobs_in_flight"));
        stop(harness).await;
    }

    fn two_per_origin() -> AbusePolicy {
        AbusePolicy {
            origin_requests_per_window: 2,
            burst_multiplier: 1,
            ..AbusePolicy::default()
        }
    }

    #[tokio::test]
    async fn test_forged_forwarded_header_shares_peer_limit() {
        let harness = harness_with(1, Duration::from_secs(5), two_per_origin(), false);

        assert_eq!(post_forwarded(&harness.app, "198.51.100.5:4000", "10.9.9.0").await, StatusCode::OK);
        assert_eq!(post_forwarded(&harness.app, "198.51.100.5:4001", "10.9.9.1").await, StatusCode::OK);
        assert_eq!(
            post_forwarded(&harness.app, "198.51.100.5:4002", "10.9.9.2").await,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(post_forwarded(&harness.app, "198.51.100.6:4000", "10.9.9.2").await, StatusCode::OK);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_forwarded_header_honoured_behind_trusted_proxy() {
        let harness = harness_with(1, Duration::from_secs(5), two_per_origin(), true);

        for client in ["203.0.113.1", "203.0.113.2", "203.0.113.3"] {
            assert_eq!(post_forwarded(&harness.app, "10.0.0.1:4000", client).await, StatusCode::OK);
        }
        stop(harness).await;
    }
}
