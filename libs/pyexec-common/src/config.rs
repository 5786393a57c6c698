// Service configuration, sourced from the environment
use anyhow::{bail, Context, Result};
use std::time::Duration;

use crate::redis::DEFAULT_QUEUE_KEY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbuseStoreBackend {
    Memory,
    Redis,
}

/// Throttling thresholds applied by the abuse guard
#[derive(Debug, Clone, PartialEq)]
pub struct AbusePolicy {
    pub submitter_requests_per_window: u64,
    pub origin_requests_per_window: u64,
    pub burst_multiplier: u64,
    pub window: Duration,
    pub max_consecutive_timeouts: u64,
    pub block_duration: Duration,
}

impl Default for AbusePolicy {
    fn default() -> Self {
        Self {
            submitter_requests_per_window: 10,
            origin_requests_per_window: 60,
            burst_multiplier: 2,
            window: Duration::from_secs(60),
            max_consecutive_timeouts: 3,
            block_duration: Duration::from_secs(60),
        }
    }
}

impl AbusePolicy {
    pub fn submitter_limit(&self) -> u64 {
        self.submitter_requests_per_window * self.burst_multiplier
    }

    pub fn origin_limit(&self) -> u64 {
        self.origin_requests_per_window * self.burst_multiplier
    }
}

/// Sandbox limits. Fixed per deployment; submitted code cannot alter them.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    pub image: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub default_timeout: Duration,
    pub allowed_modules: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub port: u16,
    pub redis_url: String,
    pub queue_key: String,
    pub queue_backend: QueueBackend,
    pub queue_memory_fallback: bool,
    pub max_concurrency: usize,
    pub limits: SandboxLimits,
    pub docker_socket_path: String,
    pub enable_local_fallback: bool,
    pub python_bin: String,
    pub result_wait: Duration,
    /// Take the client address from `X-Forwarded-For` instead of the peer
    pub trust_proxy: bool,
    pub abuse_store: AbuseStoreBackend,
    pub abuse: AbusePolicy,
}

const MIN_MEMORY_BYTES: i64 = 64 * 1024 * 1024;
const MIN_TIMEOUT_MS: u64 = 500;

impl ExecutorConfig {
    /// Load from process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Missing keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = parse_or(&get, "EXECUTOR_PORT", 4060u16)?;
        if port == 0 {
            bail!("EXECUTOR_PORT must be positive");
        }

        let redis_url = get("EXECUTOR_REDIS_URL")
            .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());
        let queue_key = get("EXECUTOR_QUEUE_KEY").unwrap_or_else(|| DEFAULT_QUEUE_KEY.to_string());

        let queue_backend = match get("EXECUTOR_QUEUE_BACKEND").as_deref().map(str::to_lowercase) {
            None => QueueBackend::Redis,
            Some(v) if v == "redis" => QueueBackend::Redis,
            Some(v) if v == "memory" => QueueBackend::Memory,
            Some(v) => bail!("EXECUTOR_QUEUE_BACKEND must be 'redis' or 'memory', got '{}'", v),
        };
        let queue_memory_fallback = parse_bool(&get, "EXECUTOR_QUEUE_MEMORY_FALLBACK", true)?;

        let max_concurrency = parse_or(&get, "EXECUTOR_MAX_CONCURRENCY", 5usize)?;
        if !(1..=20).contains(&max_concurrency) {
            bail!("EXECUTOR_MAX_CONCURRENCY must be between 1 and 20, got {}", max_concurrency);
        }

        let image = get("EXECUTOR_DOCKER_IMAGE").unwrap_or_else(|| "python:3.12-alpine".to_string());

        let memory_bytes = parse_or(&get, "EXECUTOR_MEM_LIMIT", 256 * 1024 * 1024i64)?;
        if memory_bytes < MIN_MEMORY_BYTES {
            bail!("EXECUTOR_MEM_LIMIT must be at least {} bytes", MIN_MEMORY_BYTES);
        }

        let nano_cpus = parse_or(&get, "EXECUTOR_NANO_CPUS", 1_000_000_000i64)?;
        if nano_cpus < 1 {
            bail!("EXECUTOR_NANO_CPUS must be positive");
        }

        let pids_limit = parse_or(&get, "EXECUTOR_PIDS_LIMIT", 128i64)?;
        if pids_limit < 1 {
            bail!("EXECUTOR_PIDS_LIMIT must be positive");
        }

        // Seconds, fractional allowed
        let timeout_secs = parse_or(&get, "EXECUTOR_TIMEOUT", 3.0f64)?;
        let timeout_ms = (timeout_secs * 1000.0).round();
        if !timeout_ms.is_finite() || (timeout_ms as u64) < MIN_TIMEOUT_MS {
            bail!("EXECUTOR_TIMEOUT must be at least {}ms", MIN_TIMEOUT_MS);
        }

        let allowed_modules = match get("EXECUTOR_ALLOWED_MODULES") {
            Some(raw) => serde_json::from_str::<Vec<String>>(&raw)
                .context("EXECUTOR_ALLOWED_MODULES must be a JSON array of strings")?,
            None => vec!["math".to_string(), "random".to_string(), "statistics".to_string()],
        };

        let docker_socket_path =
            get("DOCKER_SOCKET_PATH").unwrap_or_else(|| "/var/run/docker.sock".to_string());
        let enable_local_fallback = parse_bool(&get, "EXECUTOR_LOCAL_FALLBACK", true)?;
        let trust_proxy = parse_bool(&get, "EXECUTOR_TRUST_PROXY", false)?;
        let python_bin = get("EXECUTOR_PYTHON_BIN").unwrap_or_else(|| "python3".to_string());

        let result_wait_ms = parse_or(&get, "EXECUTOR_RESULT_WAIT_MS", 30_000u64)?;

        let abuse_store = match get("EXECUTOR_ABUSE_STORE").as_deref().map(str::to_lowercase) {
            None => AbuseStoreBackend::Memory,
            Some(v) if v == "memory" => AbuseStoreBackend::Memory,
            Some(v) if v == "redis" => AbuseStoreBackend::Redis,
            Some(v) => bail!("EXECUTOR_ABUSE_STORE must be 'memory' or 'redis', got '{}'", v),
        };

        let defaults = AbusePolicy::default();
        let abuse = AbusePolicy {
            submitter_requests_per_window: parse_or(
                &get,
                "EXECUTOR_RATE_SUBMITTER_PER_MIN",
                defaults.submitter_requests_per_window,
            )?,
            origin_requests_per_window: parse_or(
                &get,
                "EXECUTOR_RATE_ORIGIN_PER_MIN",
                defaults.origin_requests_per_window,
            )?,
            burst_multiplier: parse_or(&get, "EXECUTOR_BURST_MULTIPLIER", defaults.burst_multiplier)?,
            window: defaults.window,
            max_consecutive_timeouts: parse_or(
                &get,
                "EXECUTOR_MAX_CONSECUTIVE_TIMEOUTS",
                defaults.max_consecutive_timeouts,
            )?,
            block_duration: Duration::from_millis(parse_or(
                &get,
                "EXECUTOR_BLOCK_DURATION_MS",
                defaults.block_duration.as_millis() as u64,
            )?),
        };
        if abuse.max_consecutive_timeouts == 0 {
            bail!("EXECUTOR_MAX_CONSECUTIVE_TIMEOUTS must be positive");
        }

        Ok(Self {
            port,
            redis_url,
            queue_key,
            queue_backend,
            queue_memory_fallback,
            max_concurrency,
            limits: SandboxLimits {
                image,
                memory_bytes,
                nano_cpus,
                pids_limit,
                default_timeout: Duration::from_millis(timeout_ms as u64),
                allowed_modules,
            },
            docker_socket_path,
            enable_local_fallback,
            python_bin,
            result_wait: Duration::from_millis(result_wait_ms),
            trust_proxy,
            abuse_store,
            abuse,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", key, raw, e)),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).as_deref().map(str::trim) {
        None => Ok(default),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => bail!("Invalid boolean for {}: '{}'", key, other),
    }
}
