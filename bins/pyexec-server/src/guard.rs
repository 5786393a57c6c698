/// Abuse Guard - Admission Control
///
/// Three checks, all decided before a job exists:
/// 1. Static blacklist scan of the source (cheap, runs first)
/// 2. Fixed-window rate limits, per submitter and per origin, independently
/// 3. Timeout-streak blocking: repeated timed-out runs suspend a submitter
///
/// The streak itself is fed after execution, by the worker, from each
/// job's outcomes.
///
/// State lives in a `StateStore`. Store failures fail open: an unreachable
/// store must not take admission down with it.

use crate::store::StateStore;
use pyexec_common::config::AbusePolicy;
use pyexec_common::redis::{block_key, rate_key, streak_key};
use pyexec_common::screening::find_blacklisted_tokens;
use pyexec_common::types::ExecutionOutcome;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Submitter,
    Origin,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Submitter => "submitter",
            Scope::Origin => "origin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    ForbiddenToken { tokens: Vec<&'static str> },
    RateLimited { scope: Scope, retry_after: Duration },
    Blocked { retry_after: Duration },
}

impl Rejection {
    /// Label for the rejection metric
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::ForbiddenToken { .. } => "forbidden_token",
            Rejection::RateLimited { scope: Scope::Submitter, .. } => "rate_limit_submitter",
            Rejection::RateLimited { scope: Scope::Origin, .. } => "rate_limit_origin",
            Rejection::Blocked { .. } => "timeout_block",
        }
    }
}

fn snippet(source: &str) -> String {
    let mut chars = source.chars();
    let head: String = chars.by_ref().take(SNIPPET_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

pub struct AbuseGuard {
    store: Arc<dyn StateStore>,
    policy: AbusePolicy,
}

impl AbuseGuard {
    pub fn new(store: Arc<dyn StateStore>, policy: AbusePolicy) -> Self {
        Self { store, policy }
    }

    /// Reject source containing any blacklisted token
    pub fn screen_source(
        &self,
        source: &str,
        submitter_id: Option<&str>,
        origin: Option<&str>,
    ) -> Result<(), Rejection> {
        let tokens = find_blacklisted_tokens(source);
        if tokens.is_empty() {
            return Ok(());
        }

        error!(
            submitter_id = submitter_id.unwrap_or("-"),
            origin = origin.unwrap_or("-"),
            forbidden_tokens = ?tokens,
            code_snippet = %snippet(source),
            "forbidden_token_detected"
        );
        Err(Rejection::ForbiddenToken { tokens })
    }

    /// Block check, then submitter rate limit, then origin rate limit
    pub async fn admit(&self, submitter_id: Option<&str>, origin: Option<&str>) -> Result<(), Rejection> {
        if let Some(submitter) = submitter_id {
            match self.store.ttl(&block_key(submitter)).await {
                Ok(Some(retry_after)) => {
                    warn!(
                        submitter_id = submitter,
                        origin = origin.unwrap_or("-"),
                        reason = "submitter_blocked_due_to_timeouts",
                        retry_after_ms = retry_after.as_millis() as u64,
                        "ratelimit_block"
                    );
                    return Err(Rejection::Blocked { retry_after });
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Block lookup failed, admitting"),
            }

            self.check_rate(Scope::Submitter, submitter, self.policy.submitter_limit(), submitter_id, origin)
                .await?;
        }

        if let Some(ip) = origin {
            self.check_rate(Scope::Origin, ip, self.policy.origin_limit(), submitter_id, origin)
                .await?;
        }

        Ok(())
    }

    async fn check_rate(
        &self,
        scope: Scope,
        id: &str,
        limit: u64,
        submitter_id: Option<&str>,
        origin: Option<&str>,
    ) -> Result<(), Rejection> {
        let (count, retry_after) = match self.store.incr(&rate_key(scope.as_str(), id), self.policy.window, false).await {
            Ok(counted) => counted,
            Err(e) => {
                warn!(scope = scope.as_str(), error = %e, "Rate counter unavailable, admitting");
                return Ok(());
            }
        };

        if count > limit {
            warn!(
                submitter_id = submitter_id.unwrap_or("-"),
                origin = origin.unwrap_or("-"),
                scope = scope.as_str(),
                limit,
                count,
                retry_after_ms = retry_after.as_millis() as u64,
                "ratelimit_block"
            );
            return Err(Rejection::RateLimited { scope, retry_after });
        }
        Ok(())
    }

    /// Feed a finished job's outcomes into the submitter's timeout streak.
    /// Every timeout extends the streak and refreshes its TTL; other outcomes
    /// leave it alone, so it only lapses after a quiet `block_duration`.
    /// Reaching the threshold blocks the submitter and clears the streak.
    /// Returns the streak left behind.
    pub async fn record_outcomes(&self, submitter_id: Option<&str>, outcomes: &[ExecutionOutcome]) -> u64 {
        let Some(submitter) = submitter_id else {
            return 0;
        };
        let key = streak_key(submitter);

        if !outcomes.iter().any(|outcome| outcome.timed_out) {
            return match self.store.get(&key).await {
                Ok(streak) => streak.unwrap_or(0),
                Err(e) => {
                    warn!(error = %e, "Failed to read timeout streak");
                    0
                }
            };
        }

        let mut streak = 0;
        for outcome in outcomes.iter().filter(|outcome| outcome.timed_out) {
            streak = match self.store.incr(&key, self.policy.block_duration, true).await {
                Ok((count, _)) => count,
                Err(e) => {
                    warn!(error = %e, "Failed to record timeout streak");
                    return streak;
                }
            };
            info!(submitter_id = submitter, streak, "execution_timeout");

            if streak >= self.policy.max_consecutive_timeouts {
                if let Err(e) = self.store.set_until(&block_key(submitter), self.policy.block_duration).await {
                    error!(error = %e, "Failed to block submitter");
                    return streak;
                }
                if let Err(e) = self.store.delete(&key).await {
                    warn!(error = %e, "Failed to reset timeout streak");
                }
                warn!(
                    submitter_id = submitter,
                    streak,
                    block_duration_ms = self.policy.block_duration.as_millis() as u64,
                    "submitter_blocked"
                );
                return 0;
            }
        }
        streak
    }
}
