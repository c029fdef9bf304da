//! Sliding-window rate limiting backed by the kv store.
//!
//! Quotas are enforced per (identity, limit name, window) as sorted sets of
//! request timestamps. When the kv store is unreachable the limiter fails
//! open: availability wins over strictness, and the grant is flagged so the
//! caller can surface a warning.

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::config::TierQuotas;
use crate::kv::{KvClient, KvError};
use crate::metrics::Metrics;
use crate::providers::ProviderId;

/// Outcome of one limit check.
#[derive(Debug, Clone)]
pub struct WindowDecision {
    pub limit_name: String,
    pub allowed: bool,
    pub retry_after_secs: u64,
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: u64,
    pub window_seconds: u64,
    /// True when the kv store was unreachable and the request was allowed
    /// without counting.
    pub fail_open: bool,
}

#[derive(Debug, Clone)]
pub struct LimitRule {
    pub name: &'static str,
    pub window_seconds: u64,
    pub max_requests: u64,
    pub burst_allowance: u64,
}

/// Endpoint families with their own quotas on top of the generic ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointCategory {
    Standard,
    Upload,
    Translation,
}

/// The applicable limits for a tier and endpoint family. All returned
/// limits are checked; the most restrictive one decides.
pub fn limits_for(quotas: TierQuotas, category: EndpointCategory) -> Vec<LimitRule> {
    let mut limits = vec![
        LimitRule {
            name: "per_minute",
            window_seconds: 60,
            max_requests: quotas.per_minute,
            burst_allowance: quotas.burst,
        },
        LimitRule {
            name: "per_day",
            window_seconds: 86_400,
            max_requests: quotas.per_day,
            burst_allowance: 0,
        },
    ];

    match category {
        EndpointCategory::Standard => {}
        // Floors keep the extra limits from undercutting small tiers'
        // advertised generic quota.
        EndpointCategory::Upload => limits.push(LimitRule {
            name: "uploads_per_minute",
            window_seconds: 60,
            max_requests: (quotas.per_minute / 4).max(10),
            burst_allowance: 0,
        }),
        EndpointCategory::Translation => limits.push(LimitRule {
            name: "llm_per_minute",
            window_seconds: 60,
            max_requests: (quotas.per_minute / 2).max(10),
            burst_allowance: 0,
        }),
    }

    limits
}

/// `retry_after = window − (now − oldest) + 1`, clamped into
/// `(0, window]` so invariant 3 holds even with clock skew in the set.
pub fn compute_retry_after(window_seconds: u64, now: f64, oldest_score: Option<f64>) -> u64 {
    let Some(oldest) = oldest_score else {
        return window_seconds;
    };
    let elapsed = (now - oldest).max(0.0);
    let remaining = window_seconds as f64 - elapsed + 1.0;
    (remaining.ceil() as u64).clamp(1, window_seconds)
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Clone)]
pub struct SlidingWindowLimiter {
    kv: KvClient,
    metrics: Metrics,
}

impl SlidingWindowLimiter {
    pub fn new(kv: KvClient, metrics: Metrics) -> Self {
        Self { kv, metrics }
    }

    /// Check one limit for an identity and, when allowed, count the request.
    pub async fn check(&self, identity: &str, rule: &LimitRule) -> WindowDecision {
        let now = unix_now();
        let window_start = now - rule.window_seconds as f64;
        let key = format!(
            "rate_limit:{identity}:{}:{}",
            rule.name, rule.window_seconds
        );
        let effective_limit = rule.max_requests + rule.burst_allowance;

        let current = match self.kv.window_prune_and_count(&key, window_start).await {
            Ok(count) => count,
            Err(err) => return self.fail_open(rule, err),
        };

        if current >= effective_limit {
            let oldest = self.kv.window_oldest_score(&key).await.ok().flatten();
            let retry_after = compute_retry_after(rule.window_seconds, now, oldest);
            self.metrics
                .rate_limit_denied
                .with_label_values(&[rule.name])
                .inc();
            return WindowDecision {
                limit_name: rule.name.to_string(),
                allowed: false,
                retry_after_secs: retry_after,
                current,
                limit: rule.max_requests,
                remaining: 0,
                reset_at: (now as u64) + retry_after,
                window_seconds: rule.window_seconds,
                fail_open: false,
            };
        }

        // Member carries a nonce so same-millisecond requests never collapse
        // into one sorted-set entry.
        let member = format!("{now}:{}", Uuid::new_v4().simple());
        if let Err(err) = self
            .kv
            .window_record(&key, &member, now, rule.window_seconds + 60)
            .await
        {
            return self.fail_open(rule, err);
        }

        let reset_at = match self.kv.window_oldest_score(&key).await {
            Ok(Some(oldest)) => (oldest + rule.window_seconds as f64) as u64,
            _ => (now as u64) + rule.window_seconds,
        };

        WindowDecision {
            limit_name: rule.name.to_string(),
            allowed: true,
            retry_after_secs: 0,
            current: current + 1,
            limit: rule.max_requests,
            remaining: effective_limit.saturating_sub(current + 1),
            reset_at,
            window_seconds: rule.window_seconds,
            fail_open: false,
        }
    }

    /// Check every applicable rule; the first denial wins. On a grant,
    /// returns the decision with the least headroom for response headers.
    pub async fn check_all(
        &self,
        identity: &str,
        rules: &[LimitRule],
    ) -> Result<WindowDecision, WindowDecision> {
        let mut tightest: Option<WindowDecision> = None;
        for rule in rules {
            let decision = self.check(identity, rule).await;
            if !decision.allowed {
                return Err(decision);
            }
            let replace = tightest
                .as_ref()
                .map(|best| decision.remaining < best.remaining)
                .unwrap_or(true);
            if replace {
                tightest = Some(decision);
            }
        }
        Ok(tightest.unwrap_or_else(|| WindowDecision {
            limit_name: "none".into(),
            allowed: true,
            retry_after_secs: 0,
            current: 0,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_at: unix_now() as u64,
            window_seconds: 0,
            fail_open: false,
        }))
    }

    fn fail_open(&self, rule: &LimitRule, err: KvError) -> WindowDecision {
        tracing::warn!(limit = rule.name, error = %err, "rate limiting disabled: kv store unreachable");
        self.metrics.rate_limit_fail_open.inc();
        WindowDecision {
            limit_name: rule.name.to_string(),
            allowed: true,
            retry_after_secs: 0,
            current: 0,
            limit: rule.max_requests,
            remaining: rule.max_requests,
            reset_at: (unix_now() as u64) + rule.window_seconds,
            window_seconds: rule.window_seconds,
            fail_open: true,
        }
    }
}

/// Reason a provider-scoped check said no.
#[derive(Debug, Clone)]
pub enum LlmDenied {
    RequestsPerMinute { used: u64, limit: u64 },
    TokensPerMinute { used: u64, limit: u64, estimated: u64 },
}

/// Provider-scoped request and token windows consulted by the orchestrator
/// before every LLM call.
#[derive(Clone)]
pub struct ProviderUsageLimiter {
    kv: KvClient,
}

impl ProviderUsageLimiter {
    pub fn new(kv: KvClient) -> Self {
        Self { kv }
    }

    pub async fn check(
        &self,
        user_id: &str,
        provider: ProviderId,
        estimated_tokens: u64,
        requests_per_minute: u64,
        tokens_per_minute: u64,
    ) -> Result<(), LlmDenied> {
        let now = unix_now();
        let window_start = now - 60.0;

        let requests_key = format!("llm_rate:{user_id}:{provider}:requests:60");
        // Fail open on kv errors, same policy as the request limiter.
        let requests_used = self
            .kv
            .window_prune_and_count(&requests_key, window_start)
            .await
            .unwrap_or(0);
        if requests_used >= requests_per_minute {
            return Err(LlmDenied::RequestsPerMinute {
                used: requests_used,
                limit: requests_per_minute,
            });
        }

        if estimated_tokens > 0 {
            let tokens_key = format!("llm_rate:{user_id}:{provider}:tokens:60");
            let tokens_used = self
                .kv
                .window_sum(&tokens_key, window_start)
                .await
                .unwrap_or(0);
            if tokens_used + estimated_tokens > tokens_per_minute {
                return Err(LlmDenied::TokensPerMinute {
                    used: tokens_used,
                    limit: tokens_per_minute,
                    estimated: estimated_tokens,
                });
            }
        }

        Ok(())
    }

    pub async fn record(&self, user_id: &str, provider: ProviderId, tokens_used: u64) {
        let now = unix_now();
        let requests_key = format!("llm_rate:{user_id}:{provider}:requests:60");
        let member = format!("{now}:{}", Uuid::new_v4().simple());
        let _ = self.kv.window_record(&requests_key, &member, now, 120).await;

        if tokens_used > 0 {
            let tokens_key = format!("llm_rate:{user_id}:{provider}:tokens:60");
            let member = format!("{now}:{tokens_used}:{}", Uuid::new_v4().simple());
            let _ = self.kv.window_record(&tokens_key, &member, now, 120).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quotas() -> TierQuotas {
        TierQuotas {
            per_minute: 10,
            per_day: 1_000,
            burst: 0,
        }
    }

    #[test]
    fn standard_endpoints_get_minute_and_day_limits() {
        let limits = limits_for(quotas(), EndpointCategory::Standard);
        let names: Vec<_> = limits.iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["per_minute", "per_day"]);
        assert_eq!(limits[0].max_requests, 10);
        assert_eq!(limits[0].burst_allowance, 0);
    }

    #[test]
    fn upload_quota_never_undercuts_a_small_tier() {
        let limits = limits_for(quotas(), EndpointCategory::Upload);
        let upload = limits
            .iter()
            .find(|l| l.name == "uploads_per_minute")
            .unwrap();
        assert_eq!(upload.max_requests, 10);

        let generous = TierQuotas {
            per_minute: 120,
            per_day: 50_000,
            burst: 10,
        };
        let limits = limits_for(generous, EndpointCategory::Upload);
        let upload = limits
            .iter()
            .find(|l| l.name == "uploads_per_minute")
            .unwrap();
        assert_eq!(upload.max_requests, 30);
    }

    #[test]
    fn translation_endpoints_add_a_half_quota() {
        let generous = TierQuotas {
            per_minute: 60,
            per_day: 10_000,
            burst: 10,
        };
        let limits = limits_for(generous, EndpointCategory::Translation);
        let llm = limits.iter().find(|l| l.name == "llm_per_minute").unwrap();
        assert_eq!(llm.max_requests, 30);
    }

    #[test]
    fn retry_after_stays_inside_the_window() {
        // Oldest entry right at the start of the window.
        let retry = compute_retry_after(60, 1_000.0, Some(940.0));
        assert!(retry >= 1 && retry <= 60, "retry={retry}");

        // Fresh entry: nearly the whole window remains.
        let retry = compute_retry_after(60, 1_000.0, Some(999.5));
        assert!(retry >= 1 && retry <= 60, "retry={retry}");

        // Pathological: oldest newer than now still clamps.
        let retry = compute_retry_after(60, 1_000.0, Some(2_000.0));
        assert!(retry >= 1 && retry <= 60, "retry={retry}");

        // Empty window falls back to the window length.
        assert_eq!(compute_retry_after(60, 1_000.0, None), 60);
    }
}
