//! Per-provider circuit breaker.
//!
//! Process-local by design: each instance observes provider failures
//! independently and converges on its own. State machine: closed → open
//! after enough consecutive failures, open → half-open once the cool-down
//! elapses (or a background probe reports healthy), half-open → closed
//! after enough consecutive successes, any half-open failure → open.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::metrics::Metrics;

const RECENT_FAILURES_KEPT: usize = 25;

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::HalfOpen => "half-open",
            BreakerState::Open => "open",
        }
    }

    fn gauge_value(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

#[derive(Debug, Error)]
#[error("circuit for {provider} is open")]
pub struct CircuitOpen {
    pub provider: String,
}

/// Point-in-time view for the health and admin endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub opens: u64,
    pub closes: u64,
    pub success_rate: f64,
    pub recent_failures: Vec<String>,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    opens: u64,
    closes: u64,
    recent_failures: VecDeque<String>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            opens: 0,
            closes: 0,
            recent_failures: VecDeque::new(),
        }
    }

    fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            100.0
        } else {
            (self.successful_requests as f64 / self.total_requests as f64) * 100.0
        }
    }
}

pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    metrics: Metrics,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: BreakerConfig, metrics: Metrics) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(Inner::new()),
            metrics,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Ask for an execution slot. Rejected immediately while open; the
    /// half-open transition happens here once the cool-down has elapsed.
    pub async fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().await;
        self.maybe_half_open(&mut inner);
        if inner.state == BreakerState::Open {
            self.metrics
                .breaker_rejections
                .with_label_values(&[&self.provider])
                .inc();
            return Err(CircuitOpen {
                provider: self.provider.clone(),
            });
        }
        Ok(())
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_requests += 1;
        inner.successful_requests += 1;
        inner.consecutive_failures = 0;

        if inner.state == BreakerState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                self.transition(&mut inner, BreakerState::Closed);
            }
        }
    }

    pub async fn record_failure(&self, reason: &str) {
        let mut inner = self.inner.lock().await;
        inner.total_requests += 1;
        inner.failed_requests += 1;
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        inner.last_failure = Some(Instant::now());
        inner.recent_failures.push_back(reason.to_string());
        while inner.recent_failures.len() > RECENT_FAILURES_KEPT {
            inner.recent_failures.pop_front();
        }

        match inner.state {
            BreakerState::Closed
                if inner.consecutive_failures >= self.config.failure_threshold =>
            {
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Open);
            }
            _ => {}
        }
    }

    /// Run `operation` inside the breaker: acquire, then report the outcome.
    pub async fn call<T, E, Fut>(&self, operation: Fut) -> Result<Result<T, E>, CircuitOpen>
    where
        E: std::fmt::Display,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire().await?;
        let outcome = operation.await;
        match &outcome {
            Ok(_) => self.record_success().await,
            Err(err) => self.record_failure(&err.to_string()).await,
        }
        Ok(outcome)
    }

    pub async fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().await;
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub async fn is_available(&self) -> bool {
        !matches!(self.state().await, BreakerState::Open)
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock().await;
        self.maybe_half_open(&mut inner);
        BreakerSnapshot {
            provider: self.provider.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            opens: inner.opens,
            closes: inner.closes,
            success_rate: inner.success_rate(),
            recent_failures: inner.recent_failures.iter().cloned().collect(),
        }
    }

    pub async fn force_open(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_failure = Some(Instant::now());
        self.transition(&mut inner, BreakerState::Open);
    }

    pub async fn force_close(&self) {
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, BreakerState::Closed);
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        *inner = Inner::new();
        self.metrics
            .breaker_state
            .with_label_values(&[&self.provider])
            .set(BreakerState::Closed.gauge_value());
    }

    /// Feed a probe result in from the background health loop. A healthy
    /// probe while open moves the circuit to half-open so real traffic can
    /// finish the recovery.
    pub async fn observe_probe(&self, healthy: bool) {
        if !healthy {
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.state == BreakerState::Open {
            self.transition(&mut inner, BreakerState::HalfOpen);
        }
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state != BreakerState::Open {
            return;
        }
        let elapsed = inner
            .last_failure
            .map(|at| at.elapsed() >= self.config.open_timeout)
            .unwrap_or(true);
        if elapsed {
            self.transition(inner, BreakerState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut Inner, next: BreakerState) {
        if inner.state == next {
            return;
        }
        let from = inner.state;
        inner.state = next;
        inner.consecutive_successes = 0;
        match next {
            BreakerState::Open => inner.opens += 1,
            BreakerState::Closed => {
                inner.closes += 1;
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {}
        }

        tracing::info!(
            provider = %self.provider,
            from = from.as_str(),
            to = next.as_str(),
            "circuit transition"
        );
        self.metrics
            .breaker_transitions
            .with_label_values(&[&self.provider, from.as_str(), next.as_str()])
            .inc();
        self.metrics
            .breaker_state
            .with_label_values(&[&self.provider])
            .set(next.gauge_value());
    }
}

pub type HealthProbe =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync + 'static>;

/// Periodic health probe; a healthy result while open nudges the circuit to
/// half-open ahead of the cool-down.
pub fn spawn_probe_loop(
    breaker: Arc<CircuitBreaker>,
    probe: HealthProbe,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = breaker.config.probe_interval;
        let timeout = breaker.config.probe_timeout;
        loop {
            tokio::time::sleep(interval).await;
            let healthy = match tokio::time::timeout(timeout, probe()).await {
                Ok(result) => result,
                Err(_) => false,
            };
            breaker.observe_probe(healthy).await;
        }
    })
}

/// All breakers for the process, keyed by provider id.
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    metrics: Metrics,
    breakers: StdMutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig, metrics: Metrics) -> Self {
        Self {
            default_config,
            metrics,
            breakers: StdMutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, provider: &str) -> Arc<CircuitBreaker> {
        let mut guard = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    provider,
                    self.default_config,
                    self.metrics.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, provider: &str) -> Option<Arc<CircuitBreaker>> {
        let guard = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(provider).cloned()
    }

    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        let guard = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        guard.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "openai",
            BreakerConfig::default(),
            Metrics::new().unwrap(),
        )
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = breaker();
        for _ in 0..2 {
            breaker.record_failure("boom").await;
        }
        assert_eq!(breaker.state().await, BreakerState::Closed);

        breaker.record_failure("boom").await;
        assert_eq!(breaker.state().await, BreakerState::Open);
        assert!(breaker.try_acquire().await.is_err());
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        let breaker = breaker();
        breaker.record_failure("a").await;
        breaker.record_failure("b").await;
        breaker.record_success().await;
        breaker.record_failure("c").await;
        breaker.record_failure("d").await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_cooldown_then_closes_on_successes() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure("boom").await;
        }
        assert_eq!(breaker.state().await, BreakerState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);
        assert!(breaker.try_acquire().await.is_ok());

        breaker.record_success().await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn any_half_open_failure_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure("boom").await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        breaker.record_failure("still down").await;
        assert_eq!(breaker.state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn healthy_probe_moves_open_to_half_open() {
        let breaker = breaker();
        breaker.force_open().await;
        breaker.observe_probe(true).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn unhealthy_probe_leaves_state_alone() {
        let breaker = breaker();
        breaker.force_open().await;
        breaker.observe_probe(false).await;
        // Still open: the cool-down has not elapsed with paused=false but
        // open_timeout is 30s so a fresh force_open stays open.
        assert!(breaker.try_acquire().await.is_err());
    }

    #[tokio::test]
    async fn recent_failures_are_bounded() {
        let breaker = breaker();
        for i in 0..60 {
            breaker.record_failure(&format!("failure {i}")).await;
        }
        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.recent_failures.len(), 25);
        assert_eq!(snapshot.recent_failures.last().unwrap(), "failure 59");
    }

    #[tokio::test]
    async fn call_reports_outcomes() {
        let breaker = breaker();
        let result: Result<Result<u32, String>, _> =
            breaker.call(async { Ok::<_, String>(7) }).await;
        assert_eq!(result.unwrap().unwrap(), 7);

        for _ in 0..3 {
            let _ = breaker
                .call(async { Err::<u32, _>("down".to_string()) })
                .await;
        }
        assert!(matches!(
            breaker.call(async { Ok::<_, String>(1) }).await,
            Err(CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn registry_hands_out_one_breaker_per_provider() {
        let registry = BreakerRegistry::new(BreakerConfig::default(), Metrics::new().unwrap());
        let a = registry.get_or_create("gemini");
        let b = registry.get_or_create("gemini");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.all().len(), 1);
    }
}
