//! Service metrics.
//!
//! One explicit registry owned by the application value; nothing is
//! registered globally. Scraped as Prometheus text by the REST layer.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub http_requests: IntCounterVec,
    pub http_duration: HistogramVec,

    pub jobs_submitted: IntCounterVec,
    pub jobs_finished: IntCounterVec,
    pub job_stage_duration: HistogramVec,
    pub queue_depth: IntGaugeVec,

    pub decompile_functions: Histogram,
    pub decompile_strings: Histogram,
    pub decompile_imports: Histogram,

    pub provider_calls: IntCounterVec,
    pub provider_latency: HistogramVec,
    pub provider_tokens: IntCounterVec,
    pub provider_cost_cents: IntCounterVec,

    pub breaker_state: IntGaugeVec,
    pub breaker_transitions: IntCounterVec,
    pub breaker_rejections: IntCounterVec,

    pub rate_limit_denied: IntCounterVec,
    pub rate_limit_fail_open: IntCounter,

    pub errors: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            Opts::new("binsight_http_requests_total", "HTTP requests served"),
            &["method", "path", "status"],
        )?;
        let http_duration = HistogramVec::new(
            HistogramOpts::new("binsight_http_duration_seconds", "HTTP request duration")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["method", "path"],
        )?;

        let jobs_submitted = IntCounterVec::new(
            Opts::new("binsight_jobs_submitted_total", "Jobs accepted at submit"),
            &["priority"],
        )?;
        let jobs_finished = IntCounterVec::new(
            Opts::new("binsight_jobs_finished_total", "Jobs reaching a terminal state"),
            &["status"],
        )?;
        let job_stage_duration = HistogramVec::new(
            HistogramOpts::new("binsight_job_stage_duration_seconds", "Job stage duration")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["stage"],
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("binsight_queue_depth", "Ready-queue length"),
            &["priority"],
        )?;

        let decompile_functions = Histogram::with_opts(
            HistogramOpts::new(
                "binsight_decompile_function_count",
                "Functions extracted per artifact",
            )
            .buckets(vec![1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 2000.0]),
        )?;
        let decompile_strings = Histogram::with_opts(
            HistogramOpts::new(
                "binsight_decompile_string_count",
                "Strings extracted per artifact",
            )
            .buckets(vec![1.0, 10.0, 100.0, 500.0, 1000.0, 5000.0]),
        )?;
        let decompile_imports = Histogram::with_opts(
            HistogramOpts::new(
                "binsight_decompile_import_count",
                "Imports extracted per artifact",
            )
            .buckets(vec![1.0, 10.0, 50.0, 100.0, 500.0, 2000.0]),
        )?;

        let provider_calls = IntCounterVec::new(
            Opts::new("binsight_provider_calls_total", "LLM provider calls"),
            &["provider", "operation", "outcome"],
        )?;
        let provider_latency = HistogramVec::new(
            HistogramOpts::new(
                "binsight_provider_latency_seconds",
                "LLM provider call latency",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["provider", "operation"],
        )?;
        let provider_tokens = IntCounterVec::new(
            Opts::new("binsight_provider_tokens_total", "Tokens spent per provider"),
            &["provider", "kind"],
        )?;
        let provider_cost_cents = IntCounterVec::new(
            Opts::new(
                "binsight_provider_cost_cents_total",
                "Estimated provider spend in cents",
            ),
            &["provider"],
        )?;

        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "binsight_breaker_state",
                "Circuit state (0 closed, 1 half-open, 2 open)",
            ),
            &["provider"],
        )?;
        let breaker_transitions = IntCounterVec::new(
            Opts::new("binsight_breaker_transitions_total", "Circuit transitions"),
            &["provider", "from", "to"],
        )?;
        let breaker_rejections = IntCounterVec::new(
            Opts::new(
                "binsight_breaker_rejections_total",
                "Calls rejected by an open circuit",
            ),
            &["provider"],
        )?;

        let rate_limit_denied = IntCounterVec::new(
            Opts::new("binsight_rate_limit_denied_total", "Rate-limited requests"),
            &["limit"],
        )?;
        let rate_limit_fail_open = IntCounter::new(
            "binsight_rate_limit_fail_open_total",
            "Requests allowed because the kv store was unreachable",
        )?;

        let errors = IntCounterVec::new(
            Opts::new("binsight_errors_total", "Errors by kind"),
            &["kind"],
        )?;

        for collector in [
            Box::new(http_requests.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(http_duration.clone()),
            Box::new(jobs_submitted.clone()),
            Box::new(jobs_finished.clone()),
            Box::new(job_stage_duration.clone()),
            Box::new(queue_depth.clone()),
            Box::new(decompile_functions.clone()),
            Box::new(decompile_strings.clone()),
            Box::new(decompile_imports.clone()),
            Box::new(provider_calls.clone()),
            Box::new(provider_latency.clone()),
            Box::new(provider_tokens.clone()),
            Box::new(provider_cost_cents.clone()),
            Box::new(breaker_state.clone()),
            Box::new(breaker_transitions.clone()),
            Box::new(breaker_rejections.clone()),
            Box::new(rate_limit_denied.clone()),
            Box::new(rate_limit_fail_open.clone()),
            Box::new(errors.clone()),
        ] {
            registry.register(collector)?;
        }

        Ok(Self {
            registry,
            http_requests,
            http_duration,
            jobs_submitted,
            jobs_finished,
            job_stage_duration,
            queue_depth,
            decompile_functions,
            decompile_strings,
            decompile_imports,
            provider_calls,
            provider_latency,
            provider_tokens,
            provider_cost_cents,
            breaker_state,
            breaker_transitions,
            breaker_rejections,
            rate_limit_denied,
            rate_limit_fail_open,
            errors,
        })
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn scrape(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }

    pub fn record_error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once() {
        let metrics = Metrics::new().unwrap();
        metrics
            .http_requests
            .with_label_values(&["GET", "/health", "200"])
            .inc();
        metrics.record_error("validation");

        let scraped = metrics.scrape();
        assert!(scraped.contains("binsight_http_requests_total"));
        assert!(scraped.contains("binsight_errors_total"));
    }

    #[test]
    fn independent_instances_do_not_collide() {
        // Each instance owns its registry, so two Apps can coexist in tests.
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_error("a");
        second.record_error("b");
        assert!(first.scrape().contains("kind=\"a\""));
        assert!(!second.scrape().contains("kind=\"a\""));
    }
}
