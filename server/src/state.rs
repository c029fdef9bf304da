//! Application wiring.
//!
//! Everything with state lives in one `App` value built at startup and
//! shared through the router; there is no module-level mutable state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use binsight_core::auth::ApiKeyStore;
use binsight_core::breaker::{spawn_probe_loop, BreakerConfig, BreakerRegistry, HealthProbe};
use binsight_core::config::Settings;
use binsight_core::decompiler::Decompiler;
use binsight_core::kv::KvClient;
use binsight_core::metrics::Metrics;
use binsight_core::providers::{
    AnthropicProvider, GeminiProvider, LlmProvider, OpenAiProvider, ProviderId,
};
use binsight_core::queue::ReadyQueue;
use binsight_core::ratelimit::{ProviderUsageLimiter, SlidingWindowLimiter};
use binsight_core::store::JobStore;
use binsight_core::translate::TranslationOrchestrator;
use binsight_core::worker::JobPipeline;

pub struct App {
    pub settings: Settings,
    pub kv: KvClient,
    pub metrics: Metrics,
    pub store: JobStore,
    pub keys: ApiKeyStore,
    pub limiter: SlidingWindowLimiter,
    pub breakers: Arc<BreakerRegistry>,
    pub orchestrator: Arc<TranslationOrchestrator>,
    pub pipeline: Arc<JobPipeline>,
    pub started_at: Instant,
}

pub type AppState = Arc<App>;

/// Build the whole application graph from settings. Fails when the kv
/// store is unreachable or metrics registration breaks.
pub async fn build_app(settings: Settings) -> anyhow::Result<AppState> {
    let kv = KvClient::connect(&settings.kv.url).await?;
    kv.ping().await?;

    let metrics = Metrics::new()?;
    let breakers = Arc::new(BreakerRegistry::new(
        BreakerConfig::default(),
        metrics.clone(),
    ));

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .build()?;

    let mut providers: HashMap<ProviderId, Arc<dyn LlmProvider>> = HashMap::new();
    if settings.llm.openai.api_key.is_some() {
        providers.insert(
            ProviderId::OpenAi,
            Arc::new(OpenAiProvider::new(http.clone(), settings.llm.openai.clone())?),
        );
    }
    if settings.llm.anthropic.api_key.is_some() {
        providers.insert(
            ProviderId::Anthropic,
            Arc::new(AnthropicProvider::new(
                http.clone(),
                settings.llm.anthropic.clone(),
            )?),
        );
    }
    if settings.llm.gemini.api_key.is_some() {
        providers.insert(
            ProviderId::Gemini,
            Arc::new(GeminiProvider::new(http.clone(), settings.llm.gemini.clone())?),
        );
    }
    if providers.is_empty() {
        tracing::warn!("no LLM provider configured; jobs will return decompilation-only results");
    }

    // One breaker per configured provider, each with a background probe.
    for (id, provider) in &providers {
        let breaker = breakers.get_or_create(id.as_str());
        let probe_target = provider.clone();
        let probe: HealthProbe = Arc::new(move || {
            let provider = probe_target.clone();
            Box::pin(async move { provider.health_check().await.is_ok() })
        });
        spawn_probe_loop(breaker, probe);
    }

    // Informational circuit snapshots in the kv store, for operators and
    // dashboards; process-local breakers remain the source of truth.
    {
        let breakers = breakers.clone();
        let kv = kv.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                for breaker in breakers.all() {
                    let snapshot = breaker.snapshot().await;
                    if let Ok(payload) = serde_json::to_string(&snapshot) {
                        let key = format!("circuit:{}", snapshot.provider);
                        let _ = kv.set_with_ttl(&key, &payload, 120).await;
                    }
                }
            }
        });
    }

    let usage_limiter = ProviderUsageLimiter::new(kv.clone());
    let orchestrator = Arc::new(TranslationOrchestrator::new(
        providers,
        breakers.clone(),
        Some(usage_limiter),
        metrics.clone(),
    ));

    let store = JobStore::new(kv.clone(), settings.kv.result_ttl_secs);
    let queue = ReadyQueue::new(kv.clone(), metrics.clone());
    let decompiler = Arc::new(Decompiler::new(
        settings.decompiler.clone(),
        settings.limits.clone(),
    ));

    let blob_dir = std::env::temp_dir().join("binsight");
    let pipeline = Arc::new(JobPipeline::new(
        store.clone(),
        queue,
        decompiler,
        orchestrator.clone(),
        metrics.clone(),
        settings.workers.clone(),
        settings.limits.clone(),
        blob_dir,
    ));

    let keys = ApiKeyStore::new(
        kv.clone(),
        settings.security.api_key_secret.clone(),
        settings.security.api_key_prefix.clone(),
        settings.security.api_key_expiry_days,
    );
    let limiter = SlidingWindowLimiter::new(kv.clone(), metrics.clone());

    Ok(Arc::new(App {
        settings,
        kv,
        metrics,
        store,
        keys,
        limiter,
        breakers,
        orchestrator,
        pipeline,
        started_at: Instant::now(),
    }))
}
