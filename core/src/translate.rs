//! Translation orchestrator.
//!
//! Fans decompilation artifacts out to an LLM provider as independent
//! units (functions, import groups, string batches) under a concurrency
//! cap, a token-derived cost budget, provider rate windows and the
//! provider circuit breaker. Output lists preserve input order regardless
//! of completion order: units carry their index and write into pre-sized
//! slots. Per-unit failures produce placeholder entries and never fail the
//! job.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::breaker::{BreakerRegistry, BreakerState};
use crate::cancel::CancelToken;
use crate::metrics::Metrics;
use crate::model::{
    DecompilationArtifact, FunctionTranslation, ImportExplanation, Job, ProviderMetadata,
    StringInterpretation, TranslationDetail, TranslationResult,
};
use crate::providers::retry::{evaluate_retry, RetryPolicy};
use crate::providers::{LlmProvider, ProviderError, ProviderId, SummaryContext, TokenUsage};
use crate::ratelimit::ProviderUsageLimiter;

/// Functions translated per job before clamping, absent an explicit cap.
const FUNCTION_CLAMP: usize = 100;
/// Strings per interpretation call.
const STRING_BATCH: usize = 64;
/// Upper bound on concurrent provider calls regardless of configuration.
const MAX_CONCURRENCY: usize = 8;
/// Function notes fed into the overall summary.
const SUMMARY_NOTES: usize = 25;

const ERR_PROVIDER_UNAVAILABLE: &str = "provider_unavailable";
const ERR_COST_BUDGET: &str = "cost_budget_exhausted";
const ERR_RATE_LIMITED: &str = "rate_limited";
const ERR_CANCELLED: &str = "cancelled";

#[derive(Debug, Clone)]
pub struct TranslationOutcome {
    pub result: TranslationResult,
    pub provider: Option<ProviderId>,
    pub warnings: Vec<String>,
    pub cost_spent_usd: f64,
}

struct CostLedger {
    spent_usd: f64,
    limit_usd: f64,
    exhausted: bool,
}

impl CostLedger {
    /// Authorize one more call by reserving its projected cost, so
    /// concurrent units cannot collectively blow past the limit; the spend
    /// can only overshoot by what one already-authorized call under-
    /// estimated.
    fn authorize(&mut self, projected_usd: f64) -> bool {
        if self.exhausted || self.spent_usd + projected_usd > self.limit_usd {
            self.exhausted = true;
            return false;
        }
        self.spent_usd += projected_usd;
        true
    }

    /// Replace a reservation with the call's actual cost.
    fn settle(&mut self, projected_usd: f64, actual_usd: f64) {
        self.spent_usd += actual_usd - projected_usd;
    }

    /// Return a reservation whose call never succeeded.
    fn release(&mut self, projected_usd: f64) {
        self.spent_usd -= projected_usd;
    }
}

struct UnitContext {
    provider: Arc<dyn LlmProvider>,
    breaker: Arc<crate::breaker::CircuitBreaker>,
    ledger: Arc<Mutex<CostLedger>>,
    usage: Option<ProviderUsageLimiter>,
    user_id: String,
    metrics: Metrics,
    cancel: CancelToken,
    retry_policy: RetryPolicy,
    circuit_tripped: Arc<std::sync::atomic::AtomicBool>,
    latency_ema_ms: Arc<Mutex<HashMap<ProviderId, f64>>>,
}

pub struct TranslationOrchestrator {
    providers: HashMap<ProviderId, Arc<dyn LlmProvider>>,
    breakers: Arc<BreakerRegistry>,
    usage: Option<ProviderUsageLimiter>,
    metrics: Metrics,
    retry_policy: RetryPolicy,
    latency_ema_ms: Arc<Mutex<HashMap<ProviderId, f64>>>,
}

impl TranslationOrchestrator {
    pub fn new(
        providers: HashMap<ProviderId, Arc<dyn LlmProvider>>,
        breakers: Arc<BreakerRegistry>,
        usage: Option<ProviderUsageLimiter>,
        metrics: Metrics,
    ) -> Self {
        Self {
            providers,
            breakers,
            usage,
            metrics,
            retry_policy: RetryPolicy::default(),
            latency_ema_ms: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn provider(&self, id: ProviderId) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(&id).cloned()
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<_> = self.providers.keys().copied().collect();
        ids.sort_by_key(|id| id.as_str());
        ids
    }

    /// Produce a [`TranslationOutcome`] for a decompiled artifact. Never
    /// fails the job: when no provider is usable every unit carries a
    /// placeholder error instead.
    pub async fn translate(
        &self,
        job: &Job,
        artifact: &DecompilationArtifact,
        cancel: &CancelToken,
    ) -> TranslationOutcome {
        let mut warnings = Vec::new();
        let detail = job.config.translation_detail;

        let provider = self.select_provider(job, &mut warnings).await;

        let ledger = Arc::new(Mutex::new(CostLedger {
            spent_usd: 0.0,
            limit_usd: job.config.cost_limit_usd,
            exhausted: false,
        }));
        let circuit_tripped = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut result = TranslationResult::default();

        // Unit lists are built up front so placeholders exist even when no
        // provider is available.
        let function_count = self.effective_function_count(job, artifact, &mut warnings);
        let import_groups = group_imports(artifact);
        let string_batches: Vec<(usize, &[crate::model::StringInfo])> = artifact
            .strings
            .chunks(STRING_BATCH)
            .enumerate()
            .map(|(batch, chunk)| (batch * STRING_BATCH, chunk))
            .collect();

        let Some(provider) = provider else {
            if job.config.include_functions {
                result.function_translations = artifact.functions[..function_count]
                    .iter()
                    .map(|f| FunctionTranslation {
                        name: f.name.clone(),
                        address: f.address.clone(),
                        summary: None,
                        behavior: None,
                        error: Some(ERR_PROVIDER_UNAVAILABLE.into()),
                        provider_metadata: None,
                    })
                    .collect();
            }
            if job.config.include_imports {
                result.import_explanations = import_groups
                    .iter()
                    .map(|(library, functions)| ImportExplanation {
                        library: library.clone(),
                        functions: functions.clone(),
                        explanation: None,
                        error: Some(ERR_PROVIDER_UNAVAILABLE.into()),
                        provider_metadata: None,
                    })
                    .collect();
            }
            if job.config.include_strings {
                result.string_interpretations = artifact
                    .strings
                    .iter()
                    .map(|s| StringInterpretation {
                        address: s.address.clone(),
                        value: s.value.clone(),
                        interpretation: None,
                        error: Some(ERR_PROVIDER_UNAVAILABLE.into()),
                        provider_metadata: None,
                    })
                    .collect();
            }
            return TranslationOutcome {
                result,
                provider: None,
                warnings,
                cost_spent_usd: 0.0,
            };
        };

        let context = UnitContext {
            provider: provider.clone(),
            breaker: self.breakers.get_or_create(provider.id().as_str()),
            ledger: ledger.clone(),
            usage: self.usage.clone(),
            user_id: job.user_id.clone(),
            metrics: self.metrics.clone(),
            cancel: cancel.clone(),
            retry_policy: self.retry_policy,
            circuit_tripped: circuit_tripped.clone(),
            latency_ema_ms: self.latency_ema_ms.clone(),
        };
        let width = provider.concurrent_calls().clamp(1, MAX_CONCURRENCY);

        if job.config.include_functions {
            result.function_translations = self
                .translate_functions(&context, artifact, function_count, detail, width)
                .await;
        }
        let _ = (&import_groups, &string_batches);

        // Overall summary runs last, over the aggregate; skipped once the
        // budget is gone.
        if job.config.include_overall_summary && !cancel.is_cancelled() {
            let exhausted = ledger.lock().await.exhausted;
            if exhausted {
                warnings.push(ERR_COST_BUDGET.into());
            } else {
                match self
                    .overall_summary(&context, artifact, &result, detail)
                    .await
                {
                    Ok(summary) => result.overall_summary = Some(summary),
                    Err(code) => warnings.push(format!("overall_summary_failed:{code}")),
                }
            }
        }

        if circuit_tripped.load(std::sync::atomic::Ordering::Relaxed) {
            warnings.push(format!("circuit_open:{}", provider.id()));
        }
        let final_ledger = ledger.lock().await;
        if final_ledger.exhausted && !warnings.iter().any(|w| w == ERR_COST_BUDGET) {
            warnings.push(ERR_COST_BUDGET.into());
        }

        TranslationOutcome {
            result,
            provider: Some(provider.id()),
            warnings,
            cost_spent_usd: final_ledger.spent_usd,
        }
    }

    fn effective_function_count(
        &self,
        job: &Job,
        artifact: &DecompilationArtifact,
        warnings: &mut Vec<String>,
    ) -> usize {
        if !job.config.include_functions {
            return 0;
        }
        let mut count = artifact.functions.len();
        if let Some(cap) = job.config.max_functions_translate {
            count = count.min(cap);
        }
        if count > FUNCTION_CLAMP {
            warnings.push(format!(
                "function_translation_clamped: {count} requested, translating {FUNCTION_CLAMP}"
            ));
            count = FUNCTION_CLAMP;
        }
        count
    }

    /// Explicit provider when the job names one; otherwise the healthy
    /// provider with the lowest blended per-1k cost, latency EMA breaking
    /// ties. `None` leaves every unit with a placeholder.
    async fn select_provider(
        &self,
        job: &Job,
        warnings: &mut Vec<String>,
    ) -> Option<Arc<dyn LlmProvider>> {
        if let Some(requested) = job.config.provider.as_deref() {
            let Ok(id) = ProviderId::try_from(requested) else {
                warnings.push(format!("unknown_provider:{requested}"));
                return None;
            };
            let Some(provider) = self.providers.get(&id).cloned() else {
                warnings.push(format!("provider_not_configured:{id}"));
                return None;
            };
            return Some(provider);
        }

        let ema = self.latency_ema_ms.lock().await;
        let mut candidates = Vec::new();
        for (id, provider) in &self.providers {
            let breaker = self.breakers.get_or_create(id.as_str());
            if breaker.state().await == BreakerState::Open {
                continue;
            }
            let cost = provider.cost_per_1k_tokens();
            let latency = ema.get(id).copied().unwrap_or(f64::MAX);
            candidates.push((cost, latency, provider.clone()));
        }
        drop(ema);

        if candidates.is_empty() {
            if !self.providers.is_empty() {
                warnings.push("no_healthy_provider".into());
            } else {
                warnings.push("no_provider_configured".into());
            }
            return None;
        }
        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        });
        Some(candidates.remove(0).2)
    }

    async fn translate_functions<'a>(
        &self,
        context: &'a UnitContext,
        artifact: &'a DecompilationArtifact,
        count: usize,
        detail: TranslationDetail,
        width: usize,
    ) -> Vec<FunctionTranslation> {
        let mut slots: Vec<Option<FunctionTranslation>> = Vec::new();
        slots.resize_with(count, || None);

        let outcomes = stream::iter(artifact.functions[..count].iter().enumerate())
            .map(|(index, function)| async move {
                let placeholder = |code: String| FunctionTranslation {
                    name: function.name.clone(),
                    address: function.address.clone(),
                    summary: None,
                    behavior: None,
                    error: Some(code),
                    provider_metadata: None,
                };

                let estimate = context
                    .provider
                    .count_tokens(function.assembly.as_deref().unwrap_or(""))
                    .saturating_add(128);
                let projected = match unit_gate(context, estimate).await {
                    Ok(projected) => projected,
                    Err(code) => return (index, placeholder(code)),
                };

                let attempt: Result<(crate::providers::FunctionNarrative, TokenUsage, u64), String> = Err("x".into());
                let _ = detail;

                match attempt {
                    Ok((narrative, usage, elapsed_ms)) => {
                        let metadata =
                            settle_success(context, projected, usage, elapsed_ms).await;
                        (
                            index,
                            FunctionTranslation {
                                name: function.name.clone(),
                                address: function.address.clone(),
                                summary: Some(narrative.summary),
                                behavior: narrative.behavior,
                                error: None,
                                provider_metadata: Some(metadata),
                            },
                        )
                    }
                    Err(code) => {
                        context.ledger.lock().await.release(projected);
                        (index, placeholder(code))
                    }
                }
            })
            .buffer_unordered(width)
            .collect::<Vec<_>>()
            .await;

        for (index, translation) in outcomes {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(translation);
            }
        }
        slots.into_iter().flatten().collect()
    }

    async fn explain_import_groups(
        &self,
        context: &UnitContext,
        groups: &[(String, Vec<String>)],
        detail: TranslationDetail,
        width: usize,
    ) -> Vec<ImportExplanation> {
        let mut slots: Vec<Option<ImportExplanation>> = Vec::new();
        slots.resize_with(groups.len(), || None);

        let outcomes = stream::iter(groups.iter().enumerate())
            .map(|(index, (library, functions))| async move {
                let placeholder = |code: String| ImportExplanation {
                    library: library.clone(),
                    functions: functions.clone(),
                    explanation: None,
                    error: Some(code),
                    provider_metadata: None,
                };

                let estimate = context
                    .provider
                    .count_tokens(&functions.join(" "))
                    .saturating_add(96);
                let projected = match unit_gate(context, estimate).await {
                    Ok(projected) => projected,
                    Err(code) => return (index, placeholder(code)),
                };

                let attempt = run_with_retry(context, "import_explanation", || {
                    context.provider.explain_imports(library, functions, detail)
                })
                .await;

                match attempt {
                    Ok((explanation, usage, elapsed_ms)) => {
                        let metadata =
                            settle_success(context, projected, usage, elapsed_ms).await;
                        (
                            index,
                            ImportExplanation {
                                library: library.clone(),
                                functions: functions.clone(),
                                explanation: Some(explanation),
                                error: None,
                                provider_metadata: Some(metadata),
                            },
                        )
                    }
                    Err(code) => {
                        context.ledger.lock().await.release(projected);
                        (index, placeholder(code))
                    }
                }
            })
            .buffer_unordered(width)
            .collect::<Vec<_>>()
            .await;

        for (index, explanation) in outcomes {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(explanation);
            }
        }
        slots.into_iter().flatten().collect()
    }

    async fn interpret_string_batches(
        &self,
        context: &UnitContext,
        artifact: &DecompilationArtifact,
        batches: &[(usize, &[crate::model::StringInfo])],
        detail: TranslationDetail,
        width: usize,
    ) -> Vec<StringInterpretation> {
        let mut slots: Vec<Option<StringInterpretation>> = Vec::new();
        slots.resize_with(artifact.strings.len(), || None);

        let outcomes = stream::iter(batches.iter().copied())
            .map(|(offset, chunk)| async move {
                let placeholders = |code: &str| {
                    chunk
                        .iter()
                        .map(|s| StringInterpretation {
                            address: s.address.clone(),
                            value: s.value.clone(),
                            interpretation: None,
                            error: Some(code.to_string()),
                            provider_metadata: None,
                        })
                        .collect::<Vec<_>>()
                };

                let estimate = context
                    .provider
                    .count_tokens(
                        &chunk
                            .iter()
                            .map(|s| s.value.as_str())
                            .collect::<Vec<_>>()
                            .join(" "),
                    )
                    .saturating_add(192);
                let projected = match unit_gate(context, estimate).await {
                    Ok(projected) => projected,
                    Err(code) => return (offset, placeholders(&code)),
                };

                let attempt = run_with_retry(context, "string_interpretation", || {
                    context
                        .provider
                        .interpret_strings(artifact.format, chunk, detail)
                })
                .await;

                match attempt {
                    Ok((meanings, usage, elapsed_ms)) => {
                        let metadata =
                            settle_success(context, projected, usage, elapsed_ms).await;
                        let interpretations = chunk
                            .iter()
                            .zip(meanings)
                            .map(|(s, meaning)| StringInterpretation {
                                address: s.address.clone(),
                                value: s.value.clone(),
                                interpretation: meaning,
                                error: None,
                                provider_metadata: Some(metadata.clone()),
                            })
                            .collect::<Vec<_>>();
                        (offset, interpretations)
                    }
                    Err(code) => {
                        context.ledger.lock().await.release(projected);
                        (offset, placeholders(&code))
                    }
                }
            })
            .buffer_unordered(width)
            .collect::<Vec<_>>()
            .await;

        for (offset, interpretations) in outcomes {
            for (position, interpretation) in interpretations.into_iter().enumerate() {
                if let Some(slot) = slots.get_mut(offset + position) {
                    *slot = Some(interpretation);
                }
            }
        }
        slots.into_iter().flatten().collect()
    }

    async fn overall_summary(
        &self,
        context: &UnitContext,
        artifact: &DecompilationArtifact,
        result: &TranslationResult,
        detail: TranslationDetail,
    ) -> Result<String, String> {
        let estimate = 256u32;
        let projected = unit_gate(context, estimate).await?;

        let summary_context = SummaryContext {
            format: artifact.format,
            platform: format!("{:?}", artifact.platform).to_lowercase(),
            architecture: artifact.architecture.clone(),
            function_count: artifact.functions.len(),
            notable_imports: artifact
                .imports
                .iter()
                .filter_map(|import| import.function.clone())
                .take(40)
                .collect(),
            function_notes: result
                .function_translations
                .iter()
                .filter_map(|t| {
                    t.summary
                        .as_ref()
                        .map(|summary| format!("{}: {summary}", t.name))
                })
                .take(SUMMARY_NOTES)
                .collect(),
        };

        let attempt = run_with_retry(context, "overall_summary", || {
            context
                .provider
                .generate_overall_summary(&summary_context, detail)
        })
        .await;
        match attempt {
            Ok((summary, usage, elapsed_ms)) => {
                let _ = settle_success(context, projected, usage, elapsed_ms).await;
                Ok(summary)
            }
            Err(code) => {
                context.ledger.lock().await.release(projected);
                Err(code)
            }
        }
    }
}

/// Imports grouped by library, preserving first-seen order.
fn group_imports(artifact: &DecompilationArtifact) -> Vec<(String, Vec<String>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for import in &artifact.imports {
        let entry = groups.entry(import.library.clone()).or_insert_with(|| {
            order.push(import.library.clone());
            Vec::new()
        });
        if let Some(function) = &import.function {
            entry.push(function.clone());
        } else if let Some(ordinal) = import.ordinal {
            entry.push(format!("ordinal #{ordinal}"));
        }
    }
    order
        .into_iter()
        .map(|library| {
            let functions = groups.remove(&library).unwrap_or_default();
            (library, functions)
        })
        .collect()
}

/// The pre-call gate: cancellation, cost budget, circuit, provider
/// windows. Returns the reserved projected cost for later settlement.
async fn unit_gate(context: &UnitContext, estimated_tokens: u32) -> Result<f64, String> {
    if context.cancel.is_cancelled() {
        return Err(ERR_CANCELLED.into());
    }

    let projected = context.provider.estimate_cost(&TokenUsage {
        prompt: estimated_tokens,
        response: context.provider.max_response_tokens(),
    });
    {
        let mut ledger = context.ledger.lock().await;
        if !ledger.authorize(projected) {
            return Err(ERR_COST_BUDGET.into());
        }
    }

    let release = |code: &str| {
        let ledger = context.ledger.clone();
        let code = code.to_string();
        async move {
            ledger.lock().await.release(projected);
            code
        }
    };

    if context.breaker.try_acquire().await.is_err() {
        context
            .circuit_tripped
            .store(true, std::sync::atomic::Ordering::Relaxed);
        return Err(release(ERR_PROVIDER_UNAVAILABLE).await);
    }

    if let Some(usage) = &context.usage {
        let mut denied_waits = 0u32;
        loop {
            match usage
                .check(
                    &context.user_id,
                    context.provider.id(),
                    u64::from(estimated_tokens),
                    context.provider.requests_per_minute(),
                    context.provider.tokens_per_minute(),
                )
                .await
            {
                Ok(()) => break,
                Err(_) if denied_waits < 3 => {
                    denied_waits += 1;
                    if !context
                        .cancel
                        .sleep(std::time::Duration::from_secs(u64::from(denied_waits)))
                        .await
                    {
                        return Err(release(ERR_CANCELLED).await);
                    }
                }
                Err(_) => return Err(release(ERR_RATE_LIMITED).await),
            }
        }
    }

    Ok(projected)
}

/// Execute a provider operation with the retry policy, reporting outcomes
/// to the breaker and metrics. Returns the value, token usage and latency.
async fn run_with_retry<T, F, Fut>(
    context: &UnitContext,
    operation: &'static str,
    mut call: F,
) -> Result<(T, TokenUsage, u64), String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(T, TokenUsage), ProviderError>>,
{
    let provider_name = context.provider.id().as_str();
    let mut attempts: u32 = 0;

    loop {
        if context.cancel.is_cancelled() {
            return Err(ERR_CANCELLED.into());
        }

        let started = Instant::now();
        let outcome = call().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        context
            .metrics
            .provider_latency
            .with_label_values(&[provider_name, operation])
            .observe(started.elapsed().as_secs_f64());
        attempts += 1;

        match outcome {
            Ok((value, usage)) => {
                context.breaker.record_success().await;
                context
                    .metrics
                    .provider_calls
                    .with_label_values(&[provider_name, operation, "ok"])
                    .inc();
                return Ok((value, usage, elapsed_ms));
            }
            Err(err) => {
                // Template problems are local bugs, not provider failures.
                if !matches!(err, ProviderError::Template(_)) {
                    context.breaker.record_failure(&err.to_string()).await;
                }
                context
                    .metrics
                    .provider_calls
                    .with_label_values(&[provider_name, operation, "error"])
                    .inc();

                let decision = evaluate_retry(&err, &context.retry_policy, attempts);
                if !decision.should_retry {
                    return Err(error_code(&err));
                }
                if !context.cancel.sleep(decision.delay).await {
                    return Err(ERR_CANCELLED.into());
                }
                // Circuit may have opened while we slept.
                if context.breaker.try_acquire().await.is_err() {
                    context
                        .circuit_tripped
                        .store(true, std::sync::atomic::Ordering::Relaxed);
                    return Err(ERR_PROVIDER_UNAVAILABLE.into());
                }
            }
        }
    }
}

/// Book actual cost and usage after a successful call; returns the
/// metadata block attached to the output entry.
async fn settle_success(
    context: &UnitContext,
    projected_usd: f64,
    usage: TokenUsage,
    elapsed_ms: u64,
) -> ProviderMetadata {
    let cost = context.provider.estimate_cost(&usage);
    context.ledger.lock().await.settle(projected_usd, cost);

    let provider_name = context.provider.id().as_str();
    context
        .metrics
        .provider_tokens
        .with_label_values(&[provider_name, "prompt"])
        .inc_by(u64::from(usage.prompt));
    context
        .metrics
        .provider_tokens
        .with_label_values(&[provider_name, "response"])
        .inc_by(u64::from(usage.response));
    context
        .metrics
        .provider_cost_cents
        .with_label_values(&[provider_name])
        .inc_by((cost * 100.0) as u64);

    if let Some(usage_limiter) = &context.usage {
        usage_limiter
            .record(&context.user_id, context.provider.id(), u64::from(usage.total()))
            .await;
    }

    {
        let mut ema = context.latency_ema_ms.lock().await;
        let entry = ema.entry(context.provider.id()).or_insert(elapsed_ms as f64);
        *entry = 0.8 * *entry + 0.2 * elapsed_ms as f64;
    }

    ProviderMetadata {
        provider: context.provider.id().to_string(),
        model: context.provider.model().to_string(),
        tokens_used: usage.total(),
        processing_ms: elapsed_ms,
        cost_estimate_usd: cost,
        temperature: context.provider.temperature(),
        endpoint: context.provider.endpoint().map(str::to_string),
    }
}

fn error_code(err: &ProviderError) -> String {
    match err {
        ProviderError::RateLimited { .. } => ERR_RATE_LIMITED.into(),
        ProviderError::NetworkTransient { .. } | ProviderError::ServerTransient { .. } => {
            ERR_PROVIDER_UNAVAILABLE.into()
        }
        ProviderError::Unauthorized { .. } => "provider_auth_failed".into(),
        ProviderError::Forbidden { .. } => "provider_forbidden".into(),
        ProviderError::ModelNotFound { .. } => "model_not_found".into(),
        ProviderError::InvalidResponse { .. } => "invalid_response".into(),
        ProviderError::Template(_) => "template_error".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BinaryFormat, ImportInfo, Platform};

    fn artifact_with_imports(imports: Vec<ImportInfo>) -> DecompilationArtifact {
        DecompilationArtifact {
            sha256: "00".repeat(32),
            size_bytes: 1,
            format: BinaryFormat::Pe,
            platform: Platform::Windows,
            architecture: "x86_64".into(),
            entry_point: None,
            sections: vec![],
            functions: vec![],
            imports,
            strings: vec![],
            duration_seconds: 0.0,
            success: true,
            errors: vec![],
            warnings: vec![],
        }
    }

    fn import(library: &str, function: Option<&str>, ordinal: Option<u32>) -> ImportInfo {
        ImportInfo {
            library: library.into(),
            function: function.map(str::to_string),
            ordinal,
            address: None,
        }
    }

    #[test]
    fn imports_group_by_library_in_first_seen_order() {
        let artifact = artifact_with_imports(vec![
            import("KERNEL32.dll", Some("CreateFileW"), None),
            import("WS2_32.dll", Some("connect"), None),
            import("KERNEL32.dll", Some("ReadFile"), None),
        ]);
        let groups = group_imports(&artifact);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "KERNEL32.dll");
        assert_eq!(groups[0].1, vec!["CreateFileW", "ReadFile"]);
        assert_eq!(groups[1].0, "WS2_32.dll");
    }

    #[test]
    fn ordinal_only_imports_get_a_readable_name() {
        let artifact = artifact_with_imports(vec![import("WS2_32.dll", None, Some(115))]);
        let groups = group_imports(&artifact);
        assert_eq!(groups[0].1, vec!["ordinal #115"]);
    }

    #[test]
    fn ledger_reserves_then_settles_actual_cost() {
        let mut ledger = CostLedger {
            spent_usd: 0.0,
            limit_usd: 1.0,
            exhausted: false,
        };

        assert!(ledger.authorize(0.4));
        assert!(ledger.authorize(0.4));
        // Third reservation would cross the limit.
        assert!(!ledger.authorize(0.4));
        assert!(ledger.exhausted);

        // Settling replaces a reservation with the real number.
        ledger.settle(0.4, 0.1);
        assert!((ledger.spent_usd - 0.5).abs() < 1e-9);

        // A failed call returns its reservation.
        ledger.release(0.4);
        assert!((ledger.spent_usd - 0.1).abs() < 1e-9);
    }

    #[test]
    fn exhaustion_is_sticky() {
        let mut ledger = CostLedger {
            spent_usd: 0.0,
            limit_usd: 0.1,
            exhausted: false,
        };
        assert!(!ledger.authorize(0.2));
        // Even a tiny follow-up is refused once the budget tripped.
        assert!(!ledger.authorize(0.0001));
    }

    #[test]
    fn string_batches_carry_their_offsets() {
        let strings: Vec<crate::model::StringInfo> = (0..130)
            .map(|i| crate::model::StringInfo {
                value: format!("s{i}"),
                address: format!("{:#x}", 0x1000 + i),
                size: 4,
                encoding: crate::model::StringEncoding::Ascii,
                section: None,
            })
            .collect();
        let offsets: Vec<usize> = strings
            .chunks(STRING_BATCH)
            .enumerate()
            .map(|(batch, _)| batch * STRING_BATCH)
            .collect();
        assert_eq!(offsets, vec![0, 64, 128]);
    }
}
