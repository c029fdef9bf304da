//! End-to-end orchestrator behavior against a scripted provider: input
//! ordering, cost budget enforcement and circuit-open placeholders.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use binsight_core::breaker::{BreakerConfig, BreakerRegistry};
use binsight_core::cancel::CancelToken;
use binsight_core::metrics::Metrics;
use binsight_core::model::{
    BinaryFormat, DecompilationArtifact, FunctionInfo, ImportInfo, Job, JobConfig, Platform,
    StringEncoding, StringInfo,
};
use binsight_core::providers::prompts::RenderedPrompt;
use binsight_core::providers::{Completion, LlmProvider, ProviderError, ProviderId, TokenUsage};
use binsight_core::translate::TranslationOrchestrator;

/// A provider whose first completion is slow and whose payloads echo the
/// function name, so completion order differs from input order.
struct ScriptedProvider {
    calls: AtomicU32,
    usage_per_call: TokenUsage,
    concurrent: usize,
    fail_all: bool,
}

impl ScriptedProvider {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            usage_per_call: TokenUsage {
                prompt: 100,
                response: 50,
            },
            concurrent: 8,
            fail_all: false,
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAi
    }
    fn model(&self) -> &str {
        "scripted-model"
    }
    fn temperature(&self) -> f32 {
        0.1
    }
    fn concurrent_calls(&self) -> usize {
        self.concurrent
    }
    fn requests_per_minute(&self) -> u64 {
        1_000
    }
    fn tokens_per_minute(&self) -> u64 {
        1_000_000
    }
    fn max_response_tokens(&self) -> u32 {
        256
    }

    async fn complete(&self, prompt: &RenderedPrompt) -> Result<Completion, ProviderError> {
        if self.fail_all {
            return Err(ProviderError::ServerTransient {
                provider: ProviderId::OpenAi,
                status: None,
                message: "scripted outage".into(),
            });
        }

        // First call drags so its slot completes last.
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            tokio::time::sleep(Duration::from_millis(80)).await;
        }

        let text = if prompt.user.contains("Interpret these strings") {
            let mut entries = Vec::new();
            for index in 0..64 {
                if prompt.user.contains(&format!("\n{index}, ")) || prompt.user.contains(&format!("strings:\n{index}, ")) {
                    entries.push(format!(
                        "{{\"index\": {index}, \"meaning\": \"meaning-{index}\"}}"
                    ));
                }
            }
            format!("{{\"interpretations\": [{}]}}", entries.join(","))
        } else if prompt.user.contains("imports these functions") {
            "{\"explanation\": \"network library\"}".to_string()
        } else if prompt.user.contains("Summarize what this binary does") {
            "{\"summary\": \"A small network tool.\"}".to_string()
        } else {
            // Echo the function name back into the summary.
            let name = prompt
                .user
                .lines()
                .find_map(|line| line.strip_prefix("Function name: "))
                .unwrap_or("unknown");
            format!("{{\"summary\": \"explains {name}\"}}")
        };

        Ok(Completion {
            text,
            usage: self.usage_per_call,
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

fn artifact() -> DecompilationArtifact {
    DecompilationArtifact {
        sha256: "00".repeat(32),
        size_bytes: 2048,
        format: BinaryFormat::Elf,
        platform: Platform::Linux,
        architecture: "x86_64".into(),
        entry_point: Some("0x401000".into()),
        sections: vec![".text".into(), ".rodata".into()],
        functions: (0..3)
            .map(|i| FunctionInfo {
                name: format!("func_{i}"),
                address: format!("0x40{i}000"),
                size: 64,
                assembly: Some("push rbp".into()),
                calls_to: vec![],
                called_by: vec![],
                imports_used: vec![],
                string_refs: vec![],
            })
            .collect(),
        imports: vec![
            ImportInfo {
                library: "libc.so.6".into(),
                function: Some("printf".into()),
                ordinal: None,
                address: Some("0x4010a0".into()),
            },
            ImportInfo {
                library: "libssl.so.3".into(),
                function: Some("SSL_connect".into()),
                ordinal: None,
                address: None,
            },
            ImportInfo {
                library: "libc.so.6".into(),
                function: Some("malloc".into()),
                ordinal: None,
                address: None,
            },
        ],
        strings: (0..3)
            .map(|i| StringInfo {
                value: format!("string-{i}"),
                address: format!("0x50{i}000"),
                size: 8,
                encoding: StringEncoding::Ascii,
                section: Some(".rodata".into()),
            })
            .collect(),
        duration_seconds: 0.5,
        success: true,
        errors: vec![],
        warnings: vec![],
    }
}

fn job(config: JobConfig) -> Job {
    Job::new("user-1", "target.elf", 2048, "00".repeat(32), config, "/tmp/blob")
}

fn orchestrator(
    provider: Arc<dyn LlmProvider>,
) -> (TranslationOrchestrator, Arc<BreakerRegistry>) {
    let metrics = Metrics::new().unwrap();
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default(), metrics.clone()));
    let mut providers: HashMap<ProviderId, Arc<dyn LlmProvider>> = HashMap::new();
    providers.insert(ProviderId::OpenAi, provider);
    (
        TranslationOrchestrator::new(providers, breakers.clone(), None, metrics),
        breakers,
    )
}

#[tokio::test]
async fn outputs_preserve_input_order_despite_completion_order() {
    let (orchestrator, _breakers) = orchestrator(Arc::new(ScriptedProvider::new()));
    let mut config = JobConfig::default();
    config.provider = Some("openai".into());
    let job = job(config);

    let outcome = orchestrator
        .translate(&job, &artifact(), &CancelToken::new())
        .await;

    let names: Vec<_> = outcome
        .result
        .function_translations
        .iter()
        .map(|t| t.name.as_str())
        .collect();
    assert_eq!(names, vec!["func_0", "func_1", "func_2"]);
    for (i, translation) in outcome.result.function_translations.iter().enumerate() {
        assert_eq!(
            translation.summary.as_deref(),
            Some(format!("explains func_{i}").as_str()),
            "slot {i} must hold its own function's text"
        );
        assert!(translation.error.is_none());
        let metadata = translation.provider_metadata.as_ref().unwrap();
        assert_eq!(metadata.provider, "openai");
        assert_eq!(metadata.tokens_used, 150);
    }

    // Import groups preserve first-seen library order.
    let libraries: Vec<_> = outcome
        .result
        .import_explanations
        .iter()
        .map(|e| e.library.as_str())
        .collect();
    assert_eq!(libraries, vec!["libc.so.6", "libssl.so.3"]);
    assert_eq!(
        outcome.result.import_explanations[0].functions,
        vec!["printf", "malloc"]
    );

    // Strings come back in artifact order with their addresses.
    let addresses: Vec<_> = outcome
        .result
        .string_interpretations
        .iter()
        .map(|s| s.address.as_str())
        .collect();
    assert_eq!(addresses, vec!["0x500000", "0x501000", "0x502000"]);

    assert_eq!(
        outcome.result.overall_summary.as_deref(),
        Some("A small network tool.")
    );
    assert_eq!(outcome.provider, Some(ProviderId::OpenAi));
    assert!(outcome.cost_spent_usd > 0.0);
}

#[tokio::test]
async fn cost_budget_stops_dispatch_and_marks_remaining_units() {
    let mut provider = ScriptedProvider::new();
    // Serial dispatch makes the budget cutoff deterministic.
    provider.concurrent = 1;
    provider.usage_per_call = TokenUsage {
        prompt: 400_000,
        response: 200_000,
    };

    let (orchestrator, _breakers) = orchestrator(Arc::new(provider));
    let mut config = JobConfig::default();
    config.provider = Some("openai".into());
    config.include_imports = false;
    config.include_strings = false;
    config.include_overall_summary = true;
    // Roughly one call's worth of budget at the scripted usage.
    config.cost_limit_usd = 0.20;
    let job = job(config);

    let outcome = orchestrator
        .translate(&job, &artifact(), &CancelToken::new())
        .await;

    let ok_count = outcome
        .result
        .function_translations
        .iter()
        .filter(|t| t.error.is_none())
        .count();
    let exhausted_count = outcome
        .result
        .function_translations
        .iter()
        .filter(|t| t.error.as_deref() == Some("cost_budget_exhausted"))
        .count();

    assert!(ok_count >= 1, "the authorized call completes");
    assert!(exhausted_count >= 1, "later units hit the budget");
    assert_eq!(ok_count + exhausted_count, 3);
    // Spend may exceed the limit by at most the one authorized call.
    assert!(outcome.cost_spent_usd <= 0.20 + 0.9);
    assert!(outcome.warnings.iter().any(|w| w == "cost_budget_exhausted"));
    assert!(outcome.result.overall_summary.is_none());
}

#[tokio::test]
async fn open_circuit_yields_placeholders_and_warning() {
    let (orchestrator, breakers) = orchestrator(Arc::new(ScriptedProvider::new()));
    breakers.get_or_create("openai").force_open().await;

    let mut config = JobConfig::default();
    config.provider = Some("openai".into());
    let job = job(config);

    let outcome = orchestrator
        .translate(&job, &artifact(), &CancelToken::new())
        .await;

    assert_eq!(outcome.result.function_translations.len(), 3);
    for translation in &outcome.result.function_translations {
        assert_eq!(translation.error.as_deref(), Some("provider_unavailable"));
        assert!(translation.summary.is_none());
    }
    for explanation in &outcome.result.import_explanations {
        assert_eq!(explanation.error.as_deref(), Some("provider_unavailable"));
    }
    for interpretation in &outcome.result.string_interpretations {
        assert_eq!(interpretation.error.as_deref(), Some("provider_unavailable"));
    }
    assert!(outcome
        .warnings
        .iter()
        .any(|w| w == "circuit_open:openai"));
    assert!(outcome.result.overall_summary.is_none());
}

#[tokio::test]
async fn transient_failures_exhaust_retries_then_trip_the_breaker() {
    let mut provider = ScriptedProvider::new();
    provider.fail_all = true;
    provider.concurrent = 1;

    let (orchestrator, breakers) = orchestrator(Arc::new(provider));
    let mut config = JobConfig::default();
    config.provider = Some("openai".into());
    config.include_imports = false;
    config.include_strings = false;
    config.include_overall_summary = false;
    let job = job(config);

    let outcome = orchestrator
        .translate(&job, &artifact(), &CancelToken::new())
        .await;

    assert_eq!(outcome.result.function_translations.len(), 3);
    for translation in &outcome.result.function_translations {
        assert!(translation.error.is_some());
    }
    // Three attempts per unit, three units: well past the failure threshold.
    let snapshot = breakers.get_or_create("openai").snapshot().await;
    assert!(snapshot.failed_requests >= 3);
}

#[tokio::test]
async fn zero_function_cap_skips_function_translation_only() {
    let (orchestrator, _breakers) = orchestrator(Arc::new(ScriptedProvider::new()));
    let mut config = JobConfig::default();
    config.provider = Some("openai".into());
    config.max_functions_translate = Some(0);
    let job = job(config);

    let outcome = orchestrator
        .translate(&job, &artifact(), &CancelToken::new())
        .await;

    assert!(outcome.result.function_translations.is_empty());
    assert_eq!(outcome.result.import_explanations.len(), 2);
    assert_eq!(outcome.result.string_interpretations.len(), 3);
}
