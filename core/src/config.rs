//! Runtime configuration for the decompilation service.
//!
//! Settings are plain serde structs with defaults; `Settings::from_env`
//! overlays the documented environment variables on top of those defaults.
//! Malformed values are reported as `ConfigError` rather than silently
//! falling back.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use thiserror::Error;

use crate::model::Tier;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {variable}: {value} ({reason})")]
    InvalidValue {
        variable: String,
        value: String,
        reason: String,
    },
    #[error("missing required setting: {0}")]
    Missing(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    /// Disables authentication and rate limiting and enables the dev
    /// key-creation endpoint. Never enable in production.
    pub dev_mode: bool,
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            cors_origins: vec!["*".into()],
            dev_mode: false,
            log_level: "info".into(),
            log_format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    pub max_file_size_mib: u64,
    pub max_functions: usize,
    pub max_strings: usize,
    pub max_imports: usize,
    /// Submissions beyond this many queued jobs are rejected with 503.
    pub queue_ceiling: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_file_size_mib: 100,
            max_functions: 2_000,
            max_strings: 5_000,
            max_imports: 2_000,
            queue_ceiling: 500,
        }
    }
}

impl LimitSettings {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mib * 1024 * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvSettings {
    pub url: String,
    /// TTL applied to terminal job records and result blobs.
    pub result_ttl_secs: u64,
}

impl Default for KvSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            result_ttl_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompilerSettings {
    /// Path to the radare2-compatible disassembler binary.
    pub binary: String,
    pub command_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for DecompilerSettings {
    fn default() -> Self {
        Self {
            binary: "radare2".into(),
            command_timeout_secs: 30,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub model: String,
    /// Custom endpoint for OpenAI-compatible deployments.
    pub endpoint: Option<String>,
    pub temperature: f32,
    pub max_response_tokens: u32,
    pub request_timeout_secs: u64,
    pub concurrent_calls: usize,
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
}

impl ProviderSettings {
    fn with_model(model: &str) -> Self {
        Self {
            api_key: None,
            model: model.into(),
            endpoint: None,
            temperature: 0.1,
            max_response_tokens: 2048,
            request_timeout_secs: 30,
            concurrent_calls: 8,
            requests_per_minute: 60,
            tokens_per_minute: 40_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub openai: ProviderSettings,
    pub anthropic: ProviderSettings,
    pub gemini: ProviderSettings,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            openai: ProviderSettings::with_model("gpt-4o-mini"),
            anthropic: ProviderSettings::with_model("claude-3-5-haiku-latest"),
            gemini: ProviderSettings::with_model("gemini-2.0-flash"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    pub api_key_prefix: String,
    /// Deployment secret used to HMAC raw API keys before storage.
    pub api_key_secret: String,
    pub api_key_expiry_days: Option<u32>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            api_key_prefix: "ak_".into(),
            api_key_secret: "development-only-secret".into(),
            api_key_expiry_days: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub count: usize,
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: num_cpus(),
            default_timeout_secs: 600,
            max_timeout_secs: 1800,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierQuotas {
    pub per_minute: u64,
    pub per_day: u64,
    pub burst: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateTierSettings {
    pub anonymous: TierQuotas,
    pub basic: TierQuotas,
    pub standard: TierQuotas,
    pub premium: TierQuotas,
    pub enterprise: TierQuotas,
}

impl Default for RateTierSettings {
    fn default() -> Self {
        Self {
            anonymous: TierQuotas {
                per_minute: 5,
                per_day: 200,
                burst: 0,
            },
            basic: TierQuotas {
                per_minute: 10,
                per_day: 1_000,
                burst: 0,
            },
            standard: TierQuotas {
                per_minute: 60,
                per_day: 10_000,
                burst: 10,
            },
            premium: TierQuotas {
                per_minute: 300,
                per_day: 50_000,
                burst: 30,
            },
            enterprise: TierQuotas {
                per_minute: 1_000,
                per_day: 200_000,
                burst: 100,
            },
        }
    }
}

impl RateTierSettings {
    pub fn for_tier(&self, tier: Option<Tier>) -> TierQuotas {
        match tier {
            None => self.anonymous,
            Some(Tier::Basic) => self.basic,
            Some(Tier::Standard) => self.standard,
            Some(Tier::Premium) => self.premium,
            Some(Tier::Enterprise) => self.enterprise,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub limits: LimitSettings,
    pub kv: KvSettings,
    pub decompiler: DecompilerSettings,
    pub llm: LlmSettings,
    pub security: SecuritySettings,
    pub workers: WorkerSettings,
    pub rate_tiers: RateTierSettings,
}

impl Settings {
    /// Build settings from the process environment on top of defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Same as [`Settings::from_env`] but with an explicit variable map,
    /// which keeps the overlay testable.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();

        if let Some(host) = vars.get("BINSIGHT_HOST") {
            settings.server.host = host.clone();
        }
        if let Some(port) = vars.get("BINSIGHT_PORT") {
            settings.server.port = parse("BINSIGHT_PORT", port)?;
        }
        if let Some(origins) = vars.get("BINSIGHT_CORS_ORIGINS") {
            settings.server.cors_origins = origins
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect();
        }
        if let Some(dev) = vars.get("BINSIGHT_DEV_MODE") {
            settings.server.dev_mode = parse_bool("BINSIGHT_DEV_MODE", dev)?;
        }
        if let Some(level) = vars.get("BINSIGHT_LOG_LEVEL") {
            settings.server.log_level = level.clone();
        }
        if let Some(format) = vars.get("BINSIGHT_LOG_FORMAT") {
            settings.server.log_format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(ConfigError::InvalidValue {
                        variable: "BINSIGHT_LOG_FORMAT".into(),
                        value: other.into(),
                        reason: "expected json or text".into(),
                    })
                }
            };
        }

        if let Some(size) = vars.get("BINSIGHT_MAX_FILE_SIZE_MIB") {
            settings.limits.max_file_size_mib = parse("BINSIGHT_MAX_FILE_SIZE_MIB", size)?;
        }
        if let Some(ceiling) = vars.get("BINSIGHT_QUEUE_CEILING") {
            settings.limits.queue_ceiling = parse("BINSIGHT_QUEUE_CEILING", ceiling)?;
        }

        if let Some(url) = vars.get("BINSIGHT_KV_URL") {
            settings.kv.url = url.clone();
        }

        if let Some(binary) = vars.get("BINSIGHT_DECOMPILER_BIN") {
            settings.decompiler.binary = binary.clone();
        }

        if let Some(count) = vars.get("BINSIGHT_WORKERS") {
            settings.workers.count = parse("BINSIGHT_WORKERS", count)?;
        }
        if let Some(secs) = vars.get("BINSIGHT_DEFAULT_TIMEOUT_SECS") {
            settings.workers.default_timeout_secs = parse("BINSIGHT_DEFAULT_TIMEOUT_SECS", secs)?;
        }
        if let Some(secs) = vars.get("BINSIGHT_MAX_TIMEOUT_SECS") {
            settings.workers.max_timeout_secs = parse("BINSIGHT_MAX_TIMEOUT_SECS", secs)?;
        }

        if let Some(key) = vars.get("OPENAI_API_KEY") {
            settings.llm.openai.api_key = Some(key.clone());
        }
        if let Some(key) = vars.get("ANTHROPIC_API_KEY") {
            settings.llm.anthropic.api_key = Some(key.clone());
        }
        if let Some(key) = vars.get("GEMINI_API_KEY") {
            settings.llm.gemini.api_key = Some(key.clone());
        }
        if let Some(model) = vars.get("BINSIGHT_OPENAI_MODEL") {
            settings.llm.openai.model = model.clone();
        }
        if let Some(model) = vars.get("BINSIGHT_ANTHROPIC_MODEL") {
            settings.llm.anthropic.model = model.clone();
        }
        if let Some(model) = vars.get("BINSIGHT_GEMINI_MODEL") {
            settings.llm.gemini.model = model.clone();
        }
        if let Some(endpoint) = vars.get("BINSIGHT_OPENAI_ENDPOINT") {
            validate_endpoint("BINSIGHT_OPENAI_ENDPOINT", endpoint)?;
            settings.llm.openai.endpoint = Some(endpoint.trim().to_string());
        }

        if let Some(prefix) = vars.get("BINSIGHT_API_KEY_PREFIX") {
            settings.security.api_key_prefix = prefix.clone();
        }
        if let Some(secret) = vars.get("BINSIGHT_API_KEY_SECRET") {
            settings.security.api_key_secret = secret.clone();
        }

        for (tier_name, quotas) in [
            ("BASIC", &mut settings.rate_tiers.basic),
            ("STANDARD", &mut settings.rate_tiers.standard),
            ("PREMIUM", &mut settings.rate_tiers.premium),
            ("ENTERPRISE", &mut settings.rate_tiers.enterprise),
        ] {
            let variable = format!("BINSIGHT_TIER_{tier_name}_PER_MINUTE");
            if let Some(value) = vars.get(&variable) {
                quotas.per_minute = parse(&variable, value)?;
            }
            let variable = format!("BINSIGHT_TIER_{tier_name}_PER_DAY");
            if let Some(value) = vars.get(&variable) {
                quotas.per_day = parse(&variable, value)?;
            }
        }

        Ok(settings)
    }
}

fn parse<T: std::str::FromStr>(variable: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| ConfigError::InvalidValue {
            variable: variable.into(),
            value: value.into(),
            reason: format!("{err}"),
        })
}

fn parse_bool(variable: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            variable: variable.into(),
            value: other.into(),
            reason: "expected a boolean".into(),
        }),
    }
}

fn validate_endpoint(variable: &str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            variable: variable.into(),
            value: value.into(),
            reason: "endpoint must start with http:// or https://".into(),
        })
    }
}
