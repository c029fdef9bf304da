//! Core data model: jobs, decompilation artifacts, translation results and
//! API key records.
//!
//! Statuses, tiers and formats are closed sum types; anything arriving from
//! the wire goes through an explicit validation pass that returns a
//! structured [`ValidationError`] instead of partially-populated records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub const JOB_ID_PREFIX: &str = "dec_";

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("field {field} is invalid: {reason}")]
    Field { field: &'static str, reason: String },
    #[error("uploaded file is empty")]
    EmptyFile,
    #[error("uploaded file exceeds the {max_bytes} byte limit ({actual} bytes)")]
    FileTooLarge { max_bytes: u64, actual: u64 },
    #[error("unknown value {value:?} for {field}")]
    UnknownVariant { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The §status transition graph: pending → {processing, cancelled},
    /// processing → {completed, failed, cancelled}, terminal states sink.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing | JobStatus::Cancelled) => true,
            (
                JobStatus::Processing,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled,
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for JobStatus {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(ValidationError::UnknownVariant {
                field: "status",
                value: other.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisDepth {
    Basic,
    Standard,
    Comprehensive,
}

impl AnalysisDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisDepth::Basic => "basic",
            AnalysisDepth::Standard => "standard",
            AnalysisDepth::Comprehensive => "comprehensive",
        }
    }

    /// The disassembler analysis command for this depth.
    pub fn analysis_command(&self) -> &'static str {
        match self {
            AnalysisDepth::Basic => "aa",
            AnalysisDepth::Standard => "aaa",
            AnalysisDepth::Comprehensive => "aaaa",
        }
    }

    /// Soft timeout for the analysis command; exceeding it downgrades the
    /// depth once.
    pub fn soft_timeout_secs(&self) -> u64 {
        match self {
            AnalysisDepth::Basic => 30,
            AnalysisDepth::Standard => 120,
            AnalysisDepth::Comprehensive => 300,
        }
    }

    pub fn downgraded(&self) -> Option<AnalysisDepth> {
        match self {
            AnalysisDepth::Basic => None,
            AnalysisDepth::Standard => Some(AnalysisDepth::Basic),
            AnalysisDepth::Comprehensive => Some(AnalysisDepth::Standard),
        }
    }
}

impl TryFrom<&str> for AnalysisDepth {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "basic" => Ok(AnalysisDepth::Basic),
            "standard" => Ok(AnalysisDepth::Standard),
            "comprehensive" => Ok(AnalysisDepth::Comprehensive),
            other => Err(ValidationError::UnknownVariant {
                field: "analysis_depth",
                value: other.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationDetail {
    Brief,
    Standard,
    Comprehensive,
}

impl TranslationDetail {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranslationDetail::Brief => "brief",
            TranslationDetail::Standard => "standard",
            TranslationDetail::Comprehensive => "comprehensive",
        }
    }
}

impl TryFrom<&str> for TranslationDetail {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "brief" => Ok(TranslationDetail::Brief),
            "standard" => Ok(TranslationDetail::Standard),
            "comprehensive" => Ok(TranslationDetail::Comprehensive),
            other => Err(ValidationError::UnknownVariant {
                field: "translation_detail",
                value: other.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }

    /// Queue pop order, highest first.
    pub fn ordered_desc() -> [Priority; 3] {
        [Priority::High, Priority::Normal, Priority::Low]
    }
}

impl TryFrom<&str> for Priority {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(ValidationError::UnknownVariant {
                field: "priority",
                value: other.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryFormat {
    Pe,
    Elf,
    Macho,
    Unknown,
}

impl BinaryFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryFormat::Pe => "pe",
            BinaryFormat::Elf => "elf",
            BinaryFormat::Macho => "macho",
            BinaryFormat::Unknown => "unknown",
        }
    }

    pub fn default_platform(&self) -> Platform {
        match self {
            BinaryFormat::Pe => Platform::Windows,
            BinaryFormat::Elf => Platform::Linux,
            BinaryFormat::Macho => Platform::Macos,
            BinaryFormat::Unknown => Platform::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Linux,
    Macos,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringEncoding {
    #[serde(rename = "ascii")]
    Ascii,
    #[serde(rename = "utf-16")]
    Utf16,
    #[serde(rename = "utf-32")]
    Utf32,
}

/// Access tiers in ascending order; the derived `Ord` is the authorization
/// order, so keep the variants sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Basic,
    Standard,
    Premium,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Basic => "basic",
            Tier::Standard => "standard",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl TryFrom<&str> for Tier {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "basic" => Ok(Tier::Basic),
            "standard" => Ok(Tier::Standard),
            "premium" => Ok(Tier::Premium),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(ValidationError::UnknownVariant {
                field: "tier",
                value: other.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
        }
    }
}

impl TryFrom<&str> for Permission {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "admin" => Ok(Permission::Admin),
            other => Err(ValidationError::UnknownVariant {
                field: "permission",
                value: other.into(),
            }),
        }
    }
}

/// Caller-supplied knobs for a submission, already validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub analysis_depth: AnalysisDepth,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub translation_detail: TranslationDetail,
    pub include_functions: bool,
    pub include_imports: bool,
    pub include_strings: bool,
    pub include_overall_summary: bool,
    pub max_functions_translate: Option<usize>,
    pub cost_limit_usd: f64,
    pub timeout_secs: u64,
    pub priority: Priority,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            analysis_depth: AnalysisDepth::Standard,
            provider: None,
            model: None,
            translation_detail: TranslationDetail::Standard,
            include_functions: true,
            include_imports: true,
            include_strings: true,
            include_overall_summary: true,
            max_functions_translate: None,
            cost_limit_usd: 5.0,
            timeout_secs: 600,
            priority: Priority::Normal,
        }
    }
}

/// Internal processing stage, used to decide whether a cancel may still win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Queued,
    Claimed,
    Decompiling,
    Translating,
    Done,
    Cancelled,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Queued => "queued",
            JobStage::Claimed => "claimed",
            JobStage::Decompiling => "decompiling",
            JobStage::Translating => "translating",
            JobStage::Done => "done",
            JobStage::Cancelled => "cancelled",
        }
    }
}

impl TryFrom<&str> for JobStage {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "queued" => Ok(JobStage::Queued),
            "claimed" => Ok(JobStage::Claimed),
            "decompiling" => Ok(JobStage::Decompiling),
            "translating" => Ok(JobStage::Translating),
            "done" => Ok(JobStage::Done),
            "cancelled" => Ok(JobStage::Cancelled),
            other => Err(ValidationError::UnknownVariant {
                field: "stage",
                value: other.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub config: JobConfig,
    pub status: JobStatus,
    pub stage: JobStage,
    pub progress_percentage: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Path of the temp blob the worker reads; owned by the worker after
    /// claim and removed on every exit path.
    pub blob_path: String,
}

impl Job {
    pub fn new(
        user_id: impl Into<String>,
        filename: impl Into<String>,
        size_bytes: u64,
        sha256: impl Into<String>,
        config: JobConfig,
        blob_path: impl Into<String>,
    ) -> Self {
        Self {
            id: new_job_id(),
            user_id: user_id.into(),
            filename: filename.into(),
            size_bytes,
            sha256: sha256.into(),
            config,
            status: JobStatus::Pending,
            stage: JobStage::Queued,
            progress_percentage: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            blob_path: blob_path.into(),
        }
    }
}

pub fn new_job_id() -> String {
    format!("{JOB_ID_PREFIX}{}", Uuid::new_v4().simple())
}

pub fn is_job_id(value: &str) -> bool {
    value
        .strip_prefix(JOB_ID_PREFIX)
        .map(|rest| rest.len() == 32 && rest.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or(false)
}

/// Lowercase `0x`-prefixed hex rendering used for every address field.
pub fn format_address(value: u64) -> String {
    format!("{value:#x}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub address: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assembly: Option<String>,
    pub calls_to: Vec<String>,
    pub called_by: Vec<String>,
    pub imports_used: Vec<String>,
    pub string_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportInfo {
    pub library: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringInfo {
    pub value: String,
    pub address: String,
    pub size: u64,
    pub encoding: StringEncoding,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompilationArtifact {
    pub sha256: String,
    pub size_bytes: u64,
    pub format: BinaryFormat,
    pub platform: Platform,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    pub sections: Vec<String>,
    pub functions: Vec<FunctionInfo>,
    pub imports: Vec<ImportInfo>,
    pub strings: Vec<StringInfo>,
    pub duration_seconds: f64,
    pub success: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub provider: String,
    pub model: String,
    pub tokens_used: u32,
    pub processing_ms: u64,
    pub cost_estimate_usd: f64,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionTranslation {
    pub name: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub behavior: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<ProviderMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportExplanation {
    pub library: String,
    pub functions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<ProviderMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringInterpretation {
    pub address: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpretation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<ProviderMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslationResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_summary: Option<String>,
    pub function_translations: Vec<FunctionTranslation>,
    pub import_explanations: Vec<ImportExplanation>,
    pub string_interpretations: Vec<StringInterpretation>,
}

/// Stored record for an API key. The raw key never appears here; the store
/// is addressed by an HMAC of the raw key instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub user_id: String,
    pub tier: Tier,
    pub permissions: Vec<Permission>,
    pub status: ApiKeyStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Revoked,
}

impl ApiKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKeyStatus::Active => "active",
            ApiKeyStatus::Revoked => "revoked",
        }
    }
}

impl TryFrom<&str> for ApiKeyStatus {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "active" => Ok(ApiKeyStatus::Active),
            "revoked" => Ok(ApiKeyStatus::Revoked),
            other => Err(ValidationError::UnknownVariant {
                field: "key status",
                value: other.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_graph_matches_lifecycle() {
        use JobStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));

        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(!Processing.can_transition_to(Pending));

        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Processing, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn job_ids_carry_prefix_and_parse() {
        let id = new_job_id();
        assert!(id.starts_with(JOB_ID_PREFIX));
        assert!(is_job_id(&id));
        assert!(!is_job_id("dec_short"));
        assert!(!is_job_id("job_0123456789abcdef0123456789abcdef"));
    }

    #[test]
    fn two_jobs_get_distinct_ids() {
        assert_ne!(new_job_id(), new_job_id());
    }

    #[test]
    fn addresses_render_lowercase_hex() {
        assert_eq!(format_address(0x401000), "0x401000");
        assert_eq!(format_address(0xDEADBEEF), "0xdeadbeef");
    }

    #[test]
    fn tiers_are_totally_ordered() {
        assert!(Tier::Basic < Tier::Standard);
        assert!(Tier::Standard < Tier::Premium);
        assert!(Tier::Premium < Tier::Enterprise);
    }

    #[test]
    fn depth_maps_to_command_and_timeout() {
        assert_eq!(AnalysisDepth::Basic.analysis_command(), "aa");
        assert_eq!(AnalysisDepth::Standard.analysis_command(), "aaa");
        assert_eq!(AnalysisDepth::Comprehensive.analysis_command(), "aaaa");
        assert_eq!(AnalysisDepth::Comprehensive.soft_timeout_secs(), 300);
        assert_eq!(
            AnalysisDepth::Comprehensive.downgraded(),
            Some(AnalysisDepth::Standard)
        );
        assert_eq!(AnalysisDepth::Basic.downgraded(), None);
    }

    #[test]
    fn priority_pop_order_is_high_first() {
        assert_eq!(
            Priority::ordered_desc(),
            [Priority::High, Priority::Normal, Priority::Low]
        );
    }

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(
            serde_json::to_string(&StringEncoding::Utf16).unwrap(),
            "\"utf-16\""
        );
    }
}
