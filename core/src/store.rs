//! Job and result persistence.
//!
//! Jobs live as hashes under `job:{id}`; results as JSON blobs under
//! `job:{id}:result`. The status field CAS is the single linearization
//! point for the lifecycle, so concurrent cancel and complete cannot both
//! win. Terminal records pick up a TTL and age out on their own.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::kv::{KvClient, KvError};
use crate::model::{Job, JobConfig, JobStage, JobStatus, TranslationResult};

fn job_key(id: &str) -> String {
    format!("job:{id}")
}

fn result_key(id: &str) -> String {
    format!("job:{id}:result")
}

fn artifact_key(id: &str) -> String {
    format!("job:{id}:artifact")
}

#[derive(Clone)]
pub struct JobStore {
    kv: KvClient,
    result_ttl_secs: u64,
}

impl JobStore {
    pub fn new(kv: KvClient, result_ttl_secs: u64) -> Self {
        Self { kv, result_ttl_secs }
    }

    pub async fn create(&self, job: &Job) -> Result<(), KvError> {
        self.kv.hset_all(&job_key(&job.id), &job_to_fields(job)).await
    }

    pub async fn save(&self, job: &Job) -> Result<(), KvError> {
        self.kv.hset_all(&job_key(&job.id), &job_to_fields(job)).await
    }

    pub async fn load(&self, id: &str) -> Result<Option<Job>, KvError> {
        let fields = self.kv.hget_all(&job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(job_from_fields(&fields))
    }

    /// Atomic status transition. On success, stamps the matching timestamp
    /// and applies the retention TTL once the job is terminal.
    pub async fn try_transition(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, KvError> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let won = self
            .kv
            .hcas(&job_key(id), "status", from.as_str(), to.as_str())
            .await?;
        if !won {
            return Ok(false);
        }

        let now = Utc::now().to_rfc3339();
        match to {
            JobStatus::Processing => {
                self.kv.hset(&job_key(id), "started_at", &now).await?;
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.kv.hset(&job_key(id), "completed_at", &now).await?;
                self.kv.expire(&job_key(id), self.result_ttl_secs).await?;
            }
            JobStatus::Pending => {}
        }
        Ok(true)
    }

    /// CAS on the internal stage marker; this is how a cancel and a worker
    /// race for a job that is claimed but not yet decompiling.
    pub async fn try_stage(&self, id: &str, from: JobStage, to: JobStage) -> Result<bool, KvError> {
        self.kv
            .hcas(&job_key(id), "stage", from.as_str(), to.as_str())
            .await
    }

    pub async fn set_progress(&self, id: &str, percentage: u8) -> Result<(), KvError> {
        self.kv
            .hset(&job_key(id), "progress_percentage", &percentage.to_string())
            .await
    }

    pub async fn store_result(&self, id: &str, result: &TranslationResult) -> Result<(), KvError> {
        let payload = serde_json::to_string(result)
            .map_err(|err| KvError::Command(format!("result serialization failed: {err}")))?;
        self.kv
            .set_with_ttl(&result_key(id), &payload, self.result_ttl_secs)
            .await
    }

    pub async fn load_result(&self, id: &str) -> Result<Option<TranslationResult>, KvError> {
        let Some(payload) = self.kv.get(&result_key(id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&payload)
            .map(Some)
            .map_err(|err| KvError::Command(format!("result deserialization failed: {err}")))
    }

    /// Normalized artifact, kept alongside the result for raw-data fetches.
    pub async fn store_artifact(
        &self,
        id: &str,
        artifact: &crate::model::DecompilationArtifact,
    ) -> Result<(), KvError> {
        let payload = serde_json::to_string(artifact)
            .map_err(|err| KvError::Command(format!("artifact serialization failed: {err}")))?;
        self.kv
            .set_with_ttl(&artifact_key(id), &payload, self.result_ttl_secs)
            .await
    }

    pub async fn load_artifact(
        &self,
        id: &str,
    ) -> Result<Option<crate::model::DecompilationArtifact>, KvError> {
        let Some(payload) = self.kv.get(&artifact_key(id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&payload)
            .map(Some)
            .map_err(|err| KvError::Command(format!("artifact deserialization failed: {err}")))
    }
}

fn job_to_fields(job: &Job) -> Vec<(String, String)> {
    let mut fields = vec![
        ("id".into(), job.id.clone()),
        ("user_id".into(), job.user_id.clone()),
        ("filename".into(), job.filename.clone()),
        ("size_bytes".into(), job.size_bytes.to_string()),
        ("sha256".into(), job.sha256.clone()),
        (
            "config".into(),
            serde_json::to_string(&job.config).unwrap_or_else(|_| "{}".into()),
        ),
        ("status".into(), job.status.as_str().into()),
        ("stage".into(), job.stage.as_str().into()),
        (
            "progress_percentage".into(),
            job.progress_percentage.to_string(),
        ),
        ("created_at".into(), job.created_at.to_rfc3339()),
        (
            "errors".into(),
            serde_json::to_string(&job.errors).unwrap_or_else(|_| "[]".into()),
        ),
        (
            "warnings".into(),
            serde_json::to_string(&job.warnings).unwrap_or_else(|_| "[]".into()),
        ),
        ("blob_path".into(), job.blob_path.clone()),
    ];
    if let Some(started_at) = job.started_at {
        fields.push(("started_at".into(), started_at.to_rfc3339()));
    }
    if let Some(completed_at) = job.completed_at {
        fields.push(("completed_at".into(), completed_at.to_rfc3339()));
    }
    fields
}

fn job_from_fields(fields: &HashMap<String, String>) -> Option<Job> {
    let parse_time = |name: &str| -> Option<DateTime<Utc>> {
        fields
            .get(name)
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|time| time.with_timezone(&Utc))
    };

    let config: JobConfig = fields
        .get("config")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();

    Some(Job {
        id: fields.get("id")?.clone(),
        user_id: fields.get("user_id")?.clone(),
        filename: fields.get("filename")?.clone(),
        size_bytes: fields.get("size_bytes")?.parse().ok()?,
        sha256: fields.get("sha256")?.clone(),
        config,
        status: JobStatus::try_from(fields.get("status")?.as_str()).ok()?,
        stage: fields
            .get("stage")
            .and_then(|raw| JobStage::try_from(raw.as_str()).ok())
            .unwrap_or(JobStage::Queued),
        progress_percentage: fields
            .get("progress_percentage")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0),
        created_at: parse_time("created_at")?,
        started_at: parse_time("started_at"),
        completed_at: parse_time("completed_at"),
        errors: fields
            .get("errors")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default(),
        warnings: fields
            .get("warnings")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default(),
        blob_path: fields.get("blob_path").cloned().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnalysisDepth, Priority};

    fn sample_job() -> Job {
        let mut config = JobConfig::default();
        config.analysis_depth = AnalysisDepth::Comprehensive;
        config.priority = Priority::High;
        config.cost_limit_usd = 2.5;
        let mut job = Job::new(
            "user-1",
            "sample.exe",
            4096,
            "ab".repeat(32),
            config,
            "/tmp/binsight/dec_x.bin",
        );
        job.warnings.push("function_list_truncated: 150".into());
        job
    }

    #[test]
    fn job_round_trips_through_hash_fields() {
        let job = sample_job();
        let fields: HashMap<String, String> = job_to_fields(&job).into_iter().collect();
        let parsed = job_from_fields(&fields).unwrap();

        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.status, JobStatus::Pending);
        assert_eq!(parsed.stage, JobStage::Queued);
        assert_eq!(parsed.config.analysis_depth, AnalysisDepth::Comprehensive);
        assert_eq!(parsed.config.priority, Priority::High);
        assert_eq!(parsed.size_bytes, 4096);
        assert_eq!(parsed.warnings, job.warnings);
        assert!(parsed.started_at.is_none());
    }

    #[test]
    fn optional_timestamps_survive() {
        let mut job = sample_job();
        job.started_at = Some(Utc::now());
        job.completed_at = Some(Utc::now());
        let fields: HashMap<String, String> = job_to_fields(&job).into_iter().collect();
        let parsed = job_from_fields(&fields).unwrap();
        assert!(parsed.started_at.is_some());
        assert!(parsed.completed_at.is_some());
        assert!(parsed.completed_at.unwrap() >= parsed.started_at.unwrap());
    }

    #[test]
    fn missing_core_fields_reject_the_record() {
        let mut fields: HashMap<String, String> =
            job_to_fields(&sample_job()).into_iter().collect();
        fields.remove("status");
        assert!(job_from_fields(&fields).is_none());
    }
}
