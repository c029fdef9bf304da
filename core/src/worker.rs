//! Job pipeline and worker pool.
//!
//! Workers are long-lived tasks pulling from the ready queue. Each claims a
//! job through the status CAS, runs decompilation then translation under
//! the job deadline, persists the outcome and transitions to a terminal
//! state. Cancels race workers through a second CAS on the internal stage
//! marker and can only win before the decompiler run starts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::config::{LimitSettings, WorkerSettings};
use crate::decompiler::Decompiler;
use crate::kv::KvError;
use crate::metrics::Metrics;
use crate::model::{Job, JobConfig, JobStage, JobStatus, TranslationResult};
use crate::queue::ReadyQueue;
use crate::sniff::sniff_format;
use crate::store::JobStore;
use crate::translate::TranslationOrchestrator;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("uploaded file is empty")]
    EmptyFile,
    #[error("file of {actual} bytes exceeds the {max} byte limit")]
    TooLarge { actual: u64, max: u64 },
    #[error("queue is full")]
    QueueFull,
    #[error("blob write failed: {0}")]
    BlobWrite(String),
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// A job snapshot plus whatever terminal data exists.
#[derive(Debug, Clone)]
pub struct JobView {
    pub job: Job,
    pub result: Option<TranslationResult>,
    pub artifact: Option<crate::model::DecompilationArtifact>,
}

pub struct JobPipeline {
    store: JobStore,
    queue: ReadyQueue,
    decompiler: Arc<Decompiler>,
    orchestrator: Arc<TranslationOrchestrator>,
    metrics: Metrics,
    worker_settings: WorkerSettings,
    limits: LimitSettings,
    blob_dir: PathBuf,
    shutdown: CancelToken,
}

impl JobPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: JobStore,
        queue: ReadyQueue,
        decompiler: Arc<Decompiler>,
        orchestrator: Arc<TranslationOrchestrator>,
        metrics: Metrics,
        worker_settings: WorkerSettings,
        limits: LimitSettings,
        blob_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            queue,
            decompiler,
            orchestrator,
            metrics,
            worker_settings,
            limits,
            blob_dir,
            shutdown: CancelToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    /// Validate an upload, persist its blob, create the job record and
    /// enqueue it.
    pub async fn submit(
        &self,
        user_id: &str,
        filename: &str,
        bytes: &[u8],
        config: JobConfig,
    ) -> Result<Job, SubmitError> {
        if bytes.is_empty() {
            return Err(SubmitError::EmptyFile);
        }
        let max = self.limits.max_file_size_bytes();
        if bytes.len() as u64 > max {
            return Err(SubmitError::TooLarge {
                actual: bytes.len() as u64,
                max,
            });
        }

        let depth = self.queue.total_depth().await?;
        if depth as usize >= self.limits.queue_ceiling {
            return Err(SubmitError::QueueFull);
        }

        let sha256 = {
            use sha2::{Digest, Sha256};
            hex::encode(Sha256::digest(bytes))
        };

        let mut job = Job::new(user_id, filename, bytes.len() as u64, sha256, config, "");
        let blob_path = self.blob_dir.join(format!("{}.bin", job.id));
        job.blob_path = blob_path.to_string_lossy().into_owned();

        tokio::fs::create_dir_all(&self.blob_dir)
            .await
            .map_err(|err| SubmitError::BlobWrite(err.to_string()))?;
        tokio::fs::write(&blob_path, bytes)
            .await
            .map_err(|err| SubmitError::BlobWrite(err.to_string()))?;

        // Pre-tag the upload; an unknown signature is only a warning, the
        // disassembler gets the final word.
        let (format, _platform) = sniff_format(&bytes[..bytes.len().min(16)]);
        if format == crate::model::BinaryFormat::Unknown {
            job.warnings.push("unrecognized_format_signature".into());
        }

        if let Err(err) = self.store.create(&job).await {
            let _ = tokio::fs::remove_file(&blob_path).await;
            return Err(err.into());
        }
        if let Err(err) = self.queue.push(&job.id, job.config.priority).await {
            let _ = tokio::fs::remove_file(&blob_path).await;
            return Err(err.into());
        }

        self.metrics
            .jobs_submitted
            .with_label_values(&[job.config.priority.as_str()])
            .inc();
        tracing::info!(job_id = %job.id, user_id, priority = job.config.priority.as_str(), "job queued");
        Ok(job)
    }

    /// Current job snapshot; terminal completed jobs include the stored
    /// result, and `include_raw` adds the normalized artifact.
    pub async fn fetch(&self, job_id: &str, include_raw: bool) -> Result<Option<JobView>, KvError> {
        let Some(job) = self.store.load(job_id).await? else {
            return Ok(None);
        };
        let result = if job.status == JobStatus::Completed {
            self.store.load_result(job_id).await?
        } else {
            None
        };
        let artifact = if include_raw && job.status == JobStatus::Completed {
            self.store.load_artifact(job_id).await?
        } else {
            None
        };
        Ok(Some(JobView {
            job,
            result,
            artifact,
        }))
    }

    /// Cancel a job. Wins from `pending`, or from `processing` while the
    /// worker has only claimed it; anything later returns false and leaves
    /// state untouched. Idempotent on terminal jobs.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, KvError> {
        if self
            .store
            .try_transition(job_id, JobStatus::Pending, JobStatus::Cancelled)
            .await?
        {
            self.metrics
                .jobs_finished
                .with_label_values(&[JobStatus::Cancelled.as_str()])
                .inc();
            tracing::info!(job_id, "job cancelled while pending");
            return Ok(true);
        }

        // Race the worker for a claimed-but-not-yet-decompiling job.
        if self
            .store
            .try_stage(job_id, JobStage::Claimed, JobStage::Cancelled)
            .await?
        {
            let cancelled = self
                .store
                .try_transition(job_id, JobStatus::Processing, JobStatus::Cancelled)
                .await?;
            if cancelled {
                self.metrics
                    .jobs_finished
                    .with_label_values(&[JobStatus::Cancelled.as_str()])
                    .inc();
                tracing::info!(job_id, "job cancelled during claim");
            }
            return Ok(cancelled);
        }

        Ok(false)
    }

    pub async fn queue_depth(&self) -> Result<u64, KvError> {
        self.queue.total_depth().await
    }

    /// Start the worker pool. Workers run until the shutdown token fires.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.worker_settings.count.max(1))
            .map(|worker_id| {
                let pipeline = self.clone();
                tokio::spawn(async move { pipeline.worker_loop(worker_id).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        tracing::info!(worker_id, "worker started");
        while !self.shutdown.is_cancelled() {
            match self.queue.pop(5).await {
                Ok(Some(job_id)) => self.process(&job_id).await,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(worker_id, error = %err, "queue pop failed; backing off");
                    if !self.shutdown.sleep(Duration::from_secs(1)).await {
                        break;
                    }
                }
            }
        }
        tracing::info!(worker_id, "worker stopped");
    }

    async fn process(&self, job_id: &str) {
        let Ok(Some(mut job)) = self.store.load(job_id).await else {
            tracing::warn!(job_id, "popped job without a record");
            return;
        };

        // Claim. Losing means a cancel got there first.
        match self
            .store
            .try_transition(job_id, JobStatus::Pending, JobStatus::Processing)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.remove_blob(&job).await;
                return;
            }
            Err(err) => {
                tracing::warn!(job_id, error = %err, "claim failed");
                return;
            }
        }
        let _ = self
            .store
            .try_stage(job_id, JobStage::Queued, JobStage::Claimed)
            .await;
        // Keep the local copy aligned with the CAS'd fields so later saves
        // never write stale status over the linearization point.
        job.status = JobStatus::Processing;
        job.stage = JobStage::Claimed;
        job.started_at = Some(chrono::Utc::now());
        job.progress_percentage = 10;
        let _ = self.store.set_progress(job_id, 10).await;

        let deadline = Duration::from_secs(
            job.config
                .timeout_secs
                .min(self.worker_settings.max_timeout_secs)
                .max(1),
        );
        let started = Instant::now();
        let cancel = CancelToken::new();

        // The decompiler-run boundary: once this CAS wins, cancels no
        // longer do.
        match self
            .store
            .try_stage(job_id, JobStage::Claimed, JobStage::Decompiling)
            .await
        {
            Ok(true) => {}
            _ => {
                // A cancel took the stage; it owns the status transition.
                self.remove_blob(&job).await;
                return;
            }
        }
        job.stage = JobStage::Decompiling;

        let stage_started = Instant::now();
        let decompiled = tokio::time::timeout(
            deadline,
            self.decompiler.analyze(
                std::path::Path::new(&job.blob_path),
                job.config.analysis_depth,
                true,
                &cancel,
            ),
        )
        .await;
        self.metrics
            .job_stage_duration
            .with_label_values(&["decompile"])
            .observe(stage_started.elapsed().as_secs_f64());

        let artifact = match decompiled {
            Ok(Ok(artifact)) => artifact,
            Ok(Err(err)) => {
                job.errors.push(err.to_string());
                self.fail(&mut job).await;
                return;
            }
            Err(_) => {
                job.errors.push("timeout".into());
                self.fail(&mut job).await;
                return;
            }
        };

        self.metrics
            .decompile_functions
            .observe(artifact.functions.len() as f64);
        self.metrics
            .decompile_imports
            .observe(artifact.imports.len() as f64);
        self.metrics
            .decompile_strings
            .observe(artifact.strings.len() as f64);
        job.warnings.extend(artifact.warnings.iter().cloned());
        let _ = self.store.store_artifact(job_id, &artifact).await;
        let _ = self
            .store
            .try_stage(job_id, JobStage::Decompiling, JobStage::Translating)
            .await;
        job.stage = JobStage::Translating;
        job.progress_percentage = 60;
        let _ = self.store.set_progress(job_id, 60).await;

        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            job.errors.push("timeout".into());
            self.fail(&mut job).await;
            return;
        }

        let stage_started = Instant::now();
        let translated = tokio::time::timeout(
            remaining,
            self.orchestrator.translate(&job, &artifact, &cancel),
        )
        .await;
        self.metrics
            .job_stage_duration
            .with_label_values(&["translate"])
            .observe(stage_started.elapsed().as_secs_f64());

        let outcome = match translated {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.cancel();
                job.errors.push("timeout".into());
                self.fail(&mut job).await;
                return;
            }
        };

        job.warnings.extend(outcome.warnings.iter().cloned());
        if let Err(err) = self.store.store_result(job_id, &outcome.result).await {
            job.errors.push(format!("result persistence failed: {err}"));
            self.fail(&mut job).await;
            return;
        }

        job.progress_percentage = 100;
        job.stage = JobStage::Done;
        let _ = self.store.save(&job).await;
        let _ = self.store.set_progress(job_id, 100).await;

        match self
            .store
            .try_transition(job_id, JobStatus::Processing, JobStatus::Completed)
            .await
        {
            Ok(true) => {
                self.metrics
                    .jobs_finished
                    .with_label_values(&[JobStatus::Completed.as_str()])
                    .inc();
                tracing::info!(
                    job_id,
                    cost_usd = outcome.cost_spent_usd,
                    provider = outcome.provider.map(|p| p.as_str()).unwrap_or("none"),
                    "job completed"
                );
            }
            _ => {
                tracing::warn!(job_id, "terminal transition lost; discarding outcome");
            }
        }

        self.remove_blob(&job).await;
    }

    async fn fail(&self, job: &mut Job) {
        let _ = self.store.save(job).await;
        let moved = self
            .store
            .try_transition(&job.id, JobStatus::Processing, JobStatus::Failed)
            .await
            .unwrap_or(false);
        if moved {
            self.metrics
                .jobs_finished
                .with_label_values(&[JobStatus::Failed.as_str()])
                .inc();
            tracing::warn!(job_id = %job.id, errors = ?job.errors, "job failed");
        }
        self.remove_blob(job).await;
    }

    async fn remove_blob(&self, job: &Job) {
        if job.blob_path.is_empty() {
            return;
        }
        if let Err(err) = tokio::fs::remove_file(&job.blob_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(job_id = %job.id, error = %err, "blob removal failed");
            }
        }
    }
}
