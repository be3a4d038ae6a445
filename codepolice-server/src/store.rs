//! Async facade over the SQLite database.
//!
//! `rusqlite` is synchronous; every call is pushed through
//! `tokio::task::spawn_blocking` so the pipeline's async tasks never block a
//! runtime worker thread on disk I/O.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use codepolice_core::issue::{AnalysisReport, Job, JobId, JobStatus, ReportId, RepositoryId};

use crate::db::{EffectRecord, SqliteDb};

/// Shared handle to the durable job/report/effect state.
#[derive(Clone)]
pub struct Store {
    db: Arc<SqliteDb>,
}

impl Store {
    pub fn new(path: &Path) -> Result<Self> {
        Ok(Self {
            db: Arc::new(SqliteDb::new(path)?),
        })
    }

    pub fn new_in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(SqliteDb::new_in_memory()?),
        })
    }

    async fn blocking<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteDb) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .with_context(|| format!("Blocking task panicked during {op}"))?
    }

    pub async fn insert_job(&self, job: &Job) -> Result<()> {
        let job = job.clone();
        self.blocking("insert_job", move |db| db.insert_job(&job))
            .await
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.blocking("get_job", move |db| db.get_job(id)).await
    }

    pub async fn claim_next_pending(&self) -> Result<Option<Job>> {
        let now = Utc::now();
        self.blocking("claim_next_pending", move |db| db.claim_next_pending(now))
            .await
    }

    pub async fn recover_in_progress(&self) -> Result<usize> {
        self.blocking("recover_in_progress", move |db| db.recover_in_progress())
            .await
    }

    pub async fn transition_job(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        error_message: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.blocking("transition_job", move |db| {
            db.transition_job(id, from, to, error_message.as_deref(), completed_at)
        })
        .await
    }

    pub async fn requeue_job(
        &self,
        id: JobId,
        from: JobStatus,
        error_message: String,
    ) -> Result<bool> {
        self.blocking("requeue_job", move |db| {
            db.requeue_job(id, from, &error_message)
        })
        .await
    }

    pub async fn insert_report(&self, job_id: JobId, report: &AnalysisReport) -> Result<()> {
        let report = report.clone();
        self.blocking("insert_report", move |db| db.insert_report(job_id, &report))
            .await
    }

    pub async fn get_report(&self, id: ReportId) -> Result<Option<AnalysisReport>> {
        self.blocking("get_report", move |db| db.get_report(id))
            .await
    }

    pub async fn list_reports(
        &self,
        repository: &RepositoryId,
        branch: &str,
    ) -> Result<Vec<AnalysisReport>> {
        let repository = repository.clone();
        let branch = branch.to_string();
        self.blocking("list_reports", move |db| {
            db.list_reports(&repository, &branch)
        })
        .await
    }

    pub async fn record_effect(
        &self,
        job_id: JobId,
        effect_key: String,
        result_ref: Option<String>,
    ) -> Result<EffectRecord> {
        let now = Utc::now();
        self.blocking("record_effect", move |db| {
            db.record_effect(job_id, &effect_key, now, result_ref.as_deref())
        })
        .await
    }

    pub async fn get_effect(&self, job_id: JobId, effect_key: String) -> Result<Option<EffectRecord>> {
        self.blocking("get_effect", move |db| db.get_effect(job_id, &effect_key))
            .await
    }
}
