//! Effect keys and the resume protocol for durable side effects.
//!
//! Every externally visible side effect is recorded under a `(job_id, key)`
//! pair before the pipeline moves on. When a job is re-delivered or resumed
//! after a crash, stages consult the record first: a hit means the effect
//! already happened and its `result_ref` tells the stage what to adopt — the
//! branch name, the PR reference, the report id — instead of performing the
//! effect again.

use anyhow::Result;

use codepolice_core::issue::JobId;

use crate::db::EffectRecord;
use crate::store::Store;

/// The side effects a job can perform, each with a stable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Analysis report persisted; `result_ref` is the report id.
    Report,
    /// Fix branch created; `result_ref` is the branch name.
    Branch,
    /// Pull request opened; `result_ref` is a JSON `PullRequestRef`.
    PullRequest,
    /// Owner notification sent; `result_ref` is the recipient address.
    Notify,
}

impl Effect {
    pub fn key(&self) -> &'static str {
        match self {
            Effect::Report => "report",
            Effect::Branch => "branch",
            Effect::PullRequest => "pr",
            Effect::Notify => "notify",
        }
    }
}

/// A per-file commit on the fix branch; keyed so a resumed publish never
/// commits the same file twice.
pub fn commit_effect_key(path: &str) -> String {
    format!("commit:{path}")
}

/// Idempotency guard shared by the pipeline stages.
#[derive(Clone)]
pub struct IdempotencyStore {
    store: Store,
}

impl IdempotencyStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Look up whether a named effect already completed for this job.
    pub async fn completed(&self, job_id: JobId, effect: Effect) -> Result<Option<EffectRecord>> {
        self.store.get_effect(job_id, effect.key().to_string()).await
    }

    pub async fn completed_key(&self, job_id: JobId, key: String) -> Result<Option<EffectRecord>> {
        self.store.get_effect(job_id, key).await
    }

    /// Record an effect as done. First writer wins: the returned record may
    /// carry an earlier winner's `result_ref`, which the caller must adopt.
    pub async fn record(
        &self,
        job_id: JobId,
        effect: Effect,
        result_ref: Option<String>,
    ) -> Result<EffectRecord> {
        self.store
            .record_effect(job_id, effect.key().to_string(), result_ref)
            .await
    }

    pub async fn record_key(
        &self,
        job_id: JobId,
        key: String,
        result_ref: Option<String>,
    ) -> Result<EffectRecord> {
        self.store.record_effect(job_id, key, result_ref).await
    }
}
