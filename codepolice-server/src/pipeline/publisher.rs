//! Publishing stage: fix branch, per-file commits, pull request.
//!
//! Every externally visible step records an effect before the stage moves
//! on, so a job that is re-delivered mid-publish resumes where it stopped:
//! an existing `branch` record reuses the branch, an existing `commit:<path>`
//! record skips that file, an existing `pr` record returns the original
//! pull request. Before touching anything, the current head of the target
//! branch is compared with the analyzed SHA; divergence is a conflict, not
//! an error to retry.

use tracing::{info, warn};

use codepolice_core::issue::{AnalysisReport, ConsolidatedFile, Job, PullRequestRef, Severity};
use codepolice_core::render;

use crate::github::SourceHost;
use crate::idempotency::{commit_effect_key, Effect, IdempotencyStore};
use crate::retry::{ApiError, RetryExecutor};

/// Outcome of the publishing stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published(PullRequestRef),
    /// The base branch moved between analysis and publish.
    Conflict {
        file: String,
        base_sha: String,
        head_sha: String,
    },
}

pub struct PrPublisher<'a> {
    host: &'a dyn SourceHost,
    retry: &'a RetryExecutor,
    effects: &'a IdempotencyStore,
}

impl<'a> PrPublisher<'a> {
    pub fn new(
        host: &'a dyn SourceHost,
        retry: &'a RetryExecutor,
        effects: &'a IdempotencyStore,
    ) -> Self {
        Self {
            host,
            retry,
            effects,
        }
    }

    pub async fn publish(
        &self,
        job: &Job,
        report: &AnalysisReport,
        files: &[ConsolidatedFile],
    ) -> Result<PublishOutcome, ApiError> {
        // Resume: if the PR already exists this job already published.
        if let Some(record) = self
            .effects
            .completed(job.id, Effect::PullRequest)
            .await
            .map_err(internal)?
        {
            if let Some(pr) = record.result_ref.as_deref().and_then(parse_pr_ref) {
                info!(job_id = %job.id, pr = pr.number, "publish already completed, reusing PR");
                return Ok(PublishOutcome::Published(pr));
            }
        }

        let branch = self.ensure_branch(job, report).await?;
        let branch = match branch {
            Ok(branch) => branch,
            Err(conflict) => return Ok(conflict),
        };

        let applied: Vec<_> = files
            .iter()
            .flat_map(|f| f.applied_issue_ids.iter().copied())
            .collect();

        for file in files {
            if self
                .effects
                .completed_key(job.id, commit_effect_key(&file.path))
                .await
                .map_err(internal)?
                .is_some()
            {
                info!(job_id = %job.id, path = %file.path, "commit already recorded, skipping");
                continue;
            }

            let issues: Vec<_> = report
                .issues
                .iter()
                .filter(|i| file.applied_issue_ids.contains(&i.id))
                .cloned()
                .collect();
            let message = render::commit_message(file, &issues);

            let commit = match self
                .retry
                .execute("commit_file", || {
                    self.host
                        .commit_file(&job.repository, &branch, &file.path, &file.content, &message)
                })
                .await
            {
                Ok(sha) => sha,
                Err(ApiError::Conflict { file: path, .. }) => {
                    return Ok(self.conflict(job, report, &path).await);
                }
                Err(error) => return Err(error),
            };

            self.effects
                .record_key(job.id, commit_effect_key(&file.path), Some(commit.0.clone()))
                .await
                .map_err(internal)?;
        }

        let labels = render::pr_labels(report.max_severity().unwrap_or(Severity::Low));
        let title = render::pr_title(report, &applied);
        let body = render::pr_body(report, &applied);

        let pr = self
            .retry
            .execute("open_pull_request", || {
                self.host.open_pull_request(
                    &job.repository,
                    &branch,
                    &job.branch,
                    &title,
                    &body,
                    &labels,
                )
            })
            .await?;

        let record = self
            .effects
            .record(
                job.id,
                Effect::PullRequest,
                Some(serde_json::to_string(&pr).map_err(|e| internal(e.into()))?),
            )
            .await
            .map_err(internal)?;

        // A concurrent duplicate may have opened the PR first; its record
        // is the truth.
        let pr = record
            .result_ref
            .as_deref()
            .and_then(parse_pr_ref)
            .unwrap_or(pr);

        info!(job_id = %job.id, pr = pr.number, url = %pr.url, "pull request published");
        Ok(PublishOutcome::Published(pr))
    }

    /// Create (or adopt) the fix branch. Returns the conflict outcome when
    /// the base has diverged.
    async fn ensure_branch(
        &self,
        job: &Job,
        report: &AnalysisReport,
    ) -> Result<Result<String, PublishOutcome>, ApiError> {
        if let Some(record) = self
            .effects
            .completed(job.id, Effect::Branch)
            .await
            .map_err(internal)?
        {
            if let Some(name) = record.result_ref {
                info!(job_id = %job.id, branch = %name, "fix branch already exists, reusing");
                return Ok(Ok(name));
            }
        }

        // The base must still be where analysis saw it.
        let current_head = self
            .retry
            .execute("get_branch_head", || {
                self.host.get_branch_head(&job.repository, &job.branch)
            })
            .await?;
        if current_head != report.commit_sha {
            warn!(
                job_id = %job.id,
                analyzed = report.commit_sha.short(),
                current = current_head.short(),
                "base branch moved since analysis"
            );
            return Ok(Err(PublishOutcome::Conflict {
                file: String::new(),
                base_sha: report.commit_sha.0.clone(),
                head_sha: current_head.0,
            }));
        }

        let name = render::branch_name(report.timestamp, &report.summary);
        self.retry
            .execute("create_branch", || {
                self.host
                    .create_branch(&job.repository, &name, &report.commit_sha)
            })
            .await?;

        let record = self
            .effects
            .record(job.id, Effect::Branch, Some(name.clone()))
            .await
            .map_err(internal)?;

        Ok(Ok(record.result_ref.unwrap_or(name)))
    }

    async fn conflict(&self, job: &Job, report: &AnalysisReport, file: &str) -> PublishOutcome {
        let head_sha = self
            .host
            .get_branch_head(&job.repository, &job.branch)
            .await
            .map(|sha| sha.0)
            .unwrap_or_default();
        warn!(job_id = %job.id, %file, "conflict while committing fixes");
        PublishOutcome::Conflict {
            file: file.to_string(),
            base_sha: report.commit_sha.0.clone(),
            head_sha,
        }
    }
}

fn parse_pr_ref(raw: &str) -> Option<PullRequestRef> {
    serde_json::from_str(raw).ok()
}

fn internal(error: anyhow::Error) -> ApiError {
    ApiError::Fatal(format!("effect store failure: {error:#}"))
}
