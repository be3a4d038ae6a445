//! Job lifecycle driver.
//!
//! Claims Pending jobs and walks them through the stages, persisting every
//! status change as a conditional update before the next stage runs. When a
//! conditional update reports zero rows the job belongs to someone else and
//! this worker stops touching it. A stage failure spends one unit of the
//! job-level retry budget and re-enqueues the job; the idempotency records
//! let the resumed run skip work that already happened.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use codepolice_core::issue::{AnalysisReport, Job, JobStatus, ReportId};

use crate::email::EmailService;
use crate::github::SourceHost;
use crate::idempotency::{Effect, IdempotencyStore};
use crate::llm::LlmService;
use crate::pipeline::analyzer::CodeAnalyzer;
use crate::pipeline::monitor::RepositoryMonitor;
use crate::pipeline::notifier::{JobOutcome, Notifier, NotifyResult};
use crate::pipeline::planner::{text_files, FixPlanner};
use crate::pipeline::publisher::{PrPublisher, PublishOutcome};
use crate::retry::{ApiError, RetryExecutor};
use crate::store::Store;

pub struct Orchestrator {
    store: Store,
    effects: IdempotencyStore,
    host: Arc<dyn SourceHost>,
    llm: Arc<dyn LlmService>,
    email: Option<Arc<dyn EmailService>>,
    retry: RetryExecutor,
    token_budget: usize,
    job_retry_budget: u32,
}

/// Why a run of the stage sequence stopped early.
enum Halt {
    /// Another worker advanced the job; this one lets go.
    LostOwnership,
    /// A stage failed; the job was re-enqueued or marked Failed.
    StageFailed,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        host: Arc<dyn SourceHost>,
        llm: Arc<dyn LlmService>,
        email: Option<Arc<dyn EmailService>>,
        token_budget: usize,
        job_retry_budget: u32,
    ) -> Self {
        Self {
            effects: IdempotencyStore::new(store.clone()),
            store,
            host,
            llm,
            email,
            retry: RetryExecutor::default(),
            token_budget,
            job_retry_budget,
        }
    }

    /// Drive one claimed job (already in `Fetching`) to a terminal status.
    pub async fn run(&self, mut job: Job) -> Result<()> {
        info!(job_id = %job.id, repository = %job.repository, branch = %job.branch,
              retry = job.retry_count, "running job");

        match self.run_stages(&mut job).await? {
            Ok(()) => Ok(()),
            Err(Halt::LostOwnership) => {
                info!(job_id = %job.id, "job advanced elsewhere, releasing");
                Ok(())
            }
            Err(Halt::StageFailed) => Ok(()),
        }
    }

    async fn run_stages(&self, job: &mut Job) -> Result<Result<(), Halt>> {
        // Fetching.
        let monitor = RepositoryMonitor::new(self.host.as_ref(), &self.retry);
        let context = match monitor.fetch_context(job).await {
            Ok(context) => context,
            Err(e) => return self.stage_failed(job, e).await,
        };

        // Analyzing.
        if !self.advance(job, JobStatus::Analyzing).await? {
            return Ok(Err(Halt::LostOwnership));
        }
        let report = match self.analyze(job, &context).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => return self.stage_failed(job, e).await,
            Err(e) => return Err(e),
        };

        let has_fixable = report.fixable_issues().next().is_some();
        let mut outcome = if report.issues.is_empty() {
            JobOutcome::Clean
        } else {
            JobOutcome::IssuesFound { pr: None }
        };

        if has_fixable {
            // Fixing.
            if !self.advance(job, JobStatus::Fixing).await? {
                return Ok(Err(Halt::LostOwnership));
            }
            let planner = FixPlanner::new(self.llm.as_ref(), &self.retry);
            let files = text_files(&context.changed_files, &context.imported_files);
            let plan = planner.plan(&report, &files).await;

            if !plan.files.is_empty() {
                // Publishing.
                if !self.advance(job, JobStatus::Publishing).await? {
                    return Ok(Err(Halt::LostOwnership));
                }
                let publisher = PrPublisher::new(self.host.as_ref(), &self.retry, &self.effects);
                match publisher.publish(job, &report, &plan.files).await {
                    Ok(PublishOutcome::Published(pr)) => {
                        outcome = JobOutcome::IssuesFound { pr: Some(pr) };
                    }
                    Ok(PublishOutcome::Conflict {
                        file,
                        base_sha,
                        head_sha,
                    }) => {
                        outcome = JobOutcome::Conflict {
                            file,
                            base_sha,
                            head_sha,
                        };
                    }
                    Err(e) => return self.stage_failed(job, e).await,
                }
            }
        }

        // Notifying.
        if !self.advance(job, JobStatus::Notifying).await? {
            return Ok(Err(Halt::LostOwnership));
        }
        let notifier = Notifier::new(self.email.as_deref(), &self.retry, &self.effects);
        let delivery = notifier.notify(job, &report, &outcome).await?;

        // A conflict or an undeliverable notification completes the job
        // with a warning; the work that did happen stays valid.
        let terminal = if matches!(outcome, JobOutcome::Conflict { .. })
            || delivery == NotifyResult::GaveUp
        {
            JobStatus::CompletedWithWarning
        } else {
            JobStatus::Completed
        };

        if !self.advance(job, terminal).await? {
            return Ok(Err(Halt::LostOwnership));
        }
        info!(job_id = %job.id, status = %terminal, "job finished");
        Ok(Ok(()))
    }

    /// Produce the analysis report, reusing a persisted one on resume.
    async fn analyze(
        &self,
        job: &Job,
        context: &codepolice_core::issue::AnalysisContext,
    ) -> Result<Result<AnalysisReport, ApiError>> {
        if let Some(record) = self.effects.completed(job.id, Effect::Report).await? {
            if let Some(raw) = record.result_ref.as_deref() {
                if let Ok(report_id) = ReportId::parse(raw) {
                    if let Some(report) = self.store.get_report(report_id).await? {
                        info!(job_id = %job.id, report_id = %report.id,
                              "analysis already completed, reusing report");
                        return Ok(Ok(report));
                    }
                }
                warn!(job_id = %job.id, "report effect points at a missing report, re-analyzing");
            }
        }

        let analyzer = CodeAnalyzer::new(self.llm.as_ref(), &self.retry, self.token_budget);
        let report = match analyzer.analyze(context).await {
            Ok(report) => report,
            Err(e) => return Ok(Err(e)),
        };

        self.store.insert_report(job.id, &report).await?;
        self.effects
            .record(job.id, Effect::Report, Some(report.id.to_string()))
            .await?;
        Ok(Ok(report))
    }

    /// Persist a status transition; `false` means this worker lost the job.
    async fn advance(&self, job: &mut Job, to: JobStatus) -> Result<bool> {
        let completed_at = to.is_terminal().then(Utc::now);
        // A successful terminal state carries no error text; a requeued
        // attempt's failure message must not outlive the attempt.
        let error_message = match to {
            JobStatus::Completed | JobStatus::CompletedWithWarning => None,
            _ => job.error_message.clone(),
        };
        let moved = self
            .store
            .transition_job(job.id, job.status, to, error_message.clone(), completed_at)
            .await
            .with_context(|| format!("Failed to persist transition to {to}"))?;
        if moved {
            job.status = to;
            job.completed_at = completed_at;
            job.error_message = error_message;
        }
        Ok(moved)
    }

    /// Spend one unit of the job retry budget, or finish the job as Failed.
    async fn stage_failed(&self, job: &Job, error: ApiError) -> Result<Result<(), Halt>> {
        let message = format!("{error}");
        if job.retry_count < self.job_retry_budget {
            warn!(job_id = %job.id, status = %job.status, retry = job.retry_count + 1,
                  budget = self.job_retry_budget, %error, "stage failed, re-enqueueing job");
            self.store
                .requeue_job(job.id, job.status, message)
                .await
                .context("Failed to re-enqueue job")?;
        } else {
            error!(job_id = %job.id, status = %job.status, %error,
                   "stage failed with the retry budget exhausted");
            self.store
                .transition_job(
                    job.id,
                    job.status,
                    JobStatus::Failed,
                    Some(message),
                    Some(Utc::now()),
                )
                .await
                .context("Failed to mark job as Failed")?;
        }
        Ok(Err(Halt::StageFailed))
    }

    /// Send jobs orphaned by a dead worker back to the queue.
    ///
    /// A row durably in `Fetching`..`Notifying` is invisible to the claim
    /// query, so without this sweep a crash would strand it non-terminal
    /// forever. The resumed run picks up from its idempotency records.
    pub async fn recover_orphaned(&self) -> Result<usize> {
        let recovered = self
            .store
            .recover_in_progress()
            .await
            .context("Failed to recover orphaned jobs")?;
        if recovered > 0 {
            info!(recovered, "re-queued jobs orphaned by a previous worker");
        }
        Ok(recovered)
    }

    /// Poll for pending jobs and run them, forever.
    ///
    /// Starts with an orphan sweep so jobs stranded mid-stage by a crash are
    /// claimed again before any new work.
    pub async fn worker_loop(self: Arc<Self>, poll_interval: Duration) {
        if let Err(e) = self.recover_orphaned().await {
            error!("Orphan recovery failed: {e:#}");
        }

        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            loop {
                let claimed = match self.store.claim_next_pending().await {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        error!("Failed to claim a pending job: {e:#}");
                        break;
                    }
                };
                let Some(job) = claimed else { break };
                if let Err(e) = self.run(job).await {
                    error!("Job run failed: {e:#}");
                }
            }
        }
    }
}
