//! Notifying stage: email the repository owner about the outcome.
//!
//! Three outcomes exist: issues found (with or without a fix PR), a clean
//! run, and a publish conflict. Delivery gets its own retry budget; when
//! that budget is exhausted the stage reports `GaveUp` and the orchestrator
//! completes the job with a warning instead of failing it — the analysis
//! and any PR already happened and remain valid.

use tracing::{info, warn};

use codepolice_core::issue::{AnalysisReport, Job, PullRequestRef};
use codepolice_core::render;

use crate::email::EmailService;
use crate::idempotency::{Effect, IdempotencyStore};
use crate::retry::RetryExecutor;

/// What the pipeline produced, from the owner's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Analysis found nothing.
    Clean,
    /// Issues were reported; a PR exists if any fix survived consolidation.
    IssuesFound { pr: Option<PullRequestRef> },
    /// Fixes existed but could not be published.
    Conflict {
        file: String,
        base_sha: String,
        head_sha: String,
    },
}

/// How the notifying stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyResult {
    Delivered,
    /// A previous run already sent this job's email.
    AlreadyDelivered,
    /// Delivery kept failing or no deliverable address exists. The job
    /// completes with a warning.
    GaveUp,
}

pub struct Notifier<'a> {
    email: Option<&'a dyn EmailService>,
    retry: &'a RetryExecutor,
    effects: &'a IdempotencyStore,
}

impl<'a> Notifier<'a> {
    pub fn new(
        email: Option<&'a dyn EmailService>,
        retry: &'a RetryExecutor,
        effects: &'a IdempotencyStore,
    ) -> Self {
        Self {
            email,
            retry,
            effects,
        }
    }

    pub async fn notify(
        &self,
        job: &Job,
        report: &AnalysisReport,
        outcome: &JobOutcome,
    ) -> anyhow::Result<NotifyResult> {
        if self
            .effects
            .completed(job.id, Effect::Notify)
            .await?
            .is_some()
        {
            info!(job_id = %job.id, "notification already sent");
            return Ok(NotifyResult::AlreadyDelivered);
        }

        let Some(email) = self.email else {
            warn!(job_id = %job.id, "email delivery is not configured");
            return Ok(NotifyResult::GaveUp);
        };
        if job.owner_email.is_empty() {
            warn!(job_id = %job.id, "job has no owner email address");
            return Ok(NotifyResult::GaveUp);
        }

        let (subject, body) = match outcome {
            JobOutcome::Clean => render::success_email(report),
            JobOutcome::IssuesFound { pr } => render::issues_found_email(report, pr.as_ref()),
            JobOutcome::Conflict {
                file,
                base_sha,
                head_sha,
            } => render::conflict_email(report, file, base_sha, head_sha),
        };

        let delivery = self
            .retry
            .execute("send_notification", || {
                email.send(&job.owner_email, &subject, &body)
            })
            .await;

        match delivery {
            Ok(()) => {
                self.effects
                    .record(job.id, Effect::Notify, Some(job.owner_email.clone()))
                    .await?;
                info!(job_id = %job.id, to = %job.owner_email, "notification delivered");
                Ok(NotifyResult::Delivered)
            }
            Err(error) => {
                warn!(job_id = %job.id, %error, "notification delivery exhausted its retries");
                Ok(NotifyResult::GaveUp)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::testing::MemoryMailer;
    use codepolice_core::issue::{CommitSha, ReportId, RepositoryId};

    fn setup() -> (MemoryMailer, IdempotencyStore, Job, AnalysisReport) {
        let mailer = MemoryMailer::default();
        let effects = IdempotencyStore::new(Store::new_in_memory().unwrap());
        let job = Job::new(
            RepositoryId::new("acme", "widgets"),
            vec![CommitSha::from("abc1234")],
            "main".into(),
            "owner@example.com".into(),
        );
        let report = AnalysisReport {
            id: ReportId::new(),
            repository: job.repository.clone(),
            commit_sha: CommitSha::from("abc1234"),
            branch: "main".into(),
            timestamp: chrono::Utc::now(),
            issues: Vec::new(),
            summary: "No issues found.".into(),
            failed_chunks: Vec::new(),
        };
        (mailer, effects, job, report)
    }

    #[tokio::test]
    async fn test_clean_outcome_sends_success_email() {
        let (mailer, effects, job, report) = setup();
        let retry = RetryExecutor::default();
        let notifier = Notifier::new(Some(&mailer), &retry, &effects);

        let result = notifier
            .notify(&job, &report, &JobOutcome::Clean)
            .await
            .unwrap();

        assert_eq!(result, NotifyResult::Delivered);
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "owner@example.com");
        assert!(sent[0].subject.contains("no issues"));
    }

    #[tokio::test]
    async fn test_second_notify_is_a_no_op() {
        let (mailer, effects, job, report) = setup();
        let retry = RetryExecutor::default();
        let notifier = Notifier::new(Some(&mailer), &retry, &effects);

        notifier
            .notify(&job, &report, &JobOutcome::Clean)
            .await
            .unwrap();
        let second = notifier
            .notify(&job, &report, &JobOutcome::Clean)
            .await
            .unwrap();

        assert_eq!(second, NotifyResult::AlreadyDelivered);
        assert_eq!(mailer.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_gives_up() {
        let (mailer, effects, job, report) = setup();
        mailer.fail_always();
        let retry = RetryExecutor::default();
        let notifier = Notifier::new(Some(&mailer), &retry, &effects);

        let result = notifier
            .notify(&job, &report, &JobOutcome::Clean)
            .await
            .unwrap();

        assert_eq!(result, NotifyResult::GaveUp);
        // Exactly the notification retry budget was used.
        assert_eq!(mailer.attempts(), 3);
        // Nothing recorded: a later manual replay may still deliver.
        assert!(effects
            .completed(job.id, Effect::Notify)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_conflict_email_carries_shas() {
        let (mailer, effects, job, report) = setup();
        let retry = RetryExecutor::default();
        let notifier = Notifier::new(Some(&mailer), &retry, &effects);

        notifier
            .notify(
                &job,
                &report,
                &JobOutcome::Conflict {
                    file: "a.py".into(),
                    base_sha: "abc1234".into(),
                    head_sha: "f00dbabe".into(),
                },
            )
            .await
            .unwrap();

        let sent = mailer.sent();
        assert!(sent[0].body.contains("abc1234"));
        assert!(sent[0].body.contains("f00dbabe"));
    }

    #[tokio::test]
    async fn test_missing_address_gives_up_without_sending() {
        let (mailer, effects, mut job, report) = setup();
        job.owner_email = String::new();
        let retry = RetryExecutor::default();
        let notifier = Notifier::new(Some(&mailer), &retry, &effects);

        let result = notifier
            .notify(&job, &report, &JobOutcome::Clean)
            .await
            .unwrap();

        assert_eq!(result, NotifyResult::GaveUp);
        assert!(mailer.sent().is_empty());
    }
}
