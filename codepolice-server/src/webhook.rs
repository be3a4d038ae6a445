//! The HTTP surface: webhook ingestion plus read-only status queries.
//!
//! A push event arrives, its HMAC signature is checked against the shared
//! secret, and a `Pending` job row is inserted. Insertion is the enqueue:
//! the worker loop claims pending rows with a conditional update. Non-push
//! events and branch deletions are acknowledged and ignored. Job status and
//! report history are served unauthenticated, like `/health`.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, warn};

use codepolice_core::issue::{AnalysisReport, CommitSha, Job, JobId, RepositoryId};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub commits: Vec<PushCommit>,
    pub repository: PushRepository,
    pub pusher: Option<Pusher>,
}

#[derive(Debug, Deserialize)]
pub struct PushCommit {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct PushRepository {
    pub name: String,
    pub owner: PushOwner,
}

#[derive(Debug, Deserialize)]
pub struct PushOwner {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Pusher {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

type HmacSha256 = Hmac<Sha256>;

fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if !signature.starts_with("sha256=") {
        return false;
    }

    let signature_hex = &signature[7..];

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);

    // Constant-time comparison.
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Build a job from a push payload, or explain why the push is ignored.
fn job_from_push(payload: &PushPayload, fallback_email: Option<&str>) -> Result<Job, &'static str> {
    let branch = payload
        .git_ref
        .strip_prefix("refs/heads/")
        .ok_or("not a branch push")?;

    if payload.deleted {
        return Err("branch deletion");
    }
    if payload.commits.is_empty() {
        return Err("no commits");
    }

    let owner = payload
        .repository
        .owner
        .name
        .clone()
        .or_else(|| payload.repository.owner.login.clone())
        .ok_or("repository owner missing")?;

    let owner_email = payload
        .pusher
        .as_ref()
        .and_then(|p| p.email.clone())
        .or_else(|| payload.repository.owner.email.clone())
        .or_else(|| fallback_email.map(str::to_string))
        .unwrap_or_default();
    if owner_email.is_empty() {
        warn!("Push has no owner email; notification will not be deliverable");
    }

    Ok(Job::new(
        RepositoryId::new(&owner, &payload.repository.name),
        payload
            .commits
            .iter()
            .map(|c| CommitSha::from(c.id.as_str()))
            .collect(),
        branch.to_string(),
        owner_email,
    ))
}

async fn push_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), StatusCode> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_signature(&state.config.webhook_secret, &body, signature) {
        error!("Invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let event = headers
        .get("x-github-event")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    if event != "push" {
        return Ok((
            StatusCode::OK,
            Json(WebhookResponse {
                message: format!("Ignoring {event} event"),
            }),
        ));
    }

    let payload: PushPayload = serde_json::from_slice(&body).map_err(|e| {
        warn!("Malformed push payload: {e}");
        StatusCode::BAD_REQUEST
    })?;

    let job = match job_from_push(&payload, state.config.fallback_email.as_deref()) {
        Ok(job) => job,
        Err(reason) => {
            info!("Ignoring push: {reason}");
            return Ok((
                StatusCode::OK,
                Json(WebhookResponse {
                    message: format!("Ignoring push: {reason}"),
                }),
            ));
        }
    };

    info!(
        job_id = %job.id,
        repository = %job.repository,
        branch = %job.branch,
        commits = job.commits.len(),
        "Accepted push, job enqueued"
    );

    state.store.insert_job(&job).await.map_err(|e| {
        error!("Failed to enqueue job: {e:#}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            message: format!("Job {} accepted", job.id),
        }),
    ))
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, StatusCode> {
    let id = JobId::parse(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let job = state.store.get_job(id).await.map_err(|e| {
        error!("Failed to load job {id}: {e:#}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    job.map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn report_history_handler(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, branch)): Path<(String, String, String)>,
) -> Result<Json<Vec<AnalysisReport>>, StatusCode> {
    let repository = RepositoryId::new(&owner, &repo);
    let reports = state
        .store
        .list_reports(&repository, &branch)
        .await
        .map_err(|e| {
            error!("Failed to list reports for {repository}: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(reports))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhook", post(push_webhook_handler))
        .route("/jobs/{id}", get(job_status_handler))
        .route("/reports/{owner}/{repo}/{branch}", get(report_history_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let secret = "topsecret";
        let payload = br#"{"ref":"refs/heads/main"}"#;
        let signature = sign(secret, payload);
        assert!(verify_signature(secret, payload, &signature));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let secret = "topsecret";
        let signature = sign(secret, b"original");
        assert!(!verify_signature(secret, b"tampered", &signature));
    }

    #[test]
    fn test_signature_without_prefix_rejected() {
        assert!(!verify_signature("s", b"x", "deadbeef"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = b"payload";
        let signature = sign("secret-a", payload);
        assert!(!verify_signature("secret-b", payload, &signature));
    }

    fn push_payload(git_ref: &str, commits: usize) -> PushPayload {
        PushPayload {
            git_ref: git_ref.to_string(),
            deleted: false,
            commits: (0..commits)
                .map(|i| PushCommit {
                    id: format!("sha{i:07}"),
                })
                .collect(),
            repository: PushRepository {
                name: "widgets".to_string(),
                owner: PushOwner {
                    name: Some("acme".to_string()),
                    login: None,
                    email: Some("owner@example.com".to_string()),
                },
            },
            pusher: None,
        }
    }

    #[test]
    fn test_push_becomes_pending_job() {
        let payload = push_payload("refs/heads/main", 2);
        let job = job_from_push(&payload, None).unwrap();

        assert_eq!(job.branch, "main");
        assert_eq!(job.repository.to_string(), "acme/widgets");
        assert_eq!(job.commits.len(), 2);
        assert_eq!(job.owner_email, "owner@example.com");
        assert_eq!(job.status, codepolice_core::issue::JobStatus::Pending);
    }

    #[test]
    fn test_pusher_email_preferred_over_owner_email() {
        let mut payload = push_payload("refs/heads/main", 1);
        payload.pusher = Some(Pusher {
            email: Some("dev@example.com".to_string()),
        });

        let job = job_from_push(&payload, None).unwrap();
        assert_eq!(job.owner_email, "dev@example.com");
    }

    #[test]
    fn test_tag_push_is_ignored() {
        let payload = push_payload("refs/tags/v1.0.0", 1);
        assert_eq!(job_from_push(&payload, None), Err("not a branch push"));
    }

    #[test]
    fn test_empty_push_is_ignored() {
        let payload = push_payload("refs/heads/main", 0);
        assert_eq!(job_from_push(&payload, None), Err("no commits"));
    }

    #[test]
    fn test_branch_deletion_is_ignored() {
        let mut payload = push_payload("refs/heads/old-branch", 1);
        payload.deleted = true;
        assert_eq!(job_from_push(&payload, None), Err("branch deletion"));
    }

    #[test]
    fn test_fallback_email_used_when_payload_has_none() {
        let mut payload = push_payload("refs/heads/main", 1);
        payload.repository.owner.email = None;

        let job = job_from_push(&payload, Some("ops@example.com")).unwrap();
        assert_eq!(job.owner_email, "ops@example.com");
    }

    fn test_state() -> Arc<AppState> {
        let config = crate::config::Config {
            port: 0,
            state_dir: std::path::PathBuf::from("."),
            webhook_secret: "topsecret".into(),
            github_token: "token".into(),
            github_api_base: "http://localhost".into(),
            llm_api_key: "key".into(),
            llm_api_base: "http://localhost".into(),
            llm_model: "test-model".into(),
            job_retry_budget: 3,
            token_budget: 60_000,
            request_timeout: std::time::Duration::from_secs(1),
            poll_interval: std::time::Duration::from_secs(1),
            fallback_email: None,
            email: None,
        };
        Arc::new(AppState {
            config,
            store: crate::store::Store::new_in_memory().unwrap(),
        })
    }

    fn stored_job() -> Job {
        Job::new(
            RepositoryId::new("acme", "widgets"),
            vec![CommitSha::from("abc1234def")],
            "main".into(),
            "owner@example.com".into(),
        )
    }

    #[tokio::test]
    async fn test_job_status_route_returns_stored_job() {
        let state = test_state();
        let job = stored_job();
        state.store.insert_job(&job).await.unwrap();

        let Json(loaded) = job_status_handler(State(state.clone()), Path(job.id.to_string()))
            .await
            .unwrap();
        assert_eq!(loaded, job);

        let missing = job_status_handler(State(state.clone()), Path(JobId::new().to_string()))
            .await
            .unwrap_err();
        assert_eq!(missing, StatusCode::NOT_FOUND);

        let garbage = job_status_handler(State(state), Path("not-a-uuid".into()))
            .await
            .unwrap_err();
        assert_eq!(garbage, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_report_history_route_lists_branch_reports() {
        let state = test_state();
        let job = stored_job();
        state.store.insert_job(&job).await.unwrap();

        let report = AnalysisReport {
            id: codepolice_core::issue::ReportId::new(),
            repository: job.repository.clone(),
            commit_sha: CommitSha::from("abc1234def"),
            branch: job.branch.clone(),
            timestamp: chrono::Utc::now(),
            issues: Vec::new(),
            summary: "No issues found.".into(),
            failed_chunks: Vec::new(),
        };
        state.store.insert_report(job.id, &report).await.unwrap();

        let Json(reports) = report_history_handler(
            State(state.clone()),
            Path(("acme".into(), "widgets".into(), "main".into())),
        )
        .await
        .unwrap();
        assert_eq!(reports, vec![report]);

        let Json(other_branch) = report_history_handler(
            State(state),
            Path(("acme".into(), "widgets".into(), "develop".into())),
        )
        .await
        .unwrap();
        assert!(other_branch.is_empty());
    }
}
