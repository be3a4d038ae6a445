//! Source host access: file contents, branches, commits, pull requests.
//!
//! The pipeline talks to the host through the [`SourceHost`] trait so the
//! orchestrator can be driven against an in-memory fake in tests. The real
//! implementation is a thin GitHub REST v3 client; every method returns
//! [`ApiError`] so the retry executor can classify failures.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

use codepolice_core::issue::{CommitSha, PullRequestRef, RepositoryId};

use crate::retry::ApiError;

/// One analyzed commit: its message plus the paths it touched.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub sha: CommitSha,
    pub message: String,
    pub files: Vec<String>,
}

/// Read/write operations against the source host.
#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Fetch a file's raw bytes at a specific commit. `None` means the file
    /// does not exist at that revision (not an error: import resolution
    /// probes candidate paths).
    async fn get_file_at(
        &self,
        repository: &RepositoryId,
        path: &str,
        sha: &CommitSha,
    ) -> Result<Option<Vec<u8>>, ApiError>;

    /// Fetch a commit's message and changed file list.
    async fn get_commit(
        &self,
        repository: &RepositoryId,
        sha: &CommitSha,
    ) -> Result<CommitInfo, ApiError>;

    /// Current head SHA of a branch.
    async fn get_branch_head(
        &self,
        repository: &RepositoryId,
        branch: &str,
    ) -> Result<CommitSha, ApiError>;

    /// Create a branch pointing at `base_sha`. Creating a branch that
    /// already exists at the same SHA is treated as success so a resumed
    /// publish stays idempotent.
    async fn create_branch(
        &self,
        repository: &RepositoryId,
        name: &str,
        base_sha: &CommitSha,
    ) -> Result<(), ApiError>;

    /// Commit one file's full new content to a branch. Returns the new
    /// commit SHA.
    async fn commit_file(
        &self,
        repository: &RepositoryId,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<CommitSha, ApiError>;

    /// Open a pull request from `head_branch` into `base_branch` and attach
    /// the given labels.
    async fn open_pull_request(
        &self,
        repository: &RepositoryId,
        head_branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<PullRequestRef, ApiError>;
}

/// GitHub REST v3 implementation of [`SourceHost`].
#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    api_base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
    commit: CommitDetail,
    #[serde(default)]
    files: Vec<FileChange>,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct FileChange {
    filename: String,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    content: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Debug, Serialize)]
struct CreateRefRequest {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
}

#[derive(Debug, Serialize)]
struct PutContentsRequest {
    message: String,
    content: String,
    branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PutContentsResponse {
    commit: RefObject,
}

#[derive(Debug, Serialize)]
struct CreatePullRequest {
    title: String,
    body: String,
    head: String,
    base: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: u64,
    html_url: String,
}

#[derive(Debug, Serialize)]
struct AddLabelsRequest {
    labels: Vec<String>,
}

impl GitHubClient {
    pub fn new(token: String, api_base: String, request_timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent("code-police")
            .build()
            .map_err(|e| ApiError::Fatal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base,
            token,
        })
    }

    fn url(&self, repository: &RepositoryId, rest: &str) -> String {
        format!(
            "{}/repos/{}/{}/{rest}",
            self.api_base, repository.owner, repository.name
        )
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
    }

    async fn check(
        response: reqwest::Response,
        context: &str,
    ) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let error_text = response.text().await.unwrap_or_default();
        error!("GitHub API error during {context}: {status} - {error_text}");
        Err(ApiError::from_status(status, context, &error_text))
    }

    /// Blob SHA of a file on a branch, if it exists. The contents API
    /// requires it when updating an existing file.
    async fn blob_sha(
        &self,
        repository: &RepositoryId,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>, ApiError> {
        let url = self.url(repository, &format!("contents/{path}?ref={branch}"));
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, "fetch blob sha"))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, "fetch blob sha").await?;
        let contents: ContentsResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Validation(format!("Failed to parse contents response: {e}")))?;
        Ok(Some(contents.sha))
    }
}

#[async_trait]
impl SourceHost for GitHubClient {
    async fn get_file_at(
        &self,
        repository: &RepositoryId,
        path: &str,
        sha: &CommitSha,
    ) -> Result<Option<Vec<u8>>, ApiError> {
        let url = self.url(repository, &format!("contents/{path}?ref={sha}"));
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, "fetch file"))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, "fetch file").await?;
        let contents: ContentsResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Validation(format!("Failed to parse contents response: {e}")))?;

        // GitHub wraps base64 content with newlines.
        let cleaned: String = contents.content.split_whitespace().collect();
        let bytes = general_purpose::STANDARD
            .decode(cleaned)
            .map_err(|e| ApiError::Validation(format!("Invalid base64 file content: {e}")))?;

        Ok(Some(bytes))
    }

    async fn get_commit(
        &self,
        repository: &RepositoryId,
        sha: &CommitSha,
    ) -> Result<CommitInfo, ApiError> {
        let url = self.url(repository, &format!("commits/{sha}"));
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, "fetch commit"))?;
        let response = Self::check(response, "fetch commit").await?;

        let commit: CommitResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Validation(format!("Failed to parse commit response: {e}")))?;

        Ok(CommitInfo {
            sha: CommitSha(commit.sha),
            message: commit.commit.message,
            files: commit.files.into_iter().map(|f| f.filename).collect(),
        })
    }

    async fn get_branch_head(
        &self,
        repository: &RepositoryId,
        branch: &str,
    ) -> Result<CommitSha, ApiError> {
        let url = self.url(repository, &format!("git/ref/heads/{branch}"));
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, "fetch branch head"))?;
        let response = Self::check(response, "fetch branch head").await?;

        let git_ref: RefResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Validation(format!("Failed to parse ref response: {e}")))?;

        Ok(CommitSha(git_ref.object.sha))
    }

    async fn create_branch(
        &self,
        repository: &RepositoryId,
        name: &str,
        base_sha: &CommitSha,
    ) -> Result<(), ApiError> {
        let url = self.url(repository, "git/refs");
        info!("Creating branch {name} at {} in {repository}", base_sha.short());

        let request = CreateRefRequest {
            git_ref: format!("refs/heads/{name}"),
            sha: base_sha.0.clone(),
        };
        let response = self
            .request(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, "create branch"))?;

        // 422 "Reference already exists": a previous attempt got this far.
        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let existing = self.get_branch_head(repository, name).await?;
            if existing == *base_sha {
                info!("Branch {name} already exists at the expected SHA");
                return Ok(());
            }
            return Err(ApiError::Fatal(format!(
                "Branch {name} already exists at {} (expected {})",
                existing.short(),
                base_sha.short()
            )));
        }

        Self::check(response, "create branch").await?;
        Ok(())
    }

    async fn commit_file(
        &self,
        repository: &RepositoryId,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<CommitSha, ApiError> {
        let existing_sha = self.blob_sha(repository, branch, path).await?;

        let url = self.url(repository, &format!("contents/{path}"));
        let request = PutContentsRequest {
            message: message.to_string(),
            content: general_purpose::STANDARD.encode(content),
            branch: branch.to_string(),
            sha: existing_sha,
        };
        let response = self
            .request(self.client.put(&url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, "commit file"))?;

        // 409: the blob changed underneath us, i.e. the base moved.
        if response.status() == StatusCode::CONFLICT {
            return Err(ApiError::Conflict {
                file: path.to_string(),
                base_sha: String::new(),
                head_sha: String::new(),
            });
        }

        let response = Self::check(response, "commit file").await?;
        let result: PutContentsResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Validation(format!("Failed to parse commit response: {e}")))?;

        let sha = CommitSha(result.commit.sha);
        info!("Committed {path} to {branch} ({})", sha.short());
        Ok(sha)
    }

    async fn open_pull_request(
        &self,
        repository: &RepositoryId,
        head_branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<PullRequestRef, ApiError> {
        let url = self.url(repository, "pulls");
        let request = CreatePullRequest {
            title: title.to_string(),
            body: body.to_string(),
            head: head_branch.to_string(),
            base: base_branch.to_string(),
        };
        let response = self
            .request(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, "open pull request"))?;
        let response = Self::check(response, "open pull request").await?;

        let pull: PullResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Validation(format!("Failed to parse pull response: {e}")))?;

        // Labels go through the issues API; a failure here should not undo
        // the PR, so it is reported but the PR reference is still returned.
        let labels_url = self.url(repository, &format!("issues/{}/labels", pull.number));
        let label_request = AddLabelsRequest {
            labels: labels.to_vec(),
        };
        let label_response = self
            .request(self.client.post(&labels_url))
            .json(&label_request)
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, "add labels"))?;
        if !label_response.status().is_success() {
            error!(
                "Failed to label PR #{}: {}",
                pull.number,
                label_response.status()
            );
        }

        info!("Opened PR #{} at {}", pull.number, pull.html_url);
        Ok(PullRequestRef {
            number: pull.number,
            url: pull.html_url,
            branch: head_branch.to_string(),
        })
    }
}
