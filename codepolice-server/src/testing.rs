//! In-memory doubles for the external services, used across the pipeline
//! tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use codepolice_core::issue::{CommitSha, PullRequestRef, RepositoryId};

use crate::email::EmailService;
use crate::github::{CommitInfo, SourceHost};
use crate::llm::LlmService;
use crate::retry::ApiError;

// -- Source host ------------------------------------------------------------

#[derive(Default)]
struct FakeHostInner {
    files: HashMap<String, Vec<u8>>,
    commits: HashMap<String, (String, Vec<String>)>,
    branch_heads: HashMap<String, String>,
    default_head: String,
    created_branches: Vec<String>,
    commits_per_branch: HashMap<String, usize>,
    opened_prs: Vec<(PullRequestRef, Vec<String>)>,
    fetch_counts: HashMap<String, usize>,
    fail_get_commit: bool,
}

/// In-memory [`SourceHost`]: files and commits are seeded by tests, writes
/// are recorded for assertions.
pub struct FakeHost {
    inner: Mutex<FakeHostInner>,
}

impl FakeHost {
    /// Every branch resolves to `default_head` until overridden.
    pub fn new(default_head: &str) -> Self {
        Self {
            inner: Mutex::new(FakeHostInner {
                default_head: default_head.to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn add_file(&self, path: &str, content: &str) {
        self.inner
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.as_bytes().to_vec());
    }

    pub fn add_binary_file(&self, path: &str, content: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.to_vec());
    }

    pub fn add_commit(&self, sha: &str, message: &str, files: &[&str]) {
        self.inner.lock().unwrap().commits.insert(
            sha.to_string(),
            (
                message.to_string(),
                files.iter().map(|f| f.to_string()).collect(),
            ),
        );
    }

    pub fn set_branch_head(&self, branch: &str, sha: &str) {
        self.inner
            .lock()
            .unwrap()
            .branch_heads
            .insert(branch.to_string(), sha.to_string());
    }

    /// Seed a branch as already existing (e.g. from an interrupted run).
    pub fn add_branch(&self, branch: &str, sha: &str) {
        self.set_branch_head(branch, sha);
    }

    pub fn fail_get_commit(&self) {
        self.inner.lock().unwrap().fail_get_commit = true;
    }

    pub fn fetch_count(&self, path: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .fetch_counts
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn created_branches(&self) -> Vec<String> {
        self.inner.lock().unwrap().created_branches.clone()
    }

    pub fn commits_to(&self, branch: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .commits_per_branch
            .get(branch)
            .copied()
            .unwrap_or(0)
    }

    pub fn opened_prs(&self) -> Vec<(PullRequestRef, Vec<String>)> {
        self.inner.lock().unwrap().opened_prs.clone()
    }
}

#[async_trait]
impl SourceHost for FakeHost {
    async fn get_file_at(
        &self,
        _repository: &RepositoryId,
        path: &str,
        _sha: &CommitSha,
    ) -> Result<Option<Vec<u8>>, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        *inner.fetch_counts.entry(path.to_string()).or_default() += 1;
        Ok(inner.files.get(path).cloned())
    }

    async fn get_commit(
        &self,
        _repository: &RepositoryId,
        sha: &CommitSha,
    ) -> Result<CommitInfo, ApiError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_get_commit {
            return Err(ApiError::Fatal("commit lookup disabled".to_string()));
        }
        let (message, files) = inner
            .commits
            .get(&sha.0)
            .cloned()
            .ok_or_else(|| ApiError::Fatal(format!("unknown commit {sha}")))?;
        Ok(CommitInfo {
            sha: sha.clone(),
            message,
            files,
        })
    }

    async fn get_branch_head(
        &self,
        _repository: &RepositoryId,
        branch: &str,
    ) -> Result<CommitSha, ApiError> {
        let inner = self.inner.lock().unwrap();
        let sha = inner
            .branch_heads
            .get(branch)
            .cloned()
            .unwrap_or_else(|| inner.default_head.clone());
        Ok(CommitSha(sha))
    }

    async fn create_branch(
        &self,
        _repository: &RepositoryId,
        name: &str,
        base_sha: &CommitSha,
    ) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .branch_heads
            .insert(name.to_string(), base_sha.0.clone());
        inner.created_branches.push(name.to_string());
        Ok(())
    }

    async fn commit_file(
        &self,
        _repository: &RepositoryId,
        branch: &str,
        path: &str,
        content: &str,
        _message: &str,
    ) -> Result<CommitSha, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.branch_heads.contains_key(branch) {
            return Err(ApiError::Fatal(format!("branch {branch} does not exist")));
        }
        inner.files.insert(path.to_string(), content.as_bytes().to_vec());
        *inner
            .commits_per_branch
            .entry(branch.to_string())
            .or_default() += 1;
        let sha = format!("commit-{}-{}", branch, inner.commits_per_branch[branch]);
        inner.branch_heads.insert(branch.to_string(), sha.clone());
        Ok(CommitSha(sha))
    }

    async fn open_pull_request(
        &self,
        _repository: &RepositoryId,
        head_branch: &str,
        _base_branch: &str,
        _title: &str,
        _body: &str,
        labels: &[String],
    ) -> Result<PullRequestRef, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        let number = inner.opened_prs.len() as u64 + 1;
        let pr = PullRequestRef {
            number,
            url: format!("https://example.com/acme/widgets/pull/{number}"),
            branch: head_branch.to_string(),
        };
        inner.opened_prs.push((pr.clone(), labels.to_vec()));
        Ok(pr)
    }
}

// -- LLM --------------------------------------------------------------------

struct ScriptedLlmInner {
    responses: Vec<String>,
    next: usize,
    repeat_last: bool,
    prompts: Vec<String>,
}

/// [`LlmService`] that replays canned responses and records prompts.
pub struct ScriptedLlm {
    inner: Mutex<ScriptedLlmInner>,
}

impl ScriptedLlm {
    /// Answer every request with the same response.
    pub fn always(response: &str) -> Self {
        Self {
            inner: Mutex::new(ScriptedLlmInner {
                responses: vec![response.to_string()],
                next: 0,
                repeat_last: true,
                prompts: Vec::new(),
            }),
        }
    }

    /// Answer requests with the given responses in order; a request past the
    /// end fails fatally so a test notices unexpected extra calls.
    pub fn sequence(responses: Vec<String>) -> Self {
        Self {
            inner: Mutex::new(ScriptedLlmInner {
                responses,
                next: 0,
                repeat_last: false,
                prompts: Vec::new(),
            }),
        }
    }

    /// User prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.inner.lock().unwrap().prompts.clone()
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn complete(&self, _system: &str, user: &str) -> Result<String, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.prompts.push(user.to_string());

        let index = inner.next;
        if index >= inner.responses.len() {
            if inner.repeat_last {
                return Ok(inner.responses.last().cloned().unwrap_or_default());
            }
            return Err(ApiError::Fatal("scripted responses exhausted".to_string()));
        }
        inner.next += 1;
        Ok(inner.responses[index].clone())
    }
}

// -- Email ------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Default)]
struct MemoryMailerInner {
    sent: Vec<SentMail>,
    attempts: usize,
    fail: bool,
}

/// [`EmailService`] that captures messages instead of sending them.
#[derive(Default)]
pub struct MemoryMailer {
    inner: Mutex<MemoryMailerInner>,
}

impl MemoryMailer {
    pub fn fail_always(&self) {
        self.inner.lock().unwrap().fail = true;
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn attempts(&self) -> usize {
        self.inner.lock().unwrap().attempts
    }
}

#[async_trait]
impl EmailService for MemoryMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.attempts += 1;
        if inner.fail {
            return Err(ApiError::Transient("smtp unavailable".to_string()));
        }
        inner.sent.push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}
