//! Core data model for the analyze-and-fix pipeline.
//!
//! Following the principle of "make illegal states unrepresentable", the
//! job lifecycle is an explicit enum and every cross-system identifier gets
//! its own newtype so it cannot be mixed up with an arbitrary string.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Newtype for a job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for an analysis report identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportId(pub Uuid);

impl ReportId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for commit SHA to prevent mixing with other strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitSha(pub String);

impl CommitSha {
    /// Returns a truncated SHA for display (first 7 characters).
    pub fn short(&self) -> &str {
        &self.0[..7.min(self.0.len())]
    }
}

impl fmt::Display for CommitSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CommitSha {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitSha {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifies one repository at the source host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryId {
    pub owner: String,
    pub name: String,
}

impl RepositoryId {
    pub fn new(owner: &str, name: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Issue identifier, assigned sequentially when a response is validated.
///
/// Ordering matters: when two fixes overlap, the one for the higher issue id
/// wins (see `consolidate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IssueId(pub u64);

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "issue-{}", self.0)
    }
}

/// Severity of a reported issue. Ordered so that `max()` picks the worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse a severity from the LLM's string value. Unknown values are
    /// rejected so the caller can drop the issue rather than default it.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Category of a reported issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Bug,
    Security,
    Performance,
    Style,
    Maintainability,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Style => "style",
            Self::Maintainability => "maintainability",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bug" => Some(Self::Bug),
            "security" => Some(Self::Security),
            "performance" => Some(Self::Performance),
            "style" => Some(Self::Style),
            "maintainability" => Some(Self::Maintainability),
            _ => None,
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One validated finding from the analyzer.
///
/// Constructed only by `parse::parse_issue_response`; a candidate missing any
/// required field never becomes an `Issue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub severity: Severity,
    pub issue_type: IssueType,
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
    pub description: String,
    pub suggestion: Option<String>,
    pub fixable: bool,
}

/// Immutable record of one completed analyzer stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub id: ReportId,
    pub repository: RepositoryId,
    pub commit_sha: CommitSha,
    pub branch: String,
    pub timestamp: DateTime<Utc>,
    pub issues: Vec<Issue>,
    pub summary: String,
    /// Indices of context chunks whose analysis failed fatally. Issues from
    /// the other chunks are still present.
    pub failed_chunks: Vec<usize>,
}

impl AnalysisReport {
    /// The worst severity present, if any issue was found.
    pub fn max_severity(&self) -> Option<Severity> {
        self.issues.iter().map(|i| i.severity).max()
    }

    pub fn fixable_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.fixable)
    }
}

/// One file's content at a commit, or just its name if binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextFile {
    Text { path: String, content: String },
    Binary { path: String },
}

impl ContextFile {
    pub fn path(&self) -> &str {
        match self {
            Self::Text { path, .. } => path,
            Self::Binary { path } => path,
        }
    }
}

/// Input to the analyzer: changed files plus their bounded import closure.
///
/// Immutable once built; not persisted beyond the report it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisContext {
    pub repository: RepositoryId,
    pub head_sha: CommitSha,
    pub branch: String,
    pub commit_messages: Vec<String>,
    /// Files changed by the push, in the order the host reported them.
    pub changed_files: Vec<ContextFile>,
    /// Imported files resolved to depth <= 2, deduplicated against
    /// `changed_files`.
    pub imported_files: Vec<ContextFile>,
}

/// Job lifecycle status.
///
/// Transitions are strictly forward; `Failed` is reachable from any
/// non-terminal state once the job-level retry budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Fetching,
    Analyzing,
    Fixing,
    Publishing,
    Notifying,
    Completed,
    CompletedWithWarning,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Fetching => "Fetching",
            Self::Analyzing => "Analyzing",
            Self::Fixing => "Fixing",
            Self::Publishing => "Publishing",
            Self::Notifying => "Notifying",
            Self::Completed => "Completed",
            Self::CompletedWithWarning => "CompletedWithWarning",
            Self::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Self::Pending),
            "Fetching" => Some(Self::Fetching),
            "Analyzing" => Some(Self::Analyzing),
            "Fixing" => Some(Self::Fixing),
            "Publishing" => Some(Self::Publishing),
            "Notifying" => Some(Self::Notifying),
            "Completed" => Some(Self::Completed),
            "CompletedWithWarning" => Some(Self::CompletedWithWarning),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true if no further automatic transition occurs.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithWarning | Self::Failed
        )
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// The forward chain is Pending -> Fetching -> Analyzing -> Fixing ->
    /// Publishing -> Notifying -> Completed/CompletedWithWarning. Fixing and
    /// Publishing may be skipped (no fixable issues, nothing to publish).
    /// Failed is reachable from any non-terminal state. Pending is reachable
    /// from any in-progress state when a job-level retry re-enqueues the job.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        // Job-level retry: re-enqueue an in-progress job.
        if next == Pending {
            return !matches!(self, Pending);
        }
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Analyzing)
                | (Analyzing, Fixing)
                | (Analyzing, Notifying)
                | (Fixing, Publishing)
                | (Fixing, Notifying)
                | (Publishing, Notifying)
                | (Notifying, Completed)
                | (Notifying, CompletedWithWarning)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of pipeline work, triggered by a push event.
///
/// Owned exclusively by the orchestrator; mutated only through validated
/// status transitions; never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub repository: RepositoryId,
    pub commits: Vec<CommitSha>,
    /// The branch the push targeted; also the PR base.
    pub branch: String,
    pub status: JobStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Email address of the repository owner, for the notifier.
    pub owner_email: String,
}

impl Job {
    pub fn new(
        repository: RepositoryId,
        commits: Vec<CommitSha>,
        branch: String,
        owner_email: String,
    ) -> Self {
        Self {
            id: JobId::new(),
            repository,
            commits,
            branch,
            status: JobStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            owner_email,
        }
    }

    /// The commit the job analyzes: the last pushed commit.
    pub fn head_sha(&self) -> Option<&CommitSha> {
        self.commits.last()
    }
}

/// One candidate fix for one fixable issue, before consolidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixProposal {
    pub issue_id: IssueId,
    pub file: String,
    pub original_code: String,
    pub fixed_code: String,
    /// 1-based inclusive line range the fix replaces.
    pub start_line: u32,
    pub end_line: u32,
    pub explanation: String,
}

/// The unit actually committed: one coherent version of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidatedFile {
    pub path: String,
    pub content: String,
    pub applied_issue_ids: Vec<IssueId>,
}

/// Reference to an opened pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
    pub branch: String,
}
