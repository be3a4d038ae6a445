//! Analyzing stage: turn an analysis context into an issue report.
//!
//! The context is serialized into one or more prompts, never splitting a
//! file across chunks. Chunks are analyzed independently: a chunk whose
//! request or response fails terminally is recorded in
//! `AnalysisReport::failed_chunks` and the remaining chunks still
//! contribute their issues. Zero issues is an ordinary, successful outcome.

use tracing::{info, warn};

use codepolice_core::issue::{AnalysisContext, AnalysisReport, ContextFile, ReportId, Severity};
use codepolice_core::parse::parse_issue_response;

use crate::llm::LlmService;
use crate::retry::{ApiError, RetryExecutor};

const SYSTEM_PROMPT: &str = "You are a code reviewer. Inspect the provided files and report \
    genuine problems. Respond with a JSON array only, no prose. Each element must be an object \
    with the fields: severity (low|medium|high|critical), type \
    (bug|security|performance|style|maintainability), file, line, column (optional), \
    description, suggestion (optional), and fixable (boolean). Report an empty array if the \
    code is clean.";

/// Rough token estimate: four bytes per token.
fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

pub struct CodeAnalyzer<'a> {
    llm: &'a dyn LlmService,
    retry: &'a RetryExecutor,
    token_budget: usize,
}

/// One prompt's worth of files.
struct Chunk {
    prompt: String,
    files: usize,
}

impl<'a> CodeAnalyzer<'a> {
    pub fn new(llm: &'a dyn LlmService, retry: &'a RetryExecutor, token_budget: usize) -> Self {
        Self {
            llm,
            retry,
            token_budget,
        }
    }

    pub async fn analyze(&self, context: &AnalysisContext) -> Result<AnalysisReport, ApiError> {
        let (chunks, skipped) = self.build_chunks(context);

        let mut issues = Vec::new();
        let mut failed_chunks = Vec::new();
        for (index, chunk) in chunks.iter().enumerate() {
            let response = match self
                .retry
                .execute("analyze_chunk", || {
                    self.llm.complete(SYSTEM_PROMPT, &chunk.prompt)
                })
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    warn!(chunk = index, %error, "chunk analysis failed");
                    failed_chunks.push(index);
                    continue;
                }
            };

            match parse_issue_response(&response, issues.len() as u64 + 1) {
                Ok(outcome) => {
                    for reason in &outcome.dropped {
                        warn!(chunk = index, reason, "dropped malformed issue candidate");
                    }
                    issues.extend(outcome.issues);
                }
                Err(error) => {
                    warn!(chunk = index, %error, "chunk response was unusable");
                    failed_chunks.push(index);
                }
            }
        }

        // Partial failure is tolerated; total failure means no analysis
        // actually happened and the stage must not pretend otherwise.
        if !chunks.is_empty() && failed_chunks.len() == chunks.len() {
            return Err(ApiError::Fatal(format!(
                "analysis failed for all {} chunks",
                chunks.len()
            )));
        }

        let summary = summarize(&issues, &failed_chunks, &skipped);
        info!(
            issues = issues.len(),
            chunks = chunks.len(),
            failed = failed_chunks.len(),
            skipped = skipped.len(),
            "analysis complete"
        );

        Ok(AnalysisReport {
            id: ReportId::new(),
            repository: context.repository.clone(),
            commit_sha: context.head_sha.clone(),
            branch: context.branch.clone(),
            timestamp: chrono::Utc::now(),
            issues,
            summary,
            failed_chunks,
        })
    }

    /// Greedily pack files into prompts without ever splitting one file.
    ///
    /// A single file whose own estimate exceeds the budget is skipped rather
    /// than truncated (a partial file would produce bogus line numbers); the
    /// skipped paths come back alongside the chunks so the report can name
    /// what went unanalyzed.
    fn build_chunks(&self, context: &AnalysisContext) -> (Vec<Chunk>, Vec<String>) {
        let header = prompt_header(context);
        let header_tokens = estimate_tokens(&header);

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_tokens = header_tokens;
        let mut current_files = 0usize;

        let all_files = context.changed_files.iter().chain(&context.imported_files);
        for file in all_files {
            let ContextFile::Text { path, content } = file else {
                // Binary files are named but never inlined.
                continue;
            };
            let section = format!("### File: {path}\n```\n{content}\n```\n\n");
            let section_tokens = estimate_tokens(&section);

            if header_tokens + section_tokens > self.token_budget {
                warn!(%path, tokens = section_tokens, "file exceeds the analysis budget, skipping");
                skipped.push(path.clone());
                continue;
            }
            if current_files > 0 && current_tokens + section_tokens > self.token_budget {
                chunks.push(Chunk {
                    prompt: format!("{header}{current}"),
                    files: current_files,
                });
                current = String::new();
                current_tokens = header_tokens;
                current_files = 0;
            }
            current.push_str(&section);
            current_tokens += section_tokens;
            current_files += 1;
        }
        if current_files > 0 {
            chunks.push(Chunk {
                prompt: format!("{header}{current}"),
                files: current_files,
            });
        }

        (chunks, skipped)
    }
}

fn prompt_header(context: &AnalysisContext) -> String {
    let mut header = format!(
        "Repository: {}\nBranch: {}\nCommit: {}\n\nCommit messages:\n",
        context.repository, context.branch, context.head_sha
    );
    for message in &context.commit_messages {
        header.push_str(&format!("- {}\n", message.lines().next().unwrap_or("")));
    }

    let binaries: Vec<&str> = context
        .changed_files
        .iter()
        .filter(|f| matches!(f, ContextFile::Binary { .. }))
        .map(|f| f.path())
        .collect();
    if !binaries.is_empty() {
        header.push_str("\nBinary files changed (not shown): ");
        header.push_str(&binaries.join(", "));
        header.push('\n');
    }

    header.push('\n');
    header
}

fn summarize(
    issues: &[codepolice_core::issue::Issue],
    failed_chunks: &[usize],
    skipped: &[String],
) -> String {
    let mut summary = if issues.is_empty() {
        if failed_chunks.is_empty() {
            "No issues found.".to_string()
        } else {
            format!(
                "No issues found; {} analysis chunk(s) failed and may have missed findings.",
                failed_chunks.len()
            )
        }
    } else {
        let mut files: Vec<&str> = issues.iter().map(|i| i.file.as_str()).collect();
        files.sort_unstable();
        files.dedup();

        let critical = issues
            .iter()
            .filter(|i| i.severity == Severity::Critical)
            .count();
        let mut found = format!(
            "Found {} issue(s) across {} file(s).",
            issues.len(),
            files.len()
        );
        if critical > 0 {
            found.push_str(&format!(" {critical} critical."));
        }
        if !failed_chunks.is_empty() {
            found.push_str(&format!(
                " {} analysis chunk(s) failed and may have missed findings.",
                failed_chunks.len()
            ));
        }
        found
    };

    if !skipped.is_empty() {
        summary.push_str(&format!(
            " Not analyzed (over the size limit): {}.",
            skipped.join(", ")
        ));
    }
    summary
}
