//! Fixing stage: propose and consolidate fixes for the fixable issues.
//!
//! Each fixable issue gets its own LLM request with roughly ten lines of
//! context either side of the reported line. A failed request or malformed
//! response skips that one issue; the rest still get fixes. Proposals then
//! go through the consolidation pass, which resolves overlaps and refuses
//! to produce a syntactically broken file.

use std::collections::BTreeMap;

use tracing::{info, warn};

use codepolice_core::consolidate::{consolidate, ConsolidationResult};
use codepolice_core::issue::{AnalysisReport, ContextFile, FixProposal, Issue};
use codepolice_core::parse::parse_fix_response;

use crate::llm::LlmService;
use crate::retry::RetryExecutor;

/// Lines of surrounding context included with an issue's snippet.
const CONTEXT_LINES: u32 = 10;

const FIX_SYSTEM_PROMPT: &str = "You are a code fixer. You will receive one issue and the \
    surrounding code. Respond with a single JSON object only, no prose, with the fields: \
    fixedCode (the complete replacement text), startLine and endLine (1-based inclusive line \
    numbers in the original file that fixedCode replaces), and explanation. Keep the fix \
    minimal and do not change unrelated lines.";

pub struct FixPlanner<'a> {
    llm: &'a dyn LlmService,
    retry: &'a RetryExecutor,
}

impl<'a> FixPlanner<'a> {
    pub fn new(llm: &'a dyn LlmService, retry: &'a RetryExecutor) -> Self {
        Self { llm, retry }
    }

    /// Propose fixes for every fixable issue, then consolidate them.
    ///
    /// `files` maps path to the original content at the analyzed commit.
    /// Issues in files with no text content (binary, oversized, deleted)
    /// are skipped.
    pub async fn plan(
        &self,
        report: &AnalysisReport,
        files: &BTreeMap<String, String>,
    ) -> ConsolidationResult {
        let mut proposals: Vec<FixProposal> = Vec::new();

        for issue in report.fixable_issues() {
            let Some(original) = files.get(&issue.file) else {
                warn!(issue = %issue.id, file = %issue.file, "no content for fixable issue");
                continue;
            };

            match self.propose(issue, original).await {
                Some(proposal) => proposals.push(proposal),
                // Skipped issues stay in the report as fixable-but-not-fixed.
                None => continue,
            }
        }

        let result = consolidate(files, proposals);
        info!(
            files = result.files.len(),
            superseded = result.superseded.len(),
            not_fixed = result.not_fixed.len(),
            "fix plan consolidated"
        );
        result
    }

    async fn propose(&self, issue: &Issue, original: &str) -> Option<FixProposal> {
        let prompt = fix_prompt(issue, original);
        let response = match self
            .retry
            .execute("propose_fix", || {
                self.llm.complete(FIX_SYSTEM_PROMPT, &prompt)
            })
            .await
        {
            Ok(response) => response,
            Err(error) => {
                warn!(issue = %issue.id, %error, "fix request failed, skipping issue");
                return None;
            }
        };

        match parse_fix_response(&response, issue, original) {
            Ok(proposal) => Some(proposal),
            Err(error) => {
                warn!(issue = %issue.id, %error, "fix response was unusable, skipping issue");
                None
            }
        }
    }
}

/// Issue description plus a numbered snippet around the reported line.
fn fix_prompt(issue: &Issue, original: &str) -> String {
    let lines: Vec<&str> = original.lines().collect();
    let line_index = issue.line.saturating_sub(1) as usize;
    let start = line_index.saturating_sub(CONTEXT_LINES as usize);
    let end = (line_index + CONTEXT_LINES as usize + 1).min(lines.len());

    let mut snippet = String::new();
    for (offset, line) in lines[start..end].iter().enumerate() {
        snippet.push_str(&format!("{:>5} | {line}\n", start + offset + 1));
    }

    let mut prompt = format!(
        "Issue in {} at line {}: [{}/{}] {}\n",
        issue.file, issue.line, issue.severity, issue.issue_type, issue.description
    );
    if let Some(suggestion) = &issue.suggestion {
        prompt.push_str(&format!("Suggested direction: {suggestion}\n"));
    }
    prompt.push_str(&format!(
        "\nCode (line numbers refer to the original file):\n{snippet}"
    ));
    prompt
}

/// Text contents of an analysis context's files, keyed by path.
pub fn text_files(
    changed: &[ContextFile],
    imported: &[ContextFile],
) -> BTreeMap<String, String> {
    changed
        .iter()
        .chain(imported)
        .filter_map(|file| match file {
            ContextFile::Text { path, content } => Some((path.clone(), content.clone())),
            ContextFile::Binary { .. } => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLlm;
    use codepolice_core::issue::{
        CommitSha, IssueId, IssueType, ReportId, RepositoryId, Severity,
    };

    fn fixable_issue(id: u64, file: &str, line: u32) -> Issue {
        Issue {
            id: IssueId(id),
            severity: Severity::Medium,
            issue_type: IssueType::Bug,
            file: file.to_string(),
            line,
            column: None,
            description: "Comparison is inverted".to_string(),
            suggestion: None,
            fixable: true,
        }
    }

    fn report_with(issues: Vec<Issue>) -> AnalysisReport {
        AnalysisReport {
            id: ReportId::new(),
            repository: RepositoryId::new("acme", "widgets"),
            commit_sha: CommitSha::from("abc1234def"),
            branch: "main".to_string(),
            timestamp: chrono::Utc::now(),
            issues,
            summary: String::new(),
            failed_chunks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_valid_fix_is_applied() {
        let llm = ScriptedLlm::always(
            r#"{"fixedCode":"if x >= 0:","startLine":2,"endLine":2,"explanation":"flip"}"#,
        );
        let retry = RetryExecutor::default();
        let planner = FixPlanner::new(&llm, &retry);

        let mut files = BTreeMap::new();
        files.insert("a.py".to_string(), "x = read()\nif x <= 0:\n    go()\n".to_string());
        let report = report_with(vec![fixable_issue(1, "a.py", 2)]);

        let result = planner.plan(&report, &files).await;
        assert_eq!(result.files.len(), 1);
        assert!(result.files[0].content.contains("if x >= 0:"));
        assert_eq!(result.files[0].applied_issue_ids, vec![IssueId(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_fix_skips_only_that_issue() {
        // First issue gets garbage, second gets a valid fix.
        let llm = ScriptedLlm::sequence(vec![
            "cannot help with that".into(),
            r#"{"fixedCode":"y = 2","startLine":2,"endLine":2,"explanation":"set y"}"#.into(),
        ]);
        let retry = RetryExecutor::default();
        let planner = FixPlanner::new(&llm, &retry);

        let mut files = BTreeMap::new();
        files.insert("a.py".to_string(), "x = 1\ny = 1\n".to_string());
        let report = report_with(vec![
            fixable_issue(1, "a.py", 1),
            fixable_issue(2, "a.py", 2),
        ]);

        let result = planner.plan(&report, &files).await;
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].applied_issue_ids, vec![IssueId(2)]);
    }

    #[tokio::test]
    async fn test_issue_in_binary_file_is_skipped() {
        let llm = ScriptedLlm::always("{}");
        let retry = RetryExecutor::default();
        let planner = FixPlanner::new(&llm, &retry);

        let files = BTreeMap::new();
        let report = report_with(vec![fixable_issue(1, "logo.png", 1)]);

        let result = planner.plan(&report, &files).await;
        assert!(result.files.is_empty());
        assert!(llm.prompts().is_empty());
    }

    #[test]
    fn test_fix_prompt_contains_context_window() {
        let original: String = (1..=40).map(|i| format!("line {i}\n")).collect();
        let issue = fixable_issue(1, "a.py", 20);

        let prompt = fix_prompt(&issue, &original);
        assert!(prompt.contains("line 10"));
        assert!(prompt.contains("line 30"));
        assert!(!prompt.contains("line 9\n"));
        assert!(!prompt.contains("line 32"));
    }

    #[test]
    fn test_text_files_excludes_binaries() {
        let changed = vec![
            ContextFile::Text {
                path: "a.py".into(),
                content: "x\n".into(),
            },
            ContextFile::Binary {
                path: "logo.png".into(),
            },
        ];
        let files = text_files(&changed, &[]);
        assert!(files.contains_key("a.py"));
        assert!(!files.contains_key("logo.png"));
    }
}
