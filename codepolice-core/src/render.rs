//! Deterministic rendering of the pipeline's outward-facing text: branch
//! names, commit messages, the pull-request description, and the plain-text
//! notification bodies.
//!
//! Everything here is a pure function of the report/fix data, so a resumed
//! job regenerates byte-identical output.

use chrono::{DateTime, Utc};

use crate::issue::{
    AnalysisReport, ConsolidatedFile, Issue, IssueId, PullRequestRef, Severity,
};

/// Label set attached to every automated-fix PR.
pub fn pr_labels(max_severity: Severity) -> Vec<String> {
    vec![
        "automated-fix".to_string(),
        "code-quality".to_string(),
        format!("severity:{max_severity}"),
    ]
}

/// Branch name for a fix PR: `code-police/fix-<timestamp>-<description>`.
///
/// The timestamp uses the ISO 8601 basic format (no colons — git ref names
/// forbid them).
pub fn branch_name(timestamp: DateTime<Utc>, description: &str) -> String {
    format!(
        "code-police/fix-{}-{}",
        timestamp.format("%Y%m%dT%H%M%SZ"),
        kebab_case(description)
    )
}

/// Lowercase, alphanumerics kept, everything else collapsed to single dashes.
pub fn kebab_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = true;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Commit message for one consolidated file: the issue types, file path, and
/// line numbers of every fix the commit applies.
pub fn commit_message(file: &ConsolidatedFile, issues: &[Issue]) -> String {
    let applied: Vec<&Issue> = issues
        .iter()
        .filter(|i| file.applied_issue_ids.contains(&i.id))
        .collect();

    let types: Vec<&str> = {
        let mut seen = Vec::new();
        for issue in &applied {
            let name = issue.issue_type.as_str();
            if !seen.contains(&name) {
                seen.push(name);
            }
        }
        seen
    };

    let mut message = format!("fix({}): {} in {}", types.join(","), plural(applied.len(), "issue"), file.path);
    for issue in &applied {
        message.push_str(&format!(
            "\n\n- {} ({}) at {}:{} — {}",
            issue.issue_type, issue.severity, file.path, issue.line, issue.description
        ));
    }
    message
}

fn plural(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("1 {noun}")
    } else {
        format!("{n} {noun}s")
    }
}

/// Title for the fix pull request.
pub fn pr_title(report: &AnalysisReport, applied: &[IssueId]) -> String {
    format!(
        "Automated fixes for {} on {} ({})",
        plural(applied.len(), "issue"),
        report.branch,
        report.commit_sha.short()
    )
}

/// Body for the fix pull request: summary, every applied issue id, and the
/// findings that were not auto-fixed.
pub fn pr_body(report: &AnalysisReport, applied: &[IssueId]) -> String {
    let mut body = String::new();
    body.push_str("## Analysis summary\n\n");
    body.push_str(&report.summary);
    body.push_str("\n\n## Applied fixes\n\n");
    for id in applied {
        if let Some(issue) = report.issues.iter().find(|i| i.id == *id) {
            body.push_str(&format!(
                "- `{}`: {} ({}) in `{}` line {}\n",
                id, issue.issue_type, issue.severity, issue.file, issue.line
            ));
        } else {
            body.push_str(&format!("- `{id}`\n"));
        }
    }

    let unfixed: Vec<&Issue> = report
        .issues
        .iter()
        .filter(|i| !applied.contains(&i.id))
        .collect();
    if !unfixed.is_empty() {
        body.push_str("\n## Findings not auto-fixed\n\n");
        for issue in unfixed {
            body.push_str(&format!(
                "- `{}`: {} ({}) in `{}` line {} — {}\n",
                issue.id, issue.issue_type, issue.severity, issue.file, issue.line,
                issue.description
            ));
        }
    }
    body.push_str(&format!(
        "\n---\nCommit analyzed: `{}`\n",
        report.commit_sha
    ));
    body
}

/// Subject and plain-text body for the issues-found notification.
pub fn issues_found_email(
    report: &AnalysisReport,
    pr: Option<&PullRequestRef>,
) -> (String, String) {
    let subject = format!(
        "[code-police] {} found in {} ({})",
        plural(report.issues.len(), "issue"),
        report.repository,
        report.branch
    );
    let mut body = format!(
        "Analysis of {} at {} found {}.\n\n",
        report.repository,
        report.commit_sha.short(),
        plural(report.issues.len(), "issue"),
    );
    for issue in &report.issues {
        body.push_str(&format!(
            "- [{}] {} in {} line {}: {}\n",
            issue.severity, issue.issue_type, issue.file, issue.line, issue.description
        ));
    }
    if let Some(pr) = pr {
        body.push_str(&format!(
            "\nAutomated fixes were opened as a pull request: {}\n",
            pr.url
        ));
    }
    if !report.failed_chunks.is_empty() {
        body.push_str(&format!(
            "\nNote: {} of the analysis failed and may have missed findings.\n",
            plural(report.failed_chunks.len(), "chunk")
        ));
    }
    (subject, body)
}

/// Subject and body for the zero-issues success notification.
pub fn success_email(report: &AnalysisReport) -> (String, String) {
    let subject = format!(
        "[code-police] no issues in {} ({})",
        report.repository, report.branch
    );
    let body = format!(
        "Analysis of {} at {} completed with no findings. Nice work.\n",
        report.repository,
        report.commit_sha.short()
    );
    (subject, body)
}

/// Subject and body for the publish-conflict notification.
pub fn conflict_email(
    report: &AnalysisReport,
    file: &str,
    base_sha: &str,
    head_sha: &str,
) -> (String, String) {
    let subject = format!(
        "[code-police] fix PR conflicted in {} ({})",
        report.repository, report.branch
    );
    let body = format!(
        "Automated fixes for {} could not be published: the branch diverged \
         before the pull request could be opened.\n\n\
         Conflicting file: {file}\nAnalyzed base: {base_sha}\nCurrent head: {head_sha}\n\n\
         The analysis report is unaffected; re-push to trigger a fresh run.\n",
        report.repository
    );
    (subject, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{IssueType, RepositoryId, ReportId};
    use chrono::TimeZone;

    fn issue(id: u64, fixable: bool) -> Issue {
        Issue {
            id: IssueId(id),
            severity: Severity::High,
            issue_type: IssueType::Bug,
            file: "a.py".into(),
            line: 10 + id as u32,
            column: None,
            description: format!("problem {id}"),
            suggestion: None,
            fixable,
        }
    }

    fn report(issues: Vec<Issue>) -> AnalysisReport {
        AnalysisReport {
            id: ReportId::new(),
            repository: RepositoryId::new("octo", "widgets"),
            commit_sha: "abc123def456".into(),
            branch: "main".into(),
            timestamp: Utc::now(),
            issues,
            summary: "Two problems found.".into(),
            failed_chunks: vec![],
        }
    }

    #[test]
    fn test_kebab_case() {
        assert_eq!(kebab_case("Fix 3 issues in a.py!"), "fix-3-issues-in-a-py");
        assert_eq!(kebab_case("  weird__input  "), "weird-input");
        assert_eq!(kebab_case(""), "");
    }

    #[test]
    fn test_branch_name_is_a_valid_ref() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 9, 14, 30, 5).unwrap();
        let name = branch_name(ts, "2 bug fixes");
        assert_eq!(name, "code-police/fix-20250309T143005Z-2-bug-fixes");
        assert!(!name.contains(':'));
        assert!(!name.contains(' '));
    }

    #[test]
    fn test_commit_message_names_type_file_and_line() {
        let file = ConsolidatedFile {
            path: "a.py".into(),
            content: String::new(),
            applied_issue_ids: vec![IssueId(1), IssueId(2)],
        };
        let issues = vec![issue(1, true), issue(2, true)];
        let message = commit_message(&file, &issues);
        assert!(message.starts_with("fix(bug): 2 issues in a.py"));
        assert!(message.contains("a.py:11"));
        assert!(message.contains("a.py:12"));
    }

    #[test]
    fn test_pr_body_lists_applied_and_unfixed() {
        let r = report(vec![issue(1, true), issue(2, false)]);
        let body = pr_body(&r, &[IssueId(1)]);
        assert!(body.contains("Two problems found."));
        assert!(body.contains("`issue-1`"));
        assert!(body.contains("Findings not auto-fixed"));
        assert!(body.contains("`issue-2`"));
    }

    #[test]
    fn test_labels_include_max_severity() {
        let labels = pr_labels(Severity::Critical);
        assert_eq!(
            labels,
            vec!["automated-fix", "code-quality", "severity:critical"]
        );
    }

    #[test]
    fn test_issues_found_email_includes_pr_link() {
        let r = report(vec![issue(1, true)]);
        let pr = PullRequestRef {
            number: 7,
            url: "https://example.com/pr/7".into(),
            branch: "code-police/fix-x".into(),
        };
        let (subject, body) = issues_found_email(&r, Some(&pr));
        assert!(subject.contains("1 issue"));
        assert!(body.contains("https://example.com/pr/7"));
        assert!(body.contains("problem 1"));
    }

    #[test]
    fn test_success_email_mentions_no_findings() {
        let r = report(vec![]);
        let (subject, body) = success_email(&r);
        assert!(subject.contains("no issues"));
        assert!(body.contains("no findings"));
    }

    #[test]
    fn test_conflict_email_carries_shas() {
        let r = report(vec![issue(1, true)]);
        let (_, body) = conflict_email(&r, "a.py", "base111", "head222");
        assert!(body.contains("a.py"));
        assert!(body.contains("base111"));
        assert!(body.contains("head222"));
    }
}
