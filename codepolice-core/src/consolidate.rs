//! Fix consolidation: many independent per-issue fixes become one coherent
//! version of each file.
//!
//! The contract, in order:
//! 1. proposals for a file are sorted by `start_line`;
//! 2. where two line ranges overlap, the proposal with the *higher* issue id
//!    wins and the earlier one is discarded as superseded (logged, not an
//!    error);
//! 3. the survivors are spliced into the original content in range order;
//! 4. the spliced result must still be syntactically well-formed for
//!    languages where a validator is available — offending fixes are
//!    excluded, and if no coherent subset remains the file reverts to its
//!    pre-fix state. A broken file is never produced.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::issue::{ConsolidatedFile, FixProposal, IssueId};

/// Result of consolidating all proposals for one job.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationResult {
    /// Exactly one entry per file that retained at least one fix.
    pub files: Vec<ConsolidatedFile>,
    /// Proposals discarded because a later-proposed fix overlapped them.
    pub superseded: Vec<IssueId>,
    /// Proposals excluded by range or syntax validation. The corresponding
    /// issues stay in the report as fixable-but-not-fixed.
    pub not_fixed: Vec<IssueId>,
}

/// Consolidate fix proposals against the original file contents.
///
/// `originals` maps file path to the content being patched; proposals for a
/// path with no original content cannot be applied and are marked not-fixed.
pub fn consolidate(
    originals: &BTreeMap<String, String>,
    proposals: Vec<FixProposal>,
) -> ConsolidationResult {
    let mut by_file: BTreeMap<String, Vec<FixProposal>> = BTreeMap::new();
    for proposal in proposals {
        by_file.entry(proposal.file.clone()).or_default().push(proposal);
    }

    let mut result = ConsolidationResult::default();
    for (path, file_proposals) in by_file {
        let Some(original) = originals.get(&path) else {
            warn!(%path, "no original content for proposed fixes; skipping file");
            result
                .not_fixed
                .extend(file_proposals.iter().map(|p| p.issue_id));
            continue;
        };
        consolidate_file(&path, original, file_proposals, &mut result);
    }
    result
}

fn consolidate_file(
    path: &str,
    original: &str,
    mut proposals: Vec<FixProposal>,
    result: &mut ConsolidationResult,
) {
    let line_count = original.lines().count() as u32;

    // Out-of-range proposals can never splice cleanly.
    proposals.retain(|p| {
        if p.end_line > line_count {
            warn!(
                %path,
                issue = %p.issue_id,
                end_line = p.end_line,
                file_lines = line_count,
                "fix range exceeds file; marking not fixed"
            );
            result.not_fixed.push(p.issue_id);
            false
        } else {
            true
        }
    });

    proposals.sort_by_key(|p| (p.start_line, p.issue_id));

    // Resolve overlaps: the later-proposed (higher issue id) fix wins.
    let mut accepted: Vec<FixProposal> = Vec::new();
    for proposal in proposals {
        match accepted.last() {
            Some(prev) if ranges_overlap(prev, &proposal) => {
                let (winner, loser) = if proposal.issue_id > prev.issue_id {
                    (proposal, accepted.pop().expect("just checked last"))
                } else {
                    (accepted.pop().expect("just checked last"), proposal)
                };
                info!(
                    %path,
                    kept = %winner.issue_id,
                    superseded = %loser.issue_id,
                    "overlapping fixes; later issue wins"
                );
                result.superseded.push(loser.issue_id);
                accepted.push(winner);
            }
            _ => accepted.push(proposal),
        }
    }

    if accepted.is_empty() {
        return;
    }

    let content = splice(original, &accepted);
    if validate_syntax(path, &content) {
        result.files.push(ConsolidatedFile {
            path: path.to_string(),
            content,
            applied_issue_ids: accepted.iter().map(|p| p.issue_id).collect(),
        });
        return;
    }

    // The combined splice broke the file. Exclude the fixes that break it
    // on their own; if the remainder still fails, revert the whole file.
    warn!(%path, "spliced content failed syntax validation; isolating bad fixes");
    let (good, bad): (Vec<_>, Vec<_>) = accepted
        .into_iter()
        .partition(|p| validate_syntax(path, &splice(original, std::slice::from_ref(p))));

    if !bad.is_empty() && !good.is_empty() {
        let content = splice(original, &good);
        if validate_syntax(path, &content) {
            result.not_fixed.extend(bad.iter().map(|p| p.issue_id));
            result.files.push(ConsolidatedFile {
                path: path.to_string(),
                content,
                applied_issue_ids: good.iter().map(|p| p.issue_id).collect(),
            });
            return;
        }
        // Fall through: the "good" subset still interacts badly.
        result.not_fixed.extend(good.iter().map(|p| p.issue_id));
        result.not_fixed.extend(bad.iter().map(|p| p.issue_id));
        warn!(%path, "no coherent fix subset; file reverts to pre-fix state");
        return;
    }

    result.not_fixed.extend(good.iter().map(|p| p.issue_id));
    result.not_fixed.extend(bad.iter().map(|p| p.issue_id));
    warn!(%path, "no coherent fix subset; file reverts to pre-fix state");
}

fn ranges_overlap(a: &FixProposal, b: &FixProposal) -> bool {
    a.start_line <= b.end_line && b.start_line <= a.end_line
}

/// Splice non-overlapping fixes into the original content.
///
/// Proposals must be sorted ascending and non-overlapping. Applied from the
/// bottom up so earlier line numbers stay valid.
fn splice(original: &str, proposals: &[FixProposal]) -> String {
    let mut lines: Vec<&str> = original.lines().collect();
    let replacement_lines: Vec<Vec<&str>> = proposals
        .iter()
        .map(|p| p.fixed_code.lines().collect())
        .collect();

    for (proposal, replacement) in proposals.iter().zip(replacement_lines.iter()).rev() {
        let start = (proposal.start_line - 1) as usize;
        let end = proposal.end_line as usize;
        lines.splice(start..end, replacement.iter().copied());
    }

    let mut content = lines.join("\n");
    if original.ends_with('\n') && !content.is_empty() {
        content.push('\n');
    }
    content
}

/// Check that `content` is syntactically plausible for the file's language.
///
/// JSON gets a real parse. Python, Rust, JavaScript and TypeScript get a
/// string- and comment-aware delimiter balance check. Unknown languages have
/// no validator and always pass.
pub fn validate_syntax(path: &str, content: &str) -> bool {
    let extension = path.rsplit('.').next().unwrap_or_default();
    match extension {
        "json" => serde_json::from_str::<serde_json::Value>(content).is_ok(),
        "py" => delimiters_balanced(content, "#", false),
        "rs" | "js" | "ts" | "jsx" | "tsx" => delimiters_balanced(content, "//", true),
        _ => true,
    }
}

fn delimiters_balanced(content: &str, line_comment: &str, block_comments: bool) -> bool {
    let mut stack: Vec<char> = Vec::new();
    let bytes: Vec<char> = content.chars().collect();
    let comment_start: Vec<char> = line_comment.chars().collect();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];

        // Line comments run to end of line.
        if bytes[i..].starts_with(&comment_start) {
            while i < bytes.len() && bytes[i] != '\n' {
                i += 1;
            }
            continue;
        }
        // Block comments for the C-family languages.
        if block_comments && c == '/' && bytes.get(i + 1) == Some(&'*') {
            i += 2;
            while i + 1 < bytes.len() && !(bytes[i] == '*' && bytes[i + 1] == '/') {
                i += 1;
            }
            i = (i + 2).min(bytes.len());
            continue;
        }
        // String literals: skip to the matching quote, honoring escapes.
        if c == '"' || c == '\'' || c == '`' {
            let quote = c;
            i += 1;
            while i < bytes.len() {
                if bytes[i] == '\\' {
                    i += 2;
                    continue;
                }
                if bytes[i] == quote {
                    break;
                }
                i += 1;
            }
            i += 1;
            continue;
        }

        match c {
            '(' | '[' | '{' => stack.push(c),
            ')' => {
                if stack.pop() != Some('(') {
                    return false;
                }
            }
            ']' => {
                if stack.pop() != Some('[') {
                    return false;
                }
            }
            '}' => {
                if stack.pop() != Some('{') {
                    return false;
                }
            }
            _ => {}
        }
        i += 1;
    }

    stack.is_empty()
}


#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;

    fn arbitrary_proposals() -> impl Strategy<Value = Vec<FixProposal>> {
        prop::collection::vec((1u32..40, 0u32..5, any::<bool>()), 1..10).prop_map(|specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (start, span, multi))| FixProposal {
                    issue_id: IssueId(i as u64 + 1),
                    file: "f.txt".to_string(),
                    original_code: String::new(),
                    fixed_code: if multi {
                        "new one\nnew two".to_string()
                    } else {
                        "new".to_string()
                    },
                    start_line: start,
                    end_line: start + span,
                    explanation: String::new(),
                })
                .collect()
        })
    }

    proptest! {
        /// No two applied fixes may share overlapping line ranges, and every
        /// proposal is accounted for exactly once.
        #[test]
        fn applied_fixes_never_overlap(proposals in arbitrary_proposals()) {
            let original: String = (1..=50).map(|i| format!("line {i}\n")).collect();
            let mut originals = BTreeMap::new();
            originals.insert("f.txt".to_string(), original);

            let ids: Vec<IssueId> = proposals.iter().map(|p| p.issue_id).collect();
            let by_id: std::collections::BTreeMap<IssueId, (u32, u32)> = proposals
                .iter()
                .map(|p| (p.issue_id, (p.start_line, p.end_line)))
                .collect();

            let result = consolidate(&originals, proposals);

            prop_assert!(result.files.len() <= 1);
            let applied: Vec<IssueId> = result
                .files
                .first()
                .map(|f| f.applied_issue_ids.clone())
                .unwrap_or_default();

            // Applied ranges are pairwise disjoint.
            for (i, a) in applied.iter().enumerate() {
                for b in &applied[i + 1..] {
                    let (sa, ea) = by_id[a];
                    let (sb, eb) = by_id[b];
                    prop_assert!(ea < sb || eb < sa, "ranges {a} and {b} overlap");
                }
            }

            // Partition: every proposal is applied, superseded, or not fixed.
            let mut seen: Vec<IssueId> = applied.clone();
            seen.extend(&result.superseded);
            seen.extend(&result.not_fixed);
            seen.sort();
            let mut expected = ids;
            expected.sort();
            prop_assert_eq!(seen, expected);
        }
    }
}
