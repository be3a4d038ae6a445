//! Fetching stage: build the analysis context for a job.
//!
//! Fetches commit metadata and the changed files at the head SHA, then
//! follows import declarations up to depth 2 to pull in the files the
//! changed code depends on. Resolution is best-effort: an import that maps
//! to nothing in the repository is skipped. Every fetch for one job runs at
//! the same commit, so results are cached per path.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info, warn};

use codepolice_core::imports::{is_probably_binary, scan_imports};
use codepolice_core::issue::{AnalysisContext, CommitSha, ContextFile, Job};

use crate::github::SourceHost;
use crate::retry::{ApiError, RetryExecutor};

/// How many import hops away from a changed file the closure reaches.
const MAX_IMPORT_DEPTH: u32 = 2;

pub struct RepositoryMonitor<'a> {
    host: &'a dyn SourceHost,
    retry: &'a RetryExecutor,
}

impl<'a> RepositoryMonitor<'a> {
    pub fn new(host: &'a dyn SourceHost, retry: &'a RetryExecutor) -> Self {
        Self { host, retry }
    }

    /// Fetch everything the analyzer needs for this job.
    pub async fn fetch_context(&self, job: &Job) -> Result<AnalysisContext, ApiError> {
        let head_sha = job
            .head_sha()
            .ok_or_else(|| ApiError::Validation("Job has no commits".to_string()))?
            .clone();

        // Union of files changed across the pushed commits, oldest first,
        // deduplicated while preserving order.
        let mut commit_messages = Vec::with_capacity(job.commits.len());
        let mut changed_paths: Vec<String> = Vec::new();
        let mut seen_paths: HashSet<String> = HashSet::new();
        for sha in &job.commits {
            let info = self
                .retry
                .execute("get_commit", || self.host.get_commit(&job.repository, sha))
                .await?;
            commit_messages.push(info.message);
            for path in info.files {
                if seen_paths.insert(path.clone()) {
                    changed_paths.push(path);
                }
            }
        }

        // All fetches happen at the head SHA, so a plain path-keyed cache is
        // enough to fetch each file at most once per job.
        let mut cache: HashMap<String, Option<ContextFile>> = HashMap::new();

        let mut changed_files = Vec::with_capacity(changed_paths.len());
        for path in &changed_paths {
            if let Some(file) = self.fetch_cached(job, &head_sha, path, &mut cache).await? {
                changed_files.push(file);
            } else {
                // Deleted by the push; nothing to analyze.
                debug!(%path, "changed file absent at head, skipping");
            }
        }

        let imported_files = self
            .import_closure(job, &head_sha, &changed_files, &seen_paths, &mut cache)
            .await?;

        info!(
            job_id = %job.id,
            changed = changed_files.len(),
            imported = imported_files.len(),
            head = head_sha.short(),
            "analysis context ready"
        );

        Ok(AnalysisContext {
            repository: job.repository.clone(),
            head_sha,
            branch: job.branch.clone(),
            commit_messages,
            changed_files,
            imported_files,
        })
    }

    /// Breadth-first walk of import declarations, bounded at depth 2.
    async fn import_closure(
        &self,
        job: &Job,
        head_sha: &CommitSha,
        changed_files: &[ContextFile],
        changed_paths: &HashSet<String>,
        cache: &mut HashMap<String, Option<ContextFile>>,
    ) -> Result<Vec<ContextFile>, ApiError> {
        let mut queue: VecDeque<(String, String, u32)> = VecDeque::new();
        let mut visited: HashSet<String> = changed_paths.clone();

        for file in changed_files {
            if let ContextFile::Text { path, content } = file {
                for candidates in scan_imports(path, content) {
                    for candidate in candidates {
                        queue.push_back((path.clone(), candidate, 1));
                    }
                }
            }
        }

        let mut imported = Vec::new();
        while let Some((importer, candidate, depth)) = queue.pop_front() {
            if depth > MAX_IMPORT_DEPTH || !visited.insert(candidate.clone()) {
                continue;
            }

            let Some(file) = self.fetch_cached(job, head_sha, &candidate, cache).await? else {
                // Candidate path does not exist at this commit; the sibling
                // candidate for the same declaration may.
                continue;
            };

            debug!(%importer, path = %candidate, depth, "resolved import");

            if let ContextFile::Text { path, content } = &file {
                if depth < MAX_IMPORT_DEPTH {
                    for candidates in scan_imports(path, content) {
                        for next in candidates {
                            queue.push_back((path.clone(), next, depth + 1));
                        }
                    }
                }
            }
            imported.push(file);
        }

        Ok(imported)
    }

    async fn fetch_cached(
        &self,
        job: &Job,
        sha: &CommitSha,
        path: &str,
        cache: &mut HashMap<String, Option<ContextFile>>,
    ) -> Result<Option<ContextFile>, ApiError> {
        if let Some(cached) = cache.get(path) {
            return Ok(cached.clone());
        }

        let bytes = self
            .retry
            .execute("get_file_at", || {
                self.host.get_file_at(&job.repository, path, sha)
            })
            .await?;

        let file = bytes.map(|bytes| {
            if is_probably_binary(path, &bytes) {
                ContextFile::Binary {
                    path: path.to_string(),
                }
            } else {
                match String::from_utf8(bytes) {
                    Ok(content) => ContextFile::Text {
                        path: path.to_string(),
                        content,
                    },
                    Err(_) => {
                        warn!(%path, "file is not valid UTF-8, treating as binary");
                        ContextFile::Binary {
                            path: path.to_string(),
                        }
                    }
                }
            }
        });

        cache.insert(path.to_string(), file.clone());
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use codepolice_core::issue::RepositoryId;

    fn job_with_commits(shas: &[&str]) -> Job {
        Job::new(
            RepositoryId::new("acme", "widgets"),
            shas.iter().map(|s| CommitSha::from(*s)).collect(),
            "main".into(),
            "owner@example.com".into(),
        )
    }

    #[tokio::test]
    async fn test_changed_files_fetched_at_head() {
        let host = FakeHost::new("abc1234");
        host.add_commit("abc1234", "fix bug", &["src/app.py"]);
        host.add_file("src/app.py", "print('hello')\n");

        let retry = RetryExecutor::default();
        let monitor = RepositoryMonitor::new(&host, &retry);
        let job = job_with_commits(&["abc1234"]);

        let context = monitor.fetch_context(&job).await.unwrap();
        assert_eq!(context.changed_files.len(), 1);
        assert_eq!(context.changed_files[0].path(), "src/app.py");
        assert_eq!(context.commit_messages, vec!["fix bug".to_string()]);
    }

    #[tokio::test]
    async fn test_import_closure_depth_two() {
        let host = FakeHost::new("abc1234");
        host.add_commit("abc1234", "update", &["app.py"]);
        host.add_file("app.py", "import helpers\n");
        host.add_file("helpers.py", "import util\n");
        // Depth 3: reachable only through two hops, must not be fetched.
        host.add_file("util.py", "import deep\n");
        host.add_file("deep.py", "x = 1\n");

        let retry = RetryExecutor::default();
        let monitor = RepositoryMonitor::new(&host, &retry);
        let job = job_with_commits(&["abc1234"]);

        let context = monitor.fetch_context(&job).await.unwrap();
        let imported: Vec<&str> = context.imported_files.iter().map(|f| f.path()).collect();
        assert!(imported.contains(&"helpers.py"));
        assert!(imported.contains(&"util.py"));
        assert!(!imported.contains(&"deep.py"));
    }

    #[tokio::test]
    async fn test_binary_file_listed_without_content() {
        let host = FakeHost::new("abc1234");
        host.add_commit("abc1234", "assets", &["logo.png", "app.py"]);
        host.add_binary_file("logo.png", &[0x89, 0x50, 0x4e, 0x47]);
        host.add_file("app.py", "x = 1\n");

        let retry = RetryExecutor::default();
        let monitor = RepositoryMonitor::new(&host, &retry);
        let job = job_with_commits(&["abc1234"]);

        let context = monitor.fetch_context(&job).await.unwrap();
        assert!(matches!(
            &context.changed_files[0],
            ContextFile::Binary { path } if path == "logo.png"
        ));
    }

    #[tokio::test]
    async fn test_unresolvable_import_is_skipped() {
        let host = FakeHost::new("abc1234");
        host.add_commit("abc1234", "update", &["app.py"]);
        host.add_file("app.py", "import missing_module\n");

        let retry = RetryExecutor::default();
        let monitor = RepositoryMonitor::new(&host, &retry);
        let job = job_with_commits(&["abc1234"]);

        let context = monitor.fetch_context(&job).await.unwrap();
        assert!(context.imported_files.is_empty());
    }

    #[tokio::test]
    async fn test_each_file_fetched_once() {
        let host = FakeHost::new("abc1234");
        host.add_commit("abc1234", "update", &["a.py", "b.py"]);
        // Both changed files import the same helper.
        host.add_file("a.py", "import shared\n");
        host.add_file("b.py", "import shared\n");
        host.add_file("shared.py", "x = 1\n");

        let retry = RetryExecutor::default();
        let monitor = RepositoryMonitor::new(&host, &retry);
        let job = job_with_commits(&["abc1234"]);

        let context = monitor.fetch_context(&job).await.unwrap();
        assert_eq!(
            context
                .imported_files
                .iter()
                .filter(|f| f.path() == "shared.py")
                .count(),
            1
        );
        assert_eq!(host.fetch_count("shared.py"), 1);
    }

    #[tokio::test]
    async fn test_job_without_commits_is_a_validation_error() {
        let host = FakeHost::new("abc1234");
        let retry = RetryExecutor::default();
        let monitor = RepositoryMonitor::new(&host, &retry);
        let job = job_with_commits(&[]);

        let result = monitor.fetch_context(&job).await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
    }
}
