//! SQLite persistence layer for jobs, reports, and effect records.
//!
//! This module provides durable storage for the pipeline, enabling restart
//! safety. Jobs are stored with explicit relational columns rather than JSON
//! blobs for type safety and queryability; the jobs table doubles as the work
//! queue, with claims expressed as conditional updates on `status`.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema versions.
//! When the schema changes, increment `SCHEMA_VERSION` and add a migration
//! function in `run_migrations`.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use codepolice_core::issue::{
    AnalysisReport, CommitSha, Issue, IssueId, IssueType, Job, JobId, JobStatus, ReportId,
    RepositoryId, Severity,
};

/// Current schema version. Increment when making schema changes.
///
/// When adding a new version:
/// 1. Increment this constant
/// 2. Add a migration function `migrate_v{N}_to_v{N+1}`
/// 3. Call it from `run_migrations`
const SCHEMA_VERSION: i32 = 1;

/// A recorded side effect, keyed by `(job_id, effect_key)`.
///
/// The first writer wins: a second insert for the same key is a no-op and the
/// caller receives the winner's record, including its `result_ref` (branch
/// name, PR URL, report id) so resumed work can adopt the original outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectRecord {
    pub job_id: JobId,
    pub effect_key: String,
    pub completed_at: DateTime<Utc>,
    pub result_ref: Option<String>,
}

/// SQLite database for persisting pipeline state.
///
/// Uses a `Mutex<Connection>` because `rusqlite::Connection` is not `Sync`
/// (it cannot be shared between threads without synchronization). The Mutex
/// provides the required synchronization. Callers should wrap operations in
/// `tokio::task::spawn_blocking` for async compatibility.
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    /// Create a new SQLite database connection.
    ///
    /// Opens or creates the database file at the given path.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Initialize the database schema and run any pending migrations.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current_version > SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                current_version,
                SCHEMA_VERSION
            );
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    /// Run migrations from `from_version` up to `SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        // Migration v0 -> v1: Initial schema
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }

        // Future migrations go here:
        // if from_version < 2 {
        //     Self::migrate_v1_to_v2(conn)?;
        // }

        Ok(())
    }

    /// Migration v0 -> v1: Create initial schema.
    fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,

                repo_owner TEXT NOT NULL,
                repo_name TEXT NOT NULL,
                -- JSON array of commit SHAs, oldest first
                commits TEXT NOT NULL,
                branch TEXT NOT NULL,

                status TEXT NOT NULL CHECK(status IN (
                    'Pending', 'Fetching', 'Analyzing', 'Fixing', 'Publishing',
                    'Notifying', 'Completed', 'CompletedWithWarning', 'Failed'
                )),
                retry_count INTEGER NOT NULL DEFAULT 0,

                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,

                error_message TEXT,
                owner_email TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_pending
            ON jobs(created_at)
            WHERE status = 'Pending';

            CREATE TABLE IF NOT EXISTS reports (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id),

                repo_owner TEXT NOT NULL,
                repo_name TEXT NOT NULL,
                commit_sha TEXT NOT NULL,
                branch TEXT NOT NULL,
                timestamp TEXT NOT NULL,

                summary TEXT NOT NULL,
                -- JSON array of zero-based chunk indices that failed analysis
                failed_chunks TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_reports_history
            ON reports(repo_owner, repo_name, branch, timestamp);

            CREATE TABLE IF NOT EXISTS report_issues (
                report_id TEXT NOT NULL REFERENCES reports(id),
                issue_id INTEGER NOT NULL,

                severity TEXT NOT NULL CHECK(severity IN (
                    'low', 'medium', 'high', 'critical'
                )),
                issue_type TEXT NOT NULL CHECK(issue_type IN (
                    'bug', 'security', 'performance', 'style', 'maintainability'
                )),
                file TEXT NOT NULL,
                line INTEGER NOT NULL,
                col INTEGER,
                description TEXT NOT NULL,
                suggestion TEXT,
                fixable INTEGER NOT NULL,

                PRIMARY KEY (report_id, issue_id)
            );

            CREATE TABLE IF NOT EXISTS idempotency_records (
                job_id TEXT NOT NULL,
                effect_key TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                result_ref TEXT,

                PRIMARY KEY (job_id, effect_key)
            );
            "#,
        )
        .context("Failed to create initial schema (v0 -> v1)")?;

        Ok(())
    }

    // -- Jobs ---------------------------------------------------------------

    /// Insert a newly accepted job. Fails if the id already exists.
    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let commits = serde_json::to_string(&job.commits)?;
        conn.execute(
            r#"
            INSERT INTO jobs (
                id, repo_owner, repo_name, commits, branch, status, retry_count,
                created_at, started_at, completed_at, error_message, owner_email
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                job.id.to_string(),
                job.repository.owner,
                job.repository.name,
                commits,
                job.branch,
                job.status.as_str(),
                job.retry_count,
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
                job.error_message,
                job.owner_email,
            ],
        )
        .with_context(|| format!("Failed to insert job {}", job.id))?;

        Ok(())
    }

    /// Load a job by id.
    pub fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        conn.query_row(
            r#"
            SELECT id, repo_owner, repo_name, commits, branch, status, retry_count,
                   created_at, started_at, completed_at, error_message, owner_email
            FROM jobs WHERE id = ?1
            "#,
            params![id.to_string()],
            Self::row_to_job,
        )
        .optional()
        .with_context(|| format!("Failed to load job {id}"))
    }

    /// Claim the oldest pending job, atomically moving it to `Fetching`.
    ///
    /// The claim is a conditional update on `status = 'Pending'`: at-least-once
    /// queue delivery means two workers may race for the same row, and exactly
    /// one of them wins.
    pub fn claim_next_pending(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction()?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs WHERE status = 'Pending' ORDER BY created_at LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let updated = tx.execute(
            "UPDATE jobs SET status = 'Fetching', started_at = ?1
             WHERE id = ?2 AND status = 'Pending'",
            params![now.to_rfc3339(), id],
        )?;
        if updated == 0 {
            // Lost the race; caller polls again.
            return Ok(None);
        }

        let job = tx.query_row(
            r#"
            SELECT id, repo_owner, repo_name, commits, branch, status, retry_count,
                   created_at, started_at, completed_at, error_message, owner_email
            FROM jobs WHERE id = ?1
            "#,
            params![id],
            Self::row_to_job,
        )?;
        tx.commit()?;

        Ok(Some(job))
    }

    /// Re-queue every job left in an in-progress status by a dead worker.
    ///
    /// Run at startup, before the worker loop claims anything: a non-terminal,
    /// non-Pending row belongs to a worker from a previous process, so it goes
    /// back to the queue. The resumed run skips already-recorded effects, and
    /// the retry count is untouched because no stage actually failed.
    pub fn recover_in_progress(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let updated = conn.execute(
            "UPDATE jobs SET status = 'Pending'
             WHERE status IN ('Fetching', 'Analyzing', 'Fixing', 'Publishing', 'Notifying')",
            [],
        )?;

        Ok(updated)
    }

    /// Conditionally advance a job's status.
    ///
    /// The update only applies while the stored status is still `from`; a
    /// `false` return means another worker got there first and the caller
    /// must stop driving this job. Transitions are validated against the
    /// lifecycle before touching the database.
    pub fn transition_job(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        error_message: Option<&str>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(anyhow!(
                "Invalid job transition {} -> {} for job {id}",
                from.as_str(),
                to.as_str()
            ));
        }

        let conn = self.conn.lock().expect("mutex poisoned");
        let updated = conn.execute(
            "UPDATE jobs
             SET status = ?1, error_message = ?2, completed_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                to.as_str(),
                error_message,
                completed_at.map(|t| t.to_rfc3339()),
                id.to_string(),
                from.as_str(),
            ],
        )?;

        Ok(updated > 0)
    }

    /// Send a job back to the queue after a stage failure, bumping its retry
    /// count. Conditional on the status the caller last observed.
    pub fn requeue_job(&self, id: JobId, from: JobStatus, error_message: &str) -> Result<bool> {
        if !from.can_transition_to(JobStatus::Pending) {
            return Err(anyhow!(
                "Cannot requeue job {id} from status {}",
                from.as_str()
            ));
        }

        let conn = self.conn.lock().expect("mutex poisoned");
        let updated = conn.execute(
            "UPDATE jobs
             SET status = 'Pending', retry_count = retry_count + 1, error_message = ?1
             WHERE id = ?2 AND status = ?3",
            params![error_message, id.to_string(), from.as_str()],
        )?;

        Ok(updated > 0)
    }

    fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
        let id: String = row.get(0)?;
        let commits_json: String = row.get(3)?;
        let status: String = row.get(5)?;
        let created_at: String = row.get(7)?;
        let started_at: Option<String> = row.get(8)?;
        let completed_at: Option<String> = row.get(9)?;

        Ok(Job {
            id: JobId::parse(&id).map_err(|e| invalid_column(0, &e))?,
            repository: RepositoryId {
                owner: row.get(1)?,
                name: row.get(2)?,
            },
            commits: serde_json::from_str::<Vec<CommitSha>>(&commits_json)
                .map_err(|e| invalid_column(3, &e))?,
            branch: row.get(4)?,
            status: JobStatus::parse(&status)
                .ok_or_else(|| invalid_column(5, &format!("unknown status {status}")))?,
            retry_count: row.get(6)?,
            created_at: parse_timestamp(&created_at).map_err(|e| invalid_column(7, &e))?,
            started_at: started_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .map_err(|e| invalid_column(8, &e))?,
            completed_at: completed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .map_err(|e| invalid_column(9, &e))?,
            error_message: row.get(10)?,
            owner_email: row.get(11)?,
        })
    }

    // -- Reports ------------------------------------------------------------

    /// Persist a report and its issues in one transaction.
    pub fn insert_report(&self, job_id: JobId, report: &AnalysisReport) -> Result<()> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction()?;

        let failed_chunks = serde_json::to_string(&report.failed_chunks)?;
        tx.execute(
            r#"
            INSERT INTO reports (
                id, job_id, repo_owner, repo_name, commit_sha, branch,
                timestamp, summary, failed_chunks
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                report.id.to_string(),
                job_id.to_string(),
                report.repository.owner,
                report.repository.name,
                report.commit_sha.0,
                report.branch,
                report.timestamp.to_rfc3339(),
                report.summary,
                failed_chunks,
            ],
        )
        .with_context(|| format!("Failed to insert report {}", report.id))?;

        for issue in &report.issues {
            tx.execute(
                r#"
                INSERT INTO report_issues (
                    report_id, issue_id, severity, issue_type, file, line,
                    col, description, suggestion, fixable
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    report.id.to_string(),
                    issue.id.0,
                    issue.severity.as_str(),
                    issue.issue_type.as_str(),
                    issue.file,
                    issue.line,
                    issue.column,
                    issue.description,
                    issue.suggestion,
                    issue.fixable,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Load a report (with its issues) by id.
    pub fn get_report(&self, id: ReportId) -> Result<Option<AnalysisReport>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let header = conn
            .query_row(
                r#"
                SELECT id, repo_owner, repo_name, commit_sha, branch,
                       timestamp, summary, failed_chunks
                FROM reports WHERE id = ?1
                "#,
                params![id.to_string()],
                Self::row_to_report_header,
            )
            .optional()
            .with_context(|| format!("Failed to load report {id}"))?;

        let Some(mut report) = header else {
            return Ok(None);
        };
        report.issues = Self::load_issues(&conn, id)?;

        Ok(Some(report))
    }

    /// List reports for a branch, most recent first.
    pub fn list_reports(&self, repository: &RepositoryId, branch: &str) -> Result<Vec<AnalysisReport>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let mut stmt = conn.prepare(
            r#"
            SELECT id, repo_owner, repo_name, commit_sha, branch,
                   timestamp, summary, failed_chunks
            FROM reports
            WHERE repo_owner = ?1 AND repo_name = ?2 AND branch = ?3
            ORDER BY timestamp DESC
            "#,
        )?;
        let headers = stmt
            .query_map(
                params![repository.owner, repository.name, branch],
                Self::row_to_report_header,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut reports = Vec::with_capacity(headers.len());
        for mut report in headers {
            report.issues = Self::load_issues(&conn, report.id)?;
            reports.push(report);
        }

        Ok(reports)
    }

    fn row_to_report_header(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalysisReport> {
        let id: String = row.get(0)?;
        let timestamp: String = row.get(5)?;
        let failed_chunks: String = row.get(7)?;

        Ok(AnalysisReport {
            id: ReportId::parse(&id).map_err(|e| invalid_column(0, &e))?,
            repository: RepositoryId {
                owner: row.get(1)?,
                name: row.get(2)?,
            },
            commit_sha: CommitSha(row.get(3)?),
            branch: row.get(4)?,
            timestamp: parse_timestamp(&timestamp).map_err(|e| invalid_column(5, &e))?,
            issues: Vec::new(),
            summary: row.get(6)?,
            failed_chunks: serde_json::from_str(&failed_chunks)
                .map_err(|e| invalid_column(7, &e))?,
        })
    }

    fn load_issues(conn: &Connection, report_id: ReportId) -> rusqlite::Result<Vec<Issue>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT issue_id, severity, issue_type, file, line, col,
                   description, suggestion, fixable
            FROM report_issues WHERE report_id = ?1
            ORDER BY issue_id
            "#,
        )?;
        let issues = stmt
            .query_map(params![report_id.to_string()], |row| {
                let severity: String = row.get(1)?;
                let issue_type: String = row.get(2)?;
                Ok(Issue {
                    id: IssueId(row.get(0)?),
                    severity: Severity::parse(&severity)
                        .ok_or_else(|| invalid_column(1, &format!("unknown severity {severity}")))?,
                    issue_type: IssueType::parse(&issue_type).ok_or_else(|| {
                        invalid_column(2, &format!("unknown issue type {issue_type}"))
                    })?,
                    file: row.get(3)?,
                    line: row.get(4)?,
                    column: row.get(5)?,
                    description: row.get(6)?,
                    suggestion: row.get(7)?,
                    fixable: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>();
        issues
    }

    // -- Idempotency records ------------------------------------------------

    /// Record a completed effect, first writer wins.
    ///
    /// Returns the stored record: the caller's own on a fresh insert, or the
    /// earlier winner's if the key already existed. Callers adopt the
    /// returned `result_ref` rather than re-performing the effect.
    pub fn record_effect(
        &self,
        job_id: JobId,
        effect_key: &str,
        completed_at: DateTime<Utc>,
        result_ref: Option<&str>,
    ) -> Result<EffectRecord> {
        let conn = self.conn.lock().expect("mutex poisoned");

        conn.execute(
            "INSERT OR IGNORE INTO idempotency_records
             (job_id, effect_key, completed_at, result_ref)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                job_id.to_string(),
                effect_key,
                completed_at.to_rfc3339(),
                result_ref,
            ],
        )?;

        conn.query_row(
            "SELECT job_id, effect_key, completed_at, result_ref
             FROM idempotency_records WHERE job_id = ?1 AND effect_key = ?2",
            params![job_id.to_string(), effect_key],
            Self::row_to_effect,
        )
        .with_context(|| format!("Failed to read back effect {effect_key} for job {job_id}"))
    }

    /// Look up a previously recorded effect.
    pub fn get_effect(&self, job_id: JobId, effect_key: &str) -> Result<Option<EffectRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        conn.query_row(
            "SELECT job_id, effect_key, completed_at, result_ref
             FROM idempotency_records WHERE job_id = ?1 AND effect_key = ?2",
            params![job_id.to_string(), effect_key],
            Self::row_to_effect,
        )
        .optional()
        .with_context(|| format!("Failed to load effect {effect_key} for job {job_id}"))
    }

    fn row_to_effect(row: &rusqlite::Row<'_>) -> rusqlite::Result<EffectRecord> {
        let job_id: String = row.get(0)?;
        let completed_at: String = row.get(2)?;
        Ok(EffectRecord {
            job_id: JobId::parse(&job_id).map_err(|e| invalid_column(0, &e))?,
            effect_key: row.get(1)?,
            completed_at: parse_timestamp(&completed_at).map_err(|e| invalid_column(2, &e))?,
            result_ref: row.get(3)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid stored timestamp: {raw}"))?
        .with_timezone(&Utc))
}

fn invalid_column(index: usize, error: &dyn std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        error.to_string().into(),
    )
}
