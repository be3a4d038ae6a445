//! Server configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::email::EmailConfig;

const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";
const DEFAULT_LLM_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_MODEL: &str = "gpt-4o";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_JOB_RETRY_BUDGET: u32 = 3;
const DEFAULT_TOKEN_BUDGET: usize = 60_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_FROM_ADDRESS: &str = "code-police@localhost";

/// Runtime configuration for the server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the HTTP server.
    pub port: u16,
    /// Directory for the SQLite database.
    pub state_dir: PathBuf,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
    /// Token for source host API access.
    pub github_token: String,
    /// Source host API base URL (overridable for self-hosted instances).
    pub github_api_base: String,
    /// LLM API key.
    pub llm_api_key: String,
    /// LLM API base URL.
    pub llm_api_base: String,
    /// Model used for analysis and fix generation.
    pub llm_model: String,
    /// How many times a job is re-enqueued after a stage failure before it
    /// is marked Failed.
    pub job_retry_budget: u32,
    /// Approximate token budget per analysis chunk.
    pub token_budget: usize,
    /// Per-request timeout for outbound HTTP.
    pub request_timeout: Duration,
    /// How often the worker polls for pending jobs.
    pub poll_interval: Duration,
    /// Fallback recipient when a push carries no usable owner address.
    pub fallback_email: Option<String>,
    /// SMTP settings; `None` disables email delivery.
    pub email: Option<EmailConfig>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required: `WEBHOOK_SECRET`, `GITHUB_TOKEN`, `LLM_API_KEY`,
    /// `STATE_DIR`. Everything else has a default. SMTP delivery is enabled
    /// only when `SMTP_HOST` is set.
    pub fn from_env() -> Result<Self> {
        let webhook_secret = std::env::var("WEBHOOK_SECRET")
            .context("WEBHOOK_SECRET environment variable is required")?;
        let github_token = std::env::var("GITHUB_TOKEN")
            .context("GITHUB_TOKEN environment variable is required")?;
        let llm_api_key =
            std::env::var("LLM_API_KEY").context("LLM_API_KEY environment variable is required")?;
        let state_dir: PathBuf = std::env::var("STATE_DIR")
            .context("STATE_DIR environment variable is required")?
            .into();

        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("Invalid PORT value: {raw}"))?,
            Err(_) => DEFAULT_PORT,
        };

        Ok(Self {
            port,
            state_dir,
            webhook_secret,
            github_token,
            github_api_base: std::env::var("GITHUB_API_BASE")
                .unwrap_or_else(|_| DEFAULT_GITHUB_API_BASE.to_string()),
            llm_api_key,
            llm_api_base: std::env::var("LLM_API_BASE")
                .unwrap_or_else(|_| DEFAULT_LLM_API_BASE.to_string()),
            llm_model: std::env::var("LLM_MODEL")
                .unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string()),
            job_retry_budget: env_parse("JOB_RETRY_BUDGET", DEFAULT_JOB_RETRY_BUDGET)?,
            token_budget: env_parse("TOKEN_BUDGET", DEFAULT_TOKEN_BUDGET)?,
            request_timeout: Duration::from_secs(env_parse(
                "REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
            poll_interval: Duration::from_secs(env_parse(
                "POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            )?),
            fallback_email: std::env::var("FALLBACK_EMAIL").ok(),
            email: email_from_env(),
        })
    }

    /// Path to the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("codepolice.db")
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {name} value {raw}: {e}")),
        Err(_) => Ok(default),
    }
}

/// SMTP settings, present only when `SMTP_HOST` is set.
fn email_from_env() -> Option<EmailConfig> {
    let smtp_host = std::env::var("SMTP_HOST").ok()?;
    Some(EmailConfig {
        smtp_host,
        smtp_port: std::env::var("SMTP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_SMTP_PORT),
        from_address: std::env::var("SMTP_FROM")
            .unwrap_or_else(|_| DEFAULT_FROM_ADDRESS.to_string()),
        smtp_user: std::env::var("SMTP_USER").ok(),
        smtp_password: std::env::var("SMTP_PASSWORD").ok(),
    })
}
