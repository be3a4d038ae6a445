use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use codepolice_server::config::Config;
use codepolice_server::email::SmtpEmailer;
use codepolice_server::github::GitHubClient;
use codepolice_server::llm::OpenAiClient;
use codepolice_server::pipeline::orchestrator::Orchestrator;
use codepolice_server::store::Store;
use codepolice_server::{webhook, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting code-police server");

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("Failed to create state directory {:?}", config.state_dir))?;

    let db_path = config.db_path();
    info!("Using state database: {}", db_path.display());
    let store = Store::new(&db_path).context("Failed to initialize SQLite database")?;

    let github_client = GitHubClient::new(
        config.github_token.clone(),
        config.github_api_base.clone(),
        config.request_timeout,
    )
    .map_err(|e| anyhow::anyhow!("Failed to build GitHub client: {e}"))?;

    let llm_client = OpenAiClient::new(
        config.llm_api_key.clone(),
        config.llm_api_base.clone(),
        config.llm_model.clone(),
        config.request_timeout,
    )
    .map_err(|e| anyhow::anyhow!("Failed to build LLM client: {e}"))?;

    let emailer = match &config.email {
        Some(email_config) => {
            info!("Email delivery enabled via {}", email_config.smtp_host);
            Some(Arc::new(SmtpEmailer::new(email_config.clone()))
                as Arc<dyn codepolice_server::email::EmailService>)
        }
        None => {
            info!("No SMTP host configured, email delivery disabled");
            None
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Arc::new(github_client),
        Arc::new(llm_client),
        emailer,
        config.token_budget,
        config.job_retry_budget,
    ));

    let poll_interval = config.poll_interval;
    tokio::spawn(async move {
        orchestrator.worker_loop(poll_interval).await;
    });

    let port = config.port;
    let app_state = Arc::new(AppState { config, store });
    let app = webhook::router(app_state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Server listening on port {port}");

    axum::serve(listener, app).await?;

    Ok(())
}
