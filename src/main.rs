mod advisor;
mod config;
mod demo;
mod gemini;
mod models;
mod pdf;
mod prompts;
mod routes;
mod service;
mod workflow;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{fmt, EnvFilter};

use crate::advisor::Advisor;
use crate::config::Config;
use crate::demo::DemoService;
use crate::gemini::GeminiClient;
use crate::pdf::BriefFont;
use crate::routes::{router, AppState};
use crate::service::GenerationService;
use crate::workflow::WorkflowController;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = Config::from_env();
    let service: Arc<dyn GenerationService> = match &config.api_key {
        Some(key) => {
            tracing::info!("Using API key: {}...", key.chars().take(10).collect::<String>());
            Arc::new(GeminiClient::new(key.clone(), &config)?)
        }
        None => {
            tracing::warn!("⚠️ No GEMINI_API_KEY set, running in demo mode with placeholder output");
            Arc::new(DemoService)
        }
    };

    let workflow = Arc::new(WorkflowController::new(service.clone(), config.default_language));
    let mut events = workflow.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(?event, "workflow event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("⚠️ Event log lagged, {} events skipped", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let advisor = Arc::new(Advisor::with_limits(service, config.advisor_idle_timeout, config.advisor_max_sessions));
    let sweeper = advisor.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            let expired = sweeper.expire_idle(chrono::Utc::now());
            if expired > 0 {
                tracing::debug!(expired, "advisory sessions swept");
            }
        }
    });

    let brief_font = BriefFont::discover(config.pdf_font_path.as_deref());
    let state = AppState { workflow, advisor, brief_font };
    let app = router(state, config.max_upload_bytes).layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, language = %config.default_language, demo = config.demo_mode(), max_upload_bytes = config.max_upload_bytes, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
