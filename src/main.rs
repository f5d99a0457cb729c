//! Support Chatbot Core — Binary Entrypoint
//! Boots the Axum HTTP server around the chat service container.
//!
//! See `README.md` for quickstart and configuration.

use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use edu_support_bot::config::ChatConfig;
use edu_support_bot::container::ServiceContainer;
use edu_support_bot::{api, llm};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("edu_support_bot=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = ChatConfig::load()?;
    let container = Arc::new(
        ServiceContainer::builder(cfg)
            .llm(llm::build_llm_client())
            .build()?,
    );
    let router = api::create_router(container.clone());

    let addr = std::env::var("CHAT_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "support chatbot listening");

    axum::serve(listener, router).await?;
    container.shutdown();
    Ok(())
}
