//! # Confab Gateway
//!
//! Real-time conversational messaging server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! confab
//!
//! # Run with environment variables
//! CONFAB_PORT=8080 CONFAB_HOST=0.0.0.0 confab
//! ```
//!
//! Configuration is read from `confab.toml` (working directory,
//! `/etc/confab/`, or `~/.config/confab/`) when present.

mod config;
mod handlers;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use confab_service::{ChatService, HttpAssistant, StaticAuthenticator};
use confab_store::ConversationStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confab=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Confab gateway on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Persistence
    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    let store = ConversationStore::new(pool);
    store.migrate().await?;

    // Collaborators
    let assistant = Arc::new(HttpAssistant::new(
        config.assistant.endpoint.clone(),
        Duration::from_millis(config.assistant.timeout_ms),
    ));
    let chat =
        ChatService::new(store, assistant).with_history_window(config.assistant.history_window);

    let mut authenticator = StaticAuthenticator::new();
    for entry in &config.auth.tokens {
        authenticator =
            authenticator.with_token(entry.token.clone(), entry.user_id, entry.display_name.clone());
    }

    // Start the gateway
    let state = Arc::new(handlers::AppState::new(config, chat, Arc::new(authenticator)));
    handlers::run_server(state).await?;

    Ok(())
}
