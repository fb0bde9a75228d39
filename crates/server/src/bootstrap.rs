use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use taskpilot_agent::limiter::RateLimiter;
use taskpilot_agent::llm::OpenAiChat;
use taskpilot_agent::orchestrator::Orchestrator;
use taskpilot_agent::resolver::{HeuristicResolver, IntentResolver, LlmResolver};
use taskpilot_core::config::{AppConfig, ConfigError, LlmProvider, LoadOptions};
use taskpilot_core::store::ConversationStore;
use taskpilot_db::{connect, migrations, DbPool, SqlConversationStore, SqlTaskCapability};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub store: Arc<dyn ConversationStore>,
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("language model client setup failed: {0}")]
    Llm(String),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool =
        connect(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let store: Arc<dyn ConversationStore> = Arc::new(SqlConversationStore::new(db_pool.clone()));
    let tasks = Arc::new(SqlTaskCapability::new(db_pool.clone()));

    let resolver: Arc<dyn IntentResolver> = match config.llm.provider {
        LlmProvider::Heuristic => Arc::new(HeuristicResolver::new()),
        LlmProvider::OpenAi | LlmProvider::Ollama => {
            let chat = OpenAiChat::from_config(&config.llm)
                .map_err(|e| BootstrapError::Llm(e.to_string()))?;
            Arc::new(LlmResolver::new(chat))
        }
    };
    info!(
        event_name = "system.bootstrap.resolver_ready",
        provider = ?config.llm.provider,
        "intent resolver configured"
    );

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        tasks,
        resolver,
        RateLimiter::from_config(&config.limits),
        Duration::from_secs(config.limits.tool_timeout_secs),
    ));

    Ok(Application { config, db_pool, store, orchestrator })
}

#[cfg(test)]
mod tests {
    use taskpilot_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap;

    fn memory_options(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_wires_the_orchestrator() {
        let app = bootstrap(memory_options("sqlite::memory:?cache=shared"))
            .await
            .expect("bootstrap should succeed against an in-memory database");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('conversation', 'message', 'task')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema tables should exist after bootstrap");
        assert_eq!(table_count, 3);

        app.db_pool.close().await;
    }
}
