use std::sync::Arc;

use mentionbot_agent::{McpStdioConnector, OpenAiChatClient};
use mentionbot_core::config::AppConfig;
use mentionbot_core::DataStore;
use mentionbot_db::{StoreFacade, SyncError};
use mentionbot_slack::{
    mention_dispatcher, ReconnectPolicy, SlackSocketTransport, SlackWebClient, SocketModeRunner,
    TransportError,
};
use thiserror::Error;
use tracing::info;

use crate::mention::AgentMentionService;

/// Everything the process needs, built once at startup.
pub struct Application {
    pub config: AppConfig,
    pub store: Arc<StoreFacade>,
    pub slack_runner: SocketModeRunner,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("store setup failed: {0}")]
    Store(#[from] SyncError),
    #[error("model client setup failed: {0}")]
    Llm(String),
    #[error("slack client setup failed: {0}")]
    Slack(#[from] TransportError),
}

pub fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        thread_id = "unknown",
        "starting application bootstrap"
    );

    let store = Arc::new(StoreFacade::from_config(&config.store)?);
    info!(
        event_name = "system.bootstrap.store_ready",
        correlation_id = "bootstrap",
        mode = ?store.mode(),
        path = %store.local_path().display(),
        "store facade configured"
    );

    let llm = OpenAiChatClient::from_config(&config.llm)
        .map_err(|error| BootstrapError::Llm(format!("{error:#}")))?;
    let mentions = AgentMentionService::new(
        &config,
        Arc::clone(&store) as Arc<dyn DataStore>,
        Arc::new(llm),
        Arc::new(McpStdioConnector::new()),
    );

    let slack_runner = SocketModeRunner::new(
        Arc::new(SlackSocketTransport::from_config(&config.slack)?),
        mention_dispatcher(mentions),
        Arc::new(SlackWebClient::from_config(&config.slack)?),
        ReconnectPolicy::default(),
    );
    info!(
        event_name = "system.bootstrap.slack_ready",
        correlation_id = "bootstrap",
        tool_servers = config.tool_servers.len(),
        "slack runner configured"
    );

    Ok(Application { config, store, slack_runner })
}

#[cfg(test)]
mod tests {
    use mentionbot_core::config::{ConfigFile, ConfigOverrides};
    use mentionbot_core::{AppConfig, StoreMode};
    use serde_json::json;

    use crate::bootstrap::bootstrap_with_config;

    fn config(db_type: &str, store_path: std::path::PathBuf) -> AppConfig {
        let file: ConfigFile = serde_json::from_value(json!({
            "env": {
                "SLACK_BOT_TOKEN": "xoxb-test",
                "SLACK_APP_TOKEN": "xapp-test",
                "SLACK_USER_ID": "UBOT",
                "LLM_PROVIDER": "azure",
                "LLM_MODEL": "gpt-4o",
                "AZURE_OPENAI_API_KEY": "azure-key",
                "AZURE_OPENAI_API_VERSION": "2024-08-01-preview",
                "AZURE_OPENAI_ENDPOINT": "https://example.openai.azure.com",
                "AZURE_OPENAI_DEPLOYMENT": "gpt-4o-prod",
                "DB_TYPE": db_type,
                "AZURE_BLOB_URL": "https://acct.blob.core.windows.net/db/app.db"
            }
        }))
        .expect("config file");
        AppConfig::from_sources(
            file,
            |_| None,
            ConfigOverrides { store_path: Some(store_path), ..ConfigOverrides::default() },
        )
        .expect("config")
    }

    #[test]
    fn local_mode_bootstraps_without_a_mirror() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = bootstrap_with_config(config("local", dir.path().join("app.db")))
            .expect("bootstrap should succeed");

        assert_eq!(app.store.mode(), StoreMode::Local);
        assert_eq!(app.store.local_path(), dir.path().join("app.db"));
    }

    #[test]
    fn blob_mode_bootstraps_with_a_mirror() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = bootstrap_with_config(config("azure_blob", dir.path().join("app.db")))
            .expect("bootstrap should succeed");

        assert_eq!(app.store.mode(), StoreMode::AzureBlob);
    }
}
