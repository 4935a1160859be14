use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

const DEFAULT_PERSONA: &str =
    "You are a cat-shaped robot. Your favorite food is dorayaki. Stay friendly and concise.";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub tool_servers: BTreeMap<String, ToolServerConfig>,
    pub slack: SlackConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub sessions: SessionConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Launch parameters for one stdio tool server, as written under `mcpServers`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default, alias = "timeout_secs")]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct SlackConfig {
    pub app_token: SecretString,
    pub bot_token: SecretString,
    pub admin_user_id: String,
    pub api_base_url: String,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub azure: AzureOpenAiConfig,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug, Default)]
pub struct AzureOpenAiConfig {
    pub endpoint: Option<String>,
    pub api_version: Option<String>,
    pub deployment: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub name: String,
    pub max_turns: u32,
    pub max_history: usize,
    pub persona: String,
    pub reply_mode: ReplyMode,
    pub tool_server_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub mode: StoreMode,
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
    pub sync_interval_hours: u64,
    pub copy_program: String,
    pub blob: BlobConfig,
}

impl StoreConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_hours.saturating_mul(3600))
    }
}

#[derive(Clone, Debug, Default)]
pub struct BlobConfig {
    pub account_name: Option<String>,
    pub container: Option<String>,
    pub blob_name: Option<String>,
    pub url: Option<String>,
    pub sas_token: Option<SecretString>,
}

impl BlobConfig {
    /// Blob URL without the SAS query, or `None` when neither an explicit URL
    /// nor an account/container pair is configured.
    pub fn remote_url(&self, db_path: &Path) -> Option<String> {
        if let Some(url) = &self.url {
            return Some(url.trim_end_matches('?').to_string());
        }

        let account = self.account_name.as_deref()?;
        let container = self.container.as_deref()?;
        let blob_name = self.blob_name.clone().or_else(|| {
            db_path.file_name().map(|name| name.to_string_lossy().into_owned())
        })?;

        Some(format!("https://{account}.blob.core.windows.net/{container}/{blob_name}"))
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub dir: PathBuf,
}

impl LoggingConfig {
    pub fn app_log_path(&self) -> PathBuf {
        self.dir.join("app.log")
    }

    pub fn stdout_log_path(&self) -> PathBuf {
        self.dir.join("stdout.log")
    }

    pub fn stderr_log_path(&self) -> PathBuf {
        self.dir.join("stderr.log")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Azure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    Local,
    AzureBlob,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    Ack,
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub store_mode: Option<StoreMode>,
    pub store_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub slack_app_token: Option<String>,
    pub slack_bot_token: Option<String>,
    pub port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: serde_json::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid value for `{key}`: `{value}`")]
    InvalidValue { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Raw shape of the JSON configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, ToolServerConfig>,
    #[serde(default)]
    pub env: BTreeMap<String, Value>,
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "azure" => Ok(Self::Azure),
            other => Err(ConfigError::Validation(format!(
                "unsupported LLM_PROVIDER `{other}` (expected openai|azure)"
            ))),
        }
    }
}

impl std::str::FromStr for StoreMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "azure_blob" => Ok(Self::AzureBlob),
            other => Err(ConfigError::Validation(format!(
                "DB_TYPE must be either 'azure_blob' or 'local': `{other}`"
            ))),
        }
    }
}

impl std::str::FromStr for ReplyMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ack" => Ok(Self::Ack),
            "full" => Ok(Self::Full),
            other => Err(ConfigError::Validation(format!(
                "unsupported AGENT_REPLY_MODE `{other}` (expected ack|full)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported LOG_FORMAT `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

/// Layered view over the file's `env` table and a higher-priority lookup
/// (the process environment in production).
struct EnvSource<'a, F> {
    file: &'a BTreeMap<String, Value>,
    lookup: F,
}

impl<F> EnvSource<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .or_else(|| self.file.get(key).and_then(value_to_string))
            .filter(|value| !value.trim().is_empty())
    }

    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(value) => value
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value }),
            None => Ok(default),
        }
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        other => Some(other.to_string()),
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let explicit = options.config_path.clone().or_else(|| read_env(CONFIG_PATH_ENV).map(PathBuf::from));
        let file = match explicit {
            Some(path) if path.exists() => read_config_file(&path)?,
            Some(path) => return Err(ConfigError::MissingConfigFile(path)),
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    read_config_file(&default_path)?
                } else if options.require_file {
                    return Err(ConfigError::MissingConfigFile(default_path));
                } else {
                    ConfigFile::default()
                }
            }
        };

        Self::from_sources(file, read_env, options.overrides)
    }

    /// Builds the configuration from a parsed file, an environment lookup that
    /// takes precedence over the file's `env` table, and explicit overrides.
    pub fn from_sources<F>(
        file: ConfigFile,
        lookup: F,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = EnvSource { file: &file.env, lookup };

        let slack = SlackConfig {
            app_token: secret_value(source.get_or("SLACK_APP_TOKEN", "")),
            bot_token: secret_value(source.get_or("SLACK_BOT_TOKEN", "")),
            admin_user_id: source.get_or("SLACK_USER_ID", ""),
            api_base_url: source.get_or("SLACK_API_BASE_URL", "https://slack.com/api"),
        };

        let provider = match source.get("LLM_PROVIDER") {
            Some(value) => value.parse()?,
            None => {
                return Err(ConfigError::Validation(
                    "LLM_PROVIDER is required (openai|azure)".to_string(),
                ))
            }
        };
        let api_key = match provider {
            LlmProvider::OpenAi => source.get("OPENAI_API_KEY"),
            LlmProvider::Azure => source.get("AZURE_OPENAI_API_KEY"),
        };
        let llm = LlmConfig {
            provider,
            model: source.get_or("LLM_MODEL", ""),
            api_key: api_key.map(secret_value),
            base_url: source.get_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            azure: AzureOpenAiConfig {
                endpoint: source.get("AZURE_OPENAI_ENDPOINT"),
                api_version: source.get("AZURE_OPENAI_API_VERSION"),
                deployment: source.get("AZURE_OPENAI_DEPLOYMENT"),
            },
            timeout_secs: source.parse("LLM_TIMEOUT_SECS", 120)?,
            max_retries: source.parse("LLM_MAX_RETRIES", 2)?,
        };

        let agent = AgentConfig {
            name: source.get_or("AGENT_NAME", "AI Assistant"),
            max_turns: source.parse("AGENT_MAX_TURNS", 15)?,
            max_history: source.parse("AGENT_MAX_HISTORY", 200)?,
            persona: source.get_or("AGENT_PERSONA", DEFAULT_PERSONA),
            reply_mode: source.parse("AGENT_REPLY_MODE", ReplyMode::Ack)?,
            tool_server_timeout_secs: source.parse("MCP_TIMEOUT_SECS", 60)?,
        };

        let sessions = SessionConfig {
            capacity: source.parse("SESSION_CAPACITY", 256)?,
            ttl_secs: source.parse("SESSION_TTL_SECS", 86_400)?,
        };

        let mode = match source.get("DB_TYPE") {
            Some(value) => value.parse()?,
            None => {
                return Err(ConfigError::Validation(
                    "DB_TYPE must be either 'azure_blob' or 'local'".to_string(),
                ))
            }
        };
        let store = StoreConfig {
            mode,
            path: PathBuf::from(source.get_or("SQLITE_DB_PATH", "./db/app.db")),
            busy_timeout_ms: source.parse("SQLITE_BUSY_TIMEOUT_MS", 5_000)?,
            sync_interval_hours: source.parse("SQLITE_CRON_INTERVAL_HOURS", 1)?,
            copy_program: source.get_or("AZCOPY_PATH", "azcopy"),
            blob: BlobConfig {
                account_name: source.get("AZURE_STORAGE_ACCOUNT_NAME"),
                container: source.get("AZURE_BLOB_CONTAINER"),
                blob_name: source.get("AZURE_BLOB_NAME"),
                url: source.get("AZURE_BLOB_URL"),
                sas_token: source.get("AZURE_BLOB_SAS_TOKEN").map(secret_value),
            },
        };

        let server = ServerConfig {
            bind_address: source.get_or("BIND_ADDRESS", "0.0.0.0"),
            port: source.parse("PORT", 8080)?,
        };

        let logging = LoggingConfig {
            level: source.get_or("LOG_LEVEL", "info"),
            format: source.parse("LOG_FORMAT", LogFormat::Compact)?,
            dir: PathBuf::from(source.get_or("LOG_DIR", "./log")),
        };

        let mut config = Self {
            tool_servers: file.mcp_servers,
            slack,
            llm,
            agent,
            sessions,
            store,
            server,
            logging,
        };
        config.apply_overrides(overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(store_mode) = overrides.store_mode {
            self.store.mode = store_mode;
        }
        if let Some(store_path) = overrides.store_path {
            self.store.path = store_path;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_dir) = overrides.log_dir {
            self.logging.dir = log_dir;
        }
        if let Some(slack_app_token) = overrides.slack_app_token {
            self.slack.app_token = secret_value(slack_app_token);
        }
        if let Some(slack_bot_token) = overrides.slack_bot_token {
            self.slack.bot_token = secret_value(slack_bot_token);
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_slack(&self.slack)?;
        validate_llm(&self.llm)?;
        validate_agent(&self.agent, &self.sessions)?;
        validate_store(&self.store)?;
        validate_tool_servers(&self.tool_servers)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    serde_json::from_str::<ConfigFile>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_slack(slack: &SlackConfig) -> Result<(), ConfigError> {
    let app_token = slack.app_token.expose_secret();
    if app_token.is_empty() {
        return Err(ConfigError::Validation(
            "SLACK_APP_TOKEN is required. Get it from https://api.slack.com/apps > Your App > Basic Information > App-Level Tokens".to_string()
        ));
    }
    if !app_token.starts_with("xapp-") {
        let hint = if app_token.starts_with("xoxb-") {
            " (hint: you may have used the bot token instead of the app token)"
        } else {
            ""
        };
        return Err(ConfigError::Validation(format!(
            "SLACK_APP_TOKEN must start with `xapp-`{hint}"
        )));
    }

    let bot_token = slack.bot_token.expose_secret();
    if bot_token.is_empty() {
        return Err(ConfigError::Validation(
            "SLACK_BOT_TOKEN is required. Get it from https://api.slack.com/apps > Your App > OAuth & Permissions > Bot User OAuth Token".to_string()
        ));
    }
    if !bot_token.starts_with("xoxb-") {
        let hint = if bot_token.starts_with("xapp-") {
            " (hint: you may have used the app token instead of the bot token)"
        } else {
            ""
        };
        return Err(ConfigError::Validation(format!(
            "SLACK_BOT_TOKEN must start with `xoxb-`{hint}"
        )));
    }

    if slack.admin_user_id.trim().is_empty() {
        return Err(ConfigError::Validation("SLACK_USER_ID is required".to_string()));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "LLM_TIMEOUT_SECS must be in range 1..=600".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("LLM_MODEL is required".to_string()));
    }

    let missing_key =
        llm.api_key.as_ref().map(|value| value.expose_secret().trim().is_empty()).unwrap_or(true);

    match llm.provider {
        LlmProvider::OpenAi => {
            if missing_key {
                return Err(ConfigError::Validation("OPENAI_API_KEY is not set".to_string()));
            }
        }
        LlmProvider::Azure => {
            if missing_key {
                return Err(ConfigError::Validation("AZURE_OPENAI_API_KEY is not set".to_string()));
            }
            let required = [
                ("AZURE_OPENAI_API_VERSION", &llm.azure.api_version),
                ("AZURE_OPENAI_ENDPOINT", &llm.azure.endpoint),
                ("AZURE_OPENAI_DEPLOYMENT", &llm.azure.deployment),
            ];
            for (key, value) in required {
                if value.is_none() {
                    return Err(ConfigError::Validation(format!("{key} is not set")));
                }
            }
        }
    }

    Ok(())
}

fn validate_agent(agent: &AgentConfig, sessions: &SessionConfig) -> Result<(), ConfigError> {
    if agent.max_turns == 0 {
        return Err(ConfigError::Validation(
            "AGENT_MAX_TURNS must be greater than zero".to_string(),
        ));
    }
    if agent.tool_server_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "MCP_TIMEOUT_SECS must be greater than zero".to_string(),
        ));
    }
    if sessions.capacity == 0 {
        return Err(ConfigError::Validation(
            "SESSION_CAPACITY must be greater than zero".to_string(),
        ));
    }
    if sessions.ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "SESSION_TTL_SECS must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_store(store: &StoreConfig) -> Result<(), ConfigError> {
    if store.path.as_os_str().is_empty() {
        return Err(ConfigError::Validation("SQLITE_DB_PATH must not be empty".to_string()));
    }

    if store.mode == StoreMode::AzureBlob {
        if store.blob.remote_url(&store.path).is_none() {
            return Err(ConfigError::Validation(
                "DB_TYPE=azure_blob requires AZURE_BLOB_URL or AZURE_STORAGE_ACCOUNT_NAME and AZURE_BLOB_CONTAINER"
                    .to_string(),
            ));
        }
        if store.sync_interval_hours == 0 {
            return Err(ConfigError::Validation(
                "SQLITE_CRON_INTERVAL_HOURS must be greater than zero".to_string(),
            ));
        }
        if store.copy_program.trim().is_empty() {
            return Err(ConfigError::Validation("AZCOPY_PATH must not be empty".to_string()));
        }
    }

    Ok(())
}

fn validate_tool_servers(
    servers: &BTreeMap<String, ToolServerConfig>,
) -> Result<(), ConfigError> {
    for (name, server) in servers {
        if server.command.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "mcpServers.{name}.command must not be empty"
            )));
        }
        if server.timeout_secs == Some(0) {
            return Err(ConfigError::Validation(format!(
                "mcpServers.{name}.timeoutSecs must be greater than zero"
            )));
        }
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("PORT must be greater than zero".to_string()));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "LOG_LEVEL must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}
