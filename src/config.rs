use clap::Parser;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::util::redact::redact;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SafetyMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachKind {
    Mysql,
    Postgres,
}

/// An external server reached through DuckDB's scanner extensions.
#[derive(Deserialize, Serialize, Clone)]
pub struct AttachConfig {
    pub kind: AttachKind,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub alias: String,
}

impl std::fmt::Debug for AttachConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("name", &self.name)
            .field("alias", &self.alias)
            .finish()
    }
}

impl AttachConfig {
    /// Statements that load the extension and attach the server.
    pub fn to_attach_sql(&self, read_only: bool) -> String {
        let (extension, db_key) = match self.kind {
            AttachKind::Mysql => ("mysql", "database"),
            AttachKind::Postgres => ("postgres", "dbname"),
        };
        let options = if read_only {
            format!("TYPE {}, READ_ONLY", extension)
        } else {
            format!("TYPE {}", extension)
        };

        format!(
            "INSTALL {ext}; LOAD {ext}; ATTACH 'host={host} port={port} user={user} password={password} {db_key}={name}' AS \"{alias}\" ({options});",
            ext = extension,
            host = self.host,
            port = self.port,
            user = self.user,
            password = self.password.replace('\'', "''"),
            db_key = db_key,
            name = self.name,
            alias = self.alias,
            options = options,
        )
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub pool_size: usize,
    pub pool_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub include_views: bool,
    pub attach: Option<AttachConfig>,
}

impl DatabaseConfig {
    pub fn pool_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub backend: String, // "ollama" or "openai"
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub audit_log_path: Option<String>,
    pub summarize_results: bool,
    /// Stream SQL generation chunk by chunk (used by `--ask`)
    pub stream: bool,
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SafetyConfig {
    pub mode: SafetyMode,
    pub max_rows: usize,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HistoryConfig {
    pub max_turns: usize,
    pub max_prompt_chars: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionsConfig {
    pub max_sessions: usize,
    pub idle_timeout_secs: u64,
}

impl SessionsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DisplayConfig {
    pub preview_rows: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub safety: SafetyConfig,
    pub history: HistoryConfig,
    pub sessions: SessionsConfig,
    pub display: DisplayConfig,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Database file to query (":memory:" for an empty in-memory database)
    #[arg(long)]
    pub database: Option<String>,

    /// Allow data-modifying statements (each still needs confirmation)
    #[arg(long)]
    pub read_write: bool,

    /// Answer a single question on stdout instead of starting the server
    #[arg(long, value_name = "QUESTION")]
    pub ask: Option<String>,

    /// With --ask, print the model's answer to stderr while it is generated
    #[arg(long)]
    pub stream: bool,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigurationError> {
        // Start with default configuration
        let mut config_builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/querybot/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // QUERYBOT__LLM__MODEL=... style overrides
        config_builder = config_builder.add_source(
            Environment::with_prefix("QUERYBOT")
                .prefix_separator("__")
                .separator("__"),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(database) = &args.database {
            config.database.connection_string = database.clone();
        }
        if args.read_write {
            config.safety.mode = SafetyMode::ReadWrite;
        }
        if args.stream {
            config.llm.stream = true;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.database.connection_string.trim().is_empty() {
            return Err(ConfigurationError::Invalid(
                "database.connection_string must not be empty".to_string(),
            ));
        }
        if self.database.pool_size == 0 {
            return Err(ConfigurationError::Invalid(
                "database.pool_size must be at least 1".to_string(),
            ));
        }
        if self.database.query_timeout_secs == 0 || self.llm.timeout_secs == 0 {
            return Err(ConfigurationError::Invalid(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if let Some(attach) = &self.database.attach {
            if attach.alias.trim().is_empty() || attach.alias.contains('"') {
                return Err(ConfigurationError::Invalid(format!(
                    "database.attach.alias '{}' is not a valid identifier",
                    attach.alias
                )));
            }
        }
        if !matches!(self.llm.backend.as_str(), "ollama" | "openai") {
            return Err(ConfigurationError::Invalid(format!(
                "Unsupported LLM backend: {}",
                self.llm.backend
            )));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ConfigurationError::Invalid("llm.model must not be empty".to_string()));
        }
        if let Some(url) = &self.llm.api_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigurationError::Invalid(format!(
                    "llm.api_url must be an http(s) URL, got {}",
                    redact(url)
                )));
            }
        }
        if self.llm.max_retries > 2 {
            return Err(ConfigurationError::Invalid(
                "llm.max_retries may be at most 2".to_string(),
            ));
        }
        if self.safety.max_rows == 0 || self.safety.max_payload_bytes == 0 {
            return Err(ConfigurationError::Invalid(
                "safety.max_rows and safety.max_payload_bytes must be greater than zero".to_string(),
            ));
        }
        if self.history.max_turns == 0 {
            return Err(ConfigurationError::Invalid(
                "history.max_turns must be at least 1".to_string(),
            ));
        }
        if self.sessions.max_sessions == 0 || self.sessions.idle_timeout_secs == 0 {
            return Err(ConfigurationError::Invalid(
                "sessions.max_sessions and sessions.idle_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.display.preview_rows == 0 {
            return Err(ConfigurationError::Invalid(
                "display.preview_rows must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// Default implementation
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                connection_string: "querybot.duckdb".to_string(),
                pool_size: 5,
                pool_timeout_secs: 10,
                query_timeout_secs: 30,
                include_views: true,
                attach: None,
            },
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            llm: LlmConfig {
                backend: "ollama".to_string(),
                model: "sqlcoder".to_string(),
                api_key: None,
                api_url: None,
                temperature: 0.1,
                timeout_secs: 60,
                max_retries: 1,
                retry_backoff_ms: 500,
                audit_log_path: Some("logs/llm_audit.jsonl".to_string()),
                summarize_results: false,
                stream: false,
            },
            safety: SafetyConfig {
                mode: SafetyMode::ReadOnly,
                max_rows: 1000,
                max_payload_bytes: 4 * 1024 * 1024,
            },
            history: HistoryConfig {
                max_turns: 10,
                max_prompt_chars: 24_000,
            },
            sessions: SessionsConfig {
                max_sessions: 1000,
                idle_timeout_secs: 3600,
            },
            display: DisplayConfig { preview_rows: 100 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
        assert_eq!(AppConfig::default().safety.mode, SafetyMode::ReadOnly);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let mut config = AppConfig::default();
        config.llm.backend = "local".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Unsupported LLM backend: local"));
    }

    #[test]
    fn test_too_many_retries_is_rejected() {
        let mut config = AppConfig::default();
        config.llm.max_retries = 5;
        assert!(matches!(config.validate(), Err(ConfigurationError::Invalid(_))));
    }

    #[test]
    fn test_zero_row_cap_is_rejected() {
        let mut config = AppConfig::default();
        config.safety.max_rows = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides_apply() {
        let args = CliArgs {
            config: None,
            host: Some("0.0.0.0".to_string()),
            port: Some(8080),
            database: Some(":memory:".to_string()),
            read_write: true,
            ask: None,
            stream: true,
        };
        let config = AppConfig::new(&args).unwrap();
        assert_eq!(config.web.host, "0.0.0.0");
        assert_eq!(config.web.port, 8080);
        assert_eq!(config.database.connection_string, ":memory:");
        assert_eq!(config.safety.mode, SafetyMode::ReadWrite);
        assert!(config.llm.stream);
    }

    #[test]
    fn test_session_limits_must_be_positive() {
        let mut config = AppConfig::default();
        config.sessions.max_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_attach_debug_hides_password() {
        let attach = AttachConfig {
            kind: AttachKind::Postgres,
            host: "db".to_string(),
            port: 5432,
            user: "app".to_string(),
            password: "hunter2".to_string(),
            name: "shop".to_string(),
            alias: "remote".to_string(),
        };
        let debug = format!("{:?}", attach);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_attach_sql_escapes_password_quotes() {
        let attach = AttachConfig {
            kind: AttachKind::Mysql,
            host: "db.local".to_string(),
            port: 3306,
            user: "reader".to_string(),
            password: "it's".to_string(),
            name: "hrms".to_string(),
            alias: "hrms".to_string(),
        };
        let sql = attach.to_attach_sql(true);
        assert!(sql.starts_with("INSTALL mysql; LOAD mysql;"));
        assert!(sql.contains("password=it''s"));
        assert!(sql.contains("database=hrms"));
        assert!(sql.ends_with("AS \"hrms\" (TYPE mysql, READ_ONLY);"));
    }
}
