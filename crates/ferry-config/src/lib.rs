//! Layered TOML configuration for Ferry.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > config file > defaults

use ferry_mcp::{McpConfig, McpServerConfig};
use ferry_types::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The default model to use.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

/// The default max tokens for a response.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// File name of the interaction log inside the config directory.
pub const DEFAULT_LOG_FILE: &str = "mcp_interactions.jsonl";

/// Name of the server defined through `FERRY_SERVER_*` variables.
pub const CUSTOM_SERVER_NAME: &str = "custom";

const CUSTOM_SERVER_DEFAULT_COMMAND: &str = "python";

/// Resolved configuration for a Ferry session.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub api_base_url: String,
    pub system_prompt: Option<String>,
    pub config_dir: PathBuf,
    pub log_file: PathBuf,
    pub max_field_bytes: usize,
    pub mcp: McpConfig,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiSettings {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub base_url: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSettings {
    /// Interaction log path; relative paths are resolved against the config dir.
    pub file: Option<PathBuf>,
    pub max_field_bytes: Option<usize>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_file: Option<PathBuf>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub log_file: Option<PathBuf>,
}

impl HostConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables
    /// 3. Config file (`--config`, or `<config dir>/config.toml`)
    /// 4. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        Self::load_with(overrides, |key| std::env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with an explicit environment lookup.
    pub fn load_with<E>(overrides: CliOverrides, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let config_dir = config_dir_with(&env);

        // An explicit --config must exist and parse; the default file is optional.
        let settings = match &overrides.config_file {
            Some(path) => read_settings_file(path)?,
            None => load_settings_file(&config_dir.join("config.toml")),
        };

        // Resolve API key: CLI > env > config file
        let api_key = overrides
            .api_key
            .or_else(|| env("ANTHROPIC_API_KEY"))
            .or(settings.api.api_key)
            .ok_or_else(|| ConfigError::MissingKey {
                key: "api_key (set ANTHROPIC_API_KEY or add to ~/.ferry/config.toml)".into(),
            })?;

        let model = overrides
            .model
            .or_else(|| env("FERRY_MODEL"))
            .or(settings.api.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let max_tokens = overrides
            .max_tokens
            .or(settings.api.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS);
        if max_tokens == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_tokens".into(),
                message: "must be greater than zero".into(),
            });
        }

        let api_base_url = env("ANTHROPIC_API_BASE_URL")
            .or(settings.api.base_url)
            .unwrap_or_else(|| ferry_api::DEFAULT_BASE_URL.to_string());

        let log_file = overrides
            .log_file
            .or(settings.log.file)
            .map(|p| if p.is_relative() { config_dir.join(p) } else { p })
            .unwrap_or_else(|| config_dir.join(DEFAULT_LOG_FILE));
        let max_field_bytes = settings
            .log
            .max_field_bytes
            .unwrap_or(ferry_session::log::DEFAULT_MAX_FIELD_BYTES);

        let mut mcp = McpConfig {
            servers: settings.servers,
        };
        for (name, server) in &mcp.servers {
            if server.command.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: format!("servers.{name}.command"),
                    message: "must not be empty".into(),
                });
            }
        }
        if let Some(custom) = custom_server(&env) {
            if mcp.servers.contains_key(CUSTOM_SERVER_NAME) {
                tracing::warn!(
                    "FERRY_SERVER_CMD overrides [servers.{CUSTOM_SERVER_NAME}] from the config file"
                );
            }
            mcp.servers.insert(CUSTOM_SERVER_NAME.to_string(), custom);
        }

        Ok(HostConfig {
            api_key,
            model,
            max_tokens,
            api_base_url,
            system_prompt: settings.api.system_prompt,
            config_dir,
            log_file,
            max_field_bytes,
            mcp,
        })
    }
}

/// Get the Ferry config directory path (~/.ferry/).
pub fn config_dir() -> PathBuf {
    config_dir_with(|key| std::env::var(key).ok())
}

fn config_dir_with<E>(env: E) -> PathBuf
where
    E: Fn(&str) -> Option<String>,
{
    if let Some(dir) = env("FERRY_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ferry")
}

/// The extra server described by `FERRY_SERVER_CMD`, `FERRY_SERVER_ARGS`
/// and `FERRY_SERVER_CWD`, if either of the first two is set.
fn custom_server<E>(env: E) -> Option<McpServerConfig>
where
    E: Fn(&str) -> Option<String>,
{
    let command = env("FERRY_SERVER_CMD");
    let args = env("FERRY_SERVER_ARGS");
    if command.is_none() && args.is_none() {
        return None;
    }

    let mut server = McpServerConfig::new(
        command.unwrap_or_else(|| CUSTOM_SERVER_DEFAULT_COMMAND.to_string()),
    )
    .with_args(args.as_deref().unwrap_or_default().split_whitespace());
    server.cwd = env("FERRY_SERVER_CWD").map(PathBuf::from);
    server.description = Some("Server from FERRY_SERVER_CMD".to_string());
    Some(server)
}

/// Read and parse a TOML settings file, failing on any error.
fn read_settings_file(path: &Path) -> Result<SettingsFile, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse {
        path: path.display().to_string(),
        message,
    };
    let content = std::fs::read_to_string(path).map_err(|e| parse_err(e.to_string()))?;
    toml::from_str(&content).map_err(|e| parse_err(e.to_string()))
}

/// Load and parse a TOML settings file, returning defaults on any error.
fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}
