//! Configuration types for MCP servers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Default timeout for handshake and other protocol requests.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default timeout for a single `tools/call`.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 60_000;

/// How long a server gets to exit after stdin is closed before it is killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_tool_timeout() -> u64 {
    DEFAULT_TOOL_TIMEOUT_MS
}

fn default_enabled() -> bool {
    true
}

/// Top-level MCP configuration.
///
/// Servers are ordered by name, which fixes catalog order across runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

impl McpConfig {
    /// Enabled servers in name order.
    pub fn enabled(&self) -> impl Iterator<Item = (&String, &McpServerConfig)> {
        self.servers.iter().filter(|(_, s)| s.enabled)
    }
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Command to run (e.g., "python", "npx").
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides applied on top of the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Timeout for handshake requests in milliseconds (default: 30000).
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Timeout for each tool call in milliseconds (default: 60000).
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_ms: u64,
}

impl McpServerConfig {
    /// A server that runs `command` with default settings.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            description: None,
            enabled: true,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            tool_timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_server() {
        let toml_str = r#"
[servers.pokevgc]
command = "python"
args = ["-m", "pokemon_mcp.server"]
cwd = "/srv/pokemon"
"#;
        let config: McpConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.servers.len(), 1);
        let server = &config.servers["pokevgc"];
        assert_eq!(server.command, "python");
        assert_eq!(server.args.len(), 2);
        assert_eq!(server.cwd.as_deref(), Some(std::path::Path::new("/srv/pokemon")));
        assert!(server.enabled);
        assert_eq!(server.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(server.tool_timeout_ms, DEFAULT_TOOL_TIMEOUT_MS);
    }

    #[test]
    fn disabled_servers_are_filtered() {
        let toml_str = r#"
[servers.b]
command = "b"

[servers.a]
command = "a"
tool_timeout_ms = 1000

[servers.c]
command = "c"
enabled = false
"#;
        let config: McpConfig = toml::from_str(toml_str).unwrap();
        let names: Vec<_> = config.enabled().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(config.servers["a"].tool_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn parse_env_vars() {
        let toml_str = r#"
[servers.github]
command = "npx"
env = { GITHUB_TOKEN = "ghp_xxxx" }
"#;
        let config: McpConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.servers["github"].env["GITHUB_TOKEN"], "ghp_xxxx");
    }

    #[test]
    fn builder_defaults() {
        let server = McpServerConfig::new("sh").with_args(["-c", "true"]);
        assert_eq!(server.args, vec!["-c", "true"]);
        assert_eq!(server.request_timeout(), Duration::from_secs(30));
    }
}
