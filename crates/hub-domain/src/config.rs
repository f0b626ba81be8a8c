//! Layered configuration: defaults baked into the struct, overridden by a
//! TOML file, overridden again by environment variables read at startup.
//! Every section carries `#[serde(default = "...")]` helpers so a config
//! file only needs to mention the fields it wants to change.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub spoke_channel: SpokeChannelConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub agent_loop: AgentLoopConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            identity: IdentityConfig::default(),
            skills: SkillsConfig::default(),
            spoke_channel: SpokeChannelConfig::default(),
            tools: ToolsConfig::default(),
            sessions: SessionsConfig::default(),
            agent_loop: AgentLoopConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file if present, else fall back to defaults.
    /// Environment variables are layered on top by the caller (the
    /// gateway binary), since they carry secrets that don't belong in a
    /// generic domain-level loader.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| crate::error::Error::ValidationFailed(e.to_string()))
    }

    /// Sanity-check the config, returning warnings/errors rather than
    /// panicking. A config with only warnings still starts; one with an
    /// error does not.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "server.port must be nonzero".to_string(),
            });
        }

        if self.llm.providers.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "no LLM providers configured — chat completions will 503".to_string(),
            });
        }

        if self.identity.hmac_secret_env.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "identity.hmac_secret_env must name an environment variable"
                    .to_string(),
            });
        }

        if self.spoke_channel.outbound_queue_size == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "spoke_channel.outbound_queue_size must be nonzero".to_string(),
            });
        }

        issues
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Seconds an in-flight agent loop is allowed to finish in before a
    /// graceful shutdown force-fails remaining work with `shutting_down`.
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            cors: CorsConfig::default(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
        }
    }
}

fn default_port() -> u16 {
    8420
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_shutdown_deadline_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_cors_origins(),
        }
    }
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:*".to_string(), "http://127.0.0.1:*".to_string()]
}

// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "hub.sqlite3".to_string()
}

// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Name of the environment variable holding the HMAC signing secret
    /// for user bearer tokens. Never stored in the TOML file itself.
    #[serde(default = "default_hmac_secret_env")]
    pub hmac_secret_env: String,
    #[serde(default = "default_user_token_ttl_secs")]
    pub user_token_ttl_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            hmac_secret_env: default_hmac_secret_env(),
            user_token_ttl_secs: default_user_token_ttl_secs(),
        }
    }
}

fn default_hmac_secret_env() -> String {
    "HUB_TOKEN_SECRET".to_string()
}
fn default_user_token_ttl_secs() -> u64 {
    3600
}

// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    #[serde(default = "default_skill_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_skill_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_skill_ttl_secs() -> u64 {
    1800
}
fn default_sweep_interval_secs() -> u64 {
    300
}

// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpokeChannelConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
    #[serde(default = "default_register_coalesce_ms")]
    pub register_coalesce_ms: u64,
}

impl Default for SpokeChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            outbound_queue_size: default_outbound_queue_size(),
            register_coalesce_ms: default_register_coalesce_ms(),
        }
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}
fn default_outbound_queue_size() -> usize {
    256
}
fn default_register_coalesce_ms() -> u64 {
    500
}

// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_describe_timeout_secs")]
    pub describe_timeout_secs: u64,
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            search_timeout_secs: default_search_timeout_secs(),
            describe_timeout_secs: default_describe_timeout_secs(),
            exec_timeout_secs: default_exec_timeout_secs(),
        }
    }
}

fn default_search_timeout_secs() -> u64 {
    5
}
fn default_describe_timeout_secs() -> u64 {
    5
}
fn default_exec_timeout_secs() -> u64 {
    30
}

// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            title_max_chars: default_title_max_chars(),
        }
    }
}

fn default_idle_timeout_secs() -> u64 {
    900
}
fn default_title_max_chars() -> usize {
    60
}

// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_turn_deadline_secs")]
    pub turn_deadline_secs: u64,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            turn_deadline_secs: default_turn_deadline_secs(),
        }
    }
}

fn default_max_iterations() -> u32 {
    5
}
fn default_turn_deadline_secs() -> u64 {
    60
}

// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompat,
    Anthropic,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = Config::default();
        let issues = cfg.validate();
        // Only the "no providers configured" warning should fire on bare
        // defaults — no hard errors.
        assert!(issues
            .iter()
            .all(|i| i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = Config::default();
        let s = toml::to_string(&cfg).unwrap();
        let back: Config = toml::from_str(&s).unwrap();
        assert_eq!(cfg.server.port, back.server.port);
    }
}
