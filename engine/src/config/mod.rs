//! Configuration management
//!
//! This module handles loading, validation, and management of the Conduit
//! configuration. Configuration is stored in TOML format at
//! ~/.conduit/config.toml and is constructed once at startup, then passed by
//! reference into the registry, the memory store and the cognitive loop.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **session**: Step budget, loop-detection window, failure limit
//! - **memory**: Retrieval depth, embedding dimension and backend
//! - **llm**: Ollama endpoint and model names
//! - **retry**: Backoff policy for perception and decision calls
//! - **perception**: Scope heuristics
//! - **endpoints**: Tool endpoints, local (subprocess) or remote (HTTP)
//!
//! # Examples
//!
//! ```no_run
//! use conduit_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Max steps: {}", config.session.max_steps);
//! println!("Endpoints: {}", config.endpoints.len());
//! # Ok(())
//! # }
//! ```
//!
//! An endpoint section looks like:
//!
//! ```toml
//! [[endpoints]]
//! id = "math"
//! kind = "local"
//! command = "python3"
//! args = ["math_server.py"]
//! timeout_secs = 20
//!
//! [[endpoints]]
//! id = "gsuite"
//! kind = "remote"
//! base_url = "http://localhost:8100/mcp"
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Cognitive loop limits
    #[serde(default)]
    pub session: SessionConfig,

    /// Memory store settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// LLM settings for the perception/decision collaborators
    #[serde(default)]
    pub llm: LLMConfig,

    /// Retry policy for collaborator calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Perception heuristics
    #[serde(default)]
    pub perception: PerceptionConfig,

    /// Tool endpoints
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Cognitive loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum number of executed tool steps per session
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// How many recent calls a proposal is compared against
    #[serde(default = "default_loop_window")]
    pub loop_window: usize,

    /// Consecutive failed tool steps before the session gives up
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: usize,

    /// Deadline for one perception or decision attempt (seconds)
    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_secs: u64,
}

/// Embedding backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    /// Ollama `/api/embeddings`
    Ollama,
    /// Local feature hashing, no network
    Hashing,
}

/// Memory store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Records retrieved per planning step
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Embedding dimension; records of any other size are rejected
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Embedding backend
    #[serde(default = "default_embedder")]
    pub embedder: EmbedderKind,

    /// Persist the record log to SQLite under `core.data_dir`
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Database file name inside the data directory
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

/// LLM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Ollama settings
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// HTTP timeout for generation and embedding requests (seconds)
    #[serde(default = "default_llm_http_timeout")]
    pub timeout_secs: u64,
}

/// Ollama configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL for Ollama API
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Generation model
    #[serde(default = "default_ollama_model")]
    pub model: String,

    /// Embedding model
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per collaborator call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds)
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Growth factor between retries
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on a single delay (milliseconds)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

/// Perception configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PerceptionConfig {
    #[serde(default)]
    pub scope: ScopeConfig,
}

/// Scope heuristic configuration
///
/// When a query names no explicit count but contains one of `keywords`, the
/// scope limit defaults to `default_limit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    #[serde(default = "default_scope_limit")]
    pub default_limit: u32,

    #[serde(default = "default_scope_keywords")]
    pub keywords: Vec<String>,

    /// Keywords that make the defaulted scope `latest` instead of `top`
    #[serde(default = "default_recency_keywords")]
    pub recency_keywords: Vec<String>,
}

/// One tool endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointConfig {
    /// Identifier used in logs and collision errors
    pub id: String,

    /// Per-call deadline (seconds)
    #[serde(default = "default_endpoint_timeout")]
    pub timeout_secs: u64,

    #[serde(flatten)]
    pub kind: EndpointKind,
}

/// How an endpoint is reached
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EndpointKind {
    /// Spawned subprocess speaking line-delimited JSON on stdio
    Local {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// HTTP service with `GET {base}/tools` and `POST {base}/call_tool`
    Remote {
        base_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
}

impl EndpointConfig {
    /// A local endpoint with default timeout
    pub fn local(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            timeout_secs: default_endpoint_timeout(),
            kind: EndpointKind::Local {
                command: command.into(),
                args,
                cwd: None,
                env: HashMap::new(),
            },
        }
    }

    /// A remote endpoint with default timeout
    pub fn remote(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timeout_secs: default_endpoint_timeout(),
            kind: EndpointKind::Remote {
                base_url: base_url.into(),
                api_key: None,
            },
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.conduit")
}

fn default_max_steps() -> usize {
    10
}

fn default_loop_window() -> usize {
    3
}

fn default_max_consecutive_failures() -> usize {
    3
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_top_k() -> usize {
    3
}

fn default_dimension() -> usize {
    768
}

fn default_embedder() -> EmbedderKind {
    EmbedderKind::Ollama
}

fn default_database_file() -> String {
    "memory.db".to_string()
}

fn default_llm_http_timeout() -> u64 {
    120
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "phi4".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff() -> u64 {
    8_000
}

fn default_scope_limit() -> u32 {
    10
}

fn default_scope_keywords() -> Vec<String> {
    [
        "standings",
        "rankings",
        "leaderboard",
        "points",
        "table",
        "current",
        "latest",
        "top",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_recency_keywords() -> Vec<String> {
    ["latest", "recent", "newest", "news"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_endpoint_timeout() -> u64 {
    30
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            loop_window: default_loop_window(),
            max_consecutive_failures: default_max_consecutive_failures(),
            llm_timeout_secs: default_llm_timeout(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            dimension: default_dimension(),
            embedder: default_embedder(),
            persist: true,
            database_file: default_database_file(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            ollama: OllamaConfig::default(),
            timeout_secs: default_llm_http_timeout(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
            embedding_model: default_embedding_model(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            default_limit: default_scope_limit(),
            keywords: default_scope_keywords(),
            recency_keywords: default_recency_keywords(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.conduit/config.toml)
    ///
    /// If the configuration file doesn't exist, writes a default one first.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written, TOML parsing
    /// fails, or validation fails.
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Serialize before processing so the file keeps the portable ~ form
        let config = Self::default();
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = config;
        config.validate_and_process()?;
        Ok(config)
    }

    /// Get the default configuration file path (~/.conduit/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".conduit").join("config.toml"))
    }

    /// Path of the memory database
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join(&self.memory.database_file)
    }

    /// Validate and process configuration
    ///
    /// Checks value ranges and endpoint definitions, expands ~ in the data
    /// directory and creates it if missing.
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.session.max_steps == 0 {
            return Err(EngineError::Config(
                "session.max_steps must be at least 1".to_string(),
            ));
        }
        if self.session.loop_window == 0 {
            return Err(EngineError::Config(
                "session.loop_window must be at least 1".to_string(),
            ));
        }
        if self.session.max_consecutive_failures == 0 {
            return Err(EngineError::Config(
                "session.max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if self.session.llm_timeout_secs == 0 {
            return Err(EngineError::Config(
                "session.llm_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.memory.top_k == 0 {
            return Err(EngineError::Config(
                "memory.top_k must be at least 1".to_string(),
            ));
        }
        if self.memory.dimension == 0 {
            return Err(EngineError::Config(
                "memory.dimension must be at least 1".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(EngineError::Config(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        self.validate_endpoints()?;

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }

    fn validate_endpoints(&mut self) -> Result<(), EngineError> {
        let mut seen = HashSet::new();

        for endpoint in &mut self.endpoints {
            if endpoint.id.trim().is_empty() {
                return Err(EngineError::Config(
                    "Endpoint id must not be empty".to_string(),
                ));
            }
            if !seen.insert(endpoint.id.clone()) {
                return Err(EngineError::Config(format!(
                    "Duplicate endpoint id '{}'",
                    endpoint.id
                )));
            }
            if endpoint.timeout_secs == 0 {
                return Err(EngineError::Config(format!(
                    "Endpoint '{}' timeout_secs must be greater than 0",
                    endpoint.id
                )));
            }

            match &mut endpoint.kind {
                EndpointKind::Local { command, cwd, .. } => {
                    if command.trim().is_empty() {
                        return Err(EngineError::Config(format!(
                            "Local endpoint '{}' needs a command",
                            endpoint.id
                        )));
                    }
                    if let Some(dir) = cwd {
                        *dir = expand_path(dir)?;
                    }
                }
                EndpointKind::Remote { base_url, .. } => {
                    let parsed = reqwest::Url::parse(base_url).map_err(|e| {
                        EngineError::Config(format!(
                            "Remote endpoint '{}' has invalid base_url: {}",
                            endpoint.id, e
                        ))
                    })?;
                    if !matches!(parsed.scheme(), "http" | "https") {
                        return Err(EngineError::Config(format!(
                            "Remote endpoint '{}' must use http or https",
                            endpoint.id
                        )));
                    }
                    // Routes are appended, so drop any trailing slash
                    let trimmed = base_url.trim_end_matches('/').to_string();
                    *base_url = trimmed;
                }
            }
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;
        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn with_data_dir(body: &str, dir: &TempDir) -> String {
        format!(
            "[core]\ndata_dir = {:?}\n\n{}",
            dir.path().join("data").display().to_string(),
            body
        )
    }

    #[test]
    fn test_default_config_creation() {
        let config = Config::default();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.session.max_steps, 10);
        assert_eq!(config.session.loop_window, 3);
        assert_eq!(config.memory.top_k, 3);
        assert_eq!(config.perception.scope.default_limit, 10);
        assert!(config
            .perception
            .scope
            .keywords
            .contains(&"standings".to_string()));
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        assert_eq!(expand_path(&path).unwrap(), path);
    }

    #[test]
    fn test_parse_endpoints() {
        let dir = TempDir::new().unwrap();
        let toml = with_data_dir(
            r#"
[[endpoints]]
id = "math"
kind = "local"
command = "python3"
args = ["math_server.py"]
timeout_secs = 5

[[endpoints]]
id = "docs"
kind = "remote"
base_url = "http://localhost:8100/mcp/"
api_key = "secret"
"#,
            &dir,
        );

        let config = Config::from_toml_str(&toml).unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].timeout(), Duration::from_secs(5));
        match &config.endpoints[0].kind {
            EndpointKind::Local { command, args, .. } => {
                assert_eq!(command, "python3");
                assert_eq!(args, &vec!["math_server.py".to_string()]);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        match &config.endpoints[1].kind {
            EndpointKind::Remote { base_url, api_key } => {
                assert_eq!(base_url, "http://localhost:8100/mcp");
                assert_eq!(api_key.as_deref(), Some("secret"));
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert_eq!(config.endpoints[1].timeout_secs, 30);
        assert!(dir.path().join("data").is_dir());
    }

    #[test]
    fn test_duplicate_endpoint_ids_rejected() {
        let dir = TempDir::new().unwrap();
        let toml = with_data_dir(
            r#"
[[endpoints]]
id = "a"
kind = "local"
command = "x"

[[endpoints]]
id = "a"
kind = "remote"
base_url = "http://localhost:1"
"#,
            &dir,
        );

        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("Duplicate endpoint id"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = TempDir::new().unwrap();

        let bad_steps = with_data_dir("[session]\nmax_steps = 0\n", &dir);
        assert!(Config::from_toml_str(&bad_steps).is_err());

        let bad_level = format!(
            "[core]\nlog_level = \"loud\"\ndata_dir = {:?}\n",
            dir.path().display().to_string()
        );
        assert!(Config::from_toml_str(&bad_level).is_err());

        let bad_url = with_data_dir(
            "[[endpoints]]\nid = \"r\"\nkind = \"remote\"\nbase_url = \"ftp://host\"\n",
            &dir,
        );
        assert!(Config::from_toml_str(&bad_url).is_err());

        let empty_command = with_data_dir(
            "[[endpoints]]\nid = \"l\"\nkind = \"local\"\ncommand = \"  \"\n",
            &dir,
        );
        assert!(Config::from_toml_str(&empty_command).is_err());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config
            .endpoints
            .push(EndpointConfig::local("echo", "echo-tool", vec![]));
        config
            .endpoints
            .push(EndpointConfig::remote("web", "http://localhost:9000"));

        let toml_string = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_string).unwrap();

        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(config.endpoints, deserialized.endpoints);
        assert_eq!(config.memory.embedder, deserialized.memory.embedder);
    }
}
