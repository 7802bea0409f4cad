use serde::{Deserialize, Serialize};

// ── Default helper functions ────────────────────────────────────────────────

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_tenants_path() -> String {
    "usuarios.json".to_string()
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_api_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_cache_ttl_secs() -> u64 {
    3_600
}

fn default_cache_max_entries() -> usize {
    128
}

fn default_cache_max_content_chars() -> usize {
    1_500
}

fn default_bridge_command() -> String {
    "warelay-bridge".to_string()
}

fn default_bridge_state_dir() -> String {
    "./bridge-state".to_string()
}

// ── Sub-config structs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS origins allowed to call the API. Empty means allow any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_tenants_path")]
    pub tenants_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tenants_path: default_tenants_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebCacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_max_content_chars")]
    pub max_content_chars: usize,
}

impl Default for WebCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
            max_content_chars: default_cache_max_content_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    /// Sidecar executable spawned once per tenant session.
    #[serde(default = "default_bridge_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Root directory for per-tenant auth state, so each tenant's scanned
    /// login survives restarts independently.
    #[serde(default = "default_bridge_state_dir")]
    pub state_dir: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: default_bridge_command(),
            args: Vec::new(),
            state_dir: default_bridge_state_dir(),
        }
    }
}

// ── Top-level config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WarelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub web_cache: WebCacheConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl WarelayConfig {
    /// Load configuration from a TOML file at the given path.
    /// Missing fields use documented defaults. Unknown fields are silently ignored.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML config '{}': {}", path, e))?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Apply deployment-environment overrides. `PORT` (the hosting
    /// platform's convention) wins over `SERV_PORT`.
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = read_env_port("PORT").or_else(|| read_env_port("SERV_PORT")) {
            self.server.port = port;
        }
        if let Ok(host) = std::env::var("SERV_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.is_empty() {
                self.responder.api_key = key;
            }
        }
        if let Ok(origin) = std::env::var("WARELAY_ALLOWED_ORIGIN") {
            if !origin.is_empty() {
                self.server.allowed_origins = vec![origin];
            }
        }
    }
}

fn read_env_port(var: &str) -> Option<u16> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}
