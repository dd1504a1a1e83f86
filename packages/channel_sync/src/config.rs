use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / chatsync.toml / env vars)
// =============================================================================
//
//   chatsync.toml:   [connection]
//                    reconnect_delay_secs = 10
//
//   env var:         CHATSYNC_CONNECTION__RECONNECT_DELAY_SECS=10

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Where the chat server lives (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Path of the push endpoint; also the target of the priming request.
    #[serde(default = "default_push_path")]
    pub push_path: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            push_path: default_push_path(),
            api_prefix: default_api_prefix(),
        }
    }
}

/// Push connection tunables (`[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay_secs(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

/// Per-channel session tunables (`[session]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_page_size")]
    pub initial_page_size: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Scroll offset from the top at or below which older history is requested.
    #[serde(default)]
    pub scroll_threshold_px: f64,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            initial_page_size: default_page_size(),
            page_size: default_page_size(),
            scroll_threshold_px: 0.0,
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_push_path() -> String {
    "/api/socket".to_string()
}
fn default_api_prefix() -> String {
    "/api".to_string()
}
fn default_reconnect_delay_secs() -> u64 {
    5
}
fn default_outbound_capacity() -> usize {
    100
}
fn default_page_size() -> u32 {
    50
}

/// Build a figment that layers: defaults → config file → CHATSYNC_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CHATSYNC_SERVER__BASE_URL=http://chat.local`  →  `server.base_url`
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("CHATSYNC_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Server endpoints (runtime view).
#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    pub base_url: String,
    pub push_path: String,
    pub api_prefix: String,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            base_url: fc.base_url.trim_end_matches('/').to_string(),
            push_path: fc.push_path.clone(),
            api_prefix: fc.api_prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Plain HTTP URL of the push endpoint, used for priming.
    pub fn push_http_url(&self) -> String {
        format!("{}{}", self.base_url, self.push_path)
    }

    /// WebSocket URL of the push endpoint.
    pub fn push_ws_url(&self) -> String {
        let url = self.push_http_url();
        if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            url
        }
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, self.api_prefix, path)
    }
}

/// Push connection behavior (runtime view).
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionConfig {
    /// Fixed wait between an unexpected close and the single reconnect attempt.
    pub reconnect_delay: Duration,
    pub outbound_capacity: usize,
}

impl ConnectionConfig {
    pub fn from_file(fc: &ConnectionFileConfig) -> Self {
        Self {
            reconnect_delay: Duration::from_secs(fc.reconnect_delay_secs),
            outbound_capacity: fc.outbound_capacity.max(1),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_file(&ConnectionFileConfig::default())
    }
}

/// Channel session behavior (runtime view).
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub initial_page_size: u32,
    pub page_size: u32,
    pub scroll_threshold_px: f64,
}

impl SessionConfig {
    pub fn from_file(fc: &SessionFileConfig) -> Self {
        Self {
            initial_page_size: fc.initial_page_size.max(1),
            page_size: fc.page_size.max(1),
            scroll_threshold_px: fc.scroll_threshold_px.max(0.0),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_file(&SessionFileConfig::default())
    }
}
