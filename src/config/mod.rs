use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;

mod log_config;
pub use log_config::{LogConfig, LogFormat};

/// Tunables of a hub connection.
///
/// Loadable from a TOML file plus `HUB_`-prefixed environment variables, or
/// built programmatically; every field also has a builder setter.
#[derive(Deserialize, Clone, Debug)]
pub struct HubConfig {
    /// Abort the transport when the server stays silent this long.
    #[serde(default = "default_server_timeout_ms")]
    pub server_timeout_ms: u64,
    /// Interval between client ping frames. Zero disables them.
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    /// Queue depth of a streaming invocation before the receive path blocks.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    #[serde(default)]
    pub log: LogConfig,
}

impl HubConfig {
    /// Loads configuration from the file named by `HUB_CONFIG` (default
    /// `hub.toml`), overridden by `HUB_*` environment variables.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(
                Env::var("HUB_CONFIG").as_deref().unwrap_or("hub.toml"),
            ))
            .merge(Env::prefixed("HUB_").global())
            .extract()
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            server_timeout_ms: default_server_timeout_ms(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            stream_buffer: default_stream_buffer(),
            log: LogConfig::default(),
        }
    }
}

fn default_server_timeout_ms() -> u64 {
    30_000
}

fn default_keep_alive_interval_ms() -> u64 {
    15_000
}

fn default_stream_buffer() -> usize {
    32
}
