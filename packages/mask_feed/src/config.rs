use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::FeedError;

// =============================================================================
// File config (figment-deserialized from defaults / TOML file / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   feed.toml:       url = "ws://10.0.0.5:5000/ws"
//
//   env var:         MASK_FEED_URL=ws://10.0.0.5:5000/ws
//                    MASK_FEED_RECONNECT_DELAY_MS=500

pub const DEFAULT_URL: &str = "ws://localhost:5000/ws";

/// Path of the backend's MJPEG camera stream, served next to the event socket.
pub const CAMERA_STREAM_PATH: &str = "/test_camera";

const ENV_PREFIX: &str = "MASK_FEED_";

/// Tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedFileConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for FeedFileConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}
fn default_reconnect_delay_ms() -> u64 {
    2000
}
fn default_channel_capacity() -> usize {
    256
}

/// Build a figment that layers: defaults → TOML file (if given) → MASK_FEED_* env vars.
pub fn load_config(config_file: Option<&Path>) -> figment::Figment {
    layered(config_file, ENV_PREFIX)
}

fn layered(config_file: Option<&Path>, env_prefix: &str) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FeedFileConfig::default()));
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed(env_prefix))
}

/// Extract the layered file config. An explicitly named file must exist.
pub fn load_file_config(config_file: Option<&Path>) -> Result<FeedFileConfig, FeedError> {
    if let Some(path) = config_file {
        if !path.is_file() {
            return Err(FeedError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
    }
    Ok(load_config(config_file).extract()?)
}

// =============================================================================
// Runtime config (validated view used by the connection manager)
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedConfig {
    /// Backend event endpoint, `ws://` or `wss://`
    pub url: String,
    /// Fixed delay between losing the connection and the next attempt
    pub reconnect_delay: Duration,
    /// Broadcast capacity; a subscriber further behind than this loses messages
    pub channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        let fc = FeedFileConfig::default();
        Self {
            url: fc.url,
            reconnect_delay: Duration::from_millis(fc.reconnect_delay_ms),
            channel_capacity: fc.channel_capacity,
        }
    }
}

impl FeedConfig {
    /// Defaults with a different endpoint.
    pub fn new(url: impl Into<String>) -> Result<Self, FeedError> {
        let config = Self {
            url: url.into(),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Result<Self, FeedError> {
        self.reconnect_delay = delay;
        self.validate()?;
        Ok(self)
    }

    pub fn from_file(fc: &FeedFileConfig) -> Result<Self, FeedError> {
        let config = Self {
            url: fc.url.clone(),
            reconnect_delay: Duration::from_millis(fc.reconnect_delay_ms),
            channel_capacity: fc.channel_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from defaults, an optional TOML file and the environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self, FeedError> {
        Self::from_file(&load_file_config(config_file)?)
    }

    fn validate(&self) -> Result<(), FeedError> {
        let Some((scheme, rest)) = self.url.split_once("://") else {
            return Err(FeedError::Config(format!("not a URL: {}", self.url)));
        };
        if scheme != "ws" && scheme != "wss" {
            return Err(FeedError::Config(format!(
                "expected a ws:// or wss:// URL, got {}",
                self.url
            )));
        }
        if authority(rest).is_empty() {
            return Err(FeedError::Config(format!("missing host in {}", self.url)));
        }
        if self.reconnect_delay.is_zero() {
            return Err(FeedError::Config("reconnect delay must be non-zero".into()));
        }
        if self.channel_capacity == 0 {
            return Err(FeedError::Config("channel capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// HTTP URL of the camera stream on the same backend origin.
    pub fn camera_stream_url(&self) -> String {
        let (scheme, rest) = self.url.split_once("://").unwrap_or(("ws", &self.url));
        let http_scheme = if scheme == "wss" { "https" } else { "http" };
        format!("{http_scheme}://{}{CAMERA_STREAM_PATH}", authority(rest))
    }
}

fn authority(rest: &str) -> &str {
    rest.split(['/', '?', '#']).next().unwrap_or_default()
}
