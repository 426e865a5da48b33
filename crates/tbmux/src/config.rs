//! TOML configuration: recognised keys, defaults, validation, and the derived
//! upstream request parameters.

use std::path::Path;

use anyhow::{bail, Context, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Deserialize;

/// Characters escaped when the bot token is embedded as a path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db: String,
    pub upstream: UpstreamConfig,
    pub downstream: DownstreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db: "tbmux.db".to_string(),
            upstream: UpstreamConfig::default(),
            downstream: DownstreamConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub api_url: String,
    pub file_url: String,
    pub auth_token: String,
    /// Long-poll window in seconds; the upstream holds getUpdates open this
    /// long.
    pub polling_timeout: u64,
    /// Backoff cap in seconds for transient upstream failures.
    pub max_retry_interval: u64,
    /// Update types to receive; empty leaves the upstream default in effect.
    pub filter_update_types: Vec<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.telegram.org/bot".to_string(),
            file_url: "https://api.telegram.org/file/bot".to_string(),
            auth_token: String::new(),
            polling_timeout: 60,
            max_retry_interval: 600,
            filter_update_types: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownstreamConfig {
    pub listen_addr: String,
    pub api_path: String,
    pub file_path: String,
    pub auth_token: String,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            listen_addr: String::new(),
            api_path: "/bot".to_string(),
            file_path: "/file/bot".to_string(),
            auth_token: String::new(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to load config file: {}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&raw).context("failed to load config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.db.is_empty() {
            bail!("invalid config file: db is empty");
        }
        if self.upstream.api_url.is_empty() {
            bail!("invalid config file: upstream.api_url is empty");
        }
        if self.upstream.file_url.is_empty() {
            bail!("invalid config file: upstream.file_url is empty");
        }
        if self.upstream.auth_token.is_empty() {
            bail!("invalid config file: upstream.auth_token is empty");
        }
        if self.upstream.polling_timeout < 10 {
            bail!("invalid config file: upstream.polling_timeout is too short");
        }
        if self.upstream.max_retry_interval < 60 {
            bail!("invalid config file: upstream.max_retry_interval is too short");
        }
        if self.downstream.listen_addr.is_empty() {
            bail!("invalid config file: downstream.listen_addr is empty");
        }
        if self.downstream.api_path.is_empty() {
            bail!("invalid config file: downstream.api_path is empty");
        }
        if self.downstream.file_path.is_empty() {
            bail!("invalid config file: downstream.file_path is empty");
        }
        if self.downstream.auth_token.is_empty() {
            bail!("invalid config file: downstream.auth_token is empty");
        }
        Ok(())
    }

    /// Upstream API prefix ending in the path-escaped bot token.
    pub fn upstream_api_prefix(&self) -> String {
        format!(
            "{}{}",
            self.upstream.api_url,
            utf8_percent_encode(&self.upstream.auth_token, PATH_SEGMENT),
        )
    }

    /// Upstream file prefix ending in the path-escaped bot token.
    pub fn upstream_file_prefix(&self) -> String {
        format!(
            "{}{}",
            self.upstream.file_url,
            utf8_percent_encode(&self.upstream.auth_token, PATH_SEGMENT),
        )
    }

    /// The update-type filter as the JSON document sent in `allowed_updates=`.
    pub fn filter_update_types_json(&self) -> Result<String> {
        serde_json::to_string(&self.upstream.filter_update_types)
            .context("invalid config file: upstream.filter_update_types is invalid")
    }
}
