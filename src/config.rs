//! Configuration loaded from `~/.config/hlsrelay/config.toml`.
//!
//! Every field has a default, so the file is optional and may be partial.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::activity::DEFAULT_RECENT_CODES;
use crate::identity::UpstreamIdentity;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub browser: BrowserConfig,
    pub resolver: ResolverConfig,
    pub proxy: ProxyConfig,
    pub identity: UpstreamIdentity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Public origin used in rewritten playlists, e.g. `https://relay.example.com`.
    /// When unset it is derived from each request's `Host` header.
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            public_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Browser binary. Searched in `PATH` when unset.
    pub executable: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub idle_timeout_secs: u64,
    pub launch_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            extra_args: Vec::new(),
            idle_timeout_secs: 300,
            launch_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Player page address; `{code}` is replaced by the requested code.
    pub page_url: String,
    /// Regular expression a request URL must match to count as a segment.
    pub segment_pattern: String,
    /// File name substituted for the segment's to form the manifest URL.
    pub manifest_name: String,
    /// CSS selector of the player's play control.
    pub play_selector: String,
    pub navigation_timeout_secs: u64,
    pub capture_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub recent_codes: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            page_url: "https://player.example.com/e/{code}".to_string(),
            segment_pattern: r"\.ts(\?|#|$)".to_string(),
            manifest_name: "master.m3u8".to_string(),
            play_selector: ".vjs-big-play-button, .jw-icon-playback, .plyr__control--overlaid, \
                            button[aria-label='Play'], .play-button"
                .to_string(),
            navigation_timeout_secs: 30,
            capture_timeout_secs: 30,
            cache_ttl_secs: 3 * 60 * 60,
            cache_capacity: 100,
            recent_codes: DEFAULT_RECENT_CODES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            cache_ttl_secs: 3 * 60 * 60,
            cache_capacity: 200,
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location when it exists.
    ///
    /// An explicit path that cannot be read is an error; a missing default
    /// file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = default_path();
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    Self::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid TOML in {}", path.display()))
    }

    /// Reject values the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.resolver.page_url.contains("{code}") {
            bail!("resolver.page_url must contain a {{code}} placeholder");
        }
        regex::Regex::new(&self.resolver.segment_pattern)
            .context("resolver.segment_pattern is not a valid regular expression")?;
        if self.resolver.manifest_name.is_empty() || self.resolver.manifest_name.contains('/') {
            bail!("resolver.manifest_name must be a bare file name");
        }
        if let Some(public_url) = &self.server.public_url {
            url::Url::parse(public_url).context("server.public_url is not a valid URL")?;
        }
        self.identity
            .to_headers()
            .context("identity headers are not valid header values")?;
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.browser.idle_timeout_secs)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.browser.launch_timeout_secs)
    }

    /// Identity with referer/origin defaulted from the player page.
    pub fn effective_identity(&self) -> UpstreamIdentity {
        self.identity.clone().with_page_defaults(&self.resolver.page_url)
    }
}

/// Return the path to the default config file.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hlsrelay")
        .join("config.toml")
}
