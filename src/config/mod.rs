//! Typed configuration from a TOML file and environment variables.
//!
//! Loads once at startup and fails fast on malformed values. Precedence,
//! lowest first: built-in defaults, the TOML file, environment variables,
//! then command-line flags (applied by the binary).
//!
//! Environment variables:
//! - `AI_ACTION_HOST`: bind host (default `::`)
//! - `AI_ACTION_PORT`: bind port (default 50052)
//! - `AI_ACTION_GRACE_MS`: shutdown grace window in ms (default 1000)
//! - `AI_ACTION_LOG_FILE`: append handler lines to this file instead of stdout
//! - `AI_ACTION_HOSTING`: `in-process` or `actor`
//! - `OTEL_ENDPOINT`: OTLP gRPC endpoint
//! - `LOG_LEVEL`: filter used when `RUST_LOG` is unset (default `info`)

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::server::ServerConfig;

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 50052;

/// How the server is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum HostingMode {
    /// The supervisor runs directly in the calling task.
    #[default]
    InProcess,
    /// The supervisor is owned by a lifecycle actor.
    Actor,
}

impl FromStr for HostingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in-process" | "in_process" | "inprocess" => Ok(Self::InProcess),
            "actor" => Ok(Self::Actor),
            other => Err(Error::Config(format!("unknown hosting mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub grace_ms: u64,
    pub log_file: Option<PathBuf>,
    pub hosting: HostingMode,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            grace_ms: 1000,
            log_file: None,
            hosting: HostingMode::InProcess,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Defaults overridden by environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid config: {e}")))
    }

    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)?.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from a variable lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("AI_ACTION_HOST") {
            self.host = parse_var("AI_ACTION_HOST", host.trim_matches(['[', ']']))?;
        }
        if let Some(port) = lookup("AI_ACTION_PORT") {
            self.port = parse_var("AI_ACTION_PORT", &port)?;
        }
        if let Some(grace) = lookup("AI_ACTION_GRACE_MS") {
            self.grace_ms = parse_var("AI_ACTION_GRACE_MS", &grace)?;
        }
        if let Some(path) = lookup("AI_ACTION_LOG_FILE").filter(|p| !p.is_empty()) {
            self.log_file = Some(PathBuf::from(path));
        }
        if let Some(hosting) = lookup("AI_ACTION_HOSTING") {
            self.hosting = hosting.parse()?;
        }
        if let Some(endpoint) = lookup("OTEL_ENDPOINT").filter(|e| !e.is_empty()) {
            self.otel_endpoint = Some(endpoint);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(self)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.bind_addr()).grace(self.grace())
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid {name} '{value}': {e}")))
}
