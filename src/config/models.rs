//! Configuration data structures for the metrics proxy.
//!
//! Every field has a default so that a config file (or none at all) only needs
//! to name what differs. The credential paths default to empty and are
//! rejected by validation.
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::core::{
    CredentialSet, TransportSettings, UpstreamPorts, reloader::DEFAULT_QUIET_PERIOD,
};

fn default_port() -> u16 {
    2381
}

fn default_upstream_host() -> String {
    "localhost".to_string()
}

fn default_upstream_port() -> u16 {
    2379
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Port the proxy listens on (all interfaces)
    pub port: u16,
    pub upstream_host: String,
    pub upstream_port: u16,
    /// Name the upstream certificate must be valid for
    pub upstream_server_name: String,
    /// PEM bundle of CAs trusted for the upstream
    pub etcd_ca: String,
    /// PEM client certificate chain presented to the upstream
    pub etcd_cert: String,
    /// PEM private key for `etcd_cert`
    pub etcd_key: String,
    /// Only this exact path is proxied; everything else answers "ok"
    pub metrics_path: String,
    pub reload: ReloadConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            upstream_host: default_upstream_host(),
            upstream_port: default_upstream_port(),
            upstream_server_name: default_upstream_host(),
            etcd_ca: String::new(),
            etcd_cert: String::new(),
            etcd_key: String::new(),
            metrics_path: default_metrics_path(),
            reload: ReloadConfig::default(),
            transport: TransportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    pub fn credential_set(&self) -> CredentialSet {
        CredentialSet::new(
            &self.etcd_ca,
            &self.etcd_cert,
            &self.etcd_key,
            self.upstream_server_name.clone(),
        )
    }

    /// The upstream client port for TLS, the listen port for plain metrics.
    pub fn upstream_ports(&self) -> UpstreamPorts {
        UpstreamPorts {
            tls: self.upstream_port,
            plain: self.port,
        }
    }

    /// Transport tuning with durations parsed. Call after validation.
    pub fn transport_settings(&self) -> Result<TransportSettings, humantime::DurationError> {
        Ok(TransportSettings {
            max_idle_connections: self.transport.max_idle_connections,
            idle_timeout: parse_duration(&self.transport.idle_timeout)?,
            handshake_timeout: parse_duration(&self.transport.handshake_timeout)?,
        })
    }

    pub fn reload_debounce(&self) -> Result<Duration, humantime::DurationError> {
        parse_duration(&self.reload.debounce)
    }
}

/// Parse a humantime duration such as "250ms" or "1m 30s".
pub fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value.trim())
}

/// Credential reload tuning
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReloadConfig {
    /// Quiet period after the last file event before reloading
    pub debounce: String,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            debounce: humantime::format_duration(DEFAULT_QUIET_PERIOD).to_string(),
        }
    }
}

/// Outbound connection pool tuning
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub max_idle_connections: usize,
    pub idle_timeout: String,
    pub handshake_timeout: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_connections: 100,
            idle_timeout: "90s".to_string(),
            handshake_timeout: "10s".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format '{other}' (expected json or pretty)")),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}
