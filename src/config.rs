//! Configuration module for tcpnet
//!
//! JSON configuration; durations are given in milliseconds.
//!
//! ```json
//! {
//!   "log": { "level": "info" },
//!   "http": { "listen": "127.0.0.1:8080", "transport": { "read_timeout_ms": 60000 } },
//!   "tcp": { "listen": "127.0.0.1:9000" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::common::Endpoint;
use crate::error::{Error, Result};
use crate::service::http::HttpLimits;
use crate::service::tcp::DEFAULT_TCP_READ_TIMEOUT;
use crate::transport::TransportConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// HTTP service; disabled when absent
    #[serde(default)]
    pub http: Option<HttpServiceConfig>,

    /// Byte-stream service; disabled when absent
    #[serde(default)]
    pub tcp: Option<TcpServiceConfig>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Both services on loopback
    pub fn default_config() -> Self {
        Config {
            log: LogConfig::default(),
            http: Some(HttpServiceConfig {
                listen: "127.0.0.1:8080".to_string(),
                transport: TransportSettings::default(),
                limits: LimitsSettings::default(),
            }),
            tcp: Some(TcpServiceConfig {
                listen: "127.0.0.1:9000".to_string(),
                transport: TransportSettings::default(),
            }),
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(http) = &self.http {
            http.listen_endpoint()?;
            http.transport.validate()?;
        }
        if let Some(tcp) = &self.tcp {
            tcp.listen_endpoint()?;
            tcp.transport.validate()?;
        }
        Ok(())
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// HTTP service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServiceConfig {
    /// Listen address, e.g. "127.0.0.1:8080"
    pub listen: String,

    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub limits: LimitsSettings,
}

impl HttpServiceConfig {
    pub fn listen_endpoint(&self) -> Result<Endpoint> {
        self.listen.parse()
    }

    pub fn transport_config(&self) -> TransportConfig {
        self.transport.apply(TransportConfig::default())
    }

    pub fn limits(&self) -> HttpLimits {
        self.limits.apply(HttpLimits::default())
    }
}

/// Byte-stream service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpServiceConfig {
    /// Listen address, e.g. "127.0.0.1:9000"
    pub listen: String,

    #[serde(default)]
    pub transport: TransportSettings,
}

impl TcpServiceConfig {
    pub fn listen_endpoint(&self) -> Result<Endpoint> {
        self.listen.parse()
    }

    /// Read timeout defaults to 100 seconds for this service
    pub fn transport_config(&self) -> TransportConfig {
        let base = TransportConfig::default().with_read_timeout(Some(DEFAULT_TCP_READ_TIMEOUT));
        self.transport.apply(base)
    }
}

/// Transport overrides; unset fields keep the defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbuf_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_buffer_count: Option<usize>,

    /// 0 disables the read timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_delay_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_grace_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connect_retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodelay: Option<bool>,
}

impl TransportSettings {
    /// Overlay these settings on `base`
    pub fn apply(&self, mut base: TransportConfig) -> TransportConfig {
        if let Some(size) = self.inbuf_size {
            base.inbuf_size = size;
        }
        if let Some(count) = self.send_buffer_count {
            base.send_buffer_count = count;
        }
        if let Some(ms) = self.read_timeout_ms {
            base.read_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = self.restart_delay_ms {
            base.restart_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.connect_timeout_ms {
            base.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.close_grace_ms {
            base.close_grace = Duration::from_millis(ms);
        }
        if self.max_connect_retries.is_some() {
            base.max_connect_retries = self.max_connect_retries;
        }
        if let Some(nodelay) = self.nodelay {
            base.nodelay = nodelay;
        }
        base
    }

    fn validate(&self) -> Result<()> {
        if self.inbuf_size == Some(0) {
            return Err(Error::Config("inbuf_size must be positive".into()));
        }
        if self.send_buffer_count == Some(0) {
            return Err(Error::Config("send_buffer_count must be positive".into()));
        }
        Ok(())
    }
}

/// HTTP size limit overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_header_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_content_length: Option<usize>,
}

impl LimitsSettings {
    pub fn apply(&self, mut base: HttpLimits) -> HttpLimits {
        if let Some(size) = self.max_header_size {
            base.max_header_size = size;
        }
        if let Some(length) = self.max_content_length {
            base.max_content_length = length;
        }
        base
    }
}
