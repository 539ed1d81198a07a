//! Configuration for the proxy
//!
//! Two layers:
//! - [`Config`]: process settings from environment variables
//!   (`EDGEPROXY_*`), the way the runtime starts.
//! - [`FileConfig`]: the YAML document named by `EDGEPROXY_CONFIG`, with a
//!   `proxy:` section ([`ProxyConfig`]) and a `stages:` section
//!   ([`StagesConfig`]).
//!
//! Every section implements `Default`, so any key can be omitted.

use crate::decode::DecoderOptions;
use crate::error::{ProxyError, Result};
use crate::proxy::BackoffConfig;
use crate::stage::anonymize::AnonymizeConfig;
use crate::stage::enrich::ExtraFieldsConfig;
use crate::stage::extract::ExporterConfig;
use crate::stage::schema::SchemaConfig;
use crate::stage::selector::SelectorConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// URL scheme that selects the gRPC transport
pub const GRPC_SCHEME: &str = "grpc://";

/// Topic that receives records failing validation
pub const DEFAULT_INVALID_MESSAGES_TOPIC: &str = "malformed";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable output
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(ProxyError::Config(format!("unknown log format: {other}"))),
        }
    }
}

/// Process settings loaded from the environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Ingestion HTTP listen address (`EDGEPROXY_LISTEN_ADDR`)
    pub listen_addr: SocketAddr,
    /// Metrics HTTP listen address (`EDGEPROXY_METRICS_ADDR`)
    pub metrics_addr: SocketAddr,
    /// YAML file with `proxy` and `stages` sections (`EDGEPROXY_CONFIG`)
    pub config_path: Option<PathBuf>,
    /// Default log filter when `RUST_LOG` is unset (`EDGEPROXY_LOG_LEVEL`)
    pub log_level: String,
    /// Log output format (`EDGEPROXY_LOG_FORMAT`)
    pub log_format: LogFormat,
    /// Framing for request bodies (`EDGEPROXY_JSON_FRAMING`, `EDGEPROXY_TRIM`)
    pub decoder: DecoderOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            config_path: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            decoder: DecoderOptions::default(),
        }
    }
}

impl Config {
    /// Load from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(addr) = lookup("EDGEPROXY_LISTEN_ADDR") {
            config.listen_addr = parse_addr("EDGEPROXY_LISTEN_ADDR", &addr)?;
        }
        if let Some(addr) = lookup("EDGEPROXY_METRICS_ADDR") {
            config.metrics_addr = parse_addr("EDGEPROXY_METRICS_ADDR", &addr)?;
        }
        if let Some(path) = lookup("EDGEPROXY_CONFIG").filter(|p| !p.is_empty()) {
            config.config_path = Some(PathBuf::from(path));
        }
        if let Some(level) = lookup("EDGEPROXY_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(format) = lookup("EDGEPROXY_LOG_FORMAT") {
            config.log_format = format.parse()?;
        }
        if let Some(flag) = lookup("EDGEPROXY_JSON_FRAMING") {
            config.decoder.json_framing = parse_bool("EDGEPROXY_JSON_FRAMING", &flag)?;
        }
        if let Some(flag) = lookup("EDGEPROXY_TRIM") {
            config.decoder.trim = parse_bool("EDGEPROXY_TRIM", &flag)?;
        }

        Ok(config)
    }
}

fn parse_addr(key: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| ProxyError::Config(format!("{key}: invalid address '{value}': {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ProxyError::Config(format!(
            "{key}: expected a boolean, got '{value}'"
        ))),
    }
}

/// The YAML configuration document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Broker connection, topics and breaker settings
    pub proxy: ProxyConfig,
    /// Optional transform stages
    pub stages: StagesConfig,
}

impl FileConfig {
    /// Parse a YAML document
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: FileConfig = serde_yaml::from_str(raw)?;
        config.proxy.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }
}

/// One statically configured topic
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicConfig {
    /// Topic name
    pub name: String,
    /// Payload format (`json`, `raw`)
    #[serde(default)]
    pub format: String,
    /// Reroute invalid JSON to the invalid messages topic
    #[serde(default)]
    pub validate: bool,
}

impl TopicConfig {
    /// Convenience constructor
    pub fn new(name: impl Into<String>, format: impl Into<String>, validate: bool) -> Self {
        Self {
            name: name.into(),
            format: format.into(),
            validate,
        }
    }

    /// True when records of this topic must be well-formed JSON
    pub fn validates_json(&self) -> bool {
        self.validate && self.format.eq_ignore_ascii_case("json")
    }
}

/// gRPC transport settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GrpcConfig {
    /// Channel connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-call deadline until the response headers arrive; an open
    /// produce stream is not bounded by it
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Record send counters
    pub enable_metrics: bool,
    /// Record the send duration histogram
    pub enable_histogram: bool,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            enable_metrics: true,
            enable_histogram: false,
        }
    }
}

/// HTTP transport settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Timeout of each request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Record send counters
    pub enable_metrics: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            enable_metrics: true,
        }
    }
}

/// Transport chosen from the URL scheme, resolved once
#[derive(Debug, Clone)]
pub enum TransportConfig {
    /// Streaming gRPC; `endpoint` uses the `http://` scheme
    Grpc {
        /// Channel endpoint
        endpoint: String,
        /// Protocol settings
        config: GrpcConfig,
    },
    /// Request/response HTTP
    Http {
        /// Base URL, without trailing slash
        base_url: String,
        /// Protocol settings
        config: HttpConfig,
    },
}

/// Broker connection, topics and breaker settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Broker gateway URL; `grpc://` selects gRPC, anything else is HTTP
    pub url: String,
    /// Consecutive transport failures that open the breaker
    pub circuitbreaker_max_fails: u32,
    /// Period of the background topic refresh
    #[serde(with = "humantime_serde")]
    pub topic_refresh_interval: Duration,
    /// Destination for records that fail JSON validation
    pub invalid_messages_topic: String,
    /// Statically known topics
    pub topics: Vec<TopicConfig>,
    /// gRPC transport settings
    pub grpc: GrpcConfig,
    /// HTTP transport settings
    pub http: HttpConfig,
    /// Breaker backoff between probes
    pub backoff: BackoffConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            url: "grpc://localhost:19094".to_string(),
            circuitbreaker_max_fails: 3,
            topic_refresh_interval: Duration::from_secs(60),
            invalid_messages_topic: DEFAULT_INVALID_MESSAGES_TOPIC.to_string(),
            topics: vec![TopicConfig::new("test", "json", false)],
            grpc: GrpcConfig::default(),
            http: HttpConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Reject settings the proxy cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(ProxyError::Config("url must not be empty".into()));
        }
        if self.circuitbreaker_max_fails == 0 {
            return Err(ProxyError::Config(
                "circuitbreaker_max_fails must be at least 1".into(),
            ));
        }
        if self.topic_refresh_interval.is_zero() {
            return Err(ProxyError::Config(
                "topic_refresh_interval must be positive".into(),
            ));
        }
        if self.invalid_messages_topic.is_empty() {
            return Err(ProxyError::Config(
                "invalid_messages_topic must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the transport variant from the URL scheme
    pub fn transport(&self) -> TransportConfig {
        let url = self.url.trim();
        match url.strip_prefix(GRPC_SCHEME) {
            Some(authority) => TransportConfig::Grpc {
                endpoint: format!("http://{}", authority.trim_end_matches('/')),
                config: self.grpc.clone(),
            },
            None => TransportConfig::Http {
                base_url: url.trim_end_matches(['/', ' ']).to_string(),
                config: self.http.clone(),
            },
        }
    }

    /// Names of the statically configured topics
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|t| t.name.clone()).collect()
    }

    /// Topics whose records must be well-formed JSON
    pub fn validate_json_topics(&self) -> HashMap<String, bool> {
        self.topics
            .iter()
            .filter(|t| t.validates_json())
            .map(|t| (t.name.clone(), true))
            .collect()
    }
}

/// Optional transform stages, applied in declaration order
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    /// Fan-out rules
    pub event_selectors: Vec<SelectorConfig>,
    /// IP address masking
    pub anonymize: Option<AnonymizeConfig>,
    /// Extra JSON fields
    pub extra_fields: Option<ExtraFieldsConfig>,
    /// Per-topic schema validation
    pub schema: Option<SchemaConfig>,
    /// Counters derived from record fields
    pub exporters: Vec<ExporterConfig>,
}
