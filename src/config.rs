//! Layered configuration
//!
//! Sources, lowest precedence first: built-in defaults, `config/default`,
//! `config/{ENVIRONMENT}`, `config/local`, then `LLM_RELAY__*` environment
//! variables (`LLM_RELAY__APPLICATION__PORT=9000`).

use crate::proxy::service::RouteConfig;
use crate::proxy::types::{
    BufferSize, CaptureConfig, CaptureLength, ChunkSize, GatewayConfig, MaxFrameSize,
    PipeCapacity, RequestSizeLimit, ResponseSizeLimit, RingBufferConfig, SlotSize,
};
pub use config::ConfigError;
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use std::env;
use std::time::Duration;

const ENV_PREFIX: &str = "LLM_RELAY";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    pub logging: LoggingSettings,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    pub environment: String,
}

/// Gateway limits as they appear in configuration files
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GatewaySettings {
    pub max_request_size: RequestSizeLimit,
    pub max_response_size: ResponseSizeLimit,
    pub request_timeout_secs: u64,
    pub pipe_capacity: PipeCapacity,
    pub chunk_size: ChunkSize,
    pub max_event_frame: MaxFrameSize,
    pub capture_head: CaptureLength,
    pub capture_tail: CaptureLength,
    pub ring_buffer_size: BufferSize,
    pub ring_buffer_slot_size: SlotSize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        let defaults = GatewayConfig::default();
        Self {
            max_request_size: defaults.max_request_size,
            max_response_size: defaults.max_response_size,
            request_timeout_secs: defaults.request_timeout.as_secs(),
            pipe_capacity: defaults.pipe_capacity,
            chunk_size: defaults.chunk_size,
            max_event_frame: defaults.max_event_frame,
            capture_head: defaults.capture.head,
            capture_tail: defaults.capture.tail,
            ring_buffer_size: defaults.ring_buffer.buffer_size,
            ring_buffer_slot_size: defaults.ring_buffer.slot_size,
        }
    }
}

impl From<&GatewaySettings> for GatewayConfig {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            max_request_size: settings.max_request_size,
            max_response_size: settings.max_response_size,
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            pipe_capacity: settings.pipe_capacity,
            chunk_size: settings.chunk_size,
            max_event_frame: settings.max_event_frame,
            capture: CaptureConfig {
                head: settings.capture_head,
                tail: settings.capture_tail,
            },
            ring_buffer: RingBufferConfig {
                buffer_size: settings.ring_buffer_size,
                slot_size: settings.ring_buffer_slot_size,
            },
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        Self::defaults(&environment)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// Defaults overlaid with a single TOML document
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Self::defaults("development")?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    fn defaults(environment: &str) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("application.host", "0.0.0.0")?
            .set_default("application.port", 8080)?
            .set_default("application.environment", environment)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig::from(&self.gateway)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.application.host, self.application.port)
    }
}
