pub mod bridge;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub use bridge::BridgeConfig;

/// Process-level settings layered from `config/local.*` and `DATABRIDGE__*`
/// environment variables. The bridge document itself is loaded separately
/// through [`BridgeConfig`].
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub bridge_config_path: Option<String>,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    #[serde(default)]
    pub endpoint_flags: EndpointFlags,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackpressureConfig {
    #[serde(default)]
    pub http_max_concurrency: Option<usize>,
    #[serde(default)]
    pub dispatch_max_inflight: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointFlags {
    #[serde(default = "default_true")]
    pub mqtt: bool,
    #[serde(default = "default_true")]
    pub kafka: bool,
    #[serde(default = "default_true")]
    pub amqp: bool,
    #[serde(default = "default_true")]
    pub http_server: bool,
}

impl Default for EndpointFlags {
    fn default() -> Self {
        Self {
            mqtt: true,
            kafka: true,
            amqp: true,
            http_server: true,
        }
    }
}

const fn default_true() -> bool {
    true
}

impl ServiceConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("DATABRIDGE").separator("__"))
            .build()?
            .try_deserialize()
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bridge_config_path: None,
            backpressure: BackpressureConfig::default(),
            endpoint_flags: EndpointFlags::default(),
        }
    }
}
