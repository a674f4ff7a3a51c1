use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use domain::device::DeviceConfig;

use crate::mqtt::MqttSettings;

/// Top-level gateway configuration.
///
/// Sources are layered: built-in defaults, then an optional config file,
/// then environment variables (`GATEWAY__MQTT__URL=...`). CLI flags are
/// applied on top by the binary.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub state_dir: Option<String>,
}

impl GatewayConfig {
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("mqtt.url", "mqtt://localhost:1883")?
            .set_default("mqtt.reconnect_period_ms", 5000i64)?
            .set_default("mqtt.topic_prefix", "modbus")?;
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }
        builder
            .add_source(Environment::with_prefix("GATEWAY").separator("__"))
            .build()?
            .try_deserialize()
    }
}
