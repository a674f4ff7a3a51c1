//! MQTT broker integration

pub mod client;

pub use client::{InboundMessage, MessageHandler, MqttClient, MqttSettings};

use async_trait::async_trait;

use domain::Result;

/// Publish-side seam the bridge's poll sink depends on; mockable in tests.
#[async_trait]
pub trait MqttPublisherClient: Send + Sync {
    /// Publish under the configured topic prefix.
    async fn publish_bytes(&self, topic: &str, payload: &[u8], qos: u8, retain: bool)
    -> Result<()>;

    fn is_connected(&self) -> bool;
}
