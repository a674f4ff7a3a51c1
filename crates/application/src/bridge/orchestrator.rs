use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use domain::device::DeviceConfig;
use domain::status::{BridgeState, BridgeStatus, ErrorLog};
use domain::transport::TransportFactory;
use domain::{GatewayError, Result};
use infrastructure::drivers::DriverLoader;
use infrastructure::mqtt::{InboundMessage, MessageHandler, MqttClient, MqttPublisherClient, MqttSettings};
use infrastructure::state::StateStore;

use super::registry::DeviceRegistry;
use super::scheduler::{PollScheduler, PollSink};

/// JSON payload accepted on `<prefix>/<deviceId>/write`.
#[derive(Debug, Deserialize)]
struct WriteCommand {
    #[serde(rename = "dataPoint")]
    data_point: String,
    value: Value,
}

/// Serialise one poll result as the `<prefix>/<deviceId>/data` payload.
pub fn data_payload(device_id: &str, values: &HashMap<String, Value>) -> Vec<u8> {
    json!({
        "deviceId": device_id,
        "timestamp": Utc::now().timestamp_millis(),
        "data": values,
    })
    .to_string()
    .into_bytes()
}

/// Poll sink wired into the scheduler: publishes readings, books failures
/// into the registry and the bounded status error list.
pub struct BridgeSink {
    publisher: Arc<dyn MqttPublisherClient>,
    registry: Arc<DeviceRegistry>,
    errors: Arc<ErrorLog>,
}

impl BridgeSink {
    pub fn new(
        publisher: Arc<dyn MqttPublisherClient>,
        registry: Arc<DeviceRegistry>,
        errors: Arc<ErrorLog>,
    ) -> Self {
        Self {
            publisher,
            registry,
            errors,
        }
    }
}

#[async_trait]
impl PollSink for BridgeSink {
    async fn on_data(&self, device_id: &str, values: HashMap<String, Value>) {
        let payload = data_payload(device_id, &values);
        let topic = format!("{device_id}/data");
        // fire and forget at QoS 0; a failed publish never stops polling
        if let Err(err) = self.publisher.publish_bytes(&topic, &payload, 0, false).await {
            warn!(device_id = %device_id, error = %err, "failed to publish poll data");
            self.errors.push(format!("publish failed for {device_id}: {err}"));
        }
        let now = Utc::now();
        let _ = self
            .registry
            .update_state(device_id, |state| {
                state.last_poll = Some(now);
                state.record_success(now);
            })
            .await;
    }

    async fn on_error(&self, device_id: &str, error: GatewayError) {
        warn!(device_id = %device_id, error = %error, "poll failed");
        let now = Utc::now();
        let _ = self
            .registry
            .update_state(device_id, |state| {
                state.last_poll = Some(now);
                state.consecutive_failures += 1;
                state.record_error(error.to_string());
            })
            .await;
    }
}

/// Wires the MQTT client, the device registry and the polling scheduler
/// together and owns them for the lifetime of a run.
pub struct Bridge {
    mqtt: Arc<MqttClient>,
    registry: Arc<DeviceRegistry>,
    scheduler: PollScheduler,
    errors: Arc<ErrorLog>,
    state: Mutex<BridgeState>,
    state_store: Option<StateStore>,
}

impl Bridge {
    pub fn new(
        settings: MqttSettings,
        loader: Arc<DriverLoader>,
        transports: Arc<dyn TransportFactory>,
        state_store: Option<StateStore>,
    ) -> Self {
        let errors = Arc::new(ErrorLog::new());
        let mqtt = Arc::new(MqttClient::new(settings, errors.clone()));
        let registry = Arc::new(DeviceRegistry::new(loader, transports));
        let sink = Arc::new(BridgeSink::new(
            mqtt.clone() as Arc<dyn MqttPublisherClient>,
            registry.clone(),
            errors.clone(),
        ));
        Self {
            mqtt,
            registry,
            scheduler: PollScheduler::new(sink),
            errors,
            state: Mutex::new(BridgeState::Stopped),
            state_store,
        }
    }

    /// Connect to the broker and start polling. Resolves on the first
    /// CONNACK; the first connection error fails the call. Later
    /// disconnects are retried transparently and do not affect start.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            *state = state
                .to_starting()
                .map_err(|e| GatewayError::Config(e.to_string()))?;
        }

        if let Err(err) = self.mqtt.connect().await {
            error!(error = %err, "initial MQTT connection failed");
            self.errors.push(err.to_string());
            *self.state.lock().unwrap() = BridgeState::Error;
            return Err(err);
        }

        for device in self.registry.device_configs().await {
            if device.enabled {
                if let Err(err) = self.subscribe_write_topic(&device.device_id).await {
                    warn!(device_id = %device.device_id, error = %err, "failed to subscribe write topic");
                }
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            *state = state
                .to_running()
                .map_err(|e| GatewayError::Config(e.to_string()))?;
        }
        self.scheduler.start();
        info!("bridge running");
        Ok(())
    }

    /// Idempotent; concurrent calls both succeed and leave Stopped.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, BridgeState::Stopped | BridgeState::Stopping) {
                return Ok(());
            }
            *state = BridgeState::Stopping;
        }

        self.scheduler.stop();
        self.persist().await;
        self.registry.clear().await;
        self.mqtt.stop().await;

        *self.state.lock().unwrap() = BridgeState::Stopped;
        info!("bridge stopped");
        Ok(())
    }

    /// Register, schedule (when enabled) and expose the write topic.
    pub async fn add_device(&self, config: DeviceConfig) -> Result<()> {
        let device_id = config.device_id.clone();
        let enabled = config.enabled;
        let polling = config.polling.clone();
        self.registry.add_device(config).await?;

        if enabled {
            if let Some(driver) = self.registry.driver(&device_id).await {
                self.scheduler.schedule_device(&device_id, polling, driver);
            }
            if self.mqtt.is_connected() {
                if let Err(err) = self.subscribe_write_topic(&device_id).await {
                    warn!(device_id = %device_id, error = %err, "failed to subscribe write topic");
                }
            }
        } else {
            info!(device_id = %device_id, "device registered disabled, not scheduling");
        }
        self.persist().await;
        Ok(())
    }

    /// Unschedule before destruction so no in-flight poll re-arms.
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        self.scheduler.unschedule_device(device_id);
        if self.mqtt.is_connected() {
            let _ = self.mqtt.unsubscribe(&format!("{device_id}/write")).await;
        }
        self.registry.remove_device(device_id).await?;
        self.persist().await;
        Ok(())
    }

    pub async fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> Result<()> {
        self.mqtt.publish(topic, payload, qos, retain).await
    }

    pub async fn subscribe(&self, topic: &str, qos: u8, handler: MessageHandler) -> Result<()> {
        let result = self.mqtt.subscribe(topic, qos, handler).await;
        self.persist().await;
        result
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let result = self.mqtt.unsubscribe(topic).await;
        self.persist().await;
        result
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn is_scheduled(&self, device_id: &str) -> bool {
        self.scheduler.is_scheduled(device_id)
    }

    /// Live report: connectivity comes from the client, the device count
    /// from the registry, never from stale bookkeeping.
    pub async fn status(&self) -> BridgeStatus {
        BridgeStatus {
            state: *self.state.lock().unwrap(),
            timestamp: Utc::now(),
            errors: self.errors.snapshot(),
            device_count: self.registry.device_count().await,
            mqtt_connected: self.mqtt.is_connected(),
        }
    }

    async fn subscribe_write_topic(&self, device_id: &str) -> Result<()> {
        let registry = self.registry.clone();
        let id = device_id.to_string();
        let handler: MessageHandler = Arc::new(move |message: InboundMessage| {
            let registry = registry.clone();
            let id = id.clone();
            Box::pin(async move {
                let command: WriteCommand = serde_json::from_slice(&message.payload)
                    .map_err(|e| GatewayError::Handler(format!("invalid write command: {e}")))?;
                let driver = registry
                    .driver(&id)
                    .await
                    .ok_or_else(|| GatewayError::DeviceNotFound(id.clone()))?;
                info!(device_id = %id, data_point = %command.data_point, "write command received");
                driver.write_data_point(&command.data_point, command.value).await
            })
        });
        self.mqtt
            .subscribe(&format!("{device_id}/write"), 1, handler)
            .await
    }

    /// Best-effort snapshots under the optional state directory.
    async fn persist(&self) {
        let Some(store) = &self.state_store else {
            return;
        };
        if let Err(err) = store.save_devices(&self.registry.device_configs().await) {
            warn!(error = %err, "failed to persist device list");
        }
        if let Err(err) = store.save_subscriptions(&self.mqtt.subscription_topics()) {
            warn!(error = %err, "failed to persist subscription list");
        }
    }
}
