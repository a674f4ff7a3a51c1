use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use application::bridge::{Bridge, BridgeSink, DeviceRegistry, PollSink, data_payload};
use domain::device::DeviceConfig;
use domain::link::{LinkParams, SlaveId};
use domain::status::{BridgeState, ErrorLog};
use domain::transport::{DeviceIdObjects, Transport, TransportFactory};
use domain::{GatewayError, ModbusError};
use infrastructure::drivers::DriverLoader;
use infrastructure::mqtt::{MqttPublisherClient, MqttSettings};

// --- Mock transport layer -------------------------------------------------

#[derive(Default)]
struct MockFactory {
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn open_rtu(
        &self,
        _: &str,
        _: &LinkParams,
        _: Duration,
    ) -> Result<Arc<dyn Transport>, ModbusError> {
        Ok(Arc::new(NoopTransport {
            closes: self.closes.clone(),
        }))
    }

    async fn open_tcp(
        &self,
        _: &str,
        _: u16,
        _: Duration,
    ) -> Result<Arc<dyn Transport>, ModbusError> {
        Ok(Arc::new(NoopTransport {
            closes: self.closes.clone(),
        }))
    }
}

struct NoopTransport {
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for NoopTransport {
    async fn read_coils(&self, _: SlaveId, _: u16, _: u16) -> Result<Vec<bool>, ModbusError> {
        Ok(vec![])
    }
    async fn read_discrete_inputs(
        &self,
        _: SlaveId,
        _: u16,
        _: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        Ok(vec![])
    }
    async fn read_holding_registers(
        &self,
        _: SlaveId,
        _: u16,
        _: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        Ok(vec![0])
    }
    async fn read_input_registers(
        &self,
        _: SlaveId,
        _: u16,
        _: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        Ok(vec![0])
    }
    async fn write_single_coil(&self, _: SlaveId, _: u16, _: bool) -> Result<(), ModbusError> {
        Ok(())
    }
    async fn write_single_register(&self, _: SlaveId, _: u16, _: u16) -> Result<(), ModbusError> {
        Ok(())
    }
    async fn write_multiple_registers(
        &self,
        _: SlaveId,
        _: u16,
        _: &[u16],
    ) -> Result<(), ModbusError> {
        Ok(())
    }
    async fn read_device_identification(
        &self,
        _: SlaveId,
        _: u8,
    ) -> Result<DeviceIdObjects, ModbusError> {
        Ok(DeviceIdObjects::default())
    }
    fn set_timeout(&self, _: Duration) {}
    async fn close(&self) -> Result<(), ModbusError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// --- Mock publisher -------------------------------------------------------

#[derive(Default)]
struct MockPublisher {
    published: Mutex<Vec<(String, Vec<u8>, u8, bool)>>,
    fail: bool,
}

#[async_trait]
impl MqttPublisherClient for MockPublisher {
    async fn publish_bytes(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> domain::Result<()> {
        if self.fail {
            return Err(GatewayError::MqttNotConnected);
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec(), qos, retain));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.fail
    }
}

// --- Helpers --------------------------------------------------------------

fn sim_device(device_id: &str) -> DeviceConfig {
    serde_json::from_value(json!({
        "device_id": device_id,
        "driver": "sim",
        "connection": {"type": "rtu", "port": "/dev/ttyUSB0", "slave_id": 1}
    }))
    .unwrap()
}

fn make_registry() -> (Arc<DeviceRegistry>, Arc<AtomicUsize>) {
    let factory = MockFactory::default();
    let closes = factory.closes.clone();
    let registry = Arc::new(DeviceRegistry::new(
        Arc::new(DriverLoader::new()),
        Arc::new(factory),
    ));
    (registry, closes)
}

fn make_bridge() -> Bridge {
    Bridge::new(
        MqttSettings::default(),
        Arc::new(DriverLoader::new()),
        Arc::new(MockFactory::default()),
        None,
    )
}

// --- Registry tests -------------------------------------------------------

#[tokio::test]
async fn test_registry_add_get_remove() {
    let (registry, closes) = make_registry();
    registry.add_device(sim_device("dev-1")).await.unwrap();
    assert_eq!(registry.device_count().await, 1);

    let snapshot = registry.get_device("dev-1").await.unwrap();
    assert_eq!(snapshot.config.driver, "sim");
    assert!(snapshot.state.connected);
    assert_eq!(snapshot.state.consecutive_failures, 0);

    registry.remove_device("dev-1").await.unwrap();
    assert_eq!(registry.device_count().await, 0);
    assert!(registry.get_device("dev-1").await.is_none());
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_registry_duplicate_add_fails() {
    let (registry, _) = make_registry();
    registry.add_device(sim_device("dev-1")).await.unwrap();
    let err = registry.add_device(sim_device("dev-1")).await.unwrap_err();
    assert_eq!(err, GatewayError::DuplicateDevice("dev-1".to_string()));
    assert_eq!(registry.device_count().await, 1);
}

#[tokio::test]
async fn test_registry_remove_unknown_fails() {
    let (registry, _) = make_registry();
    let err = registry.remove_device("ghost").await.unwrap_err();
    assert_eq!(err, GatewayError::DeviceNotFound("ghost".to_string()));
}

#[tokio::test]
async fn test_registry_unknown_driver_fails_and_releases_transport() {
    let (registry, closes) = make_registry();
    let mut config = sim_device("dev-1");
    config.driver = "does-not-exist".to_string();
    let err = registry.add_device(config).await.unwrap_err();
    assert_eq!(
        err,
        GatewayError::DriverNotFound("does-not-exist".to_string())
    );
    assert_eq!(registry.device_count().await, 0);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_registry_clear_destroys_every_record() {
    let (registry, closes) = make_registry();
    registry.add_device(sim_device("a")).await.unwrap();
    registry.add_device(sim_device("b")).await.unwrap();
    registry.add_device(sim_device("c")).await.unwrap();
    registry.clear().await;
    assert_eq!(registry.device_count().await, 0);
    assert_eq!(closes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_registry_update_state() {
    let (registry, _) = make_registry();
    registry.add_device(sim_device("dev-1")).await.unwrap();
    registry
        .update_state("dev-1", |state| {
            state.consecutive_failures = 2;
            state.record_error("boom");
        })
        .await
        .unwrap();
    let snapshot = registry.get_device("dev-1").await.unwrap();
    assert_eq!(snapshot.state.consecutive_failures, 2);
    assert_eq!(snapshot.state.recent_errors.len(), 1);

    let err = registry
        .update_state("ghost", |_| {})
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::DeviceNotFound("ghost".to_string()));
}

// --- Bridge sink tests ----------------------------------------------------

#[tokio::test]
async fn test_sink_publishes_data_payload() {
    let (registry, _) = make_registry();
    registry.add_device(sim_device("dev-1")).await.unwrap();
    let publisher = Arc::new(MockPublisher::default());
    let errors = Arc::new(ErrorLog::new());
    let sink = BridgeSink::new(publisher.clone(), registry.clone(), errors.clone());

    let mut values = HashMap::new();
    values.insert("temperature".to_string(), json!(23.5));
    sink.on_data("dev-1", values).await;

    let published = publisher.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    let (topic, payload, qos, retain) = &published[0];
    assert_eq!(topic, "dev-1/data");
    assert_eq!(*qos, 0);
    assert!(!*retain);
    let parsed: Value = serde_json::from_slice(payload).unwrap();
    assert_eq!(parsed["deviceId"], "dev-1");
    assert_eq!(parsed["data"]["temperature"], json!(23.5));
    assert!(parsed["timestamp"].as_i64().unwrap() > 0);
    assert!(errors.is_empty());

    let snapshot = registry.get_device("dev-1").await.unwrap();
    assert!(snapshot.state.last_poll.is_some());
    assert!(snapshot.state.last_update.is_some());
}

#[tokio::test]
async fn test_sink_records_poll_errors() {
    let (registry, _) = make_registry();
    registry.add_device(sim_device("dev-1")).await.unwrap();
    let publisher = Arc::new(MockPublisher::default());
    let errors = Arc::new(ErrorLog::new());
    let sink = BridgeSink::new(publisher.clone(), registry.clone(), errors);

    sink.on_error("dev-1", GatewayError::Modbus(ModbusError::Timeout))
        .await;
    sink.on_error("dev-1", GatewayError::Modbus(ModbusError::Timeout))
        .await;

    let snapshot = registry.get_device("dev-1").await.unwrap();
    assert_eq!(snapshot.state.consecutive_failures, 2);
    assert_eq!(snapshot.state.recent_errors.len(), 2);
    assert!(publisher.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_sink_publish_failure_does_not_panic_and_is_recorded() {
    let (registry, _) = make_registry();
    registry.add_device(sim_device("dev-1")).await.unwrap();
    let publisher = Arc::new(MockPublisher {
        fail: true,
        ..MockPublisher::default()
    });
    let errors = Arc::new(ErrorLog::new());
    let sink = BridgeSink::new(publisher, registry, errors.clone());

    sink.on_data("dev-1", HashMap::new()).await;
    let recorded = errors.snapshot();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].contains("publish failed for dev-1"));
}

#[test]
fn test_data_payload_shape() {
    let mut values = HashMap::new();
    values.insert("voltage".to_string(), json!(231.2));
    let payload = data_payload("meter-7", &values);
    let parsed: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(parsed["deviceId"], "meter-7");
    assert_eq!(parsed["data"]["voltage"], json!(231.2));
    assert!(parsed["timestamp"].is_i64());
}

// --- Bridge lifecycle tests -----------------------------------------------

#[tokio::test]
async fn test_bridge_initial_status() {
    let bridge = make_bridge();
    let status = bridge.status().await;
    assert_eq!(status.state, BridgeState::Stopped);
    assert_eq!(status.device_count, 0);
    assert!(!status.mqtt_connected);
    assert!(status.errors.is_empty());
}

#[tokio::test]
async fn test_bridge_add_remove_tracks_count_and_schedule() {
    let bridge = make_bridge();
    bridge.add_device(sim_device("dev-1")).await.unwrap();
    assert_eq!(bridge.status().await.device_count, 1);
    assert!(bridge.is_scheduled("dev-1"));

    bridge.add_device(sim_device("dev-2")).await.unwrap();
    assert_eq!(bridge.status().await.device_count, 2);

    bridge.remove_device("dev-1").await.unwrap();
    assert_eq!(bridge.status().await.device_count, 1);
    assert!(!bridge.is_scheduled("dev-1"));
    assert!(bridge.is_scheduled("dev-2"));
}

#[tokio::test]
async fn test_bridge_disabled_device_not_scheduled() {
    let bridge = make_bridge();
    let mut config = sim_device("dev-1");
    config.enabled = false;
    bridge.add_device(config).await.unwrap();
    assert_eq!(bridge.status().await.device_count, 1);
    assert!(!bridge.is_scheduled("dev-1"));
}

#[tokio::test]
async fn test_bridge_stop_is_idempotent() {
    let bridge = make_bridge();
    bridge.add_device(sim_device("dev-1")).await.unwrap();
    bridge.stop().await.unwrap();
    assert_eq!(bridge.status().await.state, BridgeState::Stopped);
    bridge.stop().await.unwrap();
    assert_eq!(bridge.status().await.state, BridgeState::Stopped);
    // stop drained the registry
    assert_eq!(bridge.status().await.device_count, 0);
}

#[tokio::test]
async fn test_bridge_concurrent_stops_both_succeed() {
    let bridge = Arc::new(make_bridge());
    bridge.add_device(sim_device("dev-1")).await.unwrap();
    let a = bridge.clone();
    let b = bridge.clone();
    let (ra, rb) = tokio::join!(a.stop(), b.stop());
    assert!(ra.is_ok());
    assert!(rb.is_ok());
    assert_eq!(bridge.status().await.state, BridgeState::Stopped);
}

#[tokio::test]
async fn test_bridge_start_fails_without_broker() {
    let bridge = Bridge::new(
        MqttSettings {
            // nothing listens on port 1
            url: "mqtt://127.0.0.1:1".to_string(),
            ..MqttSettings::default()
        },
        Arc::new(DriverLoader::new()),
        Arc::new(MockFactory::default()),
        None,
    );
    let err = bridge.start().await.unwrap_err();
    assert!(matches!(err, GatewayError::MqttConnection(_)));
    let status = bridge.status().await;
    assert_eq!(status.state, BridgeState::Error);
    assert!(!status.errors.is_empty());

    // the bridge recovers: error is a startable state
    assert!(BridgeState::Error.can_start());
    bridge.stop().await.unwrap();
    assert_eq!(bridge.status().await.state, BridgeState::Stopped);
}

#[tokio::test]
async fn test_bridge_double_start_rejected_while_running() {
    let bridge = make_bridge();
    // force the state machine directly: Starting is not a startable state
    assert!(BridgeState::Starting.to_starting().is_err());
    assert!(BridgeState::Running.to_starting().is_err());
    // and a stopped bridge can be started again after stop()
    bridge.stop().await.unwrap();
    assert!(bridge.status().await.state.can_start());
}
