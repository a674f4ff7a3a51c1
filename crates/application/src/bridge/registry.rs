use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use domain::device::{ConnectionSpec, DeviceConfig, DeviceSnapshot, DeviceState};
use domain::driver::Driver;
use domain::transport::{Transport, TransportFactory};
use domain::{GatewayError, Result};
use infrastructure::drivers::{DriverContext, DriverLoader};

/// Live registry entry. Exclusively owned here; the scheduler refers to
/// devices by id only.
struct DeviceRecord {
    config: DeviceConfig,
    driver: Arc<dyn Driver>,
    transport: Arc<dyn Transport>,
    state: DeviceState,
}

/// Per-process set of configured devices, keyed by device id.
pub struct DeviceRegistry {
    loader: Arc<DriverLoader>,
    transports: Arc<dyn TransportFactory>,
    devices: Mutex<HashMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new(loader: Arc<DriverLoader>, transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            loader,
            transports,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Open the transport, instantiate the driver, store the record.
    /// Adding an id twice fails.
    pub async fn add_device(&self, config: DeviceConfig) -> Result<()> {
        let mut devices = self.devices.lock().await;
        if devices.contains_key(&config.device_id) {
            return Err(GatewayError::DuplicateDevice(config.device_id.clone()));
        }

        let transport = match &config.connection {
            ConnectionSpec::Rtu { port, link, .. } => self
                .transports
                .open_rtu(port, link, config.connection.timeout())
                .await?,
            ConnectionSpec::Tcp { host, port, .. } => self
                .transports
                .open_tcp(host, *port, config.connection.timeout())
                .await?,
        };

        let driver = match self.loader.instantiate(
            Some(&config.driver),
            DriverContext {
                transport: transport.clone(),
                slave_id: config.connection.slave_id(),
                settings: config.settings.clone(),
            },
        ) {
            Ok(driver) => driver,
            Err(err) => {
                let _ = transport.close().await;
                return Err(err);
            }
        };

        info!(device_id = %config.device_id, driver = %config.driver, "device registered");
        let state = DeviceState {
            connected: true,
            ..DeviceState::default()
        };
        devices.insert(
            config.device_id.clone(),
            DeviceRecord {
                config,
                driver,
                transport,
                state,
            },
        );
        Ok(())
    }

    /// Destroy a record; removing an unknown id fails.
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let record = self
            .devices
            .lock()
            .await
            .remove(device_id)
            .ok_or_else(|| GatewayError::DeviceNotFound(device_id.to_string()))?;
        if let Err(err) = record.transport.close().await {
            warn!(device_id = %device_id, error = %err, "failed to close transport");
        }
        info!(device_id = %device_id, "device removed");
        Ok(())
    }

    pub async fn driver(&self, device_id: &str) -> Option<Arc<dyn Driver>> {
        self.devices
            .lock()
            .await
            .get(device_id)
            .map(|record| record.driver.clone())
    }

    pub async fn get_device(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.devices.lock().await.get(device_id).map(|record| DeviceSnapshot {
            config: record.config.clone(),
            state: record.state.clone(),
        })
    }

    pub async fn list_devices(&self) -> Vec<DeviceSnapshot> {
        self.devices
            .lock()
            .await
            .values()
            .map(|record| DeviceSnapshot {
                config: record.config.clone(),
                state: record.state.clone(),
            })
            .collect()
    }

    pub async fn device_configs(&self) -> Vec<DeviceConfig> {
        self.devices
            .lock()
            .await
            .values()
            .map(|record| record.config.clone())
            .collect()
    }

    pub async fn device_count(&self) -> usize {
        self.devices.lock().await.len()
    }

    /// Partial state update used by the scheduler callbacks.
    pub async fn update_state(
        &self,
        device_id: &str,
        update: impl FnOnce(&mut DeviceState),
    ) -> Result<()> {
        let mut devices = self.devices.lock().await;
        let record = devices
            .get_mut(device_id)
            .ok_or_else(|| GatewayError::DeviceNotFound(device_id.to_string()))?;
        update(&mut record.state);
        Ok(())
    }

    /// Destroy every record.
    pub async fn clear(&self) {
        let mut devices = self.devices.lock().await;
        for (device_id, record) in devices.drain() {
            if let Err(err) = record.transport.close().await {
                warn!(device_id = %device_id, error = %err, "failed to close transport");
            }
        }
    }
}
