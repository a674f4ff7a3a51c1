use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use domain::driver::{Driver, DriverMetadata};
use domain::point::{Access, DataPoint, PollClass, ValueKind};
use domain::{GatewayError, Result};

use super::DriverContext;

fn default_min() -> f64 {
    0.0
}

fn default_max() -> f64 {
    100.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorSettings {
    #[serde(default = "default_min")]
    pub min_value: f64,
    #[serde(default = "default_max")]
    pub max_value: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            min_value: default_min(),
            max_value: default_max(),
            unit: None,
        }
    }
}

/// In-memory driver for demos and tests; produces a deterministic sine wave
/// and never touches the bus.
pub struct SimulatorDriver {
    metadata: DriverMetadata,
    catalog: Vec<DataPoint>,
    settings: SimulatorSettings,
    written: Mutex<HashMap<String, Value>>,
}

impl SimulatorDriver {
    pub fn from_context(context: DriverContext) -> Result<Arc<dyn Driver>> {
        let settings: SimulatorSettings = if context.settings.is_null() {
            SimulatorSettings::default()
        } else {
            serde_json::from_value(context.settings).map_err(|e| {
                GatewayError::DriverMetadata(format!("invalid simulator settings: {e}"))
            })?
        };

        let unit = settings.unit.clone().unwrap_or_else(|| "°C".to_string());
        let catalog = vec![
            DataPoint::readable("temperature", ValueKind::Float).with_unit(unit.clone()),
            DataPoint::readable("humidity", ValueKind::Float).with_unit("%"),
            DataPoint::readable("setpoint", ValueKind::Float)
                .with_access(Access::ReadWrite)
                .with_unit(unit),
            DataPoint::readable("serial_number", ValueKind::String).with_poll(PollClass::Static),
        ];

        Ok(Arc::new(Self {
            metadata: DriverMetadata {
                name: "sim".to_string(),
                manufacturer: "Gateway Project".to_string(),
                model: "SIM-100".to_string(),
            },
            catalog,
            settings,
            written: Mutex::new(HashMap::new()),
        }))
    }

    /// Sine wave over a 10 second period, anchored to wall-clock time so
    /// repeated polls move.
    fn wave(&self, phase: f64) -> f64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let range = self.settings.max_value - self.settings.min_value;
        let midpoint = self.settings.min_value + range / 2.0;
        let amplitude = range / 2.0;
        let raw = midpoint + amplitude * (now * 0.1 * 2.0 * std::f64::consts::PI + phase).sin();
        (raw * 100.0).round() / 100.0
    }

    fn catalog_point(&self, id: &str) -> Result<&DataPoint> {
        self.catalog
            .iter()
            .find(|point| point.id == id)
            .ok_or_else(|| GatewayError::UnknownDataPoints(vec![id.to_string()]))
    }
}

#[async_trait]
impl Driver for SimulatorDriver {
    fn metadata(&self) -> &DriverMetadata {
        &self.metadata
    }

    fn data_points(&self) -> &[DataPoint] {
        &self.catalog
    }

    async fn read_data_point(&self, id: &str) -> Result<Value> {
        let point = self.catalog_point(id)?;
        if !point.access.readable() {
            return Err(GatewayError::NotReadable(id.to_string()));
        }
        if let Some(value) = self.written.lock().unwrap().get(id) {
            return Ok(value.clone());
        }
        let value = match id {
            "temperature" => json!(self.wave(0.0)),
            "humidity" => json!(self.wave(1.0)),
            "setpoint" => json!(self.settings.min_value),
            "serial_number" => json!("SIM-100-0001"),
            _ => Value::Null,
        };
        Ok(value)
    }

    async fn write_data_point(&self, id: &str, value: Value) -> Result<()> {
        let point = self.catalog_point(id)?;
        if !point.access.writable() {
            return Err(GatewayError::NotWritable(id.to_string()));
        }
        self.written.lock().unwrap().insert(id.to_string(), value);
        Ok(())
    }

    async fn read_data_points(&self, ids: &[String]) -> Result<HashMap<String, Value>> {
        let unknown: Vec<String> = ids
            .iter()
            .filter(|id| !self.catalog.iter().any(|point| &point.id == *id))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(GatewayError::UnknownDataPoints(unknown));
        }
        let mut values = HashMap::new();
        for id in ids {
            values.insert(id.clone(), self.read_data_point(id).await?);
        }
        Ok(values)
    }
}
