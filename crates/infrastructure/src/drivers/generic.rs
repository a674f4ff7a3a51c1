use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use domain::driver::{Driver, DriverMetadata};
use domain::link::SlaveId;
use domain::point::{Access, DataPoint, PollClass, ValueKind};
use domain::transport::Transport;
use domain::{GatewayError, Result};

use super::DriverContext;
use super::codec::{decode_value, encode_value};

/// Protocol limits on how many items one read request may cover.
const MAX_REGISTER_READ: u16 = 125;
const MAX_BIT_READ: u16 = 2000;

/// Register table a point lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterTable {
    #[default]
    Holding,
    Input,
    Coil,
    Discrete,
}

impl RegisterTable {
    fn is_bit_table(&self) -> bool {
        matches!(self, Self::Coil | Self::Discrete)
    }
}

fn default_count() -> u16 {
    1
}

/// One entry of the configured register map.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterPoint {
    pub id: String,
    pub address: u16,
    #[serde(default = "default_count")]
    pub count: u16,
    #[serde(default)]
    pub table: RegisterTable,
    #[serde(default = "default_kind")]
    pub kind: ValueKind,
    #[serde(default = "default_access")]
    pub access: Access,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub decimals: Option<u8>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub enum_values: Option<std::collections::BTreeMap<u16, String>>,
    #[serde(default)]
    pub poll: PollClass,
}

fn default_kind() -> ValueKind {
    ValueKind::Integer
}

fn default_access() -> Access {
    Access::Read
}

/// Settings accepted by the generic driver: metadata plus a register map.
#[derive(Debug, Clone, Deserialize)]
pub struct GenericDriverSettings {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub points: Vec<RegisterPoint>,
}

/// Register-map driver configured entirely from device settings. Covers any
/// device whose points map 1:1 onto registers, without a vendor package.
pub struct GenericModbusDriver {
    metadata: DriverMetadata,
    transport: Arc<dyn Transport>,
    slave_id: SlaveId,
    points: Vec<RegisterPoint>,
    catalog: Vec<DataPoint>,
}

impl GenericModbusDriver {
    pub fn from_context(context: DriverContext) -> Result<Arc<dyn Driver>> {
        let settings: GenericDriverSettings = serde_json::from_value(context.settings)
            .map_err(|e| GatewayError::DriverMetadata(format!("invalid generic driver settings: {e}")))?;
        validate_settings(&settings)?;

        let catalog = settings.points.iter().map(to_data_point).collect();
        Ok(Arc::new(Self {
            metadata: DriverMetadata {
                name: settings.name.unwrap_or_else(|| "generic".to_string()),
                manufacturer: settings.manufacturer.unwrap_or_else(|| "unknown".to_string()),
                model: settings.model.unwrap_or_else(|| "register-map".to_string()),
            },
            transport: context.transport,
            slave_id: context.slave_id,
            points: settings.points,
            catalog,
        }))
    }

    fn register_point(&self, id: &str) -> Result<&RegisterPoint> {
        self.points
            .iter()
            .find(|point| point.id == id)
            .ok_or_else(|| GatewayError::UnknownDataPoints(vec![id.to_string()]))
    }

    async fn read_register_point(&self, point: &RegisterPoint) -> Result<Value> {
        let data_point = to_data_point(point);
        match point.table {
            RegisterTable::Holding => {
                let words = self
                    .transport
                    .read_holding_registers(self.slave_id, point.address, point.count)
                    .await?;
                decode_value(&data_point, &words)
            }
            RegisterTable::Input => {
                let words = self
                    .transport
                    .read_input_registers(self.slave_id, point.address, point.count)
                    .await?;
                decode_value(&data_point, &words)
            }
            RegisterTable::Coil => {
                let bits = self
                    .transport
                    .read_coils(self.slave_id, point.address, point.count)
                    .await?;
                Ok(Value::Bool(bits.first().copied().unwrap_or(false)))
            }
            RegisterTable::Discrete => {
                let bits = self
                    .transport
                    .read_discrete_inputs(self.slave_id, point.address, point.count)
                    .await?;
                Ok(Value::Bool(bits.first().copied().unwrap_or(false)))
            }
        }
    }
}

fn validate_settings(settings: &GenericDriverSettings) -> Result<()> {
    let mut seen = HashSet::new();
    for point in &settings.points {
        if !seen.insert(point.id.clone()) {
            return Err(GatewayError::DriverValidation {
                field: format!("points.{}", point.id),
                message: "duplicate data point id".to_string(),
            });
        }
        validate_point(point)?;
    }
    Ok(())
}

fn validate_point(point: &RegisterPoint) -> Result<()> {
    let expected = match point.kind {
        ValueKind::Float | ValueKind::Timestamp => Some(2),
        ValueKind::Boolean | ValueKind::Enum => Some(1),
        ValueKind::Integer | ValueKind::String => None,
    };
    if point.table.is_bit_table() && point.kind != ValueKind::Boolean {
        return Err(GatewayError::DriverValidation {
            field: format!("points.{}.kind", point.id),
            message: "coil and discrete points must be boolean".to_string(),
        });
    }
    if let Some(expected) = expected {
        if !point.table.is_bit_table() && point.count != expected {
            return Err(GatewayError::DriverValidation {
                field: format!("points.{}.count", point.id),
                message: format!("{:?} points need exactly {expected} register(s)", point.kind),
            });
        }
    }
    if point.kind == ValueKind::Integer && !matches!(point.count, 1 | 2) {
        return Err(GatewayError::DriverValidation {
            field: format!("points.{}.count", point.id),
            message: "integer points need 1 or 2 registers".to_string(),
        });
    }
    Ok(())
}

fn to_data_point(point: &RegisterPoint) -> DataPoint {
    DataPoint {
        id: point.id.clone(),
        kind: point.kind,
        access: point.access,
        unit: point.unit.clone(),
        decimals: point.decimals,
        min: point.min,
        max: point.max,
        enum_values: point.enum_values.clone(),
        poll: point.poll,
    }
}

/// One merged read request covering several contiguous points.
struct Batch<'a> {
    table: RegisterTable,
    start: u16,
    count: u16,
    points: Vec<&'a RegisterPoint>,
}

/// Sort by (table, address) and merge adjacent or overlapping spans so the
/// batch read issues the minimum number of bus requests it reasonably can.
fn plan_batches<'a>(points: &[&'a RegisterPoint]) -> Vec<Batch<'a>> {
    let mut sorted: Vec<&RegisterPoint> = points.to_vec();
    sorted.sort_by_key(|point| (point.table, point.address));

    let mut batches: Vec<Batch<'a>> = Vec::new();
    for point in sorted {
        let limit = if point.table.is_bit_table() {
            MAX_BIT_READ
        } else {
            MAX_REGISTER_READ
        };
        let end = point.address as u32 + point.count as u32;
        match batches.last_mut() {
            Some(batch)
                if batch.table == point.table
                    && point.address as u32 <= batch.start as u32 + batch.count as u32
                    && end - batch.start as u32 <= limit as u32 =>
            {
                batch.count = batch.count.max((end - batch.start as u32) as u16);
                batch.points.push(point);
            }
            _ => batches.push(Batch {
                table: point.table,
                start: point.address,
                count: point.count,
                points: vec![point],
            }),
        }
    }
    batches
}

#[async_trait]
impl Driver for GenericModbusDriver {
    fn metadata(&self) -> &DriverMetadata {
        &self.metadata
    }

    fn data_points(&self) -> &[DataPoint] {
        &self.catalog
    }

    async fn read_data_point(&self, id: &str) -> Result<Value> {
        let point = self.register_point(id)?;
        if !point.access.readable() {
            return Err(GatewayError::NotReadable(id.to_string()));
        }
        self.read_register_point(point).await
    }

    async fn write_data_point(&self, id: &str, value: Value) -> Result<()> {
        let point = self.register_point(id)?;
        if !point.access.writable() {
            return Err(GatewayError::NotWritable(id.to_string()));
        }
        match point.table {
            RegisterTable::Coil => {
                let flag = value
                    .as_bool()
                    .ok_or_else(|| GatewayError::Device(format!("coil {id} expects a boolean")))?;
                self.transport
                    .write_single_coil(self.slave_id, point.address, flag)
                    .await?;
            }
            RegisterTable::Holding => {
                let words = encode_value(&to_data_point(point), &value, point.count)?;
                if words.len() == 1 {
                    self.transport
                        .write_single_register(self.slave_id, point.address, words[0])
                        .await?;
                } else {
                    self.transport
                        .write_multiple_registers(self.slave_id, point.address, &words)
                        .await?;
                }
            }
            RegisterTable::Input | RegisterTable::Discrete => {
                return Err(GatewayError::NotWritable(id.to_string()));
            }
        }
        Ok(())
    }

    async fn read_data_points(&self, ids: &[String]) -> Result<HashMap<String, Value>> {
        let unknown: Vec<String> = ids
            .iter()
            .filter(|id| !self.points.iter().any(|point| &point.id == *id))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(GatewayError::UnknownDataPoints(unknown));
        }

        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            let point = self.register_point(id)?;
            if !point.access.readable() {
                return Err(GatewayError::NotReadable(id.clone()));
            }
            selected.push(point);
        }

        let mut values = HashMap::new();
        for batch in plan_batches(&selected) {
            if batch.table.is_bit_table() {
                let bits = match batch.table {
                    RegisterTable::Coil => {
                        self.transport
                            .read_coils(self.slave_id, batch.start, batch.count)
                            .await?
                    }
                    _ => {
                        self.transport
                            .read_discrete_inputs(self.slave_id, batch.start, batch.count)
                            .await?
                    }
                };
                for point in &batch.points {
                    let offset = (point.address - batch.start) as usize;
                    let bit = bits.get(offset).copied().unwrap_or(false);
                    values.insert(point.id.clone(), Value::Bool(bit));
                }
            } else {
                let words = match batch.table {
                    RegisterTable::Holding => {
                        self.transport
                            .read_holding_registers(self.slave_id, batch.start, batch.count)
                            .await?
                    }
                    _ => {
                        self.transport
                            .read_input_registers(self.slave_id, batch.start, batch.count)
                            .await?
                    }
                };
                for point in &batch.points {
                    let offset = (point.address - batch.start) as usize;
                    let slice = words
                        .get(offset..offset + point.count as usize)
                        .ok_or_else(|| {
                            GatewayError::Device(format!(
                                "short read for data point {} (wanted {} words at offset {offset})",
                                point.id, point.count
                            ))
                        })?;
                    values.insert(point.id.clone(), decode_value(&to_data_point(point), slice)?);
                }
            }
        }
        Ok(values)
    }
}
