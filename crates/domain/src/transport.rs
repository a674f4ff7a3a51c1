use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ModbusError;
use crate::link::{LinkParams, SlaveId};

/// Default per-request timeout when a config does not override it.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1000;

/// Objects returned by FC43 Read Device Identification, keyed by object id
/// (0 = vendor name, 1 = product code, 2 = revision).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdObjects {
    pub objects: BTreeMap<u8, String>,
}

impl DeviceIdObjects {
    pub fn vendor_name(&self) -> Option<&str> {
        self.objects.get(&0).map(String::as_str)
    }

    pub fn product_code(&self) -> Option<&str> {
        self.objects.get(&1).map(String::as_str)
    }

    pub fn revision(&self) -> Option<&str> {
        self.objects.get(&2).map(String::as_str)
    }
}

/// Uniform Modbus request API over one RTU or TCP link.
///
/// Implementations serialise all requests on the link; concurrent callers
/// observe FIFO ordering. The slave id travels with every request because a
/// serial bus multiplexes many servers over one port.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn read_coils(
        &self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, ModbusError>;

    async fn read_discrete_inputs(
        &self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, ModbusError>;

    async fn read_holding_registers(
        &self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError>;

    async fn read_input_registers(
        &self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError>;

    async fn write_single_coil(
        &self,
        slave: SlaveId,
        address: u16,
        value: bool,
    ) -> Result<(), ModbusError>;

    async fn write_single_register(
        &self,
        slave: SlaveId,
        address: u16,
        value: u16,
    ) -> Result<(), ModbusError>;

    async fn write_multiple_registers(
        &self,
        slave: SlaveId,
        address: u16,
        values: &[u16],
    ) -> Result<(), ModbusError>;

    /// FC43 / MEI 14 Read Device Identification, basic category, starting at
    /// `object_id`.
    async fn read_device_identification(
        &self,
        slave: SlaveId,
        object_id: u8,
    ) -> Result<DeviceIdObjects, ModbusError>;

    /// Replace the per-request timeout for all subsequent requests.
    fn set_timeout(&self, timeout: Duration);

    /// Idempotent and safe to call from any state.
    async fn close(&self) -> Result<(), ModbusError>;
}

/// Opens transports for the registry and the discovery scanner.
///
/// A serial port is an exclusive resource: callers must close the transport
/// bound to one set of link parameters before opening the next.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open_rtu(
        &self,
        port: &str,
        link: &LinkParams,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>, ModbusError>;

    async fn open_tcp(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>, ModbusError>;
}
