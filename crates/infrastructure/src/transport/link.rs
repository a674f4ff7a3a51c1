use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::timeout as with_timeout;
use tokio_modbus::client::{Client, Context};
use tokio_modbus::prelude::*;
use tokio_modbus::{Request, Response};
use tokio_serial::SerialStream;
use tracing::debug;

use domain::ModbusError;
use domain::link::{LinkParams, Parity, SlaveId};
use domain::transport::{DeviceIdObjects, Transport};

use super::{classify_failure, parse_device_identification};

/// One open Modbus link, serial RTU or TCP, shared behind an `Arc`.
///
/// The interior mutex serialises requests; concurrent callers queue in FIFO
/// order. The link stays bound to the parameters it was opened with; only
/// the slave id varies per request, because a serial bus multiplexes many
/// servers over one port.
pub struct ModbusLink {
    context: TokioMutex<Option<Context>>,
    timeout_ms: AtomicU64,
    description: String,
}

// LinkParams are validated before reaching these conversions
fn to_data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn to_parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

fn to_stop_bits(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

fn closed() -> ModbusError {
    ModbusError::Connection("link is closed".to_string())
}

impl ModbusLink {
    pub async fn open_serial(
        port: &str,
        link: &LinkParams,
        timeout: Duration,
    ) -> Result<Self, ModbusError> {
        link.validate()
            .map_err(|e| ModbusError::Connection(e.to_string()))?;

        let builder = tokio_serial::new(port, link.baud_rate)
            .data_bits(to_data_bits(link.data_bits))
            .parity(to_parity(link.parity))
            .stop_bits(to_stop_bits(link.stop_bits))
            .timeout(timeout);

        let stream = SerialStream::open(&builder).map_err(|e| {
            ModbusError::Connection(format!("failed to open serial port {port}: {e}"))
        })?;

        // The attached slave is a placeholder; every request sets its own.
        let context = tokio_modbus::client::rtu::attach_slave(stream, Slave(SlaveId::MIN));
        Ok(Self::new(context, timeout, format!("{port}@{link}")))
    }

    pub async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<Self, ModbusError> {
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(classify_failure)?
            .next()
            .ok_or_else(|| ModbusError::Connection(format!("cannot resolve host {host}")))?;

        let context = with_timeout(timeout, tokio_modbus::client::tcp::connect(addr))
            .await
            .map_err(|_| ModbusError::Timeout)?
            .map_err(classify_failure)?;
        Ok(Self::new(context, timeout, format!("{host}:{port}")))
    }

    fn new(context: Context, timeout: Duration, description: String) -> Self {
        Self {
            context: TokioMutex::new(Some(context)),
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
            description,
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl Transport for ModbusLink {
    async fn read_coils(
        &self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        let timeout = self.request_timeout();
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or_else(closed)?;
        ctx.set_slave(Slave(slave.value()));
        match with_timeout(timeout, ctx.read_coils(address, count)).await {
            Ok(Ok(Ok(bits))) => Ok(bits),
            Ok(Ok(Err(exception))) => Err(ModbusError::Exception(exception as u8)),
            Ok(Err(err)) => Err(classify_failure(err)),
            Err(_) => Err(ModbusError::Timeout),
        }
    }

    async fn read_discrete_inputs(
        &self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        let timeout = self.request_timeout();
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or_else(closed)?;
        ctx.set_slave(Slave(slave.value()));
        match with_timeout(timeout, ctx.read_discrete_inputs(address, count)).await {
            Ok(Ok(Ok(bits))) => Ok(bits),
            Ok(Ok(Err(exception))) => Err(ModbusError::Exception(exception as u8)),
            Ok(Err(err)) => Err(classify_failure(err)),
            Err(_) => Err(ModbusError::Timeout),
        }
    }

    async fn read_holding_registers(
        &self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let timeout = self.request_timeout();
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or_else(closed)?;
        ctx.set_slave(Slave(slave.value()));
        match with_timeout(timeout, ctx.read_holding_registers(address, count)).await {
            Ok(Ok(Ok(words))) => Ok(words),
            Ok(Ok(Err(exception))) => Err(ModbusError::Exception(exception as u8)),
            Ok(Err(err)) => Err(classify_failure(err)),
            Err(_) => Err(ModbusError::Timeout),
        }
    }

    async fn read_input_registers(
        &self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let timeout = self.request_timeout();
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or_else(closed)?;
        ctx.set_slave(Slave(slave.value()));
        match with_timeout(timeout, ctx.read_input_registers(address, count)).await {
            Ok(Ok(Ok(words))) => Ok(words),
            Ok(Ok(Err(exception))) => Err(ModbusError::Exception(exception as u8)),
            Ok(Err(err)) => Err(classify_failure(err)),
            Err(_) => Err(ModbusError::Timeout),
        }
    }

    async fn write_single_coil(
        &self,
        slave: SlaveId,
        address: u16,
        value: bool,
    ) -> Result<(), ModbusError> {
        let timeout = self.request_timeout();
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or_else(closed)?;
        ctx.set_slave(Slave(slave.value()));
        match with_timeout(timeout, ctx.write_single_coil(address, value)).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(exception))) => Err(ModbusError::Exception(exception as u8)),
            Ok(Err(err)) => Err(classify_failure(err)),
            Err(_) => Err(ModbusError::Timeout),
        }
    }

    async fn write_single_register(
        &self,
        slave: SlaveId,
        address: u16,
        value: u16,
    ) -> Result<(), ModbusError> {
        let timeout = self.request_timeout();
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or_else(closed)?;
        ctx.set_slave(Slave(slave.value()));
        match with_timeout(timeout, ctx.write_single_register(address, value)).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(exception))) => Err(ModbusError::Exception(exception as u8)),
            Ok(Err(err)) => Err(classify_failure(err)),
            Err(_) => Err(ModbusError::Timeout),
        }
    }

    async fn write_multiple_registers(
        &self,
        slave: SlaveId,
        address: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        let timeout = self.request_timeout();
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or_else(closed)?;
        ctx.set_slave(Slave(slave.value()));
        match with_timeout(timeout, ctx.write_multiple_registers(address, values)).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(exception))) => Err(ModbusError::Exception(exception as u8)),
            Ok(Err(err)) => Err(classify_failure(err)),
            Err(_) => Err(ModbusError::Timeout),
        }
    }

    async fn read_device_identification(
        &self,
        slave: SlaveId,
        object_id: u8,
    ) -> Result<DeviceIdObjects, ModbusError> {
        let timeout = self.request_timeout();
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or_else(closed)?;
        ctx.set_slave(Slave(slave.value()));
        // FC 0x2B, MEI type 0x0E, read code 0x01 (basic category)
        let request = Request::Custom(0x2b, Cow::Owned(vec![0x0e, 0x01, object_id]));
        match with_timeout(timeout, ctx.call(request)).await {
            Ok(Ok(Ok(Response::Custom(_, payload)))) => parse_device_identification(&payload),
            Ok(Ok(Ok(other))) => Err(ModbusError::Other(format!(
                "unexpected device identification response: {other:?}"
            ))),
            Ok(Ok(Err(exception))) => Err(ModbusError::Exception(exception as u8)),
            Ok(Err(err)) => Err(classify_failure(err)),
            Err(_) => Err(ModbusError::Timeout),
        }
    }

    fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    async fn close(&self) -> Result<(), ModbusError> {
        let mut guard = self.context.lock().await;
        if let Some(mut ctx) = guard.take() {
            debug!(link = %self.description, "closing modbus link");
            let _ = ctx.disconnect().await;
        }
        Ok(())
    }
}
