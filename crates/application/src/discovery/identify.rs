use std::time::{Duration, Instant};

use domain::driver::Driver;
use domain::link::SlaveId;
use domain::probe::{Identification, ProbeOutcome, ProbeResult};
use domain::transport::Transport;
use domain::{GatewayError, ModbusError};
use tracing::debug;

fn result(outcome: ProbeOutcome, started: Instant, identification: Identification) -> ProbeResult {
    ProbeResult {
        outcome,
        response_time_ms: started.elapsed().as_millis() as u64,
        identification,
    }
}

/// Probe a single slave address on an already-open transport.
///
/// Strategy, stopping at the first conclusive outcome:
/// 1. a readable data point of the supplied driver, if any - a response
///    (value or exception) proves presence, a timeout proves absence;
/// 2. FC43 Read Device Identification, which also yields vendor, product
///    code and revision when the device supports it;
/// 3. FC04 input register at address 1, then address 0 on exception;
/// 4. FC03 holding register at address 0;
/// 5. classify whatever the final attempt reported.
///
/// The per-request timeout is set once, up front. Response time is measured
/// wall-clock around the last attempt made.
pub async fn identify(
    transport: &dyn Transport,
    slave_id: SlaveId,
    timeout: Duration,
    driver: Option<&dyn Driver>,
) -> ProbeResult {
    transport.set_timeout(timeout);

    if let Some(driver) = driver {
        if let Some(point) = driver.data_points().iter().find(|p| p.access.readable()) {
            let started = Instant::now();
            match driver.read_data_point(&point.id).await {
                Ok(_) => {
                    let metadata = driver.metadata();
                    return result(
                        ProbeOutcome::Present,
                        started,
                        Identification {
                            vendor_name: Some(metadata.manufacturer.clone()),
                            model: Some(metadata.model.clone()),
                            ..Identification::default()
                        },
                    );
                }
                Err(GatewayError::Modbus(ModbusError::Exception(code))) => {
                    return result(
                        ProbeOutcome::PresentWithException { code },
                        started,
                        Identification::default(),
                    );
                }
                Err(GatewayError::Modbus(ModbusError::Timeout)) => {
                    return result(
                        ProbeOutcome::NotPresentTimeout,
                        started,
                        Identification::default(),
                    );
                }
                Err(err) => {
                    debug!(slave = %slave_id, error = %err, "driver probe inconclusive");
                }
            }
        }
    }

    let started = Instant::now();
    match transport.read_device_identification(slave_id, 0).await {
        Ok(objects) => {
            return result(
                ProbeOutcome::Present,
                started,
                Identification {
                    vendor_name: objects.vendor_name().map(str::to_string),
                    product_code: objects.product_code().map(str::to_string),
                    revision: objects.revision().map(str::to_string),
                    model: None,
                    supports_fc43: true,
                },
            );
        }
        Err(ModbusError::Exception(code)) => {
            // answered, just without FC43 support
            return result(
                ProbeOutcome::PresentWithException { code },
                started,
                Identification::default(),
            );
        }
        Err(err) => {
            debug!(slave = %slave_id, error = %err, "FC43 probe inconclusive");
        }
    }

    let started = Instant::now();
    match transport.read_input_registers(slave_id, 1, 1).await {
        Ok(_) => {
            return result(ProbeOutcome::Present, started, Identification::default());
        }
        Err(ModbusError::Exception(first_code)) => {
            // the exception already proved presence; address 0 may still
            // yield a clean read
            let retry_started = Instant::now();
            let outcome = match transport.read_input_registers(slave_id, 0, 1).await {
                Ok(_) => ProbeOutcome::Present,
                Err(ModbusError::Exception(code)) => ProbeOutcome::PresentWithException { code },
                Err(_) => ProbeOutcome::PresentWithException { code: first_code },
            };
            return result(outcome, retry_started, Identification::default());
        }
        Err(err) => {
            debug!(slave = %slave_id, error = %err, "FC04 probe inconclusive");
        }
    }

    let started = Instant::now();
    match transport.read_holding_registers(slave_id, 0, 1).await {
        Ok(_) => result(ProbeOutcome::Present, started, Identification::default()),
        Err(ModbusError::Exception(code)) => result(
            ProbeOutcome::PresentWithException { code },
            started,
            Identification::default(),
        ),
        Err(ModbusError::Timeout) => result(
            ProbeOutcome::NotPresentTimeout,
            started,
            Identification::default(),
        ),
        Err(ModbusError::Crc(_)) => result(
            ProbeOutcome::NotPresentCrc,
            started,
            Identification::default(),
        ),
        Err(_) => result(
            ProbeOutcome::NotPresentOther,
            started,
            Identification::default(),
        ),
    }
}
