//! Modbus transports over serial RTU and TCP links

mod link;

pub use link::ModbusLink;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use domain::ModbusError;
use domain::link::LinkParams;
use domain::transport::{DeviceIdObjects, Transport, TransportFactory};

/// Classifies link failures by inspecting what the underlying stack reports.
///
/// Substring-driven on purpose: serial back-ends disagree on error types but
/// agree on wording for timeouts and CRC failures.
pub(crate) fn classify_failure(err: impl std::fmt::Display) -> ModbusError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        ModbusError::Timeout
    } else if lower.contains("crc") || lower.contains("checksum") {
        ModbusError::Crc(message)
    } else if lower.contains("refused")
        || lower.contains("reset")
        || lower.contains("broken pipe")
        || lower.contains("no such file")
        || lower.contains("permission denied")
        || lower.contains("busy")
        || lower.contains("not connected")
    {
        ModbusError::Connection(message)
    } else {
        ModbusError::Other(message)
    }
}

/// Parses an FC43 / MEI 14 Read Device Identification response PDU (after
/// the function code byte): MEI type, read code, conformity level,
/// more-follows, next object id, object count, then (id, length, bytes)
/// triples.
pub(crate) fn parse_device_identification(payload: &[u8]) -> Result<DeviceIdObjects, ModbusError> {
    if payload.len() < 6 || payload[0] != 0x0e {
        return Err(ModbusError::Other(format!(
            "malformed device identification response ({} bytes)",
            payload.len()
        )));
    }
    let object_count = payload[5] as usize;
    let mut objects = BTreeMap::new();
    let mut offset = 6;
    for _ in 0..object_count {
        if offset + 2 > payload.len() {
            break;
        }
        let id = payload[offset];
        let length = payload[offset + 1] as usize;
        offset += 2;
        if offset + length > payload.len() {
            break;
        }
        let value = String::from_utf8_lossy(&payload[offset..offset + length]).to_string();
        objects.insert(id, value);
        offset += length;
    }
    Ok(DeviceIdObjects { objects })
}

/// Opens real transports for the bridge and the discovery CLI.
pub struct TransportManager;

#[async_trait]
impl TransportFactory for TransportManager {
    async fn open_rtu(
        &self,
        port: &str,
        link: &LinkParams,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>, ModbusError> {
        Ok(Arc::new(ModbusLink::open_serial(port, link, timeout).await?))
    }

    async fn open_tcp(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>, ModbusError> {
        Ok(Arc::new(ModbusLink::connect_tcp(host, port, timeout).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_timeout_messages() {
        assert_eq!(
            classify_failure("Operation timed out"),
            ModbusError::Timeout
        );
        assert_eq!(classify_failure("read timeout"), ModbusError::Timeout);
    }

    #[test]
    fn test_classify_crc_messages() {
        assert!(matches!(
            classify_failure("Invalid CRC in response"),
            ModbusError::Crc(_)
        ));
        assert!(matches!(
            classify_failure("frame checksum mismatch"),
            ModbusError::Crc(_)
        ));
    }

    #[test]
    fn test_classify_connection_messages() {
        assert!(matches!(
            classify_failure("Connection refused (os error 111)"),
            ModbusError::Connection(_)
        ));
        assert!(matches!(
            classify_failure("No such file or directory"),
            ModbusError::Connection(_)
        ));
        assert!(matches!(
            classify_failure("Device or resource busy"),
            ModbusError::Connection(_)
        ));
    }

    #[test]
    fn test_classify_falls_back_to_other() {
        assert!(matches!(
            classify_failure("something unexpected"),
            ModbusError::Other(_)
        ));
    }

    fn fc43_payload(objects: &[(u8, &str)]) -> Vec<u8> {
        let mut payload = vec![0x0e, 0x01, 0x01, 0x00, 0x00, objects.len() as u8];
        for (id, value) in objects {
            payload.push(*id);
            payload.push(value.len() as u8);
            payload.extend_from_slice(value.as_bytes());
        }
        payload
    }

    #[test]
    fn test_parse_device_identification_objects() {
        let payload = fc43_payload(&[(0, "Vendor"), (1, "PC-100"), (2, "1.4")]);
        let parsed = parse_device_identification(&payload).unwrap();
        assert_eq!(parsed.vendor_name(), Some("Vendor"));
        assert_eq!(parsed.product_code(), Some("PC-100"));
        assert_eq!(parsed.revision(), Some("1.4"));
    }

    #[test]
    fn test_parse_device_identification_rejects_short_payload() {
        assert!(parse_device_identification(&[0x0e, 0x01]).is_err());
        assert!(parse_device_identification(&[]).is_err());
    }

    #[test]
    fn test_parse_device_identification_rejects_wrong_mei_type() {
        let mut payload = fc43_payload(&[(0, "Vendor")]);
        payload[0] = 0x0d;
        assert!(parse_device_identification(&payload).is_err());
    }

    #[test]
    fn test_parse_device_identification_tolerates_truncated_object() {
        // Count claims two objects but only one is fully present
        let mut payload = fc43_payload(&[(0, "Vendor")]);
        payload[5] = 2;
        let parsed = parse_device_identification(&payload).unwrap();
        assert_eq!(parsed.vendor_name(), Some("Vendor"));
        assert_eq!(parsed.product_code(), None);
    }
}
