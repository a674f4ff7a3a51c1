use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;
use crate::link::{LinkParams, Parity};
use crate::point::DataPoint;

/// Driver identity triple shown in logs and discovery output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverMetadata {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

/// Link parameter ranges a device family is known to honour.
///
/// The quick scan strategy narrows its candidate space to these sets when a
/// driver supplies them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportedConfig {
    pub baud_rates: Vec<u32>,
    pub parities: Vec<Parity>,
    pub data_bits: Vec<u8>,
    pub stop_bits: Vec<u8>,
    /// Inclusive slave address range, within 1..=247
    pub address_range: (u8, u8),
}

impl SupportedConfig {
    /// Whether a set of link defaults falls inside every supported range.
    pub fn covers(&self, link: &LinkParams) -> bool {
        self.baud_rates.contains(&link.baud_rate)
            && self.parities.contains(&link.parity)
            && self.data_bits.contains(&link.data_bits)
            && self.stop_bits.contains(&link.stop_bits)
    }
}

/// Device-type plug-in contract.
///
/// A driver receives its transport at construction and must never close it;
/// the registry owns transport lifecycles.
#[async_trait]
pub trait Driver: Send + Sync {
    fn metadata(&self) -> &DriverMetadata;

    /// Immutable data-point catalog.
    fn data_points(&self) -> &[DataPoint];

    async fn read_data_point(&self, id: &str) -> Result<Value>;

    async fn write_data_point(&self, id: &str, value: Value) -> Result<()>;

    /// Batch read returning an id -> value mapping.
    ///
    /// Implementations group register-contiguous points to issue the minimum
    /// number of transport requests they reasonably can, and fail with
    /// "unknown data points: ..." when any id is not in the catalog.
    async fn read_data_points(&self, ids: &[String]) -> Result<HashMap<String, Value>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supported() -> SupportedConfig {
        SupportedConfig {
            baud_rates: vec![9600, 19200],
            parities: vec![Parity::None],
            data_bits: vec![8],
            stop_bits: vec![1],
            address_range: (1, 247),
        }
    }

    #[test]
    fn test_supported_config_covers_defaults() {
        assert!(supported().covers(&LinkParams::default()));
    }

    #[test]
    fn test_supported_config_rejects_outside_range() {
        let link = LinkParams::new(4800, Parity::None, 8, 1).unwrap();
        assert!(!supported().covers(&link));
        let link = LinkParams::new(9600, Parity::Even, 8, 1).unwrap();
        assert!(!supported().covers(&link));
    }
}
