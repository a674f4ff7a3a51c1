use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Value type of a data point as exposed over MQTT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Integer,
    Float,
    Boolean,
    Enum,
    String,
    Timestamp,
}

/// Access mode of a data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "w")]
    Write,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl Access {
    pub fn readable(&self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// When the scheduler should read a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PollClass {
    /// Read once, never changes (serial numbers, firmware revisions)
    Static,
    /// Read on every poll tick
    #[default]
    Periodic,
    /// Read only when explicitly requested
    OnDemand,
}

/// A driver-visible value mapped onto one or more contiguous Modbus registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub id: String,
    pub kind: ValueKind,
    pub access: Access,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Raw register value to label, only meaningful for `ValueKind::Enum`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<BTreeMap<u16, String>>,
    #[serde(default)]
    pub poll: PollClass,
}

impl DataPoint {
    /// A readable point with default metadata; builder-style setters below.
    pub fn readable(id: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            id: id.into(),
            kind,
            access: Access::Read,
            unit: None,
            decimals: None,
            min: None,
            max: None,
            enum_values: None,
            poll: PollClass::Periodic,
        }
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_poll(mut self, poll: PollClass) -> Self {
        self.poll = poll;
        self
    }
}
