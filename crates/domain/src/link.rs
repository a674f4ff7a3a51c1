use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Baud rates a serial scan may enumerate, in ascending order.
pub const BAUD_RATES: [u32; 8] = [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Parity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Even => "even",
            Self::Odd => "odd",
        }
    }

    /// Single-letter form used in link shorthand like `9600-8N1`.
    pub fn letter(&self) -> char {
        match self {
            Self::None => 'N',
            Self::Even => 'E',
            Self::Odd => 'O',
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serial link parameters a transport is bound to for its lifetime.
///
/// Two values are equal iff all four fields agree; the discovery scanner
/// relies on this to reuse one open port per group of candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkParams {
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
}

impl LinkParams {
    pub fn new(
        baud_rate: u32,
        parity: Parity,
        data_bits: u8,
        stop_bits: u8,
    ) -> Result<Self, GatewayError> {
        let params = Self {
            baud_rate,
            parity,
            data_bits,
            stop_bits,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if !BAUD_RATES.contains(&self.baud_rate) {
            return Err(GatewayError::Config(format!(
                "invalid baud rate: {}",
                self.baud_rate
            )));
        }
        if !matches!(self.data_bits, 7 | 8) {
            return Err(GatewayError::Config(format!(
                "invalid data bits: {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(GatewayError::Config(format!(
                "invalid stop bits: {}",
                self.stop_bits
            )));
        }
        Ok(())
    }
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: 1,
        }
    }
}

impl fmt::Display for LinkParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}{}{}",
            self.baud_rate,
            self.data_bits,
            self.parity.letter(),
            self.stop_bits
        )
    }
}

/// Modbus server address on a shared bus, valid range 1..=247.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SlaveId(u8);

impl SlaveId {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 247;

    pub fn new(value: u8) -> Result<Self, GatewayError> {
        if value < Self::MIN || value > Self::MAX {
            return Err(GatewayError::Config(format!(
                "invalid slave id {value}: must be in 1..=247"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for SlaveId {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SlaveId> for u8 {
    fn from(id: SlaveId) -> Self {
        id.0
    }
}

impl fmt::Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One (link parameters, slave id) combination probed during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub link: LinkParams,
    pub slave_id: SlaveId,
}
