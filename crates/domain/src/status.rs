use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl BridgeState {
    /// Check if state allows a start attempt
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Check if in a transitional state
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }

    /// Transition to starting state
    pub fn to_starting(&self) -> Result<Self, &'static str> {
        match self {
            Self::Stopped | Self::Error => Ok(Self::Starting),
            _ => Err("Can only start from Stopped or Error state"),
        }
    }

    /// Transition to running state
    pub fn to_running(&self) -> Result<Self, &'static str> {
        match self {
            Self::Starting => Ok(Self::Running),
            _ => Err("Can only complete startup from Starting state"),
        }
    }

    /// Transition to stopping state
    pub fn to_stopping(&self) -> Result<Self, &'static str> {
        match self {
            Self::Starting | Self::Running | Self::Error => Ok(Self::Stopping),
            _ => Err("Can only stop from Starting, Running or Error state"),
        }
    }

    /// Transition to stopped state
    pub fn to_stopped(&self) -> Self {
        Self::Stopped
    }

    /// Transition to error state
    pub fn to_error(&self) -> Self {
        Self::Error
    }
}

impl Default for BridgeState {
    fn default() -> Self {
        Self::Stopped
    }
}

/// Cap on the bridge's recent-error list.
pub const STATUS_ERROR_CAP: usize = 64;

/// Bounded in-memory error log shared between the bridge and its
/// collaborators (MQTT dispatch, poll sink).
#[derive(Debug, Default)]
pub struct ErrorLog {
    entries: Mutex<VecDeque<String>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap();
        entries.push_back(message.into());
        while entries.len() > STATUS_ERROR_CAP {
            entries.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Point-in-time report of the bridge.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub state: BridgeState,
    pub timestamp: DateTime<Utc>,
    pub errors: Vec<String>,
    pub device_count: usize,
    pub mqtt_connected: bool,
}
