use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::link::{LinkParams, SlaveId};
use crate::transport::DEFAULT_REQUEST_TIMEOUT_MS;

fn default_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_tcp_port() -> u16 {
    502
}

fn default_enabled() -> bool {
    true
}

/// How a device is reached on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionSpec {
    Rtu {
        port: String,
        #[serde(default)]
        link: LinkParams,
        slave_id: SlaveId,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
        slave_id: SlaveId,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

impl ConnectionSpec {
    pub fn slave_id(&self) -> SlaveId {
        match self {
            Self::Rtu { slave_id, .. } | Self::Tcp { slave_id, .. } => *slave_id,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            Self::Rtu { timeout_ms, .. } | Self::Tcp { timeout_ms, .. } => {
                Duration::from_millis(*timeout_ms)
            }
        }
    }
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

/// Poll cadence and failure back-off for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingSpec {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for PollingSpec {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Static configuration of one managed device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    /// Driver package name resolved by the loader
    pub driver: String,
    pub connection: ConnectionSpec,
    #[serde(default)]
    pub polling: PollingSpec,
    /// Driver-specific settings passed through to the factory
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Mutable runtime state of a registered device.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceState {
    pub last_poll: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub recent_errors: VecDeque<String>,
    pub connected: bool,
}

impl DeviceState {
    /// Cap on `recent_errors`; older entries are dropped first.
    pub const ERROR_CAP: usize = 16;

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.last_update = Some(now);
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.recent_errors.push_back(message.into());
        while self.recent_errors.len() > Self::ERROR_CAP {
            self.recent_errors.pop_front();
        }
    }
}

/// Read-only view of a registry entry handed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub config: DeviceConfig,
    pub state: DeviceState,
}
