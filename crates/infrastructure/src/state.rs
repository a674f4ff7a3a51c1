//! Optional on-disk snapshots of the running configuration.
//!
//! The schema is deliberately unstable: plain serde_json dumps, best effort,
//! meant for operators peeking at what the bridge currently manages.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use domain::device::DeviceConfig;

pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn save_devices(&self, devices: &[DeviceConfig]) -> Result<()> {
        self.write_json("devices.json", devices)
    }

    pub fn load_devices(&self) -> Result<Vec<DeviceConfig>> {
        let path = self.dir.join("devices.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save_subscriptions(&self, topics: &[String]) -> Result<()> {
        self.write_json("subscriptions.json", topics)
    }

    fn write_json<T: serde::Serialize + ?Sized>(&self, file: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create state dir {}", self.dir.display()))?;
        let path = self.dir.join(file);
        let raw = serde_json::to_vec_pretty(value)?;
        fs::write(&path, raw).with_context(|| format!("failed to write {}", path.display()))
    }
}
