//! Driver catalog and loader.
//!
//! Drivers are compile-time registered packages; the loader resolves a
//! package name (or auto-detects), caches resolutions, and cross-validates
//! declared defaults against supported link ranges.

pub mod codec;
pub mod generic;
pub mod simulator;

pub use generic::GenericModbusDriver;
pub use simulator::SimulatorDriver;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;

use domain::driver::{Driver, SupportedConfig};
use domain::link::{BAUD_RATES, LinkParams, Parity, SlaveId};
use domain::transport::Transport;
use domain::{GatewayError, Result};

/// Construction inputs handed to a driver factory. The driver must not
/// close the transport it receives.
pub struct DriverContext {
    pub transport: Arc<dyn Transport>,
    pub slave_id: SlaveId,
    pub settings: Value,
}

pub type DriverFactoryFn = fn(DriverContext) -> Result<Arc<dyn Driver>>;

/// Catalog entry describing one loadable driver package.
#[derive(Debug)]
pub struct DriverSpec {
    pub name: &'static str,
    pub factory: DriverFactoryFn,
    /// Link parameters a fresh device ships with, when the vendor documents them
    pub defaults: Option<LinkParams>,
    pub supported: Option<SupportedConfig>,
    pub known_models: &'static [&'static str],
}

/// Package names tried, in order, when no explicit driver was requested.
const AUTO_DETECT_CANDIDATES: [&str; 2] = ["generic", "sim"];

/// Alias prefix tried after the bare package name.
const PACKAGE_PREFIX: &str = "modbus-driver-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

pub struct DriverLoader {
    catalog: HashMap<String, Arc<DriverSpec>>,
    cache: Mutex<HashMap<String, Arc<DriverSpec>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DriverLoader {
    pub fn new() -> Self {
        Self::with_catalog(builtin_drivers())
    }

    pub fn with_catalog(specs: Vec<DriverSpec>) -> Self {
        let catalog = specs
            .into_iter()
            .map(|spec| (spec.name.to_string(), Arc::new(spec)))
            .collect();
        Self {
            catalog,
            cache: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolve a driver by package name, or auto-detect when `None`.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<DriverSpec>> {
        let requested = name.unwrap_or("auto").to_string();
        if let Some(spec) = self.cache.lock().unwrap().get(&requested) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(spec.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let spec = self
            .lookup(name)
            .ok_or_else(|| GatewayError::DriverNotFound(requested.clone()))?;
        let warnings = validate_spec(&spec)?;
        for warning in &warnings {
            warn!(driver = spec.name, "{warning}");
        }
        self.cache.lock().unwrap().insert(requested, spec.clone());
        Ok(spec)
    }

    fn lookup(&self, name: Option<&str>) -> Option<Arc<DriverSpec>> {
        match name {
            Some(name) => self
                .catalog
                .get(name)
                .or_else(|| self.catalog.get(&format!("{PACKAGE_PREFIX}{name}")))
                .cloned(),
            None => AUTO_DETECT_CANDIDATES
                .iter()
                .find_map(|candidate| self.catalog.get(*candidate).cloned()),
        }
    }

    /// Resolve and construct in one step.
    pub fn instantiate(&self, name: Option<&str>, context: DriverContext) -> Result<Arc<dyn Driver>> {
        let spec = self.resolve(name)?;
        (spec.factory)(context)
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.cache.lock().unwrap().len(),
        }
    }
}

impl Default for DriverLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Static checks plus default-vs-supported cross-validation. Hard failures
/// are validation errors; defaults outside the supported set only warn.
fn validate_spec(spec: &DriverSpec) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    if let Some(supported) = &spec.supported {
        if supported.baud_rates.is_empty() {
            return Err(GatewayError::DriverValidation {
                field: "supported.baud_rates".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if let Some(bad) = supported
            .baud_rates
            .iter()
            .find(|baud| !BAUD_RATES.contains(baud))
        {
            return Err(GatewayError::DriverValidation {
                field: "supported.baud_rates".to_string(),
                message: format!("unknown baud rate {bad}"),
            });
        }
        let (first, last) = supported.address_range;
        if first < SlaveId::MIN || last > SlaveId::MAX || first > last {
            return Err(GatewayError::DriverValidation {
                field: "supported.address_range".to_string(),
                message: format!("invalid range {first}..={last}"),
            });
        }
        if let Some(defaults) = &spec.defaults {
            if !supported.baud_rates.contains(&defaults.baud_rate) {
                warnings.push(format!(
                    "default baud rate {} outside the supported set",
                    defaults.baud_rate
                ));
            }
            if !supported.parities.contains(&defaults.parity) {
                warnings.push(format!(
                    "default parity {} outside the supported set",
                    defaults.parity
                ));
            }
            if !supported.data_bits.contains(&defaults.data_bits) {
                warnings.push(format!(
                    "default data bits {} outside the supported set",
                    defaults.data_bits
                ));
            }
            if !supported.stop_bits.contains(&defaults.stop_bits) {
                warnings.push(format!(
                    "default stop bits {} outside the supported set",
                    defaults.stop_bits
                ));
            }
        }
    }
    Ok(warnings)
}

fn builtin_drivers() -> Vec<DriverSpec> {
    vec![
        DriverSpec {
            name: "generic",
            factory: GenericModbusDriver::from_context,
            defaults: Some(LinkParams::default()),
            supported: None,
            known_models: &[],
        },
        DriverSpec {
            name: "sim",
            factory: SimulatorDriver::from_context,
            defaults: Some(LinkParams::default()),
            supported: Some(SupportedConfig {
                baud_rates: vec![9600, 19200],
                parities: vec![Parity::None],
                data_bits: vec![8],
                stop_bits: vec![1],
                address_range: (1, 247),
            }),
            known_models: &["SIM-100"],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_factory(_: DriverContext) -> Result<Arc<dyn Driver>> {
        Err(GatewayError::DriverMetadata("noop".to_string()))
    }

    #[test]
    fn test_resolve_known_driver() {
        let loader = DriverLoader::new();
        let spec = loader.resolve(Some("generic")).unwrap();
        assert_eq!(spec.name, "generic");
    }

    #[test]
    fn test_resolve_by_package_alias() {
        let loader = DriverLoader::new();
        let spec = loader.resolve(Some("modbus-driver-sim"));
        // bare name registered, prefixed alias falls through to it only when
        // the catalog carries the prefixed key; the reverse direction works
        assert!(spec.is_err());

        let loader = DriverLoader::with_catalog(vec![DriverSpec {
            name: "modbus-driver-ex9",
            factory: noop_factory,
            defaults: None,
            supported: None,
            known_models: &[],
        }]);
        assert!(loader.resolve(Some("ex9")).is_ok());
        assert!(loader.resolve(Some("modbus-driver-ex9")).is_ok());
    }

    #[test]
    fn test_auto_detect_prefers_generic() {
        let loader = DriverLoader::new();
        assert_eq!(loader.resolve(None).unwrap().name, "generic");
    }

    #[test]
    fn test_unknown_driver_not_found() {
        let loader = DriverLoader::new();
        let err = loader.resolve(Some("does-not-exist")).unwrap_err();
        assert_eq!(err, GatewayError::DriverNotFound("does-not-exist".to_string()));
    }

    #[test]
    fn test_cache_counters() {
        let loader = DriverLoader::new();
        assert_eq!(loader.stats(), LoaderStats { hits: 0, misses: 0, size: 0 });
        loader.resolve(Some("sim")).unwrap();
        loader.resolve(Some("sim")).unwrap();
        loader.resolve(Some("sim")).unwrap();
        let stats = loader.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_validation_rejects_empty_baud_set() {
        let loader = DriverLoader::with_catalog(vec![DriverSpec {
            name: "broken",
            factory: noop_factory,
            defaults: None,
            supported: Some(SupportedConfig {
                baud_rates: vec![],
                parities: vec![Parity::None],
                data_bits: vec![8],
                stop_bits: vec![1],
                address_range: (1, 247),
            }),
            known_models: &[],
        }]);
        let err = loader.resolve(Some("broken")).unwrap_err();
        assert!(
            matches!(err, GatewayError::DriverValidation { field, .. } if field == "supported.baud_rates")
        );
    }

    #[test]
    fn test_validation_rejects_bad_address_range() {
        let loader = DriverLoader::with_catalog(vec![DriverSpec {
            name: "broken",
            factory: noop_factory,
            defaults: None,
            supported: Some(SupportedConfig {
                baud_rates: vec![9600],
                parities: vec![Parity::None],
                data_bits: vec![8],
                stop_bits: vec![1],
                address_range: (0, 248),
            }),
            known_models: &[],
        }]);
        let err = loader.resolve(Some("broken")).unwrap_err();
        assert!(
            matches!(err, GatewayError::DriverValidation { field, .. } if field == "supported.address_range")
        );
    }

    #[test]
    fn test_defaults_outside_supported_only_warn() {
        let spec = DriverSpec {
            name: "warny",
            factory: noop_factory,
            defaults: Some(LinkParams::new(4800, Parity::Even, 8, 1).unwrap()),
            supported: Some(SupportedConfig {
                baud_rates: vec![9600],
                parities: vec![Parity::None],
                data_bits: vec![8],
                stop_bits: vec![1],
                address_range: (1, 247),
            }),
            known_models: &[],
        };
        let warnings = validate_spec(&spec).unwrap();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("baud rate 4800"));
        assert!(warnings[1].contains("parity even"));
    }
}
