use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use domain::Result;
use domain::link::{Candidate, LinkParams, SlaveId};
use domain::probe::{DiscoveredDevice, TestAttempt};
use domain::transport::{Transport, TransportFactory};
use infrastructure::drivers::{DriverContext, DriverSpec};

use super::identify::identify;
use super::params::ParameterSpace;

/// Scan tuning knobs. `max_devices` of 0 means scan everything.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub port: String,
    pub timeout_ms: u64,
    pub delay_ms: u64,
    pub max_devices: usize,
    pub verbose: bool,
}

impl ScanOptions {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            timeout_ms: 1000,
            delay_ms: 100,
            max_devices: 1,
            verbose: false,
        }
    }
}

/// Callbacks reporting scan progress. Errors returned here abort the scan
/// after the currently held transport has been released.
pub trait ScanObserver: Send + Sync {
    fn on_progress(&self, _current: usize, _total: usize, _found: usize) -> Result<()> {
        Ok(())
    }

    fn on_device_found(&self, _device: &DiscoveredDevice) -> Result<()> {
        Ok(())
    }

    fn on_test_attempt(&self, _candidate: &Candidate, _state: TestAttempt) -> Result<()> {
        Ok(())
    }
}

/// Observer for library callers that only want the result list.
pub struct NullObserver;

impl ScanObserver for NullObserver {}

enum GroupOutcome {
    Continue,
    Stop,
}

/// Walks the candidate space of a serial bus, reusing one open port per
/// link-parameter group, and collects every responsive address.
pub struct DiscoveryScanner {
    transports: Arc<dyn TransportFactory>,
    probe_driver: Option<Arc<DriverSpec>>,
}

impl DiscoveryScanner {
    pub fn new(transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            transports,
            probe_driver: None,
        }
    }

    /// Probe through a driver's readable data point before the generic
    /// function-code sequence.
    pub fn with_probe_driver(mut self, spec: Arc<DriverSpec>) -> Self {
        self.probe_driver = Some(spec);
        self
    }

    pub async fn scan(
        &self,
        space: &ParameterSpace,
        options: &ScanOptions,
        observer: &dyn ScanObserver,
    ) -> Result<Vec<DiscoveredDevice>> {
        let total = space.total();
        let timeout = Duration::from_millis(options.timeout_ms);
        let mut found: Vec<DiscoveredDevice> = Vec::new();
        let mut position = 0usize;

        info!(port = %options.port, total, "starting bus scan");

        for (link, slave_ids) in space.groups() {
            let transport = match self.transports.open_rtu(&options.port, &link, timeout).await {
                Ok(transport) => transport,
                Err(err) => {
                    if options.verbose {
                        warn!(
                            port = %options.port,
                            baud = link.baud_rate,
                            error = %err,
                            "failed to open serial port, skipping group"
                        );
                    }
                    // keep the progress arithmetic adding up to `total`
                    for _ in &slave_ids {
                        position += 1;
                        observer.on_progress(position, total, found.len())?;
                    }
                    continue;
                }
            };

            let outcome = self
                .scan_group(
                    transport.clone(),
                    &link,
                    &slave_ids,
                    options,
                    observer,
                    total,
                    &mut position,
                    &mut found,
                )
                .await;

            // The port is exclusive: release it before the next group, and
            // before any observer error propagates.
            if let Err(err) = transport.close().await {
                warn!(error = %err, "failed to close transport after group");
            }
            match outcome? {
                GroupOutcome::Stop => break,
                GroupOutcome::Continue => {}
            }
        }

        info!(found = found.len(), scanned = position, "bus scan finished");
        Ok(found)
    }

    #[allow(clippy::too_many_arguments)]
    async fn scan_group(
        &self,
        transport: Arc<dyn Transport>,
        link: &LinkParams,
        slave_ids: &[SlaveId],
        options: &ScanOptions,
        observer: &dyn ScanObserver,
        total: usize,
        position: &mut usize,
        found: &mut Vec<DiscoveredDevice>,
    ) -> Result<GroupOutcome> {
        for &slave_id in slave_ids {
            let candidate = Candidate {
                link: *link,
                slave_id,
            };
            observer.on_test_attempt(&candidate, TestAttempt::Testing)?;

            let attempt_started = Instant::now();
            let driver = self.probe_driver.as_ref().and_then(|spec| {
                (spec.factory)(DriverContext {
                    transport: transport.clone(),
                    slave_id,
                    settings: Value::Null,
                })
                .ok()
            });
            let probe = identify(
                transport.as_ref(),
                slave_id,
                Duration::from_millis(options.timeout_ms),
                driver.as_deref(),
            )
            .await;

            *position += 1;
            if probe.outcome.is_present() {
                let device = DiscoveredDevice {
                    slave_id,
                    link: *link,
                    probe,
                };
                debug!(slave = %slave_id, link = %link, "device found");
                found.push(device.clone());
                observer.on_device_found(&device)?;
                observer.on_test_attempt(&candidate, TestAttempt::Found)?;
            } else {
                observer.on_test_attempt(&candidate, TestAttempt::NotFound)?;
            }
            observer.on_progress(*position, total, found.len())?;

            if options.max_devices > 0 && found.len() >= options.max_devices {
                // terminating: skip the remaining candidates and the delay
                return Ok(GroupOutcome::Stop);
            }

            // keep each slot at least delay_ms long, even for fast answers
            let elapsed = attempt_started.elapsed();
            let delay = Duration::from_millis(options.delay_ms);
            if delay > elapsed {
                sleep(delay - elapsed).await;
            }
        }
        Ok(GroupOutcome::Continue)
    }
}
