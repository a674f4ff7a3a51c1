use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use domain::GatewayError;
use domain::device::PollingSpec;
use domain::driver::Driver;
use domain::point::PollClass;

/// Receives poll results; implemented by the bridge.
#[async_trait]
pub trait PollSink: Send + Sync {
    async fn on_data(&self, device_id: &str, values: HashMap<String, Value>);

    async fn on_error(&self, device_id: &str, error: GatewayError);
}

struct ScheduledDevice {
    polling: PollingSpec,
    driver: Arc<dyn Driver>,
    task: Option<(JoinHandle<()>, CancellationToken)>,
}

/// One logical timer per device, switching to the retry back-off once a
/// device keeps failing.
///
/// A device never has two polls in flight: the next timer is armed only
/// after the previous tick completes, and every resumption point re-checks
/// that the scheduler is running and the device is still scheduled.
pub struct PollScheduler {
    devices: Arc<Mutex<HashMap<String, ScheduledDevice>>>,
    running: Arc<AtomicBool>,
    sink: Arc<dyn PollSink>,
}

impl PollScheduler {
    pub fn new(sink: Arc<dyn PollSink>) -> Self {
        Self {
            devices: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    /// Register a device; arms its timer immediately when running.
    /// Scheduling an already-scheduled id replaces the entry.
    pub fn schedule_device(&self, device_id: &str, polling: PollingSpec, driver: Arc<dyn Driver>) {
        let mut devices = self.devices.lock().unwrap();
        if let Some(previous) = devices.remove(device_id) {
            if let Some((_, token)) = previous.task {
                token.cancel();
            }
        }
        let task = if self.running.load(Ordering::SeqCst) {
            Some(self.spawn_poll_loop(device_id, &polling, driver.clone()))
        } else {
            None
        };
        devices.insert(
            device_id.to_string(),
            ScheduledDevice {
                polling,
                driver,
                task,
            },
        );
    }

    /// Cancel the pending timer and forget the device. Returns whether the
    /// id was scheduled.
    pub fn unschedule_device(&self, device_id: &str) -> bool {
        let mut devices = self.devices.lock().unwrap();
        match devices.remove(device_id) {
            Some(entry) => {
                if let Some((_, token)) = entry.task {
                    token.cancel();
                }
                debug!(device_id = %device_id, "device unscheduled");
                true
            }
            None => false,
        }
    }

    /// Arm all known devices with their poll interval.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut devices = self.devices.lock().unwrap();
        let ids: Vec<String> = devices.keys().cloned().collect();
        for id in ids {
            let (polling, driver) = {
                let entry = &devices[&id];
                (entry.polling.clone(), entry.driver.clone())
            };
            let task = self.spawn_poll_loop(&id, &polling, driver);
            if let Some(entry) = devices.get_mut(&id) {
                entry.task = Some(task);
            }
        }
    }

    /// Cancel all timers; membership survives so start() can re-arm.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut devices = self.devices.lock().unwrap();
        for entry in devices.values_mut() {
            if let Some((_, token)) = entry.task.take() {
                token.cancel();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_scheduled(&self, device_id: &str) -> bool {
        self.devices.lock().unwrap().contains_key(device_id)
    }

    fn spawn_poll_loop(
        &self,
        device_id: &str,
        polling: &PollingSpec,
        driver: Arc<dyn Driver>,
    ) -> (JoinHandle<()>, CancellationToken) {
        let token = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            device_id.to_string(),
            polling.clone(),
            driver,
            self.sink.clone(),
            self.devices.clone(),
            self.running.clone(),
            token.clone(),
        ));
        (handle, token)
    }
}

async fn poll_loop(
    device_id: String,
    polling: PollingSpec,
    driver: Arc<dyn Driver>,
    sink: Arc<dyn PollSink>,
    devices: Arc<Mutex<HashMap<String, ScheduledDevice>>>,
    running: Arc<AtomicBool>,
    token: CancellationToken,
) {
    let mut consecutive_failures: u32 = 0;
    loop {
        let delay = if consecutive_failures >= polling.max_retries {
            polling.retry_backoff_ms
        } else {
            polling.interval_ms
        };
        tokio::select! {
            _ = token.cancelled() => {
                debug!(device_id = %device_id, "poll loop cancelled");
                return;
            }
            _ = sleep(Duration::from_millis(delay)) => {}
        }

        let readable: Vec<String> = driver
            .data_points()
            .iter()
            .filter(|point| point.access.readable() && point.poll == PollClass::Periodic)
            .map(|point| point.id.clone())
            .collect();
        let result = driver.read_data_points(&readable).await;

        // a stop or unschedule may have landed while the request was in flight
        if token.is_cancelled()
            || !running.load(Ordering::SeqCst)
            || !devices.lock().unwrap().contains_key(&device_id)
        {
            return;
        }

        match result {
            Ok(values) => {
                consecutive_failures = 0;
                sink.on_data(&device_id, values).await;
            }
            Err(error) => {
                consecutive_failures += 1;
                sink.on_error(&device_id, error).await;
            }
        }

        // the sink awaited too; check once more before re-arming
        if token.is_cancelled() || !running.load(Ordering::SeqCst) {
            return;
        }
    }
}
