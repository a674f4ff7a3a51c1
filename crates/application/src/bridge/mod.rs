//! The MQTT bridge runtime: device registry, polling scheduler, orchestrator.

pub mod orchestrator;
pub mod registry;
pub mod scheduler;

pub use orchestrator::{Bridge, BridgeSink, data_payload};
pub use registry::DeviceRegistry;
pub use scheduler::{PollScheduler, PollSink};
