//! Application layer - Discovery and bridge use cases

pub mod bridge;
pub mod discovery;

pub use bridge::{Bridge, DeviceRegistry, PollScheduler, PollSink};
pub use discovery::{
    DiscoveryScanner, GeneratorOptions, ParameterSpace, ScanObserver, ScanOptions, ScanStrategy,
};
