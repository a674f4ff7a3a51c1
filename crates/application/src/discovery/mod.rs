//! Serial bus discovery: parameter enumeration, device probing, scanning.

pub mod identify;
pub mod params;
pub mod scanner;

pub use identify::identify;
pub use params::{GeneratorOptions, ParameterSpace, ScanStrategy};
pub use scanner::{DiscoveryScanner, NullObserver, ScanObserver, ScanOptions};
