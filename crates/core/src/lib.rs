pub mod config;
pub mod device;
pub mod dim;
pub mod error;

pub use config::DeviceConfig;
pub use device::*;
pub use dim::*;
pub use error::*;
