pub mod config;
pub mod error;
pub mod host;
pub mod logger;

pub use config::{HostConfig, InstanceConfig};
pub use error::HostError;
pub use host::{HostEvent, HostOptions, InstanceLifecycle, ModuleHost};
