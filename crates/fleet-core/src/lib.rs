pub mod config;
pub mod duration;
pub mod policy;

pub use config::{ConfigError, FleetConfig};
pub use duration::parse_duration;
pub use policy::FleetPolicy;
