pub mod boot;
pub mod clock;
pub mod config;
pub mod display;
pub mod error;
pub mod hal;
pub mod indicator;
pub mod ledger;
pub mod link;
pub mod node;
pub mod pwm;
pub mod scheduler;
pub mod session;
pub mod telemetry;
pub mod topics;
pub mod types;

#[cfg(test)]
pub(crate) mod sim;

pub use clock::{Clock, Millis};
pub use config::{DeviceConfig, NetworkConfig, NodeConfig, SensorKind, SupervisorConfig};
pub use display::LogDisplay;
pub use error::{ConfigError, Fatal, StoreError};
pub use hal::{
    Board, BrokerClient, CrashStore, Display, LinkDriver, LinkStatus, Platform, RestartReason,
    SensorDriver, SystemReset, Watchdog,
};
pub use ledger::{ProvisioningFlags, ProvisioningLedger, LEDGER_MAGIC};
pub use node::Node;
pub use topics::*;
pub use types::{DiscoveryDevice, DiscoveryPayload, Entity};
