//! Collaborators the supervisor drives.
//!
//! Every method here is a non-blocking poll or a fire-and-forget request.
//! Adapters log and absorb their own transport failures; nothing returns an
//! error across this boundary except the crash-persistent store.

use std::net::Ipv4Addr;

use embedded_hal::digital::OutputPin;

use crate::{
    clock::Clock,
    error::{Fatal, StoreError},
    ledger::ProvisioningFlags,
    types::Entity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Connecting,
    Disconnected,
    Failed,
}

pub trait LinkDriver {
    fn status(&mut self) -> LinkStatus;

    /// Starts a (re)connect attempt. Completion is observed through `status`.
    fn begin_connect(&mut self, ssid: &str, password: &str);

    fn local_address(&mut self) -> Option<Ipv4Addr>;

    /// Received signal strength in dBm.
    fn signal_strength(&mut self) -> i32;
}

pub trait BrokerClient {
    /// Opens the session. Progress is observed through `is_connected`.
    fn connect(&mut self);

    /// Must run on every scheduler pass.
    fn process_step(&mut self);

    fn is_connected(&self) -> bool;

    fn register_entity(&mut self, entity: Entity);

    fn publish(&mut self, entity: Entity, value: f32, retained: bool);

    fn publish_availability(&mut self);
}

/// Readings return NaN on a transient failure.
pub trait SensorDriver {
    fn begin(&mut self);
    fn read_temperature(&mut self) -> f32;
    fn read_humidity(&mut self) -> f32;
}

pub trait Display {
    fn show_progress(&mut self, label: &str, step: usize, total: usize);
    fn show_values(&mut self, temperature_c: f32, humidity_pct: f32);
    fn show_error(&mut self, message: &str);
    fn show_info(&mut self, message: &str);
    fn set_link_quality(&mut self, level: u8);
    fn set_session_state(&mut self, connected: bool);
}

/// Hardware watchdog. A missed feed restarts the device.
pub trait Watchdog {
    fn enable(&mut self, period_ms: u32);
    fn feed(&mut self);
}

/// Memory that survives a soft reset but not a power cycle.
pub trait CrashStore {
    /// Whether the region holds a decodable record at all.
    fn is_valid(&self) -> bool;
    fn read(&self) -> ProvisioningFlags;
    fn write(&mut self, flags: &ProvisioningFlags) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// One provisioning phase finished; the next boot continues the protocol.
    Provisioned(Entity),
    Fatal(Fatal),
}

impl RestartReason {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Provisioned(_) => 0,
            Self::Fatal(Fatal::LinkTimeout { .. }) => 2,
            Self::Fatal(Fatal::SessionTimeout { .. }) => 3,
        }
    }
}

/// Ends the current boot. Recovery is left to the watchdog or whatever
/// supervises the process; this call never returns.
pub trait SystemReset {
    fn restart(&mut self, reason: RestartReason) -> !;
}

/// Binds one concrete set of collaborators.
pub trait Platform {
    type Clock: Clock;
    type Watchdog: Watchdog;
    type Led: OutputPin;
    type Link: LinkDriver;
    type Broker: BrokerClient;
    type Sensor: SensorDriver;
    type Display: Display;
    type Store: CrashStore;
    type Reset: SystemReset;
}

pub struct Board<P: Platform> {
    pub clock: P::Clock,
    pub watchdog: P::Watchdog,
    pub led: P::Led,
    pub link: P::Link,
    pub broker: P::Broker,
    pub sensor: P::Sensor,
    pub display: P::Display,
    pub store: P::Store,
    pub reset: P::Reset,
}
