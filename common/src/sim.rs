//! Scriptable stand-ins for every collaborator, sharing one virtual world.
//!
//! Time only moves when the node relaxes, so whole boots (including a full
//! link timeout) run in a few milliseconds of real time.

use std::{
    cell::RefCell,
    collections::VecDeque,
    convert::Infallible,
    net::Ipv4Addr,
    ops::Range,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
};

use embedded_hal::digital::{ErrorType, OutputPin};

use crate::{
    clock::{elapsed, Clock, Millis},
    config::NodeConfig,
    error::StoreError,
    hal::{
        Board, BrokerClient, CrashStore, Display, LinkDriver, LinkStatus, Platform,
        RestartReason, SensorDriver, SystemReset, Watchdog,
    },
    ledger::ProvisioningFlags,
    node::Node,
    scheduler::Maintenance,
    types::Entity,
};

pub type SharedWorld = Rc<RefCell<SimWorld>>;

#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    ConnectAttempt { at_ms: u64 },
    BrokerConnect,
    Register(Entity),
    Publish { entity: Entity, value: f32, retained: bool },
    Availability,
    Progress { label: String, step: usize, total: usize },
    Values { temperature_c: f32, humidity_pct: f32 },
    Error(String),
    Info(String),
    LinkQuality(u8),
    SessionState(bool),
}

impl SimEvent {
    pub fn mentions(&self, entity: Entity) -> bool {
        match self {
            Self::Register(registered) => *registered == entity,
            Self::Publish { entity: published, .. } => *published == entity,
            Self::Progress { label, .. } | Self::Info(label) => label == entity.boot_label(),
            _ => false,
        }
    }
}

/// Panic payload standing in for a device restart.
#[derive(Debug)]
pub struct SimRestart(pub RestartReason);

#[derive(Debug)]
pub struct SimWorld {
    pub now_us: u64,
    /// Outage windows are in milliseconds of virtual time.
    pub link_available: bool,
    pub link_outages: Vec<Range<u64>>,
    pub link_up: bool,
    pub rssi: i32,
    pub broker_available: bool,
    pub broker_outages: Vec<Range<u64>>,
    pub broker_requested: bool,
    pub temperature: VecDeque<f32>,
    pub humidity: VecDeque<f32>,
    pub default_temperature: f32,
    pub default_humidity: f32,
    pub retained: Option<ProvisioningFlags>,
    pub watchdog_period_ms: Option<u32>,
    pub feeds: Vec<u64>,
    pub pin_high: bool,
    pub events: Vec<SimEvent>,
}

impl Default for SimWorld {
    fn default() -> Self {
        Self {
            now_us: 0,
            link_available: true,
            link_outages: Vec::new(),
            link_up: false,
            rssi: -40,
            broker_available: true,
            broker_outages: Vec::new(),
            broker_requested: false,
            temperature: VecDeque::new(),
            humidity: VecDeque::new(),
            default_temperature: 21.5,
            default_humidity: 45.0,
            retained: None,
            watchdog_period_ms: None,
            feeds: Vec::new(),
            pin_high: false,
            events: Vec::new(),
        }
    }
}

impl SimWorld {
    pub fn now_ms(&self) -> u64 {
        self.now_us / 1_000
    }

    fn link_reachable(&self) -> bool {
        let now = self.now_ms();
        self.link_available && !self.link_outages.iter().any(|window| window.contains(&now))
    }

    fn broker_reachable(&self) -> bool {
        let now = self.now_ms();
        self.broker_available && !self.broker_outages.iter().any(|window| window.contains(&now))
    }

    /// Restart with retained memory intact.
    pub fn soft_reset(&mut self) {
        self.now_us = 0;
        self.link_outages.clear();
        self.broker_outages.clear();
        self.link_up = false;
        self.broker_requested = false;
        self.watchdog_period_ms = None;
        self.feeds.clear();
        self.events.clear();
    }

    /// Restart with retained memory scrambled.
    pub fn power_cycle(&mut self) {
        self.soft_reset();
        self.retained = Some(ProvisioningFlags {
            magic: 0x5A5A_1234,
            entities: [true; Entity::COUNT],
        });
    }

    pub fn registrations(&self) -> Vec<Entity> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SimEvent::Register(entity) => Some(*entity),
                _ => None,
            })
            .collect()
    }

    pub fn publishes(&self, entity: Entity) -> Vec<(f32, bool)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SimEvent::Publish {
                    entity: published,
                    value,
                    retained,
                } if *published == entity => Some((*value, *retained)),
                _ => None,
            })
            .collect()
    }

    pub fn availability_count(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, SimEvent::Availability))
            .count()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SimEvent::Error(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn connect_attempts(&self) -> Vec<u64> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SimEvent::ConnectAttempt { at_ms } => Some(*at_ms),
                _ => None,
            })
            .collect()
    }

    pub fn max_feed_gap_ms(&self) -> u64 {
        self.feeds
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .max()
            .unwrap_or(0)
    }
}

pub struct SimPlatform;

impl Platform for SimPlatform {
    type Clock = SimClock;
    type Watchdog = SimWatchdog;
    type Led = SimPin;
    type Link = SimLink;
    type Broker = SimBroker;
    type Sensor = SimSensor;
    type Display = SimDisplay;
    type Store = SimStore;
    type Reset = SimReset;
}

pub struct SimClock(SharedWorld);

impl Clock for SimClock {
    fn now_ms(&self) -> Millis {
        self.0.borrow().now_ms() as Millis
    }

    fn now_us(&self) -> u64 {
        self.0.borrow().now_us
    }

    fn relax(&self, quantum_us: u32) {
        self.0.borrow_mut().now_us += u64::from(quantum_us);
    }
}

pub struct SimWatchdog(SharedWorld);

impl Watchdog for SimWatchdog {
    fn enable(&mut self, period_ms: u32) {
        self.0.borrow_mut().watchdog_period_ms = Some(period_ms);
    }

    fn feed(&mut self) {
        let mut world = self.0.borrow_mut();
        let now = world.now_ms();
        world.feeds.push(now);
    }
}

pub struct SimPin(SharedWorld);

impl ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().pin_high = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().pin_high = true;
        Ok(())
    }
}

pub struct SimLink(SharedWorld);

impl LinkDriver for SimLink {
    fn status(&mut self) -> LinkStatus {
        let mut world = self.0.borrow_mut();
        if world.link_up && !world.link_reachable() {
            world.link_up = false;
        }
        if world.link_up {
            LinkStatus::Connected
        } else {
            LinkStatus::Disconnected
        }
    }

    fn begin_connect(&mut self, _ssid: &str, _password: &str) {
        let mut world = self.0.borrow_mut();
        let at_ms = world.now_ms();
        world.events.push(SimEvent::ConnectAttempt { at_ms });
        world.link_up = world.link_reachable();
    }

    fn local_address(&mut self) -> Option<Ipv4Addr> {
        self.0
            .borrow()
            .link_up
            .then_some(Ipv4Addr::new(192, 168, 1, 50))
    }

    fn signal_strength(&mut self) -> i32 {
        self.0.borrow().rssi
    }
}

pub struct SimBroker(SharedWorld);

impl BrokerClient for SimBroker {
    fn connect(&mut self) {
        let mut world = self.0.borrow_mut();
        world.broker_requested = true;
        world.events.push(SimEvent::BrokerConnect);
    }

    fn process_step(&mut self) {}

    fn is_connected(&self) -> bool {
        let world = self.0.borrow();
        world.broker_requested && world.link_up && world.link_reachable() && world.broker_reachable()
    }

    fn register_entity(&mut self, entity: Entity) {
        self.0.borrow_mut().events.push(SimEvent::Register(entity));
    }

    fn publish(&mut self, entity: Entity, value: f32, retained: bool) {
        self.0.borrow_mut().events.push(SimEvent::Publish {
            entity,
            value,
            retained,
        });
    }

    fn publish_availability(&mut self) {
        self.0.borrow_mut().events.push(SimEvent::Availability);
    }
}

pub struct SimSensor(SharedWorld);

impl SensorDriver for SimSensor {
    fn begin(&mut self) {}

    fn read_temperature(&mut self) -> f32 {
        let mut world = self.0.borrow_mut();
        let fallback = world.default_temperature;
        world.temperature.pop_front().unwrap_or(fallback)
    }

    fn read_humidity(&mut self) -> f32 {
        let mut world = self.0.borrow_mut();
        let fallback = world.default_humidity;
        world.humidity.pop_front().unwrap_or(fallback)
    }
}

pub struct SimDisplay(SharedWorld);

impl SimDisplay {
    fn record(&self, event: SimEvent) {
        self.0.borrow_mut().events.push(event);
    }
}

impl Display for SimDisplay {
    fn show_progress(&mut self, label: &str, step: usize, total: usize) {
        self.record(SimEvent::Progress {
            label: label.to_string(),
            step,
            total,
        });
    }

    fn show_values(&mut self, temperature_c: f32, humidity_pct: f32) {
        self.record(SimEvent::Values {
            temperature_c,
            humidity_pct,
        });
    }

    fn show_error(&mut self, message: &str) {
        self.record(SimEvent::Error(message.to_string()));
    }

    fn show_info(&mut self, message: &str) {
        self.record(SimEvent::Info(message.to_string()));
    }

    fn set_link_quality(&mut self, level: u8) {
        self.record(SimEvent::LinkQuality(level));
    }

    fn set_session_state(&mut self, connected: bool) {
        self.record(SimEvent::SessionState(connected));
    }
}

pub struct SimStore(SharedWorld);

impl CrashStore for SimStore {
    fn is_valid(&self) -> bool {
        self.0.borrow().retained.is_some()
    }

    fn read(&self) -> ProvisioningFlags {
        self.0
            .borrow()
            .retained
            .unwrap_or(ProvisioningFlags {
                magic: 0,
                entities: [false; Entity::COUNT],
            })
    }

    fn write(&mut self, flags: &ProvisioningFlags) -> Result<(), StoreError> {
        self.0.borrow_mut().retained = Some(*flags);
        Ok(())
    }
}

pub struct SimReset;

impl SystemReset for SimReset {
    fn restart(&mut self, reason: RestartReason) -> ! {
        panic::panic_any(SimRestart(reason))
    }
}

pub fn shared(world: SimWorld) -> SharedWorld {
    Rc::new(RefCell::new(world))
}

pub fn board(world: &SharedWorld) -> Board<SimPlatform> {
    Board {
        clock: SimClock(world.clone()),
        watchdog: SimWatchdog(world.clone()),
        led: SimPin(world.clone()),
        link: SimLink(world.clone()),
        broker: SimBroker(world.clone()),
        sensor: SimSensor(world.clone()),
        display: SimDisplay(world.clone()),
        store: SimStore(world.clone()),
        reset: SimReset,
    }
}

/// Default configuration with a coarse 1 ms pause so virtual time moves fast.
pub fn config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.supervisor.poll_quantum_us = 1_000;
    config.sanitize();
    config
}

/// Boots a node; a restart comes back as `Err`.
pub fn boot(world: &SharedWorld, config: NodeConfig) -> Result<Node<SimPlatform>, RestartReason> {
    let board = board(world);
    catch_restart(move || Node::boot(board, config))
}

/// Steps `node` for `duration_ms` of virtual time.
pub fn run(node: &mut Node<SimPlatform>, duration_ms: Millis) -> Result<(), RestartReason> {
    catch_restart(|| {
        let start = node.now_ms();
        while elapsed(node.now_ms(), start) < duration_ms {
            node.step();
        }
    })
}

fn catch_restart<T>(f: impl FnOnce() -> T) -> Result<T, RestartReason> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<SimRestart>() {
            Ok(restart) => Err(restart.0),
            Err(other) => panic::resume_unwind(other),
        },
    }
}
