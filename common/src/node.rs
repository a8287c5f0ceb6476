//! Application context: owns every collaborator and supervisor for one node.
//!
//! Startup runs [`Node::boot`]; the steady state is [`Node::run`]. All waits
//! go through [`scheduler::run_for`] with the node itself as the maintenance
//! task, so the watchdog, the status LED, the broker client and the telemetry
//! cycle are serviced inside every wait.

use log::{debug, error, info, warn};

use crate::{
    boot::{BootSequencer, BOOT_STEPS},
    clock::{Clock, Millis},
    config::NodeConfig,
    error::Fatal,
    hal::{Board, BrokerClient, Display, LinkDriver, LinkStatus, Platform, RestartReason,
        SensorDriver, SystemReset, Watchdog},
    indicator,
    ledger::ProvisioningLedger,
    link::{signal_level, LinkEvent, LinkState, LinkSupervisor},
    pwm::SoftwarePwm,
    scheduler::{self, FeedCadence, Maintenance},
    session::{SessionEvent, SessionState, SessionSupervisor},
    telemetry::{SensorSample, TelemetrySchedule},
    types::Entity,
};

/// Value published while an entity's registration settles.
pub const PROVISIONING_SENTINEL: f32 = 0.0;
const SENTINEL_REPUBLISH_MS: Millis = 250;

pub struct Node<P: Platform> {
    config: NodeConfig,
    clock: P::Clock,
    watchdog: P::Watchdog,
    led: SoftwarePwm<P::Led>,
    link: P::Link,
    broker: P::Broker,
    sensor: P::Sensor,
    display: P::Display,
    reset: P::Reset,
    ledger: ProvisioningLedger<P::Store>,
    feed: FeedCadence,
    link_supervisor: LinkSupervisor,
    session: SessionSupervisor,
    telemetry: TelemetrySchedule,
    boot: BootSequencer,
}

impl<P: Platform> Node<P> {
    /// Assembles the context and validates the provisioning ledger.
    pub fn new(board: Board<P>, config: NodeConfig) -> Self {
        let supervisor = &config.supervisor;
        Self {
            clock: board.clock,
            watchdog: board.watchdog,
            led: SoftwarePwm::new(
                board.led,
                supervisor.pwm_cycle_us,
                config.device.led_active_low,
            ),
            link: board.link,
            broker: board.broker,
            sensor: board.sensor,
            display: board.display,
            reset: board.reset,
            ledger: ProvisioningLedger::open(board.store),
            feed: FeedCadence::new(supervisor.watchdog_feed_interval_ms),
            link_supervisor: LinkSupervisor::new(supervisor),
            session: SessionSupervisor::new(supervisor),
            telemetry: TelemetrySchedule::new(supervisor.telemetry_refresh_ms),
            boot: BootSequencer::default(),
            config,
        }
    }

    /// Runs the startup sequence and returns the node in steady state.
    ///
    /// When an entity still needs registering the boot ends in a controlled
    /// restart instead, after at most one entity has been registered.
    pub fn boot(board: Board<P>, config: NodeConfig) -> Self {
        let mut node = Self::new(board, config);
        node.start();
        node
    }

    /// Steady-state loop.
    pub fn run(mut self) -> ! {
        loop {
            self.step();
        }
    }

    /// One steady-state pass: supervise the link, then the session, then wait.
    pub fn step(&mut self) {
        if self.poll_link() {
            self.poll_session();
        }
        self.wait(self.config.supervisor.loop_pause_ms);
    }

    pub fn link_state(&self) -> LinkState {
        self.link_supervisor.state()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn led_level(&self) -> u8 {
        self.led.level()
    }

    fn start(&mut self) {
        self.watchdog.enable(self.config.supervisor.watchdog_period_ms);
        self.advance_boot(BOOT_STEPS[0]);
        self.led.begin();
        self.display.set_link_quality(0);
        self.display.set_session_state(false);

        self.advance_boot(BOOT_STEPS[1]);
        self.link_supervisor.start(self.clock.now_ms());
        while !self.poll_link() {
            self.wait(self.config.supervisor.link_poll_ms);
        }

        self.advance_boot(BOOT_STEPS[2]);
        self.broker.connect();
        self.session.start(self.clock.now_ms());
        while !(self.poll_link() && self.poll_session()) {
            self.wait(self.config.supervisor.loop_pause_ms);
        }

        for entity in Entity::ALL {
            self.advance_boot(entity.boot_label());
            if self.ledger.next_pending() == Some(entity) {
                self.provision(entity);
            }
        }

        self.advance_boot(BOOT_STEPS[5]);
        self.sensor.begin();
        for entity in Entity::ALL {
            self.broker.register_entity(entity);
        }
        self.broker.publish_availability();
        self.telemetry.arm();
        info!("node `{}` ready", self.config.device.name);
    }

    fn advance_boot(&mut self, label: &str) {
        let _ = self.boot.advance(label, &mut self.watchdog, &mut self.display);
        self.feed.fed(self.clock.now_ms());
    }

    fn wait(&mut self, duration_ms: Millis) {
        scheduler::run_for(self, duration_ms);
    }

    /// Returns whether the link is up.
    fn poll_link(&mut self) -> bool {
        let now = self.clock.now_ms();
        let status = self.link.status();
        let address = match status {
            LinkStatus::Connected => self.link.local_address(),
            _ => None,
        };

        match self.link_supervisor.poll(now, status, address.is_some()) {
            LinkEvent::Up {
                recovered,
                report_signal,
            } => {
                if recovered {
                    if let Some(address) = address {
                        info!("link up, local address {address}");
                    }
                    self.session.link_recovered(now);
                }
                if report_signal {
                    let rssi = self.link.signal_strength();
                    self.display.set_link_quality(signal_level(rssi));
                }
                true
            }
            LinkEvent::Reconnect => {
                info!(
                    "link down ({status:?}); connecting to `{}`",
                    self.config.network.wifi_ssid
                );
                self.display.set_link_quality(0);
                self.led.set_level(0);
                self.link.begin_connect(
                    &self.config.network.wifi_ssid,
                    &self.config.network.wifi_pass,
                );
                false
            }
            LinkEvent::Waiting => {
                self.led.set_level(0);
                false
            }
            LinkEvent::TimedOut(fatal) => self.halt_and_await_external_restart(fatal),
        }
    }

    /// Returns whether the broker session is up. Only meaningful with the link up.
    fn poll_session(&mut self) -> bool {
        let now = self.clock.now_ms();
        let connected = self.broker.is_connected();

        match self.session.poll(now, connected) {
            SessionEvent::Healthy { recovered } => {
                if recovered {
                    info!("broker session established");
                    self.display.set_session_state(true);
                }
                let level = indicator::breathe(now, self.config.supervisor.breathe_period_ms);
                self.led.set_level(i32::from(level));
                true
            }
            SessionEvent::Down { lost } => {
                if lost {
                    warn!("broker session lost");
                    self.display.set_session_state(false);
                }
                let level = indicator::blink(now, self.config.supervisor.blink_period_ms);
                self.led.set_level(i32::from(level));
                false
            }
            SessionEvent::TimedOut(fatal) => self.halt_and_await_external_restart(fatal),
        }
    }

    /// Registers `entity`, lets the broker round-trip settle, records the
    /// entity in the ledger and restarts so the next boot continues.
    fn provision(&mut self, entity: Entity) -> ! {
        info!("registering {entity} with the broker");
        self.display.show_info(entity.boot_label());
        self.broker.register_entity(entity);

        let settle_ms = self.config.supervisor.provisioning_settle_ms;
        let started = self.clock.now_ms();
        let mut last_publish: Option<Millis> = None;
        while self.clock.elapsed(started) < settle_ms {
            let due = last_publish
                .map_or(true, |mark| self.clock.elapsed(mark) >= SENTINEL_REPUBLISH_MS);
            if due {
                self.broker.publish(entity, PROVISIONING_SENTINEL, true);
                last_publish = Some(self.clock.now_ms());
            }
            self.poll_session();
            self.wait(self.config.supervisor.loop_pause_ms);
        }

        match self.ledger.mark_provisioned(entity) {
            Ok(()) => info!("{entity} registered; restarting to continue provisioning"),
            Err(err) => error!("{entity} registered but the ledger was not updated: {err}"),
        }
        self.reset.restart(RestartReason::Provisioned(entity))
    }

    /// Fail-safe halt: show the fault, keep servicing the watchdog and LED for
    /// the grace period, then end the process. Does not return; the external
    /// watchdog is responsible for the restart.
    fn halt_and_await_external_restart(&mut self, fatal: Fatal) -> ! {
        error!("{fatal}; halting until the watchdog restarts the node");
        self.display.show_error(fatal.display_message());
        self.wait(self.config.supervisor.halt_grace_ms);
        self.reset.restart(RestartReason::Fatal(fatal))
    }

    fn publish_telemetry(&mut self) {
        let sample = SensorSample::read(
            &mut self.sensor,
            self.config.supervisor.temperature_offset_c,
        );

        if self.broker.is_connected() {
            if let Some(temperature) = sample.temperature_c {
                self.broker.publish(Entity::Temperature, temperature, false);
            }
            if let Some(humidity) = sample.humidity_pct {
                self.broker.publish(Entity::Humidity, humidity, false);
            }
        } else {
            debug!("broker offline; telemetry cycle not published");
        }

        self.display.show_values(
            sample.temperature_c.unwrap_or(0.0),
            sample.humidity_pct.unwrap_or(0.0),
        );
    }
}

impl<P: Platform> Maintenance for Node<P> {
    fn now_ms(&self) -> Millis {
        self.clock.now_ms()
    }

    fn maintain(&mut self) {
        let now = self.clock.now_ms();
        if self.feed.due(now) {
            self.watchdog.feed();
        }
        self.led.tick(self.clock.now_us());
        self.broker.process_step();
        if self.telemetry.due(now) {
            self.publish_telemetry();
        }
    }

    fn pause(&mut self) {
        self.clock.relax(self.config.supervisor.poll_quantum_us);
    }
}
