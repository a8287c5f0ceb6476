use std::{
    convert::Infallible,
    fs,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use embedded_hal::digital::{ErrorType, OutputPin};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, warn};

use envnode_common::{
    types::format_reading, Board, BrokerClient, Clock, CrashStore, DeviceConfig, Entity,
    LinkDriver, LinkStatus, LogDisplay, Millis, NetworkConfig, Node, NodeConfig, Platform,
    ProvisioningFlags, RestartReason, SensorDriver, StoreError, SystemReset, Topics, Watchdog,
    PAYLOAD_OFFLINE, PAYLOAD_ONLINE,
};

const CONFIG_PATH_ENV: &str = "ENVNODE_CONFIG";
const LEDGER_PATH_ENV: &str = "ENVNODE_LEDGER";
const LEDGER_FILE: &str = "envnode-ledger.json";
const ROUTE_CACHE_MS: u64 = 500;
const RESOLVE_RETRY: Duration = Duration::from_secs(2);
const WIRED_RSSI_DBM: i32 = -40;
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config()?;
    info!(
        "starting `{}` ({}) against {}:{}",
        config.device.name,
        config.device.unique_id,
        config.network.mqtt_host,
        config.network.mqtt_port
    );

    let board = Board::<HostPlatform> {
        clock: HostClock::new(),
        watchdog: ThreadWatchdog::new(),
        led: HeadlessLed::default(),
        link: HostLink::new(&config.network),
        broker: MqttBroker::new(&config.network, &config.device),
        sensor: DriftSensor::default(),
        display: LogDisplay::new(),
        store: FileCrashStore::new(ledger_path()),
        reset: ProcessReset,
    };

    Node::boot(board, config).run()
}

fn load_config() -> anyhow::Result<NodeConfig> {
    let mut config = match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => {
            let document = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file `{path}`"))?;
            NodeConfig::from_json(&document)
                .with_context(|| format!("failed to parse config file `{path}`"))?
        }
        Err(_) => NodeConfig::default(),
    };

    config
        .apply_overrides(|key| std::env::var(key).ok())
        .context("invalid environment override")?;
    config.sanitize();
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Survives a process restart on the same host, not a reboot.
fn ledger_path() -> PathBuf {
    if let Ok(path) = std::env::var(LEDGER_PATH_ENV) {
        return PathBuf::from(path);
    }
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/dev/shm"))
        .join(LEDGER_FILE)
}

struct HostPlatform;

impl Platform for HostPlatform {
    type Clock = HostClock;
    type Watchdog = ThreadWatchdog;
    type Led = HeadlessLed;
    type Link = HostLink;
    type Broker = MqttBroker;
    type Sensor = DriftSensor;
    type Display = LogDisplay;
    type Store = FileCrashStore;
    type Reset = ProcessReset;
}

struct HostClock {
    origin: Instant,
}

impl HostClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for HostClock {
    fn now_ms(&self) -> Millis {
        // Truncation gives the same wrap-around as a 32-bit tick counter.
        self.origin.elapsed().as_millis() as Millis
    }

    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn relax(&self, quantum_us: u32) {
        thread::sleep(Duration::from_micros(u64::from(quantum_us)));
    }
}

/// Aborts the process when the main loop stops feeding it.
struct ThreadWatchdog {
    origin: Instant,
    last_feed_ms: Arc<AtomicU64>,
    armed: bool,
}

impl ThreadWatchdog {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_feed_ms: Arc::new(AtomicU64::new(0)),
            armed: false,
        }
    }

    fn elapsed_ms(origin: Instant) -> u64 {
        origin.elapsed().as_millis() as u64
    }
}

impl Watchdog for ThreadWatchdog {
    fn enable(&mut self, period_ms: u32) {
        if self.armed {
            return;
        }
        self.feed();

        let origin = self.origin;
        let last_feed_ms = Arc::clone(&self.last_feed_ms);
        let period = u64::from(period_ms);
        let spawned = thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || loop {
                thread::sleep(Duration::from_millis((period / 4).max(1)));
                let starved =
                    Self::elapsed_ms(origin).saturating_sub(last_feed_ms.load(Ordering::Relaxed));
                if starved > period {
                    error!("watchdog not fed for {starved} ms; aborting");
                    process::abort();
                }
            });

        match spawned {
            Ok(_) => {
                self.armed = true;
                info!("watchdog armed with a {period_ms} ms period");
            }
            Err(err) => warn!("failed to start watchdog thread: {err}"),
        }
    }

    fn feed(&mut self) {
        self.last_feed_ms
            .store(Self::elapsed_ms(self.origin), Ordering::Relaxed);
    }
}

/// Status LED for a host without one.
#[derive(Default)]
struct HeadlessLed {
    lit: bool,
}

impl ErrorType for HeadlessLed {
    type Error = Infallible;
}

impl OutputPin for HeadlessLed {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.lit = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.lit = true;
        Ok(())
    }
}

/// Treats "a route to the broker exists" as the network link.
///
/// Name resolution runs on a helper thread; polls only consult the cached
/// address.
struct HostLink {
    target: String,
    remote: Arc<OnceLock<SocketAddr>>,
    resolving: bool,
    requested: bool,
    route: Option<Ipv4Addr>,
    checked_at: Option<Instant>,
}

impl HostLink {
    fn new(network: &NetworkConfig) -> Self {
        let target = format!("{}:{}", network.mqtt_host, network.mqtt_port);
        let remote = Arc::new(OnceLock::new());
        if let Ok(literal @ SocketAddr::V4(_)) = target.parse::<SocketAddr>() {
            let _ = remote.set(literal);
        }
        Self {
            target,
            remote,
            resolving: false,
            requested: false,
            route: None,
            checked_at: None,
        }
    }

    fn ensure_resolver(&mut self) {
        if self.resolving || self.remote.get().is_some() {
            return;
        }

        let target = self.target.clone();
        let remote = Arc::clone(&self.remote);
        let spawned = thread::Builder::new()
            .name("resolver".to_string())
            .spawn(move || loop {
                match target.to_socket_addrs() {
                    Ok(mut addrs) => {
                        if let Some(addr) = addrs.find(SocketAddr::is_ipv4) {
                            info!("resolved {target} to {addr}");
                            let _ = remote.set(addr);
                            return;
                        }
                        warn!("{target} has no IPv4 address");
                    }
                    Err(err) => warn!("failed to resolve {target}: {err}"),
                }
                thread::sleep(RESOLVE_RETRY);
            });

        match spawned {
            Ok(_) => self.resolving = true,
            Err(err) => error!("failed to spawn resolver thread: {err}"),
        }
    }

    fn refresh(&mut self, force: bool) {
        let fresh = self
            .checked_at
            .is_some_and(|at| at.elapsed() < Duration::from_millis(ROUTE_CACHE_MS));
        if fresh && !force {
            return;
        }
        self.checked_at = Some(Instant::now());

        let previous = self.route;
        self.route = self.remote.get().and_then(|remote| route_to(*remote));
        if previous.is_some() && self.route.is_none() {
            warn!("no route to {}", self.target);
        }
    }
}

/// Local address the OS would use to reach `remote`. No packets are sent.
fn route_to(remote: SocketAddr) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(remote).ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(local) if !local.ip().is_unspecified() => Some(*local.ip()),
        _ => None,
    }
}

impl LinkDriver for HostLink {
    fn status(&mut self) -> LinkStatus {
        if !self.requested {
            return LinkStatus::Disconnected;
        }
        self.refresh(false);
        if self.route.is_some() {
            LinkStatus::Connected
        } else {
            LinkStatus::Connecting
        }
    }

    fn begin_connect(&mut self, ssid: &str, _password: &str) {
        if !ssid.is_empty() {
            debug!("ignoring ssid `{ssid}` on host; using the default route");
        }
        self.requested = true;
        self.ensure_resolver();
        self.refresh(true);
    }

    fn local_address(&mut self) -> Option<Ipv4Addr> {
        self.route
    }

    fn signal_strength(&mut self) -> i32 {
        WIRED_RSSI_DBM
    }
}

enum SessionUpdate {
    Connected,
    Disconnected,
}

/// Broker session over rumqttc. The event loop runs on its own thread; the
/// supervisor only sees the connection flag it reports.
struct MqttBroker {
    network: NetworkConfig,
    device: DeviceConfig,
    topics: Topics,
    client: Option<AsyncClient>,
    updates: Option<UnboundedReceiver<SessionUpdate>>,
    connected: bool,
}

impl MqttBroker {
    fn new(network: &NetworkConfig, device: &DeviceConfig) -> Self {
        Self {
            network: network.clone(),
            device: device.clone(),
            topics: Topics::new(network, device),
            client: None,
            updates: None,
            connected: false,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.topics.device_id(),
            self.network.mqtt_host.clone(),
            self.network.mqtt_port,
        );
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        options.set_last_will(LastWill::new(
            self.topics.availability(),
            PAYLOAD_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
        if !self.network.mqtt_user.is_empty() {
            options.set_credentials(self.network.mqtt_user.clone(), self.network.mqtt_pass.clone());
        }
        options
    }

    fn try_publish(&self, topic: String, retained: bool, payload: Vec<u8>) {
        let Some(client) = &self.client else {
            warn!("publish to {topic} before the broker session was opened");
            return;
        };
        if let Err(err) = client.try_publish(topic.as_str(), QoS::AtLeastOnce, retained, payload) {
            warn!("failed to publish to {topic}: {err}");
        }
    }
}

impl BrokerClient for MqttBroker {
    fn connect(&mut self) {
        if self.client.is_some() {
            return;
        }

        let (client, mut eventloop) = AsyncClient::new(self.options(), 32);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let spawned = thread::Builder::new()
            .name("mqtt-poll".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!("failed to build mqtt runtime: {err}");
                        return;
                    }
                };

                runtime.block_on(async move {
                    loop {
                        match eventloop.poll().await {
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                if updates_tx.send(SessionUpdate::Connected).is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(err) => {
                                warn!("mqtt poll error: {err}");
                                if updates_tx.send(SessionUpdate::Disconnected).is_err() {
                                    break;
                                }
                                tokio::time::sleep(Duration::from_secs(2)).await;
                            }
                        }
                    }
                });
            });

        match spawned {
            Ok(_) => {
                self.client = Some(client);
                self.updates = Some(updates_rx);
            }
            Err(err) => error!("failed to spawn mqtt thread: {err}"),
        }
    }

    fn process_step(&mut self) {
        let Some(updates) = self.updates.as_mut() else {
            return;
        };
        while let Ok(update) = updates.try_recv() {
            self.connected = matches!(update, SessionUpdate::Connected);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn register_entity(&mut self, entity: Entity) {
        let payload = self.topics.discovery_payload(entity, &self.device);
        match serde_json::to_vec(&payload) {
            Ok(document) => self.try_publish(self.topics.discovery(entity), true, document),
            Err(err) => warn!("failed to encode discovery document for {entity}: {err}"),
        }
    }

    fn publish(&mut self, entity: Entity, value: f32, retained: bool) {
        let payload = format_reading(value).into_bytes();
        self.try_publish(self.topics.state(entity), retained, payload);
    }

    fn publish_availability(&mut self) {
        self.try_publish(self.topics.availability(), true, PAYLOAD_ONLINE.into());
    }
}

/// Simulated readings for running without sensor hardware.
#[derive(Default)]
struct DriftSensor {
    tick: u64,
}

impl SensorDriver for DriftSensor {
    fn begin(&mut self) {
        info!("using simulated sensor readings");
    }

    fn read_temperature(&mut self) -> f32 {
        self.tick = self.tick.wrapping_add(1);
        20.0 + (self.tick % 8) as f32 * 0.2
    }

    fn read_humidity(&mut self) -> f32 {
        42.0 + (self.tick % 6) as f32 * 0.5
    }
}

/// Ledger file on a tmpfs path, so it is lost on reboot like retained RAM.
struct FileCrashStore {
    path: PathBuf,
}

impl FileCrashStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Option<ProvisioningFlags> {
        let document = fs::read(&self.path).ok()?;
        serde_json::from_slice(&document).ok()
    }
}

impl CrashStore for FileCrashStore {
    fn is_valid(&self) -> bool {
        self.load().is_some()
    }

    fn read(&self) -> ProvisioningFlags {
        self.load().unwrap_or(ProvisioningFlags {
            magic: 0,
            entities: [false; Entity::COUNT],
        })
    }

    fn write(&mut self, flags: &ProvisioningFlags) -> Result<(), StoreError> {
        let document = serde_json::to_vec(flags)?;
        fs::write(&self.path, document)?;
        Ok(())
    }
}

/// Ends the process; a service manager is expected to start it again.
struct ProcessReset;

impl SystemReset for ProcessReset {
    fn restart(&mut self, reason: RestartReason) -> ! {
        match reason {
            RestartReason::Provisioned(entity) => {
                info!("restarting after registering {entity}");
            }
            RestartReason::Fatal(fatal) => {
                error!("restarting after fatal {}: {fatal}", fatal.as_label());
            }
        }
        process::exit(reason.exit_code())
    }
}
