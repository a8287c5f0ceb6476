use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use dht_sensor::{dht11, dht22};
use embedded_svc::{
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EventPayload, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::EspWifi,
};
use log::{error, info, warn};

use envnode_common::{
    link::{AttemptAction, ConnectAttempt},
    types::format_reading,
    Board, BrokerClient, Clock, CrashStore, DeviceConfig, Entity, LinkDriver, LinkStatus,
    LogDisplay, Millis, NetworkConfig, Node, NodeConfig, Platform,
    ProvisioningFlags, RestartReason, SensorDriver, SensorKind, StoreError, SystemReset, Topics,
    Watchdog, PAYLOAD_OFFLINE, PAYLOAD_ONLINE,
};

const NVS_NAMESPACE: &str = "envnode";
const NVS_CONFIG_KEY: &str = "node_json";
/// Association plus DHCP on a slow access point.
const CONNECT_ATTEMPT_WINDOW_MS: Millis = 10_000;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut config = load_node_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load node config from NVS: {err:#}");
        NodeConfig::default()
    });
    config
        .apply_overrides(build_time_setting)
        .context("invalid build-time override")?;

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;

    let mac = wifi
        .sta_netif()
        .get_mac()
        .context("failed to read the station MAC")?;
    if config.device.adopt_hardware_id(mac) {
        info!("device id derived from MAC: {}", config.device.unique_id);
    }
    config.sanitize();
    config.validate().context("invalid configuration")?;

    // SAFETY: the configured pins are not claimed anywhere else.
    let led_pin = unsafe { AnyOutputPin::new(config.device.led_pin) };
    let sensor_pin = unsafe { AnyIOPin::new(config.device.sensor_pin) };

    let board = Board::<EspPlatform> {
        clock: EspClock,
        watchdog: TaskWatchdog::default(),
        led: PinDriver::output(led_pin)?,
        link: EspLink::new(wifi),
        broker: EspBroker::new(&config.network, &config.device),
        sensor: DhtSensor::new(sensor_pin, config.device.sensor_kind)
            .context("failed to initialize sensor pin")?,
        display: LogDisplay::new(),
        store: RtcLedgerStore,
        reset: WatchdogReset,
    };

    Node::boot(board, config).run()
}

fn load_node_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<NodeConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 2048];

    match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
        Some(value) => Ok(NodeConfig::from_json(value)?),
        None => Ok(NodeConfig::default()),
    }
}

/// Credentials baked in at build time through the environment.
fn build_time_setting(key: &str) -> Option<String> {
    let value = match key {
        "WIFI_SSID" => option_env!("WIFI_SSID"),
        "WIFI_PASS" => option_env!("WIFI_PASS"),
        "MQTT_HOST" => option_env!("MQTT_HOST"),
        "MQTT_PORT" => option_env!("MQTT_PORT"),
        "MQTT_USER" => option_env!("MQTT_USER"),
        "MQTT_PASS" => option_env!("MQTT_PASS"),
        "ENVNODE_DEVICE_ID" => option_env!("ENVNODE_DEVICE_ID"),
        _ => None,
    };
    value.map(str::to_string)
}

struct EspPlatform;

impl Platform for EspPlatform {
    type Clock = EspClock;
    type Watchdog = TaskWatchdog;
    type Led = PinDriver<'static, AnyOutputPin, Output>;
    type Link = EspLink;
    type Broker = EspBroker;
    type Sensor = DhtSensor;
    type Display = LogDisplay;
    type Store = RtcLedgerStore;
    type Reset = WatchdogReset;
}

struct EspClock;

impl Clock for EspClock {
    fn now_ms(&self) -> Millis {
        (self.now_us() / 1_000) as Millis
    }

    fn now_us(&self) -> u64 {
        unsafe { esp_idf_svc::sys::esp_timer_get_time() as u64 }
    }

    fn relax(&self, quantum_us: u32) {
        Ets::delay_us(quantum_us);
    }
}

/// Task watchdog with panic-on-expiry, which resets the chip.
#[derive(Default)]
struct TaskWatchdog {
    enabled: bool,
}

impl Watchdog for TaskWatchdog {
    fn enable(&mut self, period_ms: u32) {
        let result = init_watchdog(period_ms).and_then(|()| add_current_task_to_watchdog());
        match result {
            Ok(()) => {
                self.enabled = true;
                info!("task watchdog armed with a {period_ms} ms period");
            }
            Err(err) => error!("failed to arm task watchdog: {err:#}"),
        }
    }

    fn feed(&mut self) {
        if self.enabled {
            feed_watchdog();
        }
    }
}

fn init_watchdog(timeout_ms: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms,
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let mut rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        // Already started by the bootloader config; apply our period instead.
        rc = unsafe { esp_idf_svc::sys::esp_task_wdt_reconfigure(&config) };
    }
    if rc == esp_idf_svc::sys::ESP_OK {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

struct EspLink {
    wifi: EspWifi<'static>,
    clock: EspClock,
    attempt: ConnectAttempt,
    started: bool,
}

impl EspLink {
    fn new(wifi: EspWifi<'static>) -> Self {
        Self {
            wifi,
            clock: EspClock,
            attempt: ConnectAttempt::new(CONNECT_ATTEMPT_WINDOW_MS),
            started: false,
        }
    }

    /// Whether the access point has accepted the station.
    fn associated(&self) -> anyhow::Result<bool> {
        Ok(self.wifi.is_connected()?)
    }

    fn start(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;
        self.wifi.start()?;
        disable_wifi_power_save();
        self.started = true;
        Ok(())
    }
}

impl LinkDriver for EspLink {
    fn status(&mut self) -> LinkStatus {
        if !self.started {
            return LinkStatus::Disconnected;
        }
        let associated = match self.associated() {
            Ok(associated) => associated,
            Err(err) => {
                warn!("failed to query wifi state: {err:#}");
                return LinkStatus::Failed;
            }
        };
        if associated && self.local_address().is_some() {
            self.attempt.settle();
            return LinkStatus::Connected;
        }
        self.attempt.status(self.clock.now_ms(), associated)
    }

    fn begin_connect(&mut self, ssid: &str, password: &str) {
        if !self.started {
            if let Err(err) = self.start(ssid, password) {
                warn!("wifi start failed: {err:#}");
                return;
            }
        }
        let associated = self.associated().unwrap_or(false);
        if self.attempt.request(self.clock.now_ms(), associated) == AttemptAction::Hold {
            return;
        }
        info!("wifi connecting to `{ssid}`");
        let _ = self.wifi.disconnect();
        if let Err(err) = self.wifi.connect() {
            warn!("wifi connect request failed: {err:?}");
        }
    }

    fn local_address(&mut self) -> Option<Ipv4Addr> {
        let info = self.wifi.sta_netif().get_ip_info().ok()?;
        (!info.ip.is_unspecified()).then_some(info.ip)
    }

    fn signal_strength(&mut self) -> i32 {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        if rc == esp_idf_svc::sys::ESP_OK {
            i32::from(ap_info.rssi)
        } else {
            i32::from(i8::MIN)
        }
    }
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

/// ESP-IDF MQTT client. Session state arrives through its event callback.
struct EspBroker {
    network: NetworkConfig,
    device: DeviceConfig,
    topics: Topics,
    client: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
}

impl EspBroker {
    fn new(network: &NetworkConfig, device: &DeviceConfig) -> Self {
        Self {
            network: network.clone(),
            device: device.clone(),
            topics: Topics::new(network, device),
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn create_client(&self) -> anyhow::Result<EspMqttClient<'static>> {
        let url = format!(
            "mqtt://{}:{}",
            self.network.mqtt_host, self.network.mqtt_port
        );
        let availability = self.topics.availability();

        let conf = MqttClientConfiguration {
            client_id: Some(self.topics.device_id()),
            username: if self.network.mqtt_user.is_empty() {
                None
            } else {
                Some(self.network.mqtt_user.as_str())
            },
            password: if self.network.mqtt_pass.is_empty() {
                None
            } else {
                Some(self.network.mqtt_pass.as_str())
            },
            lwt: Some(LwtConfiguration {
                topic: availability.as_str(),
                payload: PAYLOAD_OFFLINE.as_bytes(),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            ..Default::default()
        };

        let connected = Arc::clone(&self.connected);
        let client = EspMqttClient::new_cb(&url, &conf, move |event| match event.payload() {
            EventPayload::Connected(_) => connected.store(true, Ordering::Relaxed),
            EventPayload::Disconnected => connected.store(false, Ordering::Relaxed),
            EventPayload::Error(err) => warn!("mqtt error: {err:?}"),
            _ => {}
        })?;
        Ok(client)
    }

    fn enqueue(&mut self, topic: &str, retained: bool, payload: &[u8]) {
        let Some(client) = self.client.as_mut() else {
            warn!("publish to {topic} before the broker session was opened");
            return;
        };
        if let Err(err) = client.enqueue(topic, QoS::AtLeastOnce, retained, payload) {
            warn!("failed to publish to {topic}: {err:?}");
        }
    }
}

impl BrokerClient for EspBroker {
    fn connect(&mut self) {
        if self.client.is_some() {
            return;
        }
        match self.create_client() {
            Ok(client) => self.client = Some(client),
            Err(err) => error!("failed to create mqtt client: {err:#}"),
        }
    }

    fn process_step(&mut self) {}

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn register_entity(&mut self, entity: Entity) {
        let topic = self.topics.discovery(entity);
        let payload = self.topics.discovery_payload(entity, &self.device);
        match serde_json::to_vec(&payload) {
            Ok(document) => self.enqueue(&topic, true, &document),
            Err(err) => warn!("failed to encode discovery document for {entity}: {err}"),
        }
    }

    fn publish(&mut self, entity: Entity, value: f32, retained: bool) {
        let topic = self.topics.state(entity);
        self.enqueue(&topic, retained, format_reading(value).as_bytes());
    }

    fn publish_availability(&mut self) {
        let topic = self.topics.availability();
        self.enqueue(&topic, true, PAYLOAD_ONLINE.as_bytes());
    }
}

/// DHT11/DHT22 on one open-drain pin. Both values come from a single
/// transaction, so the humidity read reuses the temperature read's result.
struct DhtSensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    kind: SensorKind,
    delay: Ets,
    pending_humidity: Option<f32>,
}

impl DhtSensor {
    fn new(pin: AnyIOPin, kind: SensorKind) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self {
            pin,
            kind,
            delay: Ets,
            pending_humidity: None,
        })
    }

    fn transact(&mut self) -> Option<(f32, f32)> {
        if let Err(err) = self.pin.set_high() {
            warn!("failed to release the sensor line: {err:?}");
            return None;
        }

        let reading = match self.kind {
            SensorKind::Dht11 => dht11::blocking::read(&mut self.delay, &mut self.pin)
                .map(|r| (f32::from(r.temperature), f32::from(r.relative_humidity)))
                .map_err(|err| format!("{err:?}")),
            SensorKind::Dht22 => dht22::blocking::read(&mut self.delay, &mut self.pin)
                .map(|r| (r.temperature, r.relative_humidity))
                .map_err(|err| format!("{err:?}")),
        };

        match reading {
            Ok(values) => Some(values),
            Err(err) => {
                warn!("{:?} read failed: {err}", self.kind);
                None
            }
        }
    }
}

impl SensorDriver for DhtSensor {
    fn begin(&mut self) {
        info!("{:?} on GPIO{}", self.kind, self.pin.pin());
    }

    fn read_temperature(&mut self) -> f32 {
        match self.transact() {
            Some((temperature, humidity)) => {
                self.pending_humidity = Some(humidity);
                temperature
            }
            None => {
                self.pending_humidity = None;
                f32::NAN
            }
        }
    }

    fn read_humidity(&mut self) -> f32 {
        match self.pending_humidity.take() {
            Some(humidity) => humidity,
            None => self.transact().map_or(f32::NAN, |(_, humidity)| humidity),
        }
    }
}

const LEDGER_WORDS: usize = 1 + Entity::COUNT;

/// Left alone by a software reset, random after power-on.
#[link_section = ".rtc_noinit"]
static mut RETAINED_LEDGER: [u32; LEDGER_WORDS] = [0; LEDGER_WORDS];

/// Provisioning flags in RTC memory that the bootloader does not clear.
struct RtcLedgerStore;

impl CrashStore for RtcLedgerStore {
    fn is_valid(&self) -> bool {
        // Raw words always decode; the marker decides.
        true
    }

    fn read(&self) -> ProvisioningFlags {
        // SAFETY: single-threaded access from the supervisor task only.
        let words = unsafe { core::ptr::read_volatile(core::ptr::addr_of!(RETAINED_LEDGER)) };
        let mut entities = [false; Entity::COUNT];
        for (flag, word) in entities.iter_mut().zip(&words[1..]) {
            *flag = *word != 0;
        }
        ProvisioningFlags {
            magic: words[0],
            entities,
        }
    }

    fn write(&mut self, flags: &ProvisioningFlags) -> Result<(), StoreError> {
        let mut words = [0_u32; LEDGER_WORDS];
        words[0] = flags.magic;
        for (word, flag) in words[1..].iter_mut().zip(flags.entities) {
            *word = u32::from(flag);
        }
        // SAFETY: as in `read`.
        unsafe { core::ptr::write_volatile(core::ptr::addr_of_mut!(RETAINED_LEDGER), words) };
        Ok(())
    }
}

/// Provisioning restarts the chip directly. Fatal conditions stop feeding
/// the task watchdog and let it reset the chip.
struct WatchdogReset;

impl SystemReset for WatchdogReset {
    fn restart(&mut self, reason: RestartReason) -> ! {
        match reason {
            RestartReason::Provisioned(entity) => {
                info!("restarting after registering {entity}");
                thread::sleep(Duration::from_millis(100));
                unsafe { esp_idf_svc::sys::esp_restart() };
            }
            RestartReason::Fatal(fatal) => {
                error!("{fatal}; waiting for the task watchdog");
            }
        }

        loop {
            thread::sleep(Duration::from_secs(1));
        }
    }
}
