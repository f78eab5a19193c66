use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use btleplug::api::{Central, CentralEvent, CharPropFlags, Peripheral as _, ScanFilter, ValueNotification};
use btleplug::platform::{Peripheral, PeripheralId};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{Receiver as TokioReceiver, Sender as TokioSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ble::{self, DeviceInfo, Radio};
use crate::config::ListenConfig;
use crate::error::HrError;
use crate::measurement::{parse_measurement, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID};
use crate::signal::LinkSignal;
use crate::sources::{Discovery, SourceCache};
use crate::stream::{HrSample, StreamWriter};

const BLOCKED_TTL: Duration = Duration::from_secs(60);
const LINK_SHUTDOWN: Duration = Duration::from_secs(2);

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Connect,
    Busy,
    Blocked,
    Deferred,
    Full,
}

/// Connection bookkeeping: who is linked, who waits for a reconnect and who
/// is ignored for a while.
#[derive(Debug)]
pub struct LinkBook<K> {
    connecting: HashSet<K>,
    connected: HashSet<K>,
    pending: HashMap<K, Instant>,
    blocked: HashMap<K, Instant>,
    generations: HashMap<K, u64>,
    next_generation: u64,
    max_devices: Option<usize>,
}

impl<K: Clone + Eq + Hash> LinkBook<K> {
    pub fn new(max_devices: Option<usize>) -> Self {
        LinkBook {
            connecting: HashSet::new(),
            connected: HashSet::new(),
            pending: HashMap::new(),
            blocked: HashMap::new(),
            generations: HashMap::new(),
            next_generation: 0,
            max_devices,
        }
    }

    pub fn admit(&mut self, id: &K, now: Instant, preferred: bool, in_grace: bool) -> Admission {
        if let Some(until) = self.blocked.get(id) {
            if now < *until {
                return Admission::Blocked;
            }
            self.blocked.remove(id);
        }
        if self.is_linked(id) {
            return Admission::Busy;
        }
        if in_grace && !preferred {
            return Admission::Deferred;
        }
        if self.at_capacity() {
            return Admission::Full;
        }
        Admission::Connect
    }

    pub fn at_capacity(&self) -> bool {
        self.max_devices
            .is_some_and(|max| self.connected.len() + self.connecting.len() >= max)
    }

    pub fn is_linked(&self, id: &K) -> bool {
        self.connected.contains(id) || self.connecting.contains(id)
    }

    /// Starts a link attempt and returns its generation. Signals carrying an
    /// older generation come from a superseded link and are ignored.
    pub fn start_connecting(&mut self, id: K) -> u64 {
        self.next_generation += 1;
        self.generations.insert(id.clone(), self.next_generation);
        self.connecting.insert(id);
        self.next_generation
    }

    pub fn is_current(&self, id: &K, generation: u64) -> bool {
        self.generations.get(id) == Some(&generation)
    }

    pub fn mark_connected(&mut self, id: &K, generation: u64) -> bool {
        if !self.is_current(id, generation) {
            return false;
        }
        self.connecting.remove(id);
        self.pending.remove(id);
        self.connected.insert(id.clone());
        true
    }

    /// Drops the link and queues a reconnect. False when one is already
    /// queued or the device is blocked.
    pub fn schedule_reconnect(&mut self, id: &K, at: Instant) -> bool {
        self.connecting.remove(id);
        self.connected.remove(id);
        self.generations.remove(id);
        if self.blocked.contains_key(id) || self.pending.contains_key(id) {
            return false;
        }
        self.pending.insert(id.clone(), at);
        true
    }

    pub fn block(&mut self, id: &K, until: Instant) {
        self.connecting.remove(id);
        self.connected.remove(id);
        self.pending.remove(id);
        self.generations.remove(id);
        self.blocked.insert(id.clone(), until);
    }

    /// Devices whose reconnect time has come. Each is pushed back by
    /// `interval` so a failed attempt retries later.
    pub fn due_reconnects(&mut self, now: Instant, interval: Duration) -> Vec<K> {
        self.pending.retain(|id, _| !self.connected.contains(id));

        let mut due = vec![];
        for (id, at) in self.pending.iter_mut() {
            if now < *at {
                continue;
            }
            *at = now + interval;
            if !self.connecting.contains(id) {
                due.push(id.clone());
            }
        }
        due
    }
}

pub struct HrListener {
    config: ListenConfig,
    radio: Radio,
    writer: StreamWriter,
    cache: Option<(PathBuf, SourceCache)>,
    preferred: Vec<String>,
    book: LinkBook<PeripheralId>,
    peripherals: HashMap<PeripheralId, Peripheral>,
    names: HashMap<PeripheralId, String>,
    links: HashMap<PeripheralId, (CancellationToken, JoinHandle<()>)>,
    deferred: HashSet<PeripheralId>,
    scan_started: Instant,
    tx: TokioSender<LinkSignal>,
    rx: TokioReceiver<LinkSignal>,
    cancel: CancellationToken,
}

impl HrListener {
    pub async fn new(config: ListenConfig, cancel: CancellationToken) -> Result<Self> {
        let radio = Radio::first().await?;
        let writer = StreamWriter::open(&config.file, config.truncate)
            .with_context(|| format!("opening stream file {}", config.file.display()))?;

        let cache = match &config.sources_file {
            Some(path) => match SourceCache::load(path) {
                Ok(cache) => Some((path.clone(), cache)),
                Err(e) => {
                    warn!("Ignoring sources file: {e}");
                    None
                }
            },
            None => None,
        };
        let preferred = cache
            .as_ref()
            .map(|(_, cache)| cache.preferred_labels())
            .unwrap_or_default();
        if !preferred.is_empty() {
            info!("Preferred sources: {}", preferred.join(", "));
        }

        let (tx, rx) = tokio::sync::mpsc::channel(128);
        let book = LinkBook::new(config.max_devices);

        Ok(HrListener {
            config,
            radio,
            writer,
            cache,
            preferred,
            book,
            peripherals: HashMap::new(),
            names: HashMap::new(),
            links: HashMap::new(),
            deferred: HashSet::new(),
            scan_started: Instant::now(),
            tx,
            rx,
            cancel,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        let mut events = self.radio.adapter.events().await?;
        self.start_scan().await?;
        info!("Listening for Heart Rate...");

        // Devices the OS already knows about never show up as discovered.
        for peripheral in self.radio.adapter.peripherals().await? {
            self.consider(peripheral.id()).await;
        }

        let cancel = self.cancel.clone();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                        self.consider(id).await;
                    }
                    Some(CentralEvent::DeviceDisconnected(id)) => self.on_disconnect(id),
                    Some(_) => {}
                    None => break,
                },
                Some(signal) = self.rx.recv() => self.handle_signal(signal),
                _ = tick.tick() => self.tick().await,
            }
        }

        info!("Stopping listener");
        let _ = self.radio.adapter.stop_scan().await;
        // Each link disconnects what it connected on its way out.
        for (cancel, _) in self.links.values() {
            cancel.cancel();
        }
        for (_, (_, task)) in self.links.drain() {
            let _ = tokio::time::timeout(LINK_SHUTDOWN, task).await;
        }
        Ok(())
    }

    async fn start_scan(&mut self) -> Result<()> {
        let filter = if self.config.scan_all {
            ScanFilter::default()
        } else {
            ScanFilter {
                services: vec![HEART_RATE_SERVICE_UUID],
            }
        };
        self.radio
            .adapter
            .start_scan(filter)
            .await
            .context("Can't scan BLE adapter for Heart Rate devices")?;
        self.scan_started = Instant::now();
        Ok(())
    }

    fn label(&self, id: &PeripheralId) -> String {
        self.names
            .get(id)
            .cloned()
            .unwrap_or_else(|| format!("{id:?}"))
    }

    fn in_grace(&self) -> bool {
        in_grace(!self.preferred.is_empty(), self.scan_started.elapsed(), self.config.preferred_grace)
    }

    async fn consider(&mut self, id: PeripheralId) {
        let Ok(peripheral) = self.radio.adapter.peripheral(&id).await else {
            return;
        };
        let Some(info) = ble::device_info(&peripheral).await else {
            return;
        };
        let label = info.label().to_string();
        self.names.insert(id.clone(), label.clone());
        self.peripherals.insert(id.clone(), peripheral.clone());

        if !wanted(&info, &self.config) {
            return;
        }

        let preferred = ble::matches_any(&[label.as_str(), info.address.as_str()], &self.preferred);
        match self.book.admit(&id, Instant::now(), preferred, self.in_grace()) {
            Admission::Connect => {
                self.deferred.remove(&id);
                self.spawn_link(id, peripheral, label, info.address);
            }
            Admission::Deferred => {
                if self.deferred.insert(id) {
                    debug!("Deferring {label} while waiting for preferred sources");
                }
            }
            Admission::Busy | Admission::Blocked | Admission::Full => {}
        }
    }

    fn spawn_link(&mut self, id: PeripheralId, peripheral: Peripheral, label: String, address: String) {
        let generation = self.book.start_connecting(id.clone());
        info!("Connecting to {label} ({address})");

        let cancel = self.cancel.child_token();
        if let Some((old, _)) = self.links.remove(&id) {
            old.cancel();
        }
        let link = Link {
            peripheral,
            id: id.clone(),
            generation,
            label,
            address,
            timeout: Duration::from_secs_f64(self.config.connect_timeout.max(0.1)),
            tx: self.tx.clone(),
            cancel: cancel.clone(),
        };
        self.links.insert(id, (cancel, tokio::spawn(link.run())));
    }

    fn handle_signal(&mut self, signal: LinkSignal) {
        match signal {
            LinkSignal::Subscribed(id, generation) => {
                let label = self.label(&id);
                if !self.book.mark_connected(&id, generation) {
                    debug!("Ignoring subscription from a superseded link to {label}");
                    return;
                }
                info!("Subscribed to Heart Rate on {label}");
                self.remember(&id, &label);
            }
            LinkSignal::HeartRate(sample) => {
                info!("{} HR={} bpm", sample.source, sample.bpm);
                if let Err(e) = self.writer.append(&sample) {
                    warn!("Dropping sample: {e}");
                }
            }
            LinkSignal::ConnectFailed(id, generation, _) | LinkSignal::NoHeartRate(id, generation, _)
            | LinkSignal::Disconnected(id, generation)
                if !self.book.is_current(&id, generation) =>
            {
                debug!("Ignoring signal from a superseded link to {}", self.label(&id));
            }
            LinkSignal::ConnectFailed(id, _, reason) => {
                warn!("Failed to connect. {reason}");
                self.schedule_reconnect(&id, "Connect failed.");
            }
            LinkSignal::NoHeartRate(id, _, reason) => {
                self.book.block(&id, Instant::now() + BLOCKED_TTL);
                warn!(
                    "{reason}. Ignoring {} for {}s.",
                    self.label(&id),
                    BLOCKED_TTL.as_secs()
                );
            }
            LinkSignal::Disconnected(id, _) => self.schedule_reconnect(&id, "Disconnected."),
        }
    }

    fn on_disconnect(&mut self, id: PeripheralId) {
        if !self.book.is_linked(&id) {
            return;
        }
        if let Some((cancel, _)) = self.links.remove(&id) {
            cancel.cancel();
        }
        self.schedule_reconnect(&id, "Disconnected.");
    }

    fn schedule_reconnect(&mut self, id: &PeripheralId, reason: &str) {
        let delay = Duration::from_secs_f64(self.config.reconnect_interval.max(0.1));
        if self.book.schedule_reconnect(id, Instant::now() + delay) {
            warn!(
                "{reason} Reconnecting in {:.1}s... ({})",
                delay.as_secs_f64(),
                self.label(id)
            );
        }
    }

    fn remember(&mut self, id: &PeripheralId, label: &str) {
        let Some((path, cache)) = self.cache.as_mut() else {
            return;
        };
        let Some(peripheral) = self.peripherals.get(id) else {
            return;
        };
        let address = ble::device_address(peripheral);
        if cache.get(&address).is_none() {
            info!("Remembering {label} ({address})");
        }
        cache.upsert(&address, label, Discovery::Listener, true);
        if let Err(e) = cache.save(path.as_path()) {
            warn!("Could not update sources file: {e}");
        }
    }

    async fn tick(&mut self) {
        let interval = Duration::from_secs_f64(self.config.reconnect_interval.max(0.1));
        let mut rescan = false;
        for id in self.book.due_reconnects(Instant::now(), interval) {
            if self.book.at_capacity() {
                continue;
            }
            let label = self.label(&id);
            match self.peripherals.get(&id).cloned() {
                Some(peripheral) => {
                    info!("Reconnect attempt: connect {label}");
                    let address = ble::device_address(&peripheral);
                    self.spawn_link(id, peripheral, label, address);
                }
                None => rescan = true,
            }
        }

        if rescan {
            info!("Reconnect attempt: scan");
            let _ = self.radio.adapter.stop_scan().await;
            if let Err(e) = self.start_scan().await {
                warn!("{e:#}");
            }
        }

        if !self.deferred.is_empty() && !self.in_grace() {
            let deferred: Vec<PeripheralId> = self.deferred.drain().collect();
            for id in deferred {
                self.consider(id).await;
            }
        }
    }
}

async fn subscribe(peripheral: &Peripheral, label: &str, timeout: Duration) -> Result<Notifications, HrError> {
    ble::connect(peripheral, label, timeout).await?;
    if !ble::has_heart_rate_service(peripheral).await? {
        return Err(HrError::NoHeartRateService(label.to_string()));
    }

    let characteristic = peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == HEART_RATE_MEASUREMENT_UUID && c.properties.contains(CharPropFlags::NOTIFY))
        .ok_or_else(|| HrError::NoHeartRateCharacteristic(label.to_string()))?;

    debug!("Subscribing to characteristic {:?}", characteristic.uuid);
    peripheral.subscribe(&characteristic).await?;
    Ok(peripheral.notifications().await?)
}

/// One connection attempt to one device and, once subscribed, its
/// notification loop.
struct Link {
    peripheral: Peripheral,
    id: PeripheralId,
    generation: u64,
    label: String,
    address: String,
    timeout: Duration,
    tx: TokioSender<LinkSignal>,
    cancel: CancellationToken,
}

impl Link {
    async fn run(self) {
        let Link { peripheral, id, generation, label, address, timeout, tx, cancel } = self;

        // A link made by someone else (the OS, another app) is left alone.
        let was_connected = peripheral.is_connected().await.unwrap_or(false);

        let subscribed = tokio::select! {
            _ = cancel.cancelled() => {
                release(&peripheral, was_connected).await;
                return;
            }
            result = subscribe(&peripheral, &label, timeout) => result,
        };
        let mut notifications = match subscribed {
            Ok(notifications) => notifications,
            Err(e @ (HrError::NoHeartRateService(_) | HrError::NoHeartRateCharacteristic(_))) => {
                release(&peripheral, was_connected).await;
                let _ = tx.send(LinkSignal::NoHeartRate(id, generation, e.to_string())).await;
                return;
            }
            Err(e) => {
                let _ = tx.send(LinkSignal::ConnectFailed(id, generation, e.to_string())).await;
                return;
            }
        };
        let _ = tx.send(LinkSignal::Subscribed(id.clone(), generation)).await;

        // Process while the BLE connection is not broken or stopped.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    release(&peripheral, was_connected).await;
                    return;
                }
                data = notifications.next() => {
                    let Some(data) = data else { break; };
                    if data.uuid != HEART_RATE_MEASUREMENT_UUID {
                        continue;
                    }
                    match parse_measurement(&data.value) {
                        Ok(measurement) => {
                            if measurement.sensor_contact == Some(false) {
                                debug!("{label}: no skin contact");
                            }
                            if let Some(energy) = measurement.energy_expended {
                                debug!("{label}: energy expended {energy} kJ");
                            }
                            let sample = HrSample::new(measurement.bpm, label.as_str())
                                .with_id(address.as_str())
                                .with_rr(measurement.rr_millis());
                            if tx.send(LinkSignal::HeartRate(sample)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => debug!("Skipping payload from {label}: {e}"),
                    }
                }
            }
        }
        let _ = tx.send(LinkSignal::Disconnected(id, generation)).await;
    }
}

async fn release(peripheral: &Peripheral, was_connected: bool) {
    if !was_connected {
        let _ = peripheral.disconnect().await;
    }
}

/// Name and address filters, plus the Heart Rate service check unless
/// `--scan-all` is given.
pub fn wanted(info: &DeviceInfo, config: &ListenConfig) -> bool {
    if !config.scan_all && !info.advertises_heart_rate() {
        return false;
    }
    let name = info.name.as_deref().unwrap_or_default();
    if !config.name.is_empty() && !ble::matches_any(&[name], &config.name) {
        return false;
    }
    if !config.address.is_empty() && !ble::matches_any(&[info.address.as_str()], &config.address) {
        return false;
    }
    true
}

/// True while non-preferred devices should wait for preferred ones.
pub fn in_grace(has_preferred: bool, since_scan: Duration, grace_secs: f64) -> bool {
    has_preferred && since_scan < Duration::from_secs_f64(grace_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::config::{Cli, Command};

    #[test]
    fn admission_order() {
        let now = Instant::now();
        let mut book = LinkBook::new(Some(1));
        assert_eq!(book.admit(&"a", now, false, true), Admission::Deferred);
        assert_eq!(book.admit(&"a", now, true, true), Admission::Connect);
        book.start_connecting("a");
        assert_eq!(book.admit(&"a", now, true, false), Admission::Busy);
        assert_eq!(book.admit(&"b", now, false, false), Admission::Full);

        book.block(&"a", now + Duration::from_secs(60));
        assert!(!book.is_linked(&"a"));
        assert_eq!(book.admit(&"a", now, true, false), Admission::Blocked);
        assert_eq!(
            book.admit(&"a", now + Duration::from_secs(61), true, false),
            Admission::Connect
        );
    }

    #[test]
    fn reconnects_are_queued_once() {
        let now = Instant::now();
        let interval = Duration::from_secs(5);
        let mut book = LinkBook::new(None);
        let generation = book.start_connecting("a");
        assert!(book.mark_connected(&"a", generation));

        assert!(book.schedule_reconnect(&"a", now + interval));
        assert!(!book.schedule_reconnect(&"a", now + interval));
        assert!(!book.is_linked(&"a"));

        assert!(book.due_reconnects(now, interval).is_empty());
        assert_eq!(book.due_reconnects(now + interval, interval), vec!["a"]);
        // pushed back after an attempt
        assert!(book.due_reconnects(now + interval, interval).is_empty());

        let generation = book.start_connecting("a");
        assert!(book.mark_connected(&"a", generation));
        assert!(book.due_reconnects(now + interval * 3, interval).is_empty());
        assert!(book.is_linked(&"a"));
    }

    #[test]
    fn superseded_link_cannot_claim_the_device() {
        let now = Instant::now();
        let interval = Duration::from_secs(5);
        let mut book = LinkBook::new(Some(1));

        // A stale disconnect lands while the reconnect is still subscribing.
        let generation = book.start_connecting("a");
        assert!(book.schedule_reconnect(&"a", now + interval));
        assert!(!book.is_current(&"a", generation));
        assert!(!book.mark_connected(&"a", generation));

        assert!(!book.is_linked(&"a"));
        assert!(!book.at_capacity());
        assert_eq!(book.due_reconnects(now + interval, interval), vec!["a"]);

        let retry = book.start_connecting("a");
        assert_ne!(retry, generation);
        assert!(book.mark_connected(&"a", retry));
        assert!(book.at_capacity());
    }

    fn listen_config(args: &[&str]) -> ListenConfig {
        let argv = ["hrlight", "listen"].iter().chain(args).copied();
        let Command::Listen(config) = Cli::try_parse_from(argv).unwrap().command else {
            panic!("expected listen");
        };
        config
    }

    fn device(name: &str, address: &str, heart_rate: bool) -> DeviceInfo {
        DeviceInfo {
            address: address.to_string(),
            name: Some(name.to_string()),
            services: if heart_rate { vec![HEART_RATE_SERVICE_UUID] } else { vec![] },
            ..DeviceInfo::default()
        }
    }

    #[test]
    fn only_heart_rate_devices_unless_scan_all() {
        let mouse = device("MX Master", "11:22:33:44:55:66", false);
        let strap = device("Polar H10 1234", "AA:BB:CC:DD:EE:FF", true);

        let config = listen_config(&[]);
        assert!(!wanted(&mouse, &config));
        assert!(wanted(&strap, &config));

        let config = listen_config(&["--scan-all"]);
        assert!(wanted(&mouse, &config));
    }

    #[test]
    fn name_and_address_filters() {
        let strap = device("Polar H10 1234", "AA:BB:CC:DD:EE:FF", true);

        assert!(wanted(&strap, &listen_config(&["--name", "polar"])));
        assert!(!wanted(&strap, &listen_config(&["--name", "garmin"])));
        assert!(wanted(&strap, &listen_config(&["--name", "garmin", "--name", "h10"])));
        assert!(wanted(&strap, &listen_config(&["--address", "cc:dd"])));
        assert!(!wanted(&strap, &listen_config(&["--address", "00:11"])));
        assert!(!wanted(&strap, &listen_config(&["--name", "polar", "--address", "00:11"])));
    }

    #[test]
    fn deferred_devices_connect_after_grace() {
        let grace = 6.0;
        assert!(in_grace(true, Duration::from_secs(2), grace));
        assert!(!in_grace(true, Duration::from_secs(6), grace));
        assert!(!in_grace(false, Duration::ZERO, grace));
        assert!(!in_grace(true, Duration::ZERO, 0.0));

        let now = Instant::now();
        let mut book = LinkBook::new(None);
        let open = in_grace(true, Duration::from_secs(1), grace);
        assert_eq!(book.admit(&"other", now, false, open), Admission::Deferred);
        assert_eq!(book.admit(&"mine", now, true, open), Admission::Connect);

        let open = in_grace(true, Duration::from_secs(7), grace);
        assert_eq!(book.admit(&"other", now, false, open), Admission::Connect);
    }

    #[test]
    fn blocked_devices_are_not_rescheduled() {
        let now = Instant::now();
        let mut book = LinkBook::new(None);
        book.start_connecting("a");
        book.block(&"a", now + BLOCKED_TTL);
        assert!(!book.schedule_reconnect(&"a", now));
        assert!(book.due_reconnects(now, Duration::from_secs(1)).is_empty());
    }
}
