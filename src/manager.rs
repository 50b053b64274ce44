//! Scale link lifecycle: discovery, connection, measurement delivery.
//!
//! `ScaleLinkManager` owns the device registry, the single active link and
//! the latest reading. Consumers observe it through [`ScaleEvent`]s from
//! [`ScaleLinkManager::subscribe`] and read snapshots through the query
//! methods. Scan and notification work runs as tokio tasks driven by the
//! radio's streams; shared state sits behind a mutex that is never held
//! across an await.

use futures_util::stream::{BoxStream, SelectAll, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::bluetooth::radio::{RadioClient, RadioState};
use crate::bluetooth::uuids::{
    is_scale_service_set, BODY_COMPOSITION_MEASUREMENT, BODY_COMPOSITION_SERVICE,
    SCALE_SERVICES, WEIGHT_MEASUREMENT, WEIGHT_SCALE_SERVICE,
};
use crate::error::{Result, ScaleError};
use crate::events::{EventBus, EventReceiver, ScaleEvent};
use crate::models::{Advertisement, ScaleDevice, ScaleReading};
use crate::protocol::{decode_body_composition, decode_weight};
use crate::registry::DeviceRegistry;
use crate::utils::format_datetime;

pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Used when `start_scan` is called without a timeout
    pub scan_timeout: Duration,
    /// Ask the radio to report every advertisement, not just the first
    pub allow_duplicates: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        ManagerOptions {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            allow_duplicates: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Measurement {
    Weight,
    BodyComposition,
}

type Notifications = SelectAll<BoxStream<'static, (Measurement, Vec<u8>)>>;

struct Task {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Task {
    async fn stop(self, what: &str) {
        let _ = self.cancel.send(());
        if let Err(e) = self.handle.await {
            warn!("{} task ended abnormally: {}", what, e);
        }
    }
}

struct ScanSession {
    generation: u64,
    task: Task,
}

struct ActiveLink {
    id: String,
    generation: u64,
    pump: Option<Task>,
}

enum Link {
    Idle,
    Connecting(String),
    Connected(ActiveLink),
}

/// Most recent reading and the scale it came from
struct LatestReading {
    device_id: String,
    reading: ScaleReading,
}

struct State {
    disposed: bool,
    registry: DeviceRegistry,
    latest: Option<LatestReading>,
    scan: Option<ScanSession>,
    scan_generation: u64,
    link: Link,
    link_generation: u64,
}

impl State {
    fn is_current_link(&self, generation: u64) -> bool {
        matches!(&self.link, Link::Connected(active) if active.generation == generation)
    }

    fn connected_id(&self) -> Option<&str> {
        match &self.link {
            Link::Connected(active) => Some(&active.id),
            _ => None,
        }
    }
}

/// Puts a `Connecting` slot back to idle if the attempt never reached
/// `Connected`, including when the caller drops the connect future
struct PendingConnect<'a> {
    shared: &'a Shared,
    id: &'a str,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if matches!(&state.link, Link::Connecting(pending) if pending == self.id) {
            debug!("Connect attempt to {} abandoned", self.id);
            state.link = Link::Idle;
        }
    }
}

struct Shared {
    radio: Arc<dyn RadioClient>,
    events: EventBus,
    options: ManagerOptions,
    state: Mutex<State>,
}

/// Discovers, connects to and streams measurements from one BLE scale at a
/// time. Call [`destroy`](Self::destroy) when done; afterwards every
/// operation fails with [`ScaleError::Disposed`].
///
/// Connecting while another device is connected (or still connecting) is
/// rejected with [`ScaleError::AlreadyConnected`]; disconnect first.
pub struct ScaleLinkManager {
    shared: Arc<Shared>,
}

impl ScaleLinkManager {
    pub fn new(radio: Arc<dyn RadioClient>) -> Self {
        Self::with_options(radio, ManagerOptions::default())
    }

    pub fn with_options(radio: Arc<dyn RadioClient>, options: ManagerOptions) -> Self {
        ScaleLinkManager {
            shared: Arc::new(Shared {
                radio,
                events: EventBus::new(),
                options,
                state: Mutex::new(State {
                    disposed: false,
                    registry: DeviceRegistry::new(),
                    latest: None,
                    scan: None,
                    scan_generation: 0,
                    link: Link::Idle,
                    link_generation: 0,
                }),
            }),
        }
    }

    /// Ordered stream of every event emitted from now on
    pub fn subscribe(&self) -> Result<EventReceiver> {
        self.shared.ensure_live()?;
        Ok(self.shared.events.subscribe())
    }

    /// Begin a time-bounded scan for scales. `None` uses the configured
    /// default timeout.
    pub async fn start_scan(&self, timeout: Option<Duration>) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_live()?;

        match shared.radio.state().await {
            Ok(RadioState::PoweredOn) => {}
            Ok(state) => {
                warn!("Bluetooth radio not usable: {:?}", state);
                return Err(ScaleError::UnsupportedPlatform);
            }
            Err(e) => {
                error!("Failed to query radio state: {}", e);
                return Err(ScaleError::UnsupportedPlatform);
            }
        }

        let timeout = timeout.unwrap_or(shared.options.scan_timeout);
        let mut state = shared.lock();
        if state.disposed {
            return Err(ScaleError::Disposed);
        }
        if state.scan.is_some() {
            return Err(ScaleError::AlreadyScanning);
        }

        state.scan_generation += 1;
        let generation = state.scan_generation;
        let (cancel, cancelled) = oneshot::channel();

        info!("Starting scale scan for {} ms", timeout.as_millis());
        shared.events.emit(ScaleEvent::ScanStart);

        let handle = tokio::spawn(run_scan(
            Arc::clone(shared),
            generation,
            timeout,
            cancelled,
        ));
        state.scan = Some(ScanSession {
            generation,
            task: Task { cancel, handle },
        });
        Ok(())
    }

    /// Cancel the running scan. No-op when nothing is scanning.
    pub async fn stop_scan(&self) -> Result<()> {
        self.shared.ensure_live()?;
        self.shared.stop_scan().await;
        Ok(())
    }

    /// Connect to a previously discovered scale and subscribe to its
    /// measurement characteristics
    pub async fn connect_to_device(&self, id: &str) -> Result<ScaleDevice> {
        let shared = &self.shared;

        let device = {
            let mut state = shared.lock();
            if state.disposed {
                return Err(ScaleError::Disposed);
            }
            let device = state
                .registry
                .get(id)
                .cloned()
                .ok_or_else(|| ScaleError::DeviceNotFound(id.to_string()))?;
            match &state.link {
                Link::Connected(active) if active.id == id => return Ok(device),
                Link::Connected(active) => {
                    return Err(ScaleError::AlreadyConnected(active.id.clone()))
                }
                Link::Connecting(other) => return Err(ScaleError::AlreadyConnected(other.clone())),
                Link::Idle => {}
            }
            state.link = Link::Connecting(id.to_string());
            device
        };
        let pending = PendingConnect { shared, id };

        info!("Connecting to {} ({})", device.display_name(), id);
        shared.events.emit(ScaleEvent::Connecting(device));

        let info = match shared.radio.connect(id).await {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to connect to {}: {}", id, e);
                drop(pending);
                shared.events.error(ScaleError::Radio(e.clone()));
                return Err(ScaleError::ConnectionFailed {
                    id: id.to_string(),
                    source: e,
                });
            }
        };

        let connected_at = OffsetDateTime::now_utc();
        let connected = {
            let mut state = shared.lock();
            if state.disposed {
                None
            } else {
                state.link_generation += 1;
                let generation = state.link_generation;
                let device = state.registry.mark_connected(id, connected_at, &info);
                if device.is_some() {
                    state.link = Link::Connected(ActiveLink {
                        id: id.to_string(),
                        generation,
                        pump: None,
                    });
                }
                device.map(|device| (device, generation))
            }
        };
        drop(pending);
        let Some((device, generation)) = connected else {
            // torn down while the handshake was in flight
            if let Err(e) = shared.radio.disconnect(id).await {
                debug!("Disconnect after teardown failed for {}: {}", id, e);
            }
            return Err(ScaleError::Disposed);
        };

        info!(
            "Connected to {} at {}",
            device.display_name(),
            format_datetime(&connected_at)
        );
        shared.events.emit(ScaleEvent::Connected(device.clone()));

        let notifications = shared.subscribe_measurements(id).await;
        if notifications.is_empty() {
            warn!("No measurement characteristics available on {}", id);
            return Ok(device);
        }

        let (cancel, cancelled) = oneshot::channel();
        let handle = tokio::spawn(run_notifications(
            Arc::clone(shared),
            id.to_string(),
            generation,
            notifications,
            cancelled,
        ));
        let mut state = shared.lock();
        match &mut state.link {
            Link::Connected(active) if active.generation == generation => {
                active.pump = Some(Task { cancel, handle });
            }
            // link went away while subscribing
            _ => {
                let _ = cancel.send(());
            }
        }
        Ok(device)
    }

    /// Tear down the active connection, if any
    pub async fn disconnect_device(&self) -> Result<()> {
        self.shared.ensure_live()?;
        self.shared.disconnect().await;
        Ok(())
    }

    /// Whether `id` is the connected device and exposes the body
    /// composition service. Any failure reads as "not supported".
    pub async fn supports_body_composition(&self, id: &str) -> Result<bool> {
        self.shared.ensure_live()?;
        let connected = self.shared.lock().connected_id() == Some(id);
        if !connected {
            return Ok(false);
        }
        match self.shared.radio.services(id).await {
            Ok(services) => Ok(services.contains(&BODY_COMPOSITION_SERVICE)),
            Err(e) => {
                debug!("Service query for {} failed: {}", id, e);
                Ok(false)
            }
        }
    }

    pub fn get_discovered_devices(&self) -> Result<Vec<ScaleDevice>> {
        let state = self.shared.live_state()?;
        Ok(state.registry.snapshot())
    }

    pub fn get_device_by_id(&self, id: &str) -> Result<Option<ScaleDevice>> {
        let state = self.shared.live_state()?;
        Ok(state.registry.get(id).cloned())
    }

    pub fn get_latest_data(&self) -> Result<Option<ScaleReading>> {
        let state = self.shared.live_state()?;
        Ok(state.latest.as_ref().map(|latest| latest.reading.clone()))
    }

    pub fn is_scanning(&self) -> Result<bool> {
        let state = self.shared.live_state()?;
        Ok(state.scan.is_some())
    }

    pub fn connected_device(&self) -> Result<Option<ScaleDevice>> {
        let state = self.shared.live_state()?;
        Ok(state
            .connected_id()
            .and_then(|id| state.registry.get(id))
            .cloned())
    }

    /// Stop scanning, disconnect, release the radio and close all event
    /// streams. Safe to call more than once.
    pub async fn destroy(&self) {
        let already = {
            let mut state = self.shared.lock();
            std::mem::replace(&mut state.disposed, true)
        };
        if already {
            debug!("Scale link already destroyed");
            return;
        }

        info!("Shutting down scale link");
        self.shared.stop_scan().await;
        self.shared.disconnect().await;
        self.shared.radio.shutdown().await;
        {
            let mut state = self.shared.lock();
            state.registry.clear();
            state.latest = None;
        }
        self.shared.events.close();
    }
}

impl Drop for ScaleLinkManager {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if !state.disposed {
            warn!("Scale link dropped without destroy(); aborting background tasks");
        }
        if let Some(scan) = state.scan.take() {
            scan.task.handle.abort();
        }
        if let Link::Connected(active) = &mut state.link {
            if let Some(pump) = active.pump.take() {
                pump.handle.abort();
            }
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_live(&self) -> Result<()> {
        self.live_state().map(|_| ())
    }

    fn live_state(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.lock();
        if state.disposed {
            return Err(ScaleError::Disposed);
        }
        Ok(state)
    }

    async fn stop_scan(&self) {
        let session = self.lock().scan.take();
        if let Some(session) = session {
            debug!("Stopping scan {}", session.generation);
            session.task.stop("Scan").await;
        }
    }

    async fn disconnect(&self) {
        let active = {
            let mut state = self.lock();
            match std::mem::replace(&mut state.link, Link::Idle) {
                Link::Connected(active) => Some(active),
                other => {
                    state.link = other;
                    None
                }
            }
        };
        let Some(mut active) = active else {
            return;
        };

        if let Some(pump) = active.pump.take() {
            pump.stop("Notification").await;
        }
        if let Err(e) = self.radio.disconnect(&active.id).await {
            warn!("Radio disconnect from {} failed: {}", active.id, e);
            self.events.error(ScaleError::Radio(e));
        }

        let device = self.lock().registry.mark_disconnected(&active.id);
        if let Some(device) = device {
            info!("Disconnected from {}", device.display_name());
            self.events.emit(ScaleEvent::Disconnected(device));
        }
    }

    /// Subscribe to each measurement characteristic whose service the device
    /// offers, merged into one stream in arrival order
    async fn subscribe_measurements(&self, id: &str) -> Notifications {
        let services = match self.radio.services(id).await {
            Ok(services) => services,
            Err(e) => {
                debug!("Service list for {} unavailable ({}), trying both", id, e);
                SCALE_SERVICES.to_vec()
            }
        };

        let mut notifications = Notifications::new();
        for (service, characteristic, kind) in [
            (WEIGHT_SCALE_SERVICE, WEIGHT_MEASUREMENT, Measurement::Weight),
            (
                BODY_COMPOSITION_SERVICE,
                BODY_COMPOSITION_MEASUREMENT,
                Measurement::BodyComposition,
            ),
        ] {
            if !services.contains(&service) {
                continue;
            }
            match self.radio.subscribe(id, service, characteristic).await {
                Ok(values) => {
                    debug!("Subscribed to {:?} notifications on {}", kind, id);
                    notifications.push(values.map(move |payload| (kind, payload)).boxed());
                }
                Err(e) => {
                    warn!("Failed to subscribe to {:?} on {}: {}", kind, id, e);
                    self.events.error(ScaleError::Radio(e));
                }
            }
        }
        notifications
    }

    fn handle_advertisement(&self, advertisement: Advertisement, seen: &mut HashSet<String>) {
        if !is_scale_service_set(&advertisement.services) {
            debug!("Ignoring non-scale peripheral {}", advertisement.id);
            return;
        }

        let mut state = self.lock();
        if state.disposed {
            return;
        }
        let (device, _) = state.registry.observe(&advertisement);
        if seen.insert(device.id.clone()) {
            info!(
                "Found scale {} ({}), rssi={:?}",
                device.display_name(),
                device.id,
                advertisement.rssi
            );
            self.events.emit(ScaleEvent::DeviceFound(device));
        } else {
            debug!("Re-observed {}", device.id);
        }
    }

    fn handle_weight(&self, id: &str, generation: u64, payload: &[u8]) {
        let reading = match decode_weight(payload, OffsetDateTime::now_utc()) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Dropping weight payload from {}: {}", id, e);
                self.events.error(ScaleError::Decode(e));
                return;
            }
        };

        let mut state = self.lock();
        if !state.is_current_link(generation) {
            return;
        }
        debug!(
            "Weight from {}: {:.3} {}",
            id,
            reading.weight,
            reading.unit.symbol()
        );
        state.registry.record_weight(id, reading.weight);
        state.latest = Some(LatestReading {
            device_id: id.to_string(),
            reading: reading.clone(),
        });
        self.events.emit(ScaleEvent::WeightData(reading));
    }

    fn handle_body_composition(&self, id: &str, generation: u64, payload: &[u8]) {
        let sample = match decode_body_composition(payload, OffsetDateTime::now_utc()) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Dropping body composition payload from {}: {}", id, e);
                self.events.error(ScaleError::Decode(e));
                return;
            }
        };

        let mut state = self.lock();
        if !state.is_current_link(generation) {
            return;
        }
        // only merge onto a reading taken by this same scale
        let prior = state
            .latest
            .as_ref()
            .filter(|latest| latest.device_id == id)
            .map(|latest| &latest.reading);
        let merged = match prior {
            Some(prior) => Some(prior.merged_with(&sample)),
            None => ScaleReading::from_sample(&sample),
        };
        let Some(reading) = merged else {
            warn!(
                "Body composition from {} arrived before any weight from it, dropped",
                id
            );
            return;
        };

        if sample.weight.is_some() {
            state.registry.record_weight(id, reading.weight);
        }
        state.latest = Some(LatestReading {
            device_id: id.to_string(),
            reading: reading.clone(),
        });
        self.events.emit(ScaleEvent::BodyCompositionData(reading));
    }

    fn handle_link_lost(&self, id: &str, generation: u64) {
        let mut state = self.lock();
        if !state.is_current_link(generation) {
            return;
        }
        state.link = Link::Idle;
        warn!("Lost connection to {}", id);
        if let Some(device) = state.registry.mark_disconnected(id) {
            self.events.emit(ScaleEvent::Disconnected(device));
        }
        self.events.error(ScaleError::ConnectionLost(id.to_string()));
    }
}

async fn run_scan(
    shared: Arc<Shared>,
    generation: u64,
    timeout: Duration,
    mut cancelled: oneshot::Receiver<()>,
) {
    match shared
        .radio
        .start_scan(&SCALE_SERVICES, shared.options.allow_duplicates)
        .await
    {
        Ok(mut advertisements) => {
            let deadline = sleep(timeout);
            tokio::pin!(deadline);
            let mut seen = HashSet::new();

            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        debug!("Scan {} timed out", generation);
                        break;
                    }
                    _ = &mut cancelled => {
                        debug!("Scan {} cancelled", generation);
                        break;
                    }
                    advertisement = advertisements.next() => match advertisement {
                        Some(advertisement) => shared.handle_advertisement(advertisement, &mut seen),
                        None => {
                            debug!("Advertisement stream ended");
                            break;
                        }
                    }
                }
            }

            drop(advertisements);
            if let Err(e) = shared.radio.stop_scan().await {
                warn!("Failed to stop discovery: {}", e);
                shared.events.error(ScaleError::Radio(e));
            }
        }
        Err(e) => {
            error!("Failed to start device discovery: {}", e);
            shared.events.error(ScaleError::Radio(e));
        }
    }

    let mut state = shared.lock();
    if state.scan.as_ref().map(|s| s.generation) == Some(generation) {
        state.scan = None;
    }
    info!(
        "Scan finished, {} scale(s) known",
        state.registry.len()
    );
    shared.events.emit(ScaleEvent::ScanEnd);
}

async fn run_notifications(
    shared: Arc<Shared>,
    id: String,
    generation: u64,
    mut notifications: Notifications,
    mut cancelled: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut cancelled => {
                debug!("Notification pump for {} stopped", id);
                return;
            }
            next = notifications.next() => match next {
                Some((Measurement::Weight, payload)) => shared.handle_weight(&id, generation, &payload),
                Some((Measurement::BodyComposition, payload)) => {
                    shared.handle_body_composition(&id, generation, &payload)
                }
                None => break,
            }
        }
    }
    shared.handle_link_lost(&id, generation);
}
