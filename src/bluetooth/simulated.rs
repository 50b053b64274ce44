//! In-process stand-in for a BLE central.
//!
//! Used for development runs without hardware and by the test suite. Each
//! fixture device is advertised twice per scan, notifications can be pushed
//! by hand, and links can be dropped as if the scale walked out of range.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::bluetooth::radio::{
    AdvertisementStream, NotificationStream, RadioClient, RadioState,
};
use crate::bluetooth::uuids::{
    BODY_COMPOSITION_MEASUREMENT, BODY_COMPOSITION_SERVICE, WEIGHT_MEASUREMENT,
    WEIGHT_SCALE_SERVICE,
};
use crate::error::RadioError;
use crate::models::{Advertisement, PeripheralInfo};

const DEFAULT_ADVERTISE_INTERVAL_MS: u64 = 20;
const DEFAULT_CONNECT_DELAY_MS: u64 = 10;

/// A scale the simulated radio can "see"
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub id: String,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
    pub manufacturer: Option<String>,
    pub model_number: Option<String>,
    pub reachable: bool,
}

impl SimulatedDevice {
    /// Weight-only scale
    pub fn weight_scale(id: &str, name: &str) -> Self {
        SimulatedDevice {
            id: id.to_string(),
            name: Some(name.to_string()),
            services: vec![WEIGHT_SCALE_SERVICE],
            manufacturer: None,
            model_number: None,
            reachable: true,
        }
    }

    /// Scale exposing both the weight and the body composition service
    pub fn body_composition_scale(id: &str, name: &str) -> Self {
        let mut device = Self::weight_scale(id, name);
        device.services.push(BODY_COMPOSITION_SERVICE);
        device
    }

    pub fn with_info(mut self, manufacturer: &str, model_number: &str) -> Self {
        self.manufacturer = Some(manufacturer.to_string());
        self.model_number = Some(model_number.to_string());
        self
    }

    /// Advertises normally but refuses every connection attempt
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    fn advertisement(&self, rssi: i16) -> Advertisement {
        Advertisement {
            id: self.id.clone(),
            name: self.name.clone(),
            services: self.services.clone(),
            rssi: Some(rssi),
        }
    }
}

#[derive(Debug)]
struct Settings {
    state: RadioState,
    advertise_interval: Duration,
    connect_delay: Duration,
    auto_readings: Option<Duration>,
    fail_next_scan: bool,
}

#[derive(Default)]
struct Link {
    subscribers: HashMap<Uuid, mpsc::UnboundedSender<Vec<u8>>>,
    generator: Option<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(generator) = self.generator.take() {
            generator.abort();
        }
    }
}

struct Inner {
    devices: Vec<SimulatedDevice>,
    settings: Mutex<Settings>,
    links: Mutex<HashMap<String, Link>>,
}

/// Cloneable handle; clones share the same simulated air
#[derive(Clone)]
pub struct SimulatedRadio {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedRadio {
    pub fn new(devices: Vec<SimulatedDevice>) -> Self {
        SimulatedRadio {
            inner: Arc::new(Inner {
                devices,
                settings: Mutex::new(Settings {
                    state: RadioState::PoweredOn,
                    advertise_interval: Duration::from_millis(DEFAULT_ADVERTISE_INTERVAL_MS),
                    connect_delay: Duration::from_millis(DEFAULT_CONNECT_DELAY_MS),
                    auto_readings: None,
                    fail_next_scan: false,
                }),
                links: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Two scales that produce a slowly drifting weight every couple of seconds
    pub fn demo() -> Self {
        Self::new(vec![
            SimulatedDevice::body_composition_scale("SIM-0001", "Simulated Body Scale")
                .with_info("Simulated", "BCS-1"),
            SimulatedDevice::weight_scale("SIM-0002", "Simulated Weight Scale"),
        ])
        .with_advertise_interval(Duration::from_millis(400))
        .with_connect_delay(Duration::from_millis(300))
        .with_auto_readings(Duration::from_secs(2))
    }

    pub fn with_state(self, state: RadioState) -> Self {
        self.set_state(state);
        self
    }

    pub fn with_advertise_interval(self, interval: Duration) -> Self {
        lock(&self.inner.settings).advertise_interval = interval;
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        lock(&self.inner.settings).connect_delay = delay;
        self
    }

    /// Generate weight (and, where supported, body composition) payloads
    /// on every connected link at the given interval
    pub fn with_auto_readings(self, interval: Duration) -> Self {
        lock(&self.inner.settings).auto_readings = Some(interval);
        self
    }

    pub fn set_state(&self, state: RadioState) {
        lock(&self.inner.settings).state = state;
    }

    /// Make the next `start_scan` fail as if discovery could not be started
    pub fn fail_next_scan(&self) {
        lock(&self.inner.settings).fail_next_scan = true;
    }

    pub fn is_linked(&self, id: &str) -> bool {
        lock(&self.inner.links).contains_key(id)
    }

    /// Deliver a raw characteristic value to the subscriber on `id`.
    /// Returns false when nobody is subscribed.
    pub fn push_notification(&self, id: &str, characteristic: Uuid, payload: Vec<u8>) -> bool {
        let links = lock(&self.inner.links);
        links
            .get(id)
            .and_then(|link| link.subscribers.get(&characteristic))
            .map(|tx| tx.send(payload).is_ok())
            .unwrap_or(false)
    }

    /// Sever the link from the peripheral side, ending its notification streams
    pub fn drop_link(&self, id: &str) -> bool {
        let removed = lock(&self.inner.links).remove(id).is_some();
        if removed {
            info!("Simulated link to {} dropped", id);
        }
        removed
    }

    fn device(&self, id: &str) -> Option<&SimulatedDevice> {
        self.inner.devices.iter().find(|d| d.id == id)
    }

    fn spawn_generator(&self, device: &SimulatedDevice, interval: Duration) -> JoinHandle<()> {
        let radio = self.clone();
        let id = device.id.clone();
        let body_composition = device.services.contains(&BODY_COMPOSITION_SERVICE);

        tokio::spawn(async move {
            let mut tick: u32 = 0;
            loop {
                sleep(interval).await;
                tick = tick.wrapping_add(1);

                let weight_kg = 72.0 + (tick as f64 * 0.7).sin() * 0.4;
                let raw = (weight_kg / 0.005).round() as u16;
                let mut payload = vec![0x00];
                payload.extend_from_slice(&raw.to_le_bytes());
                radio.push_notification(&id, WEIGHT_MEASUREMENT, payload);

                if body_composition && tick % 3 == 0 {
                    let fat = (180.0 + (tick as f64 * 0.3).cos() * 10.0) as u16;
                    let water = (weight_kg * 0.55 / 0.005).round() as u16;
                    let flags: u16 = (1 << 8) | (1 << 9);
                    let mut payload = flags.to_le_bytes().to_vec();
                    payload.extend_from_slice(&fat.to_le_bytes());
                    payload.extend_from_slice(&water.to_le_bytes());
                    payload.extend_from_slice(&5000u16.to_le_bytes());
                    radio.push_notification(&id, BODY_COMPOSITION_MEASUREMENT, payload);
                }
            }
        })
    }
}

#[async_trait]
impl RadioClient for SimulatedRadio {
    async fn state(&self) -> Result<RadioState, RadioError> {
        Ok(lock(&self.inner.settings).state)
    }

    async fn start_scan(
        &self,
        services: &[Uuid],
        allow_duplicates: bool,
    ) -> Result<AdvertisementStream, RadioError> {
        let interval = {
            let mut settings = lock(&self.inner.settings);
            if settings.state != RadioState::PoweredOn {
                return Err(RadioError::Unavailable);
            }
            if std::mem::take(&mut settings.fail_next_scan) {
                return Err(RadioError::backend("simulated discovery failure"));
            }
            settings.advertise_interval
        };

        let visible: Vec<&SimulatedDevice> = self
            .inner
            .devices
            .iter()
            .filter(|d| services.is_empty() || d.services.iter().any(|s| services.contains(s)))
            .collect();

        // every device is heard twice, as real scales keep advertising
        let mut adverts: Vec<Advertisement> = visible.iter().map(|d| d.advertisement(-70)).collect();
        adverts.extend(visible.iter().map(|d| d.advertisement(-65)));
        debug!(
            "Simulated scan: {} advertisements (duplicates={})",
            adverts.len(),
            allow_duplicates
        );

        let stream = stream::iter(adverts)
            .then(move |advertisement| async move {
                sleep(interval).await;
                advertisement
            })
            .chain(stream::pending());
        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<PeripheralInfo, RadioError> {
        let (delay, auto_readings) = {
            let settings = lock(&self.inner.settings);
            (settings.connect_delay, settings.auto_readings)
        };
        sleep(delay).await;

        let device = self
            .device(id)
            .ok_or_else(|| RadioError::UnknownDevice(id.to_string()))?
            .clone();
        if !device.reachable {
            return Err(RadioError::backend(format!(
                "simulated device {} refused the connection",
                id
            )));
        }

        let mut link = Link::default();
        if let Some(interval) = auto_readings {
            link.generator = Some(self.spawn_generator(&device, interval));
        }
        lock(&self.inner.links).insert(id.to_string(), link);

        Ok(PeripheralInfo {
            manufacturer: device.manufacturer.clone(),
            model_number: device.model_number.clone(),
        })
    }

    async fn services(&self, id: &str) -> Result<Vec<Uuid>, RadioError> {
        if !self.is_linked(id) {
            return Err(RadioError::NotConnected(id.to_string()));
        }
        self.device(id)
            .map(|d| d.services.clone())
            .ok_or_else(|| RadioError::UnknownDevice(id.to_string()))
    }

    async fn subscribe(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, RadioError> {
        let offers_service = self
            .device(id)
            .map(|d| d.services.contains(&service))
            .unwrap_or(false);
        if !offers_service {
            return Err(RadioError::CharacteristicNotFound(characteristic));
        }

        let mut links = lock(&self.inner.links);
        let link = links
            .get_mut(id)
            .ok_or_else(|| RadioError::NotConnected(id.to_string()))?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.subscribers.insert(characteristic, tx);

        Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn disconnect(&self, id: &str) -> Result<(), RadioError> {
        lock(&self.inner.links).remove(id);
        Ok(())
    }

    async fn shutdown(&self) {
        lock(&self.inner.links).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn radio() -> SimulatedRadio {
        SimulatedRadio::new(vec![
            SimulatedDevice::weight_scale("A", "Scale A"),
            SimulatedDevice::body_composition_scale("B", "Scale B"),
        ])
        .with_advertise_interval(Duration::from_millis(1))
        .with_connect_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn advertises_each_device_twice() {
        let radio = radio();
        let stream = radio.start_scan(&[], false).await.unwrap();
        let ids = stream.take(4).map(|a| a.id).collect::<Vec<_>>().await;
        assert_eq!(ids, vec!["A", "B", "A", "B"]);
    }

    #[tokio::test]
    async fn scan_respects_service_filter() {
        let radio = radio();
        let stream = radio
            .start_scan(&[BODY_COMPOSITION_SERVICE], false)
            .await
            .unwrap();
        let ids = stream.take(2).map(|a| a.id).collect::<Vec<_>>().await;
        assert_eq!(ids, vec!["B", "B"]);
    }

    #[tokio::test]
    async fn powered_off_radio_cannot_scan() {
        let radio = radio().with_state(RadioState::PoweredOff);
        assert!(matches!(
            radio.start_scan(&[], false).await,
            Err(RadioError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn scan_failure_switch_fires_once() {
        let radio = radio();
        radio.fail_next_scan();
        assert!(matches!(
            radio.start_scan(&[], false).await,
            Err(RadioError::Backend(_))
        ));
        assert!(radio.start_scan(&[], false).await.is_ok());
    }

    #[tokio::test]
    async fn notifications_flow_until_link_drops() {
        let radio = radio();
        radio.connect("A").await.unwrap();
        let mut stream = radio
            .subscribe("A", WEIGHT_SCALE_SERVICE, WEIGHT_MEASUREMENT)
            .await
            .unwrap();

        assert!(radio.push_notification("A", WEIGHT_MEASUREMENT, vec![1, 2, 3]));
        assert_eq!(stream.next().await, Some(vec![1, 2, 3]));

        assert!(radio.drop_link("A"));
        assert_eq!(stream.next().await, None);
        assert!(!radio.push_notification("A", WEIGHT_MEASUREMENT, vec![1]));
    }

    #[tokio::test]
    async fn weight_only_scale_has_no_body_composition_characteristic() {
        let radio = radio();
        radio.connect("A").await.unwrap();
        assert!(matches!(
            radio
                .subscribe("A", BODY_COMPOSITION_SERVICE, BODY_COMPOSITION_MEASUREMENT)
                .await,
            Err(RadioError::CharacteristicNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_device_refuses_connection() {
        let radio = SimulatedRadio::new(vec![SimulatedDevice::weight_scale("A", "A").unreachable()])
            .with_connect_delay(Duration::from_millis(1));
        assert!(matches!(
            radio.connect("A").await,
            Err(RadioError::Backend(_))
        ));
        assert!(!radio.is_linked("A"));
    }
}
