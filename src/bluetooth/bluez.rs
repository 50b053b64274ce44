//! Bluetooth Low Energy central backed by BlueZ

use async_trait::async_trait;
use bluer::{
    Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport, Session,
};
use futures_util::stream::{self, BoxStream, SelectAll, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bluetooth::radio::{
    AdvertisementStream, NotificationStream, RadioClient, RadioState,
};
use crate::bluetooth::uuids::{DEVICE_INFORMATION_SERVICE, MANUFACTURER_NAME, MODEL_NUMBER};
use crate::error::RadioError;
use crate::models::{Advertisement, PeripheralInfo};

pub struct BluezRadio {
    // keeps the D-Bus connection alive for the adapter
    _session: Session,
    adapter: Adapter,
    // peripherals connected through this client, released on shutdown
    links: Mutex<HashSet<Address>>,
}

impl BluezRadio {
    /// Open a BlueZ session on the default adapter and power it on
    pub async fn new() -> Result<Self, RadioError> {
        // Initialize Bluetooth session
        let session = match Session::new().await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create Bluetooth session: {}", e);
                return Err(e.into());
            }
        };

        // Get the default Bluetooth adapter
        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                error!("Failed to get default Bluetooth adapter: {}", e);
                return Err(e.into());
            }
        };

        // Ensure Bluetooth adapter is powered on
        if let Err(e) = adapter.set_powered(true).await {
            error!("Failed to power on adapter: {}", e);
            return Err(e.into());
        }

        info!("Using Bluetooth adapter {}", adapter.name());
        Ok(BluezRadio {
            _session: session,
            adapter,
            links: Mutex::new(HashSet::new()),
        })
    }

    fn device(&self, id: &str) -> Result<Device, RadioError> {
        Ok(self.adapter.device(parse_address(id)?)?)
    }

    fn links(&self) -> std::sync::MutexGuard<'_, HashSet<Address>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn connected_device(&self, id: &str) -> Result<Device, RadioError> {
        let device = self.device(id)?;
        if !device.is_connected().await? {
            return Err(RadioError::NotConnected(id.to_string()));
        }
        Ok(device)
    }

    async fn read_device_information(device: &Device) -> Result<PeripheralInfo, RadioError> {
        let mut info = PeripheralInfo::default();
        for service in device.services().await? {
            if service.uuid().await? != DEVICE_INFORMATION_SERVICE {
                continue;
            }
            for characteristic in service.characteristics().await? {
                let uuid = characteristic.uuid().await?;
                let slot = if uuid == MANUFACTURER_NAME {
                    &mut info.manufacturer
                } else if uuid == MODEL_NUMBER {
                    &mut info.model_number
                } else {
                    continue;
                };
                let value = characteristic.read().await?;
                let text = String::from_utf8_lossy(&value)
                    .trim_end_matches('\0')
                    .trim()
                    .to_string();
                if !text.is_empty() {
                    *slot = Some(text);
                }
            }
        }
        Ok(info)
    }
}

fn parse_address(id: &str) -> Result<Address, RadioError> {
    id.parse()
        .map_err(|_| RadioError::UnknownDevice(id.to_string()))
}

/// Property changes that mean the peripheral advertised again
fn is_readvertisement(property: &DeviceProperty) -> bool {
    matches!(
        property,
        DeviceProperty::Rssi(_)
            | DeviceProperty::ManufacturerData(_)
            | DeviceProperty::ServiceData(_)
            | DeviceProperty::Uuids(_)
    )
}

/// Forward discovery results until the receiving side is dropped. With
/// `allow_duplicates`, every device found also has its property changes
/// watched so repeated advertisements are reported too.
async fn pump_discovery(
    adapter: Adapter,
    mut discovery: BoxStream<'static, AdapterEvent>,
    allow_duplicates: bool,
    tx: mpsc::UnboundedSender<Advertisement>,
) {
    let mut changes: SelectAll<BoxStream<'static, (Address, DeviceEvent)>> = SelectAll::new();

    loop {
        tokio::select! {
            _ = tx.closed() => break,
            event = discovery.next() => match event {
                Some(AdapterEvent::DeviceAdded(address)) => {
                    if let Some(advertisement) = advertisement_for(&adapter, address).await {
                        let _ = tx.send(advertisement);
                    }
                    if allow_duplicates {
                        match adapter.device(address) {
                            Ok(device) => match device.events().await {
                                Ok(events) => {
                                    changes.push(events.map(move |e| (address, e)).boxed())
                                }
                                Err(e) => debug!("No property events for {}: {}", address, e),
                            },
                            Err(e) => debug!("Device {} vanished: {}", address, e),
                        }
                    }
                }
                Some(other) => debug!("Discovery event: {:?}", other),
                None => {
                    debug!("Discovery stream ended");
                    break;
                }
            },
            Some((address, event)) = changes.next(), if !changes.is_empty() => {
                if let DeviceEvent::PropertyChanged(property) = event {
                    if is_readvertisement(&property) {
                        if let Some(advertisement) = advertisement_for(&adapter, address).await {
                            let _ = tx.send(advertisement);
                        }
                    }
                }
            }
        }
    }
}

async fn advertisement_for(adapter: &Adapter, address: Address) -> Option<Advertisement> {
    let device = adapter.device(address).ok()?;
    let name = device.name().await.unwrap_or_default();
    let services = device
        .uuids()
        .await
        .ok()
        .flatten()
        .map(|uuids| uuids.into_iter().collect())
        .unwrap_or_default();
    let rssi = device.rssi().await.ok().flatten();

    Some(Advertisement {
        id: address.to_string().to_uppercase(),
        name,
        services,
        rssi,
    })
}

#[async_trait]
impl RadioClient for BluezRadio {
    async fn state(&self) -> Result<RadioState, RadioError> {
        match self.adapter.is_powered().await {
            Ok(true) => Ok(RadioState::PoweredOn),
            Ok(false) => Ok(RadioState::PoweredOff),
            Err(e) => {
                warn!("Failed to query adapter power state: {}", e);
                Ok(RadioState::Unsupported)
            }
        }
    }

    async fn start_scan(
        &self,
        services: &[Uuid],
        allow_duplicates: bool,
    ) -> Result<AdvertisementStream, RadioError> {
        // Configure discovery filter for Low Energy scales only
        let filter = DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            uuids: services.iter().copied().collect::<HashSet<_>>(),
            duplicate_data: allow_duplicates,
            ..Default::default()
        };

        // Apply the discovery filter (warn if it fails, but continue)
        if let Err(e) = self.adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        let events = match self.adapter.discover_devices().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to start device discovery: {}", e);
                return Err(e.into());
            }
        };

        // discovery stops once the pump sees the returned stream dropped
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_discovery(
            self.adapter.clone(),
            events.boxed(),
            allow_duplicates,
            tx,
        ));
        Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<PeripheralInfo, RadioError> {
        let device = self.device(id)?;
        if let Err(e) = device.connect().await {
            error!("Failed to connect to {}: {}", id, e);
            return Err(e.into());
        }
        self.links().insert(device.address());

        match Self::read_device_information(&device).await {
            Ok(info) => Ok(info),
            Err(e) => {
                debug!("Device information unavailable for {}: {}", id, e);
                Ok(PeripheralInfo::default())
            }
        }
    }

    async fn services(&self, id: &str) -> Result<Vec<Uuid>, RadioError> {
        let device = self.connected_device(id).await?;
        let uuids = device.uuids().await?.unwrap_or_default();
        Ok(uuids.into_iter().collect())
    }

    async fn subscribe(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, RadioError> {
        let device = self.connected_device(id).await?;
        for remote_service in device.services().await? {
            if remote_service.uuid().await? != service {
                continue;
            }
            for remote_char in remote_service.characteristics().await? {
                if remote_char.uuid().await? == characteristic {
                    let notifications = remote_char.notify().await?;
                    debug!("Subscribed to {} on {}", characteristic, id);
                    return Ok(notifications.boxed());
                }
            }
        }
        Err(RadioError::CharacteristicNotFound(characteristic))
    }

    async fn disconnect(&self, id: &str) -> Result<(), RadioError> {
        let device = self.device(id)?;
        self.links().remove(&device.address());
        device.disconnect().await?;
        Ok(())
    }

    async fn shutdown(&self) {
        let addresses: Vec<Address> = self.links().drain().collect();
        for address in addresses {
            let device = match self.adapter.device(address) {
                Ok(device) => device,
                Err(e) => {
                    debug!("Skipping {} on shutdown: {}", address, e);
                    continue;
                }
            };
            if !device.is_connected().await.unwrap_or(false) {
                continue;
            }
            info!("Disconnecting {} on shutdown", address);
            if let Err(e) = device.disconnect().await {
                warn!("Failed to disconnect {} on shutdown: {}", address, e);
            }
        }
        debug!("Released adapter {}", self.adapter.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upper_and_lower_case_addresses() {
        assert_eq!(
            parse_address("AA:BB:CC:DD:EE:FF").unwrap(),
            parse_address("aa:bb:cc:dd:ee:ff").unwrap()
        );
        assert!(matches!(
            parse_address("not-an-address"),
            Err(RadioError::UnknownDevice(_))
        ));
    }

    #[test]
    fn only_advertising_properties_count_as_readvertisement() {
        assert!(is_readvertisement(&DeviceProperty::Rssi(-60)));
        assert!(!is_readvertisement(&DeviceProperty::Connected(true)));
    }
}
