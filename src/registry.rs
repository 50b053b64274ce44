//! In-memory registry of scales seen during this session

use std::collections::HashMap;
use time::OffsetDateTime;

use crate::models::{Advertisement, PeripheralInfo, ScaleDevice};

/// Mapping from device id to its last-known state.
///
/// Entries are kept in first-seen order and are never removed until the
/// registry is cleared. Re-observing an id refreshes the existing entry.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<ScaleDevice>,
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an advertisement. Returns the updated snapshot and whether the
    /// id was new to the registry.
    pub fn observe(&mut self, advertisement: &Advertisement) -> (ScaleDevice, bool) {
        if let Some(&slot) = self.index.get(&advertisement.id) {
            let device = &mut self.devices[slot];
            if let Some(name) = advertisement.name.as_ref().filter(|n| !n.is_empty()) {
                device.name = name.clone();
            }
            return (device.clone(), false);
        }

        let device = ScaleDevice::from_advertisement(advertisement);
        self.index.insert(device.id.clone(), self.devices.len());
        self.devices.push(device.clone());
        (device, true)
    }

    pub fn get(&self, id: &str) -> Option<&ScaleDevice> {
        self.index.get(id).map(|&slot| &self.devices[slot])
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut ScaleDevice> {
        match self.index.get(id) {
            Some(&slot) => Some(&mut self.devices[slot]),
            None => None,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Mark `id` connected, stamping the connection time and any device
    /// information read during the handshake
    pub fn mark_connected(
        &mut self,
        id: &str,
        at: OffsetDateTime,
        info: &PeripheralInfo,
    ) -> Option<ScaleDevice> {
        let device = self.get_mut(id)?;
        device.is_connected = true;
        device.last_connection_time = Some(at);
        if info.manufacturer.is_some() {
            device.manufacturer = info.manufacturer.clone();
        }
        if info.model_number.is_some() {
            device.model_number = info.model_number.clone();
        }
        Some(device.clone())
    }

    pub fn mark_disconnected(&mut self, id: &str) -> Option<ScaleDevice> {
        let device = self.get_mut(id)?;
        device.is_connected = false;
        Some(device.clone())
    }

    pub fn record_weight(&mut self, id: &str, weight: f64) {
        if let Some(device) = self.get_mut(id) {
            device.last_weight = Some(weight);
        }
    }

    /// Snapshots of every known device in first-seen order
    pub fn snapshot(&self) -> Vec<ScaleDevice> {
        self.devices.clone()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert(id: &str, name: Option<&str>) -> Advertisement {
        Advertisement {
            id: id.to_string(),
            name: name.map(str::to_string),
            services: vec![],
            rssi: Some(-60),
        }
    }

    #[test]
    fn rediscovery_updates_instead_of_duplicating() {
        let mut registry = DeviceRegistry::new();
        let (_, new) = registry.observe(&advert("A", None));
        assert!(new);
        let (device, new) = registry.observe(&advert("A", Some("Body Scale")));
        assert!(!new);
        assert_eq!(device.name, "Body Scale");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_name_does_not_erase_known_name() {
        let mut registry = DeviceRegistry::new();
        registry.observe(&advert("A", Some("Body Scale")));
        let (device, _) = registry.observe(&advert("A", Some("")));
        assert_eq!(device.name, "Body Scale");
    }

    #[test]
    fn keeps_first_seen_order() {
        let mut registry = DeviceRegistry::new();
        registry.observe(&advert("B", None));
        registry.observe(&advert("A", None));
        registry.observe(&advert("B", None));
        let ids: Vec<_> = registry.snapshot().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["B", "A"]);
    }

    #[test]
    fn connection_state_round_trip() {
        let mut registry = DeviceRegistry::new();
        registry.observe(&advert("A", None));
        let now = OffsetDateTime::now_utc();
        let info = PeripheralInfo {
            manufacturer: Some("Acme".to_string()),
            model_number: None,
        };

        let device = registry.mark_connected("A", now, &info).unwrap();
        assert!(device.is_connected);
        assert_eq!(device.last_connection_time, Some(now));
        assert_eq!(device.manufacturer.as_deref(), Some("Acme"));

        registry.record_weight("A", 81.2);
        let device = registry.mark_disconnected("A").unwrap();
        assert!(!device.is_connected);
        assert_eq!(device.last_weight, Some(81.2));
        // connection time survives the disconnect
        assert_eq!(device.last_connection_time, Some(now));
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut registry = DeviceRegistry::new();
        assert!(registry
            .mark_connected("missing", OffsetDateTime::now_utc(), &PeripheralInfo::default())
            .is_none());
        assert!(registry.mark_disconnected("missing").is_none());
        registry.record_weight("missing", 1.0);
        assert!(registry.is_empty());
    }

    #[test]
    fn clear_empties_everything() {
        let mut registry = DeviceRegistry::new();
        registry.observe(&advert("A", None));
        registry.clear();
        assert!(!registry.contains("A"));
        assert!(registry.get("A").is_none());
    }
}
