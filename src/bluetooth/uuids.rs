//! GATT identifiers used by Bluetooth SIG weight scales
use uuid::Uuid;

/// Expand an assigned 16-bit number onto the Bluetooth base UUID
/// (0000xxxx-0000-1000-8000-00805f9b34fb).
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

pub const WEIGHT_SCALE_SERVICE: Uuid = from_short(0x181D);
pub const WEIGHT_MEASUREMENT: Uuid = from_short(0x2A9D);

pub const BODY_COMPOSITION_SERVICE: Uuid = from_short(0x181B);
pub const BODY_COMPOSITION_MEASUREMENT: Uuid = from_short(0x2A9C);

pub const DEVICE_INFORMATION_SERVICE: Uuid = from_short(0x180A);
pub const MANUFACTURER_NAME: Uuid = from_short(0x2A29);
pub const MODEL_NUMBER: Uuid = from_short(0x2A24);

/// Services a peripheral must advertise (any of) to be treated as a scale
pub const SCALE_SERVICES: [Uuid; 2] = [WEIGHT_SCALE_SERVICE, BODY_COMPOSITION_SERVICE];

/// True when the advertised service list contains a known scale service
pub fn is_scale_service_set(services: &[Uuid]) -> bool {
    services.iter().any(|uuid| SCALE_SERVICES.contains(uuid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_uuids_expand_onto_base() {
        assert_eq!(
            WEIGHT_SCALE_SERVICE.to_string(),
            "0000181d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BODY_COMPOSITION_MEASUREMENT.to_string(),
            "00002a9c-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn scale_service_detection() {
        assert!(is_scale_service_set(&[DEVICE_INFORMATION_SERVICE, BODY_COMPOSITION_SERVICE]));
        assert!(!is_scale_service_set(&[DEVICE_INFORMATION_SERVICE]));
        assert!(!is_scale_service_set(&[]));
    }
}
