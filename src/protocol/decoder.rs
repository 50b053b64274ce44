//! Weight and body composition measurement decoding

use log::{debug, warn};
use time::OffsetDateTime;

use crate::error::DecodeError;
use crate::models::{BodyCompositionSample, ScaleReading, WeightUnit};
use crate::utils::{pounds_to_kg, round_to};

// Weight measurement flags (u8)
const WEIGHT_FLAG_IMPERIAL: u8 = 0x01;
const WEIGHT_FLAG_TIMESTAMP: u8 = 0x02;
const WEIGHT_FLAG_USER_ID: u8 = 0x04;
const WEIGHT_FLAG_BMI_HEIGHT: u8 = 0x08;

// Body composition flags (u16)
const BODY_FLAG_IMPERIAL: u16 = 1 << 0;
const BODY_FLAG_TIMESTAMP: u16 = 1 << 1;
const BODY_FLAG_USER_ID: u16 = 1 << 2;
const BODY_FLAG_BASAL_METABOLISM: u16 = 1 << 3;
const BODY_FLAG_MUSCLE_PERCENT: u16 = 1 << 4;
const BODY_FLAG_MUSCLE_MASS: u16 = 1 << 5;
const BODY_FLAG_FAT_FREE_MASS: u16 = 1 << 6;
const BODY_FLAG_SOFT_LEAN_MASS: u16 = 1 << 7;
const BODY_FLAG_BODY_WATER_MASS: u16 = 1 << 8;
const BODY_FLAG_IMPEDANCE: u16 = 1 << 9;
const BODY_FLAG_WEIGHT: u16 = 1 << 10;
const BODY_FLAG_HEIGHT: u16 = 1 << 11;
const BODY_FLAG_MULTI_PACKET: u16 = 1 << 12;

const TIMESTAMP_LEN: usize = 7;
const UNSUCCESSFUL: u16 = 0xFFFF;

// Resolutions
const KG_RESOLUTION: f64 = 0.005;
const LB_RESOLUTION: f64 = 0.01;
const PERCENT_RESOLUTION: f64 = 0.1;
const IMPEDANCE_RESOLUTION: f64 = 0.1;
const HEIGHT_M_RESOLUTION: f64 = 0.001;
const HEIGHT_IN_RESOLUTION: f64 = 0.1;
const METRES_PER_INCH: f64 = 0.0254;

/// Little-endian cursor over a payload whose length was validated up front
struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        Fields { data, pos }
    }

    fn u16(&mut self) -> u16 {
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        value
    }

    fn skip(&mut self, len: usize) {
        self.pos += len;
    }
}

fn mass(raw: u16, unit: WeightUnit) -> f64 {
    match unit {
        WeightUnit::Kilogram => round_to(raw as f64 * KG_RESOLUTION, 3),
        WeightUnit::Pound => round_to(raw as f64 * LB_RESOLUTION, 2),
    }
}

fn mass_kg(raw: u16, unit: WeightUnit) -> f64 {
    match unit {
        WeightUnit::Kilogram => mass(raw, unit),
        WeightUnit::Pound => round_to(pounds_to_kg(mass(raw, unit)), 3),
    }
}

fn height_m(raw: u16, unit: WeightUnit) -> f64 {
    match unit {
        WeightUnit::Kilogram => raw as f64 * HEIGHT_M_RESOLUTION,
        WeightUnit::Pound => raw as f64 * HEIGHT_IN_RESOLUTION * METRES_PER_INCH,
    }
}

fn check_length(data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() != expected {
        warn!(
            "Invalid scale payload: len={}, expected={}",
            data.len(),
            expected
        );
        return Err(DecodeError::UnexpectedLength {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Decode a Weight Measurement (0x2A9D) notification into a reading
///
/// Payload structure (little-endian):
/// - Byte 0: Flags (bit0 imperial units, bit1 time stamp, bit2 user id,
///   bit3 BMI and height)
/// - Bytes 1-2: Weight (0.005 kg or 0.01 lb resolution, 0xFFFF = unsuccessful)
/// - Optional 7 bytes: Time stamp (skipped, the receive time is used)
/// - Optional 1 byte: User id (skipped)
/// - Optional 2+2 bytes: BMI (0.1 resolution) and height
///
/// # Arguments
/// * `data` - Raw characteristic value
/// * `received_at` - Instant the notification arrived, used as the reading time
pub fn decode_weight(data: &[u8], received_at: OffsetDateTime) -> Result<ScaleReading, DecodeError> {
    let flags = *data.first().ok_or(DecodeError::Empty)?;

    let mut expected = 1 + 2;
    if flags & WEIGHT_FLAG_TIMESTAMP != 0 {
        expected += TIMESTAMP_LEN;
    }
    if flags & WEIGHT_FLAG_USER_ID != 0 {
        expected += 1;
    }
    if flags & WEIGHT_FLAG_BMI_HEIGHT != 0 {
        expected += 4;
    }
    check_length(data, expected)?;

    let unit = if flags & WEIGHT_FLAG_IMPERIAL != 0 {
        WeightUnit::Pound
    } else {
        WeightUnit::Kilogram
    };

    let mut fields = Fields::new(data, 1);
    let raw_weight = fields.u16();
    if raw_weight == UNSUCCESSFUL {
        return Err(DecodeError::MeasurementUnsuccessful);
    }
    if raw_weight == 0 {
        return Err(DecodeError::NonPositiveWeight);
    }

    if flags & WEIGHT_FLAG_TIMESTAMP != 0 {
        fields.skip(TIMESTAMP_LEN);
    }
    if flags & WEIGHT_FLAG_USER_ID != 0 {
        fields.skip(1);
    }

    let mut reading = ScaleReading::new(mass(raw_weight, unit), unit, received_at);
    if flags & WEIGHT_FLAG_BMI_HEIGHT != 0 {
        let bmi = fields.u16();
        let _height = fields.u16();
        reading.body_mass_index = Some(round_to(bmi as f64 * PERCENT_RESOLUTION, 1));
    }

    debug!(
        "Decoded weight {:.3} {}",
        reading.weight,
        reading.unit.symbol()
    );
    Ok(reading)
}

/// Decode a Body Composition Measurement (0x2A9C) notification
///
/// Payload structure (little-endian):
/// - Bytes 0-1: Flags
/// - Bytes 2-3: Body fat percentage (0.1 % resolution, 0xFFFF = unsuccessful)
/// - Optional fields in flag order: time stamp (7), user id (1), basal
///   metabolism, muscle percentage, muscle mass, fat free mass, soft lean
///   mass, body water mass, impedance, weight, height (2 bytes each)
///
/// Bone mass is derived as fat free mass minus soft lean mass. BMI is
/// derived when weight and height travel together.
pub fn decode_body_composition(
    data: &[u8],
    received_at: OffsetDateTime,
) -> Result<BodyCompositionSample, DecodeError> {
    if data.len() < 2 {
        return Err(if data.is_empty() {
            DecodeError::Empty
        } else {
            DecodeError::UnexpectedLength {
                expected: 4,
                actual: data.len(),
            }
        });
    }
    let flags = u16::from_le_bytes([data[0], data[1]]);

    let mut expected = 2 + 2;
    if flags & BODY_FLAG_TIMESTAMP != 0 {
        expected += TIMESTAMP_LEN;
    }
    if flags & BODY_FLAG_USER_ID != 0 {
        expected += 1;
    }
    for flag in [
        BODY_FLAG_BASAL_METABOLISM,
        BODY_FLAG_MUSCLE_PERCENT,
        BODY_FLAG_MUSCLE_MASS,
        BODY_FLAG_FAT_FREE_MASS,
        BODY_FLAG_SOFT_LEAN_MASS,
        BODY_FLAG_BODY_WATER_MASS,
        BODY_FLAG_IMPEDANCE,
        BODY_FLAG_WEIGHT,
        BODY_FLAG_HEIGHT,
    ] {
        if flags & flag != 0 {
            expected += 2;
        }
    }
    check_length(data, expected)?;

    if flags & BODY_FLAG_MULTI_PACKET != 0 {
        debug!("Body composition measurement spans multiple packets");
    }

    let unit = if flags & BODY_FLAG_IMPERIAL != 0 {
        WeightUnit::Pound
    } else {
        WeightUnit::Kilogram
    };

    let mut fields = Fields::new(data, 2);
    let raw_fat = fields.u16();
    if raw_fat == UNSUCCESSFUL {
        return Err(DecodeError::MeasurementUnsuccessful);
    }

    let mut sample = BodyCompositionSample::empty(unit, received_at);
    sample.body_fat_percent = Some(round_to(raw_fat as f64 * PERCENT_RESOLUTION, 1));

    if flags & BODY_FLAG_TIMESTAMP != 0 {
        fields.skip(TIMESTAMP_LEN);
    }
    if flags & BODY_FLAG_USER_ID != 0 {
        fields.skip(1);
    }
    if flags & BODY_FLAG_BASAL_METABOLISM != 0 {
        fields.skip(2);
    }
    if flags & BODY_FLAG_MUSCLE_PERCENT != 0 {
        fields.skip(2);
    }
    if flags & BODY_FLAG_MUSCLE_MASS != 0 {
        sample.muscle_mass_kg = Some(mass_kg(fields.u16(), unit));
    }
    let fat_free = (flags & BODY_FLAG_FAT_FREE_MASS != 0).then(|| mass_kg(fields.u16(), unit));
    let soft_lean = (flags & BODY_FLAG_SOFT_LEAN_MASS != 0).then(|| mass_kg(fields.u16(), unit));
    if let (Some(fat_free), Some(soft_lean)) = (fat_free, soft_lean) {
        if fat_free >= soft_lean {
            sample.bone_mass_kg = Some(round_to(fat_free - soft_lean, 3));
        }
    }
    if flags & BODY_FLAG_BODY_WATER_MASS != 0 {
        sample.body_water_mass_kg = Some(mass_kg(fields.u16(), unit));
    }
    if flags & BODY_FLAG_IMPEDANCE != 0 {
        sample.impedance = Some(round_to(fields.u16() as f64 * IMPEDANCE_RESOLUTION, 1));
    }
    if flags & BODY_FLAG_WEIGHT != 0 {
        let raw_weight = fields.u16();
        if raw_weight == 0 {
            return Err(DecodeError::NonPositiveWeight);
        }
        sample.weight = Some(mass(raw_weight, unit));
    }
    let height = (flags & BODY_FLAG_HEIGHT != 0).then(|| height_m(fields.u16(), unit));

    Ok(sample.with_height_m(height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[test]
    fn decodes_si_weight() {
        // 16000 * 0.005 = 80.0 kg
        let reading = decode_weight(&[0x00, 0x80, 0x3E], now()).unwrap();
        assert_eq!(reading.unit, WeightUnit::Kilogram);
        assert_eq!(reading.weight, 80.0);
        assert_eq!(reading.timestamp, now());
        assert!(!reading.has_body_composition());
    }

    #[test]
    fn decodes_imperial_weight() {
        // 17640 * 0.01 = 176.4 lb
        let reading = decode_weight(&[0x01, 0xE8, 0x44], now()).unwrap();
        assert_eq!(reading.unit, WeightUnit::Pound);
        assert_eq!(reading.weight, 176.4);
    }

    #[test]
    fn skips_timestamp_and_user_and_reads_bmi() {
        let mut payload = vec![0x0E, 0x80, 0x3E];
        payload.extend_from_slice(&[0xE8, 0x07, 1, 15, 8, 30, 0]); // 2024-01-15 08:30:00
        payload.push(3); // user id
        payload.extend_from_slice(&247u16.to_le_bytes()); // BMI 24.7
        payload.extend_from_slice(&1800u16.to_le_bytes()); // 1.8 m
        let reading = decode_weight(&payload, now()).unwrap();
        assert_eq!(reading.weight, 80.0);
        assert_eq!(reading.body_mass_index, Some(24.7));
    }

    #[test]
    fn decoding_is_deterministic() {
        let payload = [0x00, 0x34, 0x12];
        assert_eq!(
            decode_weight(&payload, now()).unwrap(),
            decode_weight(&payload, now()).unwrap()
        );
    }

    #[test]
    fn rejects_malformed_weight_payloads() {
        assert_eq!(decode_weight(&[], now()), Err(DecodeError::Empty));
        assert_eq!(
            decode_weight(&[0x00, 0x80], now()),
            Err(DecodeError::UnexpectedLength {
                expected: 3,
                actual: 2
            })
        );
        // time stamp flagged but missing
        assert!(matches!(
            decode_weight(&[0x02, 0x80, 0x3E], now()),
            Err(DecodeError::UnexpectedLength { .. })
        ));
        assert_eq!(
            decode_weight(&[0x00, 0xFF, 0xFF], now()),
            Err(DecodeError::MeasurementUnsuccessful)
        );
        assert_eq!(
            decode_weight(&[0x00, 0x00, 0x00], now()),
            Err(DecodeError::NonPositiveWeight)
        );
    }

    #[test]
    fn decodes_body_composition_fields() {
        let flags: u16 = BODY_FLAG_MUSCLE_MASS
            | BODY_FLAG_FAT_FREE_MASS
            | BODY_FLAG_SOFT_LEAN_MASS
            | BODY_FLAG_BODY_WATER_MASS
            | BODY_FLAG_IMPEDANCE;
        let mut payload = flags.to_le_bytes().to_vec();
        payload.extend_from_slice(&215u16.to_le_bytes()); // 21.5 %
        payload.extend_from_slice(&7000u16.to_le_bytes()); // muscle 35 kg
        payload.extend_from_slice(&12600u16.to_le_bytes()); // fat free 63 kg
        payload.extend_from_slice(&12000u16.to_le_bytes()); // soft lean 60 kg
        payload.extend_from_slice(&8800u16.to_le_bytes()); // water 44 kg
        payload.extend_from_slice(&5123u16.to_le_bytes()); // 512.3 ohm

        let sample = decode_body_composition(&payload, now()).unwrap();
        assert_eq!(sample.unit, WeightUnit::Kilogram);
        assert_eq!(sample.body_fat_percent, Some(21.5));
        assert_eq!(sample.muscle_mass_kg, Some(35.0));
        assert_eq!(sample.bone_mass_kg, Some(3.0));
        assert_eq!(sample.body_water_mass_kg, Some(44.0));
        assert_eq!(sample.impedance, Some(512.3));
        assert_eq!(sample.weight, None);
        assert_eq!(sample.body_mass_index, None);
    }

    #[test]
    fn body_composition_with_weight_and_height_yields_bmi() {
        let flags: u16 = BODY_FLAG_WEIGHT | BODY_FLAG_HEIGHT;
        let mut payload = flags.to_le_bytes().to_vec();
        payload.extend_from_slice(&180u16.to_le_bytes());
        payload.extend_from_slice(&16000u16.to_le_bytes()); // 80 kg
        payload.extend_from_slice(&2000u16.to_le_bytes()); // 2.0 m

        let sample = decode_body_composition(&payload, now()).unwrap();
        assert_eq!(sample.weight, Some(80.0));
        assert_eq!(sample.body_mass_index, Some(20.0));
    }

    #[test]
    fn imperial_body_masses_are_normalised_to_kg() {
        let flags: u16 = BODY_FLAG_IMPERIAL | BODY_FLAG_MUSCLE_MASS;
        let mut payload = flags.to_le_bytes().to_vec();
        payload.extend_from_slice(&200u16.to_le_bytes());
        payload.extend_from_slice(&10000u16.to_le_bytes()); // 100 lb

        let sample = decode_body_composition(&payload, now()).unwrap();
        assert_eq!(sample.unit, WeightUnit::Pound);
        assert_eq!(sample.muscle_mass_kg, Some(45.359));
    }

    #[test]
    fn rejects_malformed_body_composition() {
        assert_eq!(decode_body_composition(&[], now()), Err(DecodeError::Empty));
        assert!(matches!(
            decode_body_composition(&[0x00], now()),
            Err(DecodeError::UnexpectedLength { .. })
        ));
        // impedance flagged but absent
        let mut payload = BODY_FLAG_IMPEDANCE.to_le_bytes().to_vec();
        payload.extend_from_slice(&100u16.to_le_bytes());
        assert_eq!(
            decode_body_composition(&payload, now()),
            Err(DecodeError::UnexpectedLength {
                expected: 6,
                actual: 4
            })
        );
        let unsuccessful = [0x00, 0x00, 0xFF, 0xFF];
        assert_eq!(
            decode_body_composition(&unsuccessful, now()),
            Err(DecodeError::MeasurementUnsuccessful)
        );
    }
}
