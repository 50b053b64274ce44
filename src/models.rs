use time::OffsetDateTime;
use uuid::Uuid;

use crate::utils::{body_mass_index, round_to};

/// Unit a scale reports its weight in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightUnit {
    Kilogram,
    Pound,
}

impl WeightUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            WeightUnit::Kilogram => "kg",
            WeightUnit::Pound => "lb",
        }
    }
}

/// A point-in-time measurement from the connected scale.
///
/// Readings are never mutated; a new notification produces a new value that
/// supersedes the previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleReading {
    pub weight: f64,
    pub unit: WeightUnit,
    pub timestamp: OffsetDateTime,
    pub impedance: Option<f64>,
    pub body_fat_percent: Option<f64>,
    pub muscle_mass_kg: Option<f64>,
    pub water_percent: Option<f64>,
    pub bone_mass_kg: Option<f64>,
    pub body_mass_index: Option<f64>,
}

impl ScaleReading {
    pub fn new(weight: f64, unit: WeightUnit, timestamp: OffsetDateTime) -> Self {
        ScaleReading {
            weight,
            unit,
            timestamp,
            impedance: None,
            body_fat_percent: None,
            muscle_mass_kg: None,
            water_percent: None,
            bone_mass_kg: None,
            body_mass_index: None,
        }
    }

    /// Weight normalised to kilograms
    pub fn weight_kg(&self) -> f64 {
        match self.unit {
            WeightUnit::Kilogram => self.weight,
            WeightUnit::Pound => crate::utils::pounds_to_kg(self.weight),
        }
    }

    pub fn has_body_composition(&self) -> bool {
        self.impedance.is_some()
            || self.body_fat_percent.is_some()
            || self.muscle_mass_kg.is_some()
            || self.water_percent.is_some()
            || self.bone_mass_kg.is_some()
    }

    /// Merge a body composition sample onto this reading.
    ///
    /// Fields carried by the sample overwrite, everything else keeps its
    /// prior value. The result is stamped with the sample's timestamp.
    pub fn merged_with(&self, sample: &BodyCompositionSample) -> ScaleReading {
        let (weight, unit) = match sample.weight {
            Some(weight) => (weight, sample.unit),
            None => (self.weight, self.unit),
        };

        let mut merged = ScaleReading {
            weight,
            unit,
            timestamp: sample.timestamp,
            impedance: sample.impedance.or(self.impedance),
            body_fat_percent: sample.body_fat_percent.or(self.body_fat_percent),
            muscle_mass_kg: sample.muscle_mass_kg.or(self.muscle_mass_kg),
            water_percent: self.water_percent,
            bone_mass_kg: sample.bone_mass_kg.or(self.bone_mass_kg),
            body_mass_index: sample.body_mass_index.or(self.body_mass_index),
        };

        if let Some(water_kg) = sample.body_water_mass_kg {
            let weight_kg = merged.weight_kg();
            if weight_kg > 0.0 {
                merged.water_percent = Some(round_to(water_kg / weight_kg * 100.0, 2));
            }
        }

        merged
    }

    /// Promote a sample to a standalone reading. Only possible when the
    /// sample carries its own weight.
    pub fn from_sample(sample: &BodyCompositionSample) -> Option<ScaleReading> {
        let weight = sample.weight?;
        let base = ScaleReading::new(weight, sample.unit, sample.timestamp);
        Some(base.merged_with(sample))
    }
}

/// Decoded body composition payload, before merging onto the latest reading.
/// Mass values are already normalised to kilograms; `weight` stays in `unit`.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyCompositionSample {
    pub timestamp: OffsetDateTime,
    pub unit: WeightUnit,
    pub body_fat_percent: Option<f64>,
    pub impedance: Option<f64>,
    pub muscle_mass_kg: Option<f64>,
    pub body_water_mass_kg: Option<f64>,
    pub bone_mass_kg: Option<f64>,
    pub weight: Option<f64>,
    pub body_mass_index: Option<f64>,
}

impl BodyCompositionSample {
    pub fn empty(unit: WeightUnit, timestamp: OffsetDateTime) -> Self {
        BodyCompositionSample {
            timestamp,
            unit,
            body_fat_percent: None,
            impedance: None,
            muscle_mass_kg: None,
            body_water_mass_kg: None,
            bone_mass_kg: None,
            weight: None,
            body_mass_index: None,
        }
    }

    /// Fill BMI from a weight/height pair carried in the same payload
    pub fn with_height_m(mut self, height_m: Option<f64>) -> Self {
        if let (Some(weight), Some(height)) = (self.weight, height_m) {
            let weight_kg = match self.unit {
                WeightUnit::Kilogram => weight,
                WeightUnit::Pound => crate::utils::pounds_to_kg(weight),
            };
            self.body_mass_index = body_mass_index(weight_kg, height);
        }
        self
    }
}

/// Identity and connection metadata for one physical scale
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleDevice {
    pub id: String,
    pub name: String,
    pub manufacturer: Option<String>,
    pub model_number: Option<String>,
    pub is_connected: bool,
    pub last_connection_time: Option<OffsetDateTime>,
    pub last_weight: Option<f64>,
}

impl ScaleDevice {
    pub fn from_advertisement(advertisement: &Advertisement) -> Self {
        ScaleDevice {
            id: advertisement.id.clone(),
            name: advertisement.name.clone().unwrap_or_default(),
            manufacturer: None,
            model_number: None,
            is_connected: false,
            last_connection_time: None,
            last_weight: None,
        }
    }

    /// Display name, falling back to the id when the scale advertises none
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// One observation of a peripheral during a scan
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub id: String,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

/// Descriptive strings read from the Device Information service on connect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeripheralInfo {
    pub manufacturer: Option<String>,
    pub model_number: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(secs).unwrap()
    }

    #[test]
    fn merge_keeps_absent_fields_and_overwrites_present_ones() {
        let mut prior = ScaleReading::new(80.0, WeightUnit::Kilogram, at(100));
        prior.body_fat_percent = Some(20.0);
        prior.impedance = Some(500.0);
        prior.bone_mass_kg = Some(3.1);

        let mut sample = BodyCompositionSample::empty(WeightUnit::Kilogram, at(200));
        sample.body_fat_percent = Some(21.5);
        sample.muscle_mass_kg = Some(35.0);

        let merged = prior.merged_with(&sample);
        assert_eq!(merged.timestamp, at(200));
        assert_eq!(merged.weight, 80.0);
        assert_eq!(merged.body_fat_percent, Some(21.5));
        assert_eq!(merged.muscle_mass_kg, Some(35.0));
        assert_eq!(merged.impedance, Some(500.0));
        assert_eq!(merged.bone_mass_kg, Some(3.1));
        // the prior snapshot is untouched
        assert_eq!(prior.body_fat_percent, Some(20.0));
    }

    #[test]
    fn merge_derives_water_percent_from_weight() {
        let prior = ScaleReading::new(80.0, WeightUnit::Kilogram, at(100));
        let mut sample = BodyCompositionSample::empty(WeightUnit::Kilogram, at(101));
        sample.body_water_mass_kg = Some(44.0);

        let merged = prior.merged_with(&sample);
        assert_eq!(merged.water_percent, Some(55.0));
    }

    #[test]
    fn sample_weight_replaces_prior_weight_and_unit() {
        let prior = ScaleReading::new(80.0, WeightUnit::Kilogram, at(100));
        let mut sample = BodyCompositionSample::empty(WeightUnit::Pound, at(101));
        sample.weight = Some(170.0);

        let merged = prior.merged_with(&sample);
        assert_eq!(merged.weight, 170.0);
        assert_eq!(merged.unit, WeightUnit::Pound);
    }

    #[test]
    fn sample_without_weight_cannot_stand_alone() {
        let sample = BodyCompositionSample::empty(WeightUnit::Kilogram, at(1));
        assert!(ScaleReading::from_sample(&sample).is_none());

        let mut weighted = sample.clone();
        weighted.weight = Some(70.0);
        weighted.body_fat_percent = Some(18.0);
        let reading = ScaleReading::from_sample(&weighted).unwrap();
        assert_eq!(reading.weight, 70.0);
        assert_eq!(reading.body_fat_percent, Some(18.0));
        assert!(reading.has_body_composition());
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let advertisement = Advertisement {
            id: "AA:BB:CC:DD:EE:FF".to_string(),
            name: None,
            services: vec![],
            rssi: None,
        };
        let device = ScaleDevice::from_advertisement(&advertisement);
        assert_eq!(device.display_name(), "AA:BB:CC:DD:EE:FF");
    }
}
