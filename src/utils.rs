//! Utility functions for unit conversion and formatting
use time::{format_description, OffsetDateTime};

const KG_PER_POUND: f64 = 0.453_592_37;

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    let format = format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]")
        .expect("Failed to create format description");
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

pub fn pounds_to_kg(pounds: f64) -> f64 {
    pounds * KG_PER_POUND
}

pub fn kg_to_pounds(kg: f64) -> f64 {
    kg / KG_PER_POUND
}

/// Round to a fixed number of decimal places for display and storage
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Body mass index from weight in kilograms and height in metres
///
/// Returns None for a non-positive height.
pub fn body_mass_index(weight_kg: f64, height_m: f64) -> Option<f64> {
    if height_m <= 0.0 {
        return None;
    }
    Some(round_to(weight_kg / (height_m * height_m), 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn formats_datetime_day_first() {
        let dt = datetime!(2024-03-05 07:08:09 UTC);
        assert_eq!(format_datetime(&dt), "05.03.2024 - 07:08:09");
    }

    #[test]
    fn pound_conversion_round_trips() {
        assert!((pounds_to_kg(1.0) - 0.45359237).abs() < 1e-12);
        assert!((kg_to_pounds(pounds_to_kg(176.4)) - 176.4).abs() < 1e-9);
    }

    #[test]
    fn bmi_requires_positive_height() {
        assert_eq!(body_mass_index(80.0, 0.0), None);
        assert_eq!(body_mass_index(80.0, 2.0), Some(20.0));
        assert_eq!(body_mass_index(72.5, 1.8), Some(22.4));
    }

    #[test]
    fn rounding_to_decimals() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(80.0049, 3), 80.005);
    }
}
