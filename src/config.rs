use log::{info, warn};
use std::env;
use tokio::time::Duration;

use crate::error::ConfigError;
use crate::manager::{ManagerOptions, DEFAULT_SCAN_TIMEOUT};

#[derive(Debug, Clone)]
pub struct ScaleConfig {
    pub scan_timeout: Duration,
    /// Connect to this id when it shows up instead of the first scale found
    pub preferred_device: Option<String>,
    /// Use the simulated radio instead of BlueZ
    pub simulate: bool,
    pub allow_duplicates: bool,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        ScaleConfig {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            preferred_device: None,
            simulate: false,
            allow_duplicates: false,
        }
    }
}

impl ScaleConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ScaleConfig::default();

        if let Some(value) = lookup("SCALE_SCAN_TIMEOUT_SECS") {
            let secs = value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(ConfigError::InvalidValue {
                    name: "SCALE_SCAN_TIMEOUT_SECS",
                    expected: "a positive number of seconds",
                    value: value.clone(),
                })?;
            config.scan_timeout = Duration::from_secs(secs);
        }

        if let Some(device) = lookup("SCALE_DEVICE") {
            let device = device.trim();
            if device.is_empty() {
                warn!("SCALE_DEVICE is set but empty, ignoring");
            } else {
                config.preferred_device = Some(device.to_uppercase());
            }
        }

        if let Some(value) = lookup("SCALE_SIMULATE") {
            config.simulate = parse_bool("SCALE_SIMULATE", &value)?;
        }
        if let Some(value) = lookup("SCALE_ALLOW_DUPLICATES") {
            config.allow_duplicates = parse_bool("SCALE_ALLOW_DUPLICATES", &value)?;
        }

        info!(
            "Scan timeout {}s, preferred device {}, simulate={}",
            config.scan_timeout.as_secs(),
            config.preferred_device.as_deref().unwrap_or("<first found>"),
            config.simulate
        );

        Ok(config)
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            scan_timeout: self.scan_timeout,
            allow_duplicates: self.allow_duplicates,
        }
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            expected: "a boolean",
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = ScaleConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.scan_timeout, DEFAULT_SCAN_TIMEOUT);
        assert!(config.preferred_device.is_none());
        assert!(!config.simulate);
        assert!(!config.allow_duplicates);
    }

    #[test]
    fn reads_all_values() {
        let config = ScaleConfig::from_lookup(lookup(&[
            ("SCALE_SCAN_TIMEOUT_SECS", "5"),
            ("SCALE_DEVICE", " aa:bb:cc:dd:ee:ff "),
            ("SCALE_SIMULATE", "yes"),
            ("SCALE_ALLOW_DUPLICATES", "1"),
        ]))
        .unwrap();
        assert_eq!(config.scan_timeout, Duration::from_secs(5));
        assert_eq!(config.preferred_device.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert!(config.simulate);
        assert!(config.manager_options().allow_duplicates);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(ScaleConfig::from_lookup(lookup(&[("SCALE_SCAN_TIMEOUT_SECS", "0")])).is_err());
        assert!(ScaleConfig::from_lookup(lookup(&[("SCALE_SCAN_TIMEOUT_SECS", "soon")])).is_err());
        assert!(ScaleConfig::from_lookup(lookup(&[("SCALE_SIMULATE", "maybe")])).is_err());
    }

    #[test]
    fn empty_device_is_ignored() {
        let config = ScaleConfig::from_lookup(lookup(&[("SCALE_DEVICE", "  ")])).unwrap();
        assert!(config.preferred_device.is_none());
    }
}
