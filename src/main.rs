use log::{error, info, warn};
use std::sync::Arc;

use scale_link::bluetooth::{RadioClient, SimulatedRadio};
use scale_link::utils::{format_datetime, kg_to_pounds};
use scale_link::{EventReceiver, ScaleConfig, ScaleEvent, ScaleLinkManager, WeightUnit};

#[cfg(feature = "bluez")]
async fn hardware_radio() -> Result<Arc<dyn RadioClient>, Box<dyn std::error::Error>> {
    let radio = scale_link::bluetooth::BluezRadio::new().await?;
    Ok(Arc::new(radio))
}

#[cfg(not(feature = "bluez"))]
async fn hardware_radio() -> Result<Arc<dyn RadioClient>, Box<dyn std::error::Error>> {
    Err("built without BlueZ support, set SCALE_SIMULATE=1".into())
}

async fn build_radio(config: &ScaleConfig) -> Result<Arc<dyn RadioClient>, Box<dyn std::error::Error>> {
    if config.simulate {
        info!("Using simulated scale radio");
        return Ok(Arc::new(SimulatedRadio::demo()));
    }
    hardware_radio().await
}

fn log_event(event: &ScaleEvent) {
    let now = format_datetime(&time::OffsetDateTime::now_utc());
    match event {
        ScaleEvent::DeviceFound(device) => {
            info!("[{}] Found {} ({})", now, device.display_name(), device.id)
        }
        ScaleEvent::Connected(device) => info!(
            "[{}] Connected to {} {}",
            now,
            device.manufacturer.as_deref().unwrap_or(""),
            device.display_name()
        ),
        ScaleEvent::WeightData(reading) => {
            let kg = reading.weight_kg();
            info!(
                "[{}] Weight: {:.2} kg / {:.1} lb",
                now,
                kg,
                match reading.unit {
                    WeightUnit::Pound => reading.weight,
                    WeightUnit::Kilogram => kg_to_pounds(kg),
                }
            );
        }
        ScaleEvent::BodyCompositionData(reading) => {
            info!("[{}] Body composition:", now);
            if let Some(fat) = reading.body_fat_percent {
                info!("  Body fat: {:.1}%", fat);
            }
            if let Some(water) = reading.water_percent {
                info!("  Water: {:.1}%", water);
            }
            if let Some(muscle) = reading.muscle_mass_kg {
                info!("  Muscle mass: {:.2} kg", muscle);
            }
            if let Some(bone) = reading.bone_mass_kg {
                info!("  Bone mass: {:.2} kg", bone);
            }
            if let Some(impedance) = reading.impedance {
                info!("  Impedance: {:.1} ohm", impedance);
            }
            if let Some(bmi) = reading.body_mass_index {
                info!("  BMI: {:.1}", bmi);
            }
        }
        ScaleEvent::Error(e) => warn!("[{}] {}", now, e),
        other => info!("[{}] {}", now, other.name()),
    }
}

async fn run(
    manager: &ScaleLinkManager,
    config: &ScaleConfig,
    mut events: EventReceiver,
) -> Result<(), Box<dyn std::error::Error>> {
    manager.start_scan(None).await?;

    // Wait for the preferred scale, or the first one if none is configured
    let mut target = None;
    while let Some(event) = events.recv().await {
        log_event(&event);
        match event {
            ScaleEvent::DeviceFound(device) => {
                let wanted = config
                    .preferred_device
                    .as_ref()
                    .map_or(true, |id| *id == device.id);
                if wanted {
                    target = Some(device.id);
                    break;
                }
            }
            ScaleEvent::ScanEnd => break,
            _ => {}
        }
    }

    let Some(id) = target else {
        warn!("No scale found during the scan");
        return Ok(());
    };

    manager.stop_scan().await?;
    manager.connect_to_device(&id).await?;
    if manager.supports_body_composition(&id).await? {
        info!("{} reports body composition", id);
    }

    while let Some(event) = events.recv().await {
        log_event(&event);
        if let ScaleEvent::Disconnected(_) = event {
            warn!("Scale disconnected, stopping");
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match ScaleConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let radio = build_radio(&config).await?;
    let manager = ScaleLinkManager::with_options(radio, config.manager_options());
    let events = manager.subscribe()?;

    // Run until the scale goes away or Ctrl+C
    tokio::select! {
        result = run(&manager, &config, events) => {
            match result {
                Ok(_) => info!("Scale session ended"),
                Err(e) => error!("Fatal error: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Program terminated by user. Exiting gracefully.");
        }
    }

    manager.destroy().await;
    Ok(())
}
