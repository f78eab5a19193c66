use std::collections::HashMap;

use anyhow::Result;
use btleplug::api::{Central, CentralEvent, ScanFilter};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ble::{self, Radio};
use crate::config::BroadcastConfig;
use crate::measurement::bpm_from_advertisement;
use crate::stream::{HrSample, StreamWriter};

/// Reads heart rate straight out of advertisements, no connection needed.
pub async fn run(config: BroadcastConfig, cancel: CancellationToken) -> Result<()> {
    let radio = Radio::first().await?;
    let mut writer = config
        .file
        .as_deref()
        .map(|path| StreamWriter::open(path, false))
        .transpose()?;

    let mut events = radio.adapter.events().await?;
    radio.adapter.start_scan(ScanFilter::default()).await?;
    info!("Scanning for BLE advertisements...");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.next() => event,
        };
        let Some(event) = event else { break };

        let (id, service_data, manufacturer_data) = match event {
            CentralEvent::ServiceDataAdvertisement { id, service_data } => {
                (id, service_data, HashMap::new())
            }
            CentralEvent::ManufacturerDataAdvertisement { id, manufacturer_data } => {
                (id, HashMap::new(), manufacturer_data)
            }
            _ => continue,
        };

        let Ok(peripheral) = radio.adapter.peripheral(&id).await else {
            continue;
        };
        let Some(info) = ble::device_info(&peripheral).await else {
            continue;
        };
        if !ble::matches_device(
            info.name.as_deref(),
            &info.address,
            config.name.as_deref(),
            config.address.as_deref(),
        ) {
            continue;
        }

        if config.raw {
            let svc = service_data
                .iter()
                .map(|(uuid, data)| format!("{uuid}={}", ble::hex_string(data)))
                .collect::<Vec<_>>();
            let mfg = manufacturer_data
                .iter()
                .map(|(id, data)| format!("{id:04x}={}", ble::hex_string(data)))
                .collect::<Vec<_>>();
            info!(
                "{} svc:{} mfg:{}",
                info.describe(),
                if svc.is_empty() { "-".to_string() } else { svc.join(" ") },
                if mfg.is_empty() { "-".to_string() } else { mfg.join(" ") },
            );
            continue;
        }

        let Some(measurement) = bpm_from_advertisement(&service_data, &manufacturer_data) else {
            continue;
        };
        info!("{} {} HR={} bpm", info.label(), info.address, measurement.bpm);

        if let Some(writer) = writer.as_mut() {
            let sample = HrSample::new(measurement.bpm, info.label())
                .with_id(info.address.as_str())
                .with_rr(measurement.rr_millis());
            if let Err(e) = writer.append(&sample) {
                warn!("Dropping sample: {e}");
            }
        }
    }

    let _ = radio.adapter.stop_scan().await;
    Ok(())
}
