use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use btleplug::api::{Central, Peripheral as _, ScanFilter};
use btleplug::platform::Peripheral;
use tracing::{debug, info, warn};

use crate::ble::{self, DeviceInfo, Radio};
use crate::config::ScanConfig;
use crate::sources::{Discovery, SourceCache};

#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub seen: usize,
    pub found: usize,
    pub path: PathBuf,
}

impl ScanReport {
    pub fn summary(&self) -> String {
        format!("Saved {} sources to {}", self.found, self.path.display())
    }
}

/// Indexes of devices worth a probe connection, strongest signal first.
/// Devices that already advertise the Heart Rate service are skipped.
pub fn probe_order(devices: &[DeviceInfo], max_connect: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..devices.len())
        .filter(|i| !devices[*i].advertises_heart_rate())
        .collect();
    order.sort_by_key(|i| std::cmp::Reverse(devices[*i].rssi.unwrap_or(-999)));
    order.truncate(max_connect);
    order
}

async fn discover(radio: &Radio, scan_time: f64) -> Result<Vec<(Peripheral, DeviceInfo)>> {
    radio
        .adapter
        .start_scan(ScanFilter::default())
        .await
        .context("Can't scan BLE adapter")?;
    tokio::time::sleep(Duration::from_secs_f64(scan_time.max(0.0))).await;
    let _ = radio.adapter.stop_scan().await;

    let mut devices = vec![];
    for peripheral in radio.adapter.peripherals().await? {
        if let Some(info) = ble::device_info(&peripheral).await {
            devices.push((peripheral, info));
        }
    }
    Ok(devices)
}

async fn probe(peripheral: &Peripheral, label: &str, timeout: Duration) -> bool {
    let result = match ble::connect(peripheral, label, timeout).await {
        Ok(()) => ble::has_heart_rate_service(peripheral).await,
        Err(e) => Err(e),
    };
    let _ = peripheral.disconnect().await;
    match result {
        Ok(found) => found,
        Err(e) => {
            debug!("Probe of {label} failed: {e}");
            false
        }
    }
}

/// Scans, probes likely candidates and merges every Heart Rate source into
/// the cache file.
pub async fn scan_sources(config: &ScanConfig) -> Result<ScanReport> {
    let radio = Radio::first().await?;
    info!("Scanning {:.1}s for Heart Rate sources...", config.scan_time);
    let devices = discover(&radio, config.scan_time).await?;
    let infos: Vec<DeviceInfo> = devices.iter().map(|(_, info)| info.clone()).collect();

    let mut found: Vec<(&DeviceInfo, Discovery)> = infos
        .iter()
        .filter(|info| info.advertises_heart_rate())
        .map(|info| (info, Discovery::Advertisement))
        .collect();

    let timeout = Duration::from_secs_f64(config.connect_timeout.max(0.1));
    for i in probe_order(&infos, config.max_connect) {
        let (peripheral, info) = &devices[i];
        if probe(peripheral, info.label(), timeout).await {
            found.push((&infos[i], Discovery::Connect));
        }
    }

    let mut cache = match SourceCache::load(&config.sources_file) {
        Ok(cache) => cache,
        Err(e) => {
            warn!("Starting a fresh sources file: {e}");
            SourceCache::default()
        }
    };
    for (info, via) in &found {
        cache.upsert(&info.address, info.label(), *via, true);
    }
    cache
        .save(&config.sources_file)
        .with_context(|| format!("saving {}", config.sources_file.display()))?;
    debug!("{} sources cached in {}", cache.len(), config.sources_file.display());

    Ok(ScanReport {
        seen: infos.len(),
        found: found.len(),
        path: config.sources_file.clone(),
    })
}

pub async fn run(config: ScanConfig) -> Result<()> {
    if config.list {
        let radio = Radio::first().await?;
        let devices = discover(&radio, config.scan_time).await?;
        if devices.is_empty() {
            info!("No BLE devices found.");
        }
        for (_, info) in &devices {
            println!("{}", info.describe());
        }
        return Ok(());
    }

    let report = scan_sources(&config).await?;
    debug!("{} devices seen", report.seen);
    println!("{}", report.summary());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::HEART_RATE_SERVICE_UUID;

    fn device(address: &str, rssi: Option<i16>, hr: bool) -> DeviceInfo {
        DeviceInfo {
            address: address.into(),
            rssi,
            services: if hr { vec![HEART_RATE_SERVICE_UUID] } else { vec![] },
            ..Default::default()
        }
    }

    #[test]
    fn strongest_non_advertising_first() {
        let devices = vec![
            device("weak", Some(-90), false),
            device("hr", Some(-30), true),
            device("strong", Some(-40), false),
            device("silent", None, false),
            device("mid", Some(-70), false),
        ];
        assert_eq!(probe_order(&devices, 5), vec![2, 4, 0, 3]);
        assert_eq!(probe_order(&devices, 2), vec![2, 4]);
        assert!(probe_order(&devices, 0).is_empty());
    }

    #[test]
    fn report_summary() {
        let report = ScanReport {
            seen: 7,
            found: 2,
            path: PathBuf::from("data/hr_sources.json"),
        };
        assert_eq!(report.summary(), "Saved 2 sources to data/hr_sources.json");
    }
}
