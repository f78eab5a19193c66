use std::time::Duration;

use btleplug::api::{BDAddr, Central, Manager as _, Peripheral as _};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tracing::debug;
use uuid::Uuid;

use crate::error::{HrError, Result};
use crate::measurement::HEART_RATE_SERVICE_UUID;

/// The manager is kept next to the adapter so both live as long as the scan.
pub struct Radio {
    _manager: Manager,
    pub adapter: Adapter,
}

impl Radio {
    pub async fn first() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter_list = manager.adapters().await?;

        for adapter in adapter_list.iter() {
            debug!(
                "Adapter: {}",
                adapter
                    .adapter_info()
                    .await
                    .unwrap_or_else(|_| "No name adapter".to_string())
            );
        }

        // TODO: add an --adapter flag for machines with more than one radio
        let adapter = adapter_list.into_iter().next().ok_or(HrError::NoAdapter)?;
        Ok(Radio {
            _manager: manager,
            adapter,
        })
    }
}

/// Address string for a peripheral. CoreBluetooth hides addresses, so the
/// platform identifier stands in for it there.
pub fn device_address(peripheral: &Peripheral) -> String {
    let address = peripheral.address();
    if address == BDAddr::from([0u8; 6]) {
        format!("{:?}", peripheral.id())
    } else {
        address.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
    pub manufacturer_ids: Vec<u16>,
}

impl DeviceInfo {
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    pub fn advertises_heart_rate(&self) -> bool {
        self.services.contains(&HEART_RATE_SERVICE_UUID)
    }

    pub fn describe(&self) -> String {
        let uuids = if self.services.is_empty() {
            "-".to_string()
        } else {
            self.services.iter().map(Uuid::to_string).collect::<Vec<_>>().join(",")
        };
        let mfg = if self.manufacturer_ids.is_empty() {
            "-".to_string()
        } else {
            self.manufacturer_ids
                .iter()
                .map(|id| format!("{id:04x}"))
                .collect::<Vec<_>>()
                .join(",")
        };
        let mut line = format!(
            "{} {} uuids:{uuids} mfg:{mfg}",
            self.name.as_deref().unwrap_or("(unknown)"),
            self.address
        );
        if let Some(rssi) = self.rssi {
            line.push_str(&format!(" rssi:{rssi}dBm"));
        }
        line
    }
}

pub async fn device_info(peripheral: &Peripheral) -> Option<DeviceInfo> {
    let properties = peripheral.properties().await.ok()??;
    let mut manufacturer_ids: Vec<u16> = properties.manufacturer_data.keys().copied().collect();
    manufacturer_ids.sort_unstable();

    Some(DeviceInfo {
        address: device_address(peripheral),
        name: properties.local_name,
        rssi: properties.rssi,
        services: properties.services,
        manufacturer_ids,
    })
}

pub async fn connect(peripheral: &Peripheral, label: &str, timeout: Duration) -> Result<()> {
    if peripheral.is_connected().await? {
        return Ok(());
    }
    match tokio::time::timeout(timeout, peripheral.connect()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(HrError::ConnectTimeout(label.to_string())),
    }
}

pub async fn has_heart_rate_service(peripheral: &Peripheral) -> Result<bool> {
    peripheral.discover_services().await?;
    Ok(peripheral
        .services()
        .iter()
        .any(|service| service.uuid == HEART_RATE_SERVICE_UUID))
}

/// True when any needle is a case-insensitive substring of any haystack.
pub fn matches_any(haystacks: &[&str], needles: &[String]) -> bool {
    needles.iter().any(|needle| {
        let needle = needle.to_lowercase();
        haystacks
            .iter()
            .any(|hay| hay.to_lowercase().contains(&needle))
    })
}

/// Address filter is exact, name filter is a substring. Both case-insensitive.
pub fn matches_device(
    name: Option<&str>,
    address: &str,
    want_name: Option<&str>,
    want_address: Option<&str>,
) -> bool {
    if let Some(want) = want_address {
        if !address.eq_ignore_ascii_case(want) {
            return false;
        }
    }
    if let Some(want) = want_name {
        let name = name.unwrap_or_default().to_lowercase();
        if !name.contains(&want.to_lowercase()) {
            return false;
        }
    }
    true
}

pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_matching() {
        let needles = vec!["polar".to_string(), "Watch".to_string()];
        assert!(matches_any(&["Polar H10 1234"], &needles));
        assert!(matches_any(&["-", "Apple WATCH"], &needles));
        assert!(!matches_any(&["Garmin"], &needles));
        assert!(!matches_any(&["anything"], &[]));
    }

    #[test]
    fn device_filters() {
        assert!(matches_device(Some("Polar H10"), "AA:BB", None, None));
        assert!(matches_device(Some("Polar H10"), "AA:BB", Some("h10"), Some("aa:bb")));
        assert!(!matches_device(Some("Polar H10"), "AA:BB", None, Some("AA:B")));
        assert!(!matches_device(None, "AA:BB", Some("polar"), None));
    }

    #[test]
    fn describe_line() {
        let info = DeviceInfo {
            address: "AA:BB".into(),
            name: Some("Polar".into()),
            rssi: Some(-60),
            services: vec![HEART_RATE_SERVICE_UUID],
            manufacturer_ids: vec![0x004c],
        };
        assert!(info.advertises_heart_rate());
        assert_eq!(
            info.describe(),
            "Polar AA:BB uuids:0000180d-0000-1000-8000-00805f9b34fb mfg:004c rssi:-60dBm"
        );
        let bare = DeviceInfo { address: "CC".into(), ..Default::default() };
        assert_eq!(bare.label(), "CC");
        assert_eq!(bare.describe(), "(unknown) CC uuids:- mfg:-");
    }

    #[test]
    fn hex_dump() {
        assert_eq!(hex_string(&[0x00, 0x4c, 0xff]), "004cff");
    }
}
