//! Heart Rate Measurement (0x2A37) decoding.
//!
//! The same byte layout shows up in GATT notifications and, for some
//! vendors, inside advertisement service or manufacturer data.

use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

const FLAG_HR_U16: u8 = 0x01;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_ENERGY_EXPENDED: u8 = 0x08;
const FLAG_RR_INTERVALS: u8 = 0x10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload too short ({0} bytes)")]
    TooShort(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartRateMeasurement {
    pub bpm: u16,
    pub sensor_contact: Option<bool>,
    pub energy_expended: Option<u16>,
    /// Raw RR intervals in 1/1024 s.
    pub rr_intervals: Vec<u16>,
}

impl HeartRateMeasurement {
    pub fn rr_millis(&self) -> Vec<f64> {
        self.rr_intervals
            .iter()
            .map(|rr| f64::from(*rr) * 1000.0 / 1024.0)
            .collect()
    }
}

pub fn parse_measurement(data: &[u8]) -> Result<HeartRateMeasurement, PayloadError> {
    if data.len() < 2 {
        return Err(PayloadError::TooShort(data.len()));
    }
    let flags = data[0];

    let (bpm, mut offset) = if flags & FLAG_HR_U16 != 0 {
        if data.len() < 3 {
            return Err(PayloadError::TooShort(data.len()));
        }
        (u16::from_le_bytes([data[1], data[2]]), 3)
    } else {
        (u16::from(data[1]), 2)
    };

    let sensor_contact = if flags & FLAG_CONTACT_SUPPORTED != 0 {
        Some(flags & FLAG_CONTACT_DETECTED != 0)
    } else {
        None
    };

    // Optional trailing fields are best effort, a truncated one ends decoding.
    let mut energy_expended = None;
    if flags & FLAG_ENERGY_EXPENDED != 0 {
        if let Some(bytes) = data.get(offset..offset + 2) {
            energy_expended = Some(u16::from_le_bytes([bytes[0], bytes[1]]));
        }
        offset += 2;
    }

    let mut rr_intervals = vec![];
    if flags & FLAG_RR_INTERVALS != 0 {
        if let Some(rest) = data.get(offset..) {
            rr_intervals = rest
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
        }
    }

    Ok(HeartRateMeasurement {
        bpm,
        sensor_contact,
        energy_expended,
        rr_intervals,
    })
}

/// Looks for a measurement in service data first, then manufacturer data.
pub fn bpm_from_advertisement(
    service_data: &HashMap<Uuid, Vec<u8>>,
    manufacturer_data: &HashMap<u16, Vec<u8>>,
) -> Option<HeartRateMeasurement> {
    service_data
        .values()
        .chain(manufacturer_data.values())
        .find_map(|payload| parse_measurement(payload).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eight_bit_bpm() {
        let m = parse_measurement(&[0x00, 72]).unwrap();
        assert_eq!(m.bpm, 72);
        assert_eq!(m.sensor_contact, None);
        assert!(m.rr_intervals.is_empty());
    }

    #[test]
    fn sixteen_bit_bpm_is_little_endian() {
        let m = parse_measurement(&[0x01, 0x2c, 0x01]).unwrap();
        assert_eq!(m.bpm, 300);
    }

    #[test]
    fn short_payloads_are_rejected() {
        assert_eq!(parse_measurement(&[]), Err(PayloadError::TooShort(0)));
        assert_eq!(parse_measurement(&[0x00]), Err(PayloadError::TooShort(1)));
        assert_eq!(parse_measurement(&[0x01, 0x50]), Err(PayloadError::TooShort(2)));
    }

    #[test]
    fn sensor_contact_bits() {
        assert_eq!(parse_measurement(&[0x06, 60]).unwrap().sensor_contact, Some(true));
        assert_eq!(parse_measurement(&[0x04, 60]).unwrap().sensor_contact, Some(false));
        assert_eq!(parse_measurement(&[0x02, 60]).unwrap().sensor_contact, None);
    }

    #[test]
    fn energy_and_rr_intervals() {
        // flags: u8 bpm, energy present, rr present
        let data = [0x18, 65, 0x10, 0x00, 0x00, 0x04, 0x00, 0x02, 0xff];
        let m = parse_measurement(&data).unwrap();
        assert_eq!(m.bpm, 65);
        assert_eq!(m.energy_expended, Some(16));
        // trailing odd byte dropped
        assert_eq!(m.rr_intervals, vec![1024, 512]);
        assert_eq!(m.rr_millis(), vec![1000.0, 500.0]);
    }

    #[test]
    fn rr_intervals_after_sixteen_bit_bpm() {
        let m = parse_measurement(&[0x11, 0x2c, 0x01, 0x00, 0x04, 0x00, 0x02]).unwrap();
        assert_eq!(m.bpm, 300);
        assert_eq!(m.rr_intervals, vec![1024, 512]);
        assert_eq!(m.rr_millis(), vec![1000.0, 500.0]);

        let m = parse_measurement(&[0x19, 0xb4, 0x00, 0x10, 0x00, 0x00, 0x04]).unwrap();
        assert_eq!(m.bpm, 180);
        assert_eq!(m.energy_expended, Some(16));
        assert_eq!(m.rr_intervals, vec![1024]);
    }

    #[test]
    fn truncated_optional_fields_keep_bpm() {
        let m = parse_measurement(&[0x18, 80, 0x01]).unwrap();
        assert_eq!(m.bpm, 80);
        assert_eq!(m.energy_expended, None);
        assert!(m.rr_intervals.is_empty());
    }

    #[test]
    fn advertisement_prefers_service_data() {
        let mut service = HashMap::new();
        service.insert(HEART_RATE_SERVICE_UUID, vec![0x00, 90]);
        let mut manufacturer = HashMap::new();
        manufacturer.insert(0x004c, vec![0x00, 120]);
        assert_eq!(bpm_from_advertisement(&service, &manufacturer).unwrap().bpm, 90);

        service.insert(HEART_RATE_SERVICE_UUID, vec![0x01]);
        assert_eq!(bpm_from_advertisement(&service, &manufacturer).unwrap().bpm, 120);

        assert!(bpm_from_advertisement(&HashMap::new(), &HashMap::new()).is_none());
    }
}
