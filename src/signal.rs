use btleplug::platform::PeripheralId;

use crate::scan::ScanReport;
use crate::stream::HrSample;

/// Sent by per-device tasks back to the listener loop. The `u64` is the
/// generation of the link that sent it.
pub enum LinkSignal {
    Subscribed(PeripheralId, u64),
    HeartRate(HrSample),
    ConnectFailed(PeripheralId, u64, String),
    NoHeartRate(PeripheralId, u64, String),
    Disconnected(PeripheralId, u64),
}

/// Sent by the background scan task to the display.
pub enum ScanSignal {
    Finished(ScanReport),
    Failed(String),
}
