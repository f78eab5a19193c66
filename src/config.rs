use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

pub const DEFAULT_STREAM_FILE: &str = "data/hr_stream.jsonl";
pub const DEFAULT_SOURCES_FILE: &str = "data/hr_sources.json";

#[derive(Parser, Debug)]
#[command(name = "hrlight")]
#[command(about = "Heart-rate breathing light fed by Bluetooth LE sources", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to Heart Rate sources and append readings to the stream file
    Listen(ListenConfig),
    /// Read heart rate out of BLE advertisements
    Broadcast(BroadcastConfig),
    /// Find Heart Rate sources and save them to the sources file
    Scan(ScanConfig),
    /// Write a synthetic heart-rate stream
    Simulate(SimulateConfig),
    /// Breathing light and live chart driven by the stream file
    Display(DisplayConfig),
}

#[derive(Args, Debug, Clone)]
pub struct ListenConfig {
    /// Stream file to append readings to
    #[arg(long, default_value = DEFAULT_STREAM_FILE)]
    pub file: PathBuf,
    /// Empty the stream file before writing
    #[arg(long)]
    pub truncate: bool,
    /// Substring match on device name (repeatable)
    #[arg(long)]
    pub name: Vec<String>,
    /// Substring match on device address or identifier (repeatable)
    #[arg(long)]
    pub address: Vec<String>,
    /// Maximum number of devices connected at once
    #[arg(long)]
    pub max_devices: Option<usize>,
    /// Scan without the Heart Rate service filter
    #[arg(long)]
    pub scan_all: bool,
    /// Source cache whose entries are connected first
    #[arg(long)]
    pub sources_file: Option<PathBuf>,
    /// Seconds to wait for preferred sources before taking others
    #[arg(long, default_value_t = 6.0)]
    pub preferred_grace: f64,
    /// Seconds allowed for one connection attempt
    #[arg(long, default_value_t = 10.0)]
    pub connect_timeout: f64,
    /// Seconds between reconnect attempts
    #[arg(long, default_value_t = 5.0)]
    pub reconnect_interval: f64,
    /// Stop after N seconds (0 = run until interrupted)
    #[arg(long, default_value_t = 0.0)]
    pub timeout: f64,
}

#[derive(Args, Debug, Clone)]
pub struct BroadcastConfig {
    /// Substring match on device name
    #[arg(long)]
    pub name: Option<String>,
    /// Exact BLE address match
    #[arg(long)]
    pub address: Option<String>,
    /// Stop after N seconds (0 = run until interrupted)
    #[arg(long, default_value_t = 0.0)]
    pub timeout: f64,
    /// Log raw service and manufacturer data
    #[arg(long)]
    pub raw: bool,
    /// Also append readings to this stream file
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ScanConfig {
    /// Source cache to update
    #[arg(long, default_value = DEFAULT_SOURCES_FILE)]
    pub sources_file: PathBuf,
    /// Seconds to scan
    #[arg(long, default_value_t = 12.0)]
    pub scan_time: f64,
    /// Devices without an advertised Heart Rate service to probe by connecting
    #[arg(long, default_value_t = 5)]
    pub max_connect: usize,
    /// Seconds allowed for one probe connection
    #[arg(long, default_value_t = 8.0)]
    pub connect_timeout: f64,
    /// Only list what was seen, leave the cache alone
    #[arg(long)]
    pub list: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateConfig {
    #[arg(long, default_value = DEFAULT_STREAM_FILE)]
    pub file: PathBuf,
    /// Empty the stream file before writing
    #[arg(long)]
    pub truncate: bool,
    /// Seconds between samples
    #[arg(long, default_value_t = 0.5)]
    pub interval: f64,
    /// Seconds to run (omit for forever)
    #[arg(long)]
    pub duration: Option<f64>,
    /// Minimum bpm
    #[arg(long = "min", default_value_t = 50)]
    pub hr_min: u16,
    /// Maximum bpm
    #[arg(long = "max", default_value_t = 200)]
    pub hr_max: u16,
    /// Cycle period in seconds
    #[arg(long, default_value_t = 240.0)]
    pub period: f64,
    /// Uniform noise of +/- N bpm
    #[arg(long, default_value_t = 0)]
    pub jitter: u16,
    /// Source name to simulate (repeatable)
    #[arg(long = "source", default_values_t = ["simulator".to_string()])]
    pub sources: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DisplayConfig {
    #[arg(long, default_value = DEFAULT_STREAM_FILE)]
    pub file: PathBuf,
    /// History window in seconds
    #[arg(long, default_value_t = 1800)]
    pub window: u64,
    #[arg(long = "min", default_value_t = 50)]
    pub hr_min: u16,
    #[arg(long = "max", default_value_t = 200)]
    pub hr_max: u16,
    /// Close the window after N seconds
    #[arg(long)]
    pub duration: Option<f64>,
    /// Listener log to surface connection events from
    #[arg(long)]
    pub listener_log: Option<PathBuf>,
    /// Mark a source disconnected after N seconds without data
    #[arg(long, default_value_t = 5.0)]
    pub stale_seconds: f64,
    /// Hide secondary panels after N seconds without data (0 = never)
    #[arg(long, default_value_t = 12.0)]
    pub hide_seconds: f64,
    #[arg(long, default_value = DEFAULT_SOURCES_FILE)]
    pub sources_file: PathBuf,
    /// Scan duration for the scan button
    #[arg(long, default_value_t = 12.0)]
    pub scan_time: f64,
    #[arg(long, default_value_t = 5)]
    pub scan_max_connect: usize,
    #[arg(long, default_value_t = 8.0)]
    pub scan_timeout: f64,
    /// Only show sources matching this substring (repeatable)
    #[arg(long = "source")]
    pub sources: Vec<String>,
}

impl DisplayConfig {
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            sources_file: self.sources_file.clone(),
            scan_time: self.scan_time,
            max_connect: self.scan_max_connect,
            connect_timeout: self.scan_timeout,
            list: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_flags() {
        let cli = Cli::try_parse_from([
            "hrlight", "listen", "--name", "polar", "--name", "watch", "--address", "AA:BB",
            "--truncate", "--max-devices", "2", "--scan-all", "--sources-file", "s.json",
            "--preferred-grace", "3", "--timeout", "30",
        ])
        .unwrap();
        let Command::Listen(config) = cli.command else {
            panic!("expected listen");
        };
        assert_eq!(config.name, vec!["polar", "watch"]);
        assert_eq!(config.address, vec!["AA:BB"]);
        assert!(config.truncate && config.scan_all);
        assert_eq!(config.max_devices, Some(2));
        assert_eq!(config.sources_file, Some(PathBuf::from("s.json")));
        assert_eq!(config.preferred_grace, 3.0);
        assert_eq!(config.timeout, 30.0);
        assert_eq!(config.file, PathBuf::from(DEFAULT_STREAM_FILE));
    }

    #[test]
    fn display_defaults() {
        let cli = Cli::try_parse_from(["hrlight", "display", "--listener-log", "l.log"]).unwrap();
        let Command::Display(config) = cli.command else {
            panic!("expected display");
        };
        assert_eq!(config.window, 1800);
        assert_eq!((config.hr_min, config.hr_max), (50, 200));
        assert_eq!(config.hide_seconds, 12.0);
        assert_eq!(config.listener_log, Some(PathBuf::from("l.log")));
        assert_eq!(config.scan_config().max_connect, 5);
    }

    #[test]
    fn simulate_sources() {
        let cli = Cli::try_parse_from(["hrlight", "simulate"]).unwrap();
        let Command::Simulate(config) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(config.sources, vec!["simulator"]);

        let cli = Cli::try_parse_from([
            "hrlight", "simulate", "--source", "a", "--source", "b", "--min", "60", "--max", "90",
        ])
        .unwrap();
        let Command::Simulate(config) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(config.sources, vec!["a", "b"]);
        assert_eq!((config.hr_min, config.hr_max), (60, 90));
    }
}
