use std::f64::consts::TAU;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::SimulateConfig;
use crate::stream::{now_secs, HrSample, StreamWriter};

/// Sinusoidal heart rate at `elapsed` seconds, clamped to the range.
pub fn bpm_at(elapsed: f64, phase: f64, hr_min: u16, hr_max: u16, period: f64, noise: f64) -> u16 {
    let lo = f64::from(hr_min.min(hr_max));
    let hi = f64::from(hr_min.max(hr_max));
    let mid = (lo + hi) / 2.0;
    let amp = (hi - lo) / 2.0;
    let period = if period > 0.0 { period } else { 240.0 };

    let hr = mid + amp * (TAU * elapsed / period + phase).sin() + noise;
    hr.clamp(lo, hi).round() as u16
}

pub async fn transmit_fake_hr_data(config: SimulateConfig, cancel: CancellationToken) -> Result<()> {
    let mut writer = StreamWriter::open(&config.file, config.truncate)?;
    info!("Simulating {} source(s) into {}", config.sources.len(), writer.path().display());

    let interval = Duration::from_secs_f64(config.interval.max(0.01));
    let start = now_secs();
    let phase_step = TAU / config.sources.len().max(1) as f64;

    loop {
        let now = now_secs();
        let elapsed = now - start;
        if config.duration.is_some_and(|d| elapsed >= d) {
            break;
        }

        for (i, source) in config.sources.iter().enumerate() {
            let jitter = f64::from(config.jitter);
            let noise = if jitter > 0.0 {
                rand::thread_rng().gen_range(-jitter..=jitter)
            } else {
                0.0
            };
            let bpm = bpm_at(elapsed, phase_step * i as f64, config.hr_min, config.hr_max, config.period, noise);
            let mut sample = HrSample::new(bpm, source.as_str());
            sample.ts = now;
            writer.append(&sample)?;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_a_sine_between_bounds() {
        assert_eq!(bpm_at(0.0, 0.0, 50, 200, 240.0, 0.0), 125);
        assert_eq!(bpm_at(60.0, 0.0, 50, 200, 240.0, 0.0), 200);
        assert_eq!(bpm_at(180.0, 0.0, 50, 200, 240.0, 0.0), 50);
        // half-cycle phase offset mirrors the curve
        assert_eq!(bpm_at(60.0, TAU / 2.0, 50, 200, 240.0, 0.0), 50);
    }

    #[test]
    fn noise_is_clamped() {
        assert_eq!(bpm_at(60.0, 0.0, 50, 200, 240.0, 40.0), 200);
        assert_eq!(bpm_at(180.0, 0.0, 50, 200, 240.0, -40.0), 50);
        assert_eq!(bpm_at(0.0, 0.0, 200, 50, 0.0, 0.0), 125);
    }

    #[tokio::test]
    async fn writes_one_line_per_source_per_tick() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sim.jsonl");
        let config = SimulateConfig {
            file: file.clone(),
            truncate: true,
            interval: 0.01,
            duration: Some(0.2),
            hr_min: 60,
            hr_max: 80,
            period: 10.0,
            jitter: 2,
            sources: vec!["a".into(), "b".into()],
        };
        transmit_fake_hr_data(config, CancellationToken::new()).await.unwrap();

        let text = std::fs::read_to_string(&file).unwrap();
        let records: Vec<_> = text.lines().filter_map(crate::stream::parse_line).collect();
        assert!(records.len() >= 2);
        assert_eq!(records.len() % 2, 0);
        assert_eq!(records[0].source, "a");
        assert_eq!(records[1].source, "b");
        assert!(records.iter().all(|r| (60..=80).contains(&r.bpm)));
    }
}
