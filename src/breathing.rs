//! Colour and pulse model for the breathing light.

use eframe::egui::Color32;

pub const BG: Color32 = Color32::from_rgb(0xf6, 0xf1, 0xe7);
pub const TEXT: Color32 = Color32::from_rgb(0x1f, 0x29, 0x37);
pub const MUTED: Color32 = Color32::from_rgb(0x6b, 0x72, 0x80);

pub const GREEN: Color32 = Color32::from_rgb(34, 197, 94);
pub const ORANGE: Color32 = Color32::from_rgb(255, 140, 0);
pub const RED: Color32 = Color32::from_rgb(239, 68, 68);
const DARK: Color32 = Color32::from_rgb(25, 30, 35);

pub const SCORE_COLORS: [Color32; 4] = [
    Color32::from_rgb(0x25, 0x63, 0xeb),
    Color32::from_rgb(0xef, 0x44, 0x44),
    Color32::from_rgb(0x10, 0xb9, 0x81),
    Color32::from_rgb(0xf5, 0x9e, 0x0b),
];

const STALE_INTENSITY: f64 = 0.06;

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

pub fn mix(a: Color32, b: Color32, t: f64) -> Color32 {
    let channel = |x: u8, y: u8| lerp(f64::from(x), f64::from(y), t) as u8;
    Color32::from_rgb(
        channel(a.r(), b.r()),
        channel(a.g(), b.g()),
        channel(a.b(), b.b()),
    )
}

/// Position of `bpm` inside the configured range, clamped to 0..=1.
pub fn normalize(bpm: f64, hr_min: u16, hr_max: u16) -> f64 {
    let span = f64::from(hr_max.saturating_sub(hr_min)).max(1.0);
    ((bpm - f64::from(hr_min)) / span).clamp(0.0, 1.0)
}

pub fn color_for_bpm(bpm: f64, hr_min: u16, hr_max: u16) -> Color32 {
    let t = normalize(bpm, hr_min, hr_max);
    if t <= 0.5 {
        mix(GREEN, ORANGE, t / 0.5)
    } else {
        mix(ORANGE, RED, (t - 0.5) / 0.5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Theme {
    pub bg: Color32,
    pub panel: Color32,
    pub grid: Color32,
    pub text: Color32,
    pub muted: Color32,
    pub line: Color32,
}

impl Theme {
    pub fn from_base(base: Color32) -> Self {
        Theme {
            bg: mix(base, Color32::WHITE, 0.55),
            panel: mix(base, Color32::WHITE, 0.62),
            grid: mix(base, Color32::WHITE, 0.38),
            text: mix(base, DARK, 0.85),
            muted: mix(base, DARK, 0.68),
            line: mix(base, DARK, 0.25),
        }
    }

    pub fn neutral() -> Self {
        Theme {
            bg: BG,
            panel: Color32::from_rgb(0xfd, 0xf9, 0xf2),
            grid: Color32::from_rgb(0xd9, 0xd1, 0xc6),
            text: TEXT,
            muted: MUTED,
            line: TEXT,
        }
    }
}

/// Brightness of the light `phase` (0..1) of the way through a beat.
pub fn envelope(phase: f64, norm: f64) -> f64 {
    let calm = 1.0 - norm;
    let attack = 0.10 + 0.08 * calm;
    let peak_hold = 0.05 + 0.03 * calm;
    let peak_floor = 0.70 + 0.08 * calm;

    if phase < attack {
        phase / attack
    } else if phase < attack + peak_hold {
        let t = (phase - attack) / peak_hold;
        1.0 - (1.0 - peak_floor) * t.powf(1.3)
    } else {
        let decay_t = (phase - attack - peak_hold) / (1.0 - attack - peak_hold);
        let decay_speed = 1.8 + 1.6 * norm;
        peak_floor * (-decay_speed * decay_t).exp()
    }
}

/// Exponential smoothing factor for `dt` seconds, given the per-tick
/// factor used at a `tick` second cadence.
pub fn smoothing(per_tick: f64, tick: f64, dt: f64) -> f64 {
    1.0 - (1.0 - per_tick).powf(dt.max(0.0) / tick)
}

/// Beat clock and smoothed state of one light.
#[derive(Debug, Clone, Default)]
pub struct Pulse {
    pub hr_smoothed: Option<f64>,
    pub intensity: f64,
    last_beat: Option<f64>,
    last_tick: Option<f64>,
}

impl Pulse {
    /// Advances the light to `now` and returns the smoothed intensity.
    pub fn tick(&mut self, now: f64, rolling_hr: f64, stale: bool, hr_min: u16, hr_max: u16) -> f64 {
        let dt = self.last_tick.map_or(0.033, |t| now - t);
        self.last_tick = Some(now);

        let hr = match self.hr_smoothed {
            None => rolling_hr,
            Some(prev) => prev + smoothing(0.06, 0.033, dt) * (rolling_hr - prev),
        };
        self.hr_smoothed = Some(hr);

        let bpm = hr.clamp(f64::from(hr_min), f64::from(hr_max));
        let interval = 60.0 / bpm.max(1.0);
        let norm = normalize(bpm, hr_min, hr_max);

        let mut last_beat = self.last_beat.unwrap_or(now);
        if now - last_beat >= interval {
            last_beat += ((now - last_beat) / interval).floor() * interval;
        }
        self.last_beat = Some(last_beat);
        let phase = ((now - last_beat) / interval).clamp(0.0, 1.0);

        let raw = if stale {
            STALE_INTENSITY
        } else {
            0.08 + 0.92 * envelope(phase, norm)
        };
        self.intensity += smoothing(0.28, 0.033, dt) * (raw - self.intensity);
        self.intensity
    }

    /// Radius scale of the light for the current intensity.
    pub fn scale(&self, hr_min: u16, hr_max: u16) -> f64 {
        let norm = normalize(self.hr_smoothed.unwrap_or(60.0), hr_min, hr_max);
        let amp = 0.40 + 0.20 * norm;
        0.68 + 0.55 * amp * self.intensity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colour_ramp_endpoints() {
        assert_eq!(color_for_bpm(40.0, 50, 200), GREEN);
        assert_eq!(color_for_bpm(125.0, 50, 200), ORANGE);
        assert_eq!(color_for_bpm(250.0, 50, 200), RED);
    }

    #[test]
    fn normalize_handles_degenerate_range() {
        assert_eq!(normalize(80.0, 80, 80), 0.0);
        assert_eq!(normalize(81.0, 80, 80), 1.0);
        assert_eq!(normalize(125.0, 50, 200), 0.5);
    }

    #[test]
    fn envelope_shape() {
        for norm in [0.0, 0.5, 1.0] {
            assert_eq!(envelope(0.0, norm), 0.0);
            let mut prev_decay = f64::MAX;
            for i in 0..=100 {
                let phase = i as f64 / 100.0;
                let e = envelope(phase, norm);
                assert!((0.0..=1.0).contains(&e), "phase {phase} gave {e}");
                if phase > 0.35 {
                    assert!(e <= prev_decay);
                    prev_decay = e;
                }
            }
        }
        // peak right after the attack
        assert!((envelope(0.18, 0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn smoothing_matches_tick_rate() {
        assert!((smoothing(0.06, 0.033, 0.033) - 0.06).abs() < 1e-12);
        assert_eq!(smoothing(0.28, 0.033, 0.0), 0.0);
        assert!(smoothing(0.28, 0.033, 10.0) > 0.999);
    }

    #[test]
    fn stale_pulse_dims() {
        let mut pulse = Pulse::default();
        for i in 0..300 {
            pulse.tick(i as f64 * 0.033, 70.0, true, 50, 200);
        }
        assert!((pulse.intensity - STALE_INTENSITY).abs() < 1e-3);
        assert_eq!(pulse.hr_smoothed, Some(70.0));
    }

    #[test]
    fn theme_is_lighter_than_base() {
        let theme = Theme::from_base(RED);
        assert!(theme.bg.g() > RED.g());
        assert!(theme.text.r() < RED.r());
    }
}
