//! Head-to-head scoring. Lower score wins.

use std::fmt;

/// Minimum spacing between two points on a source's score timeline.
const SCORE_SAMPLE_SECS: f64 = 1.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    sum: f64,
    count: u32,
    min: Option<u16>,
    max: Option<u16>,
    scores: Vec<(f64, f64)>,
    last_score_time: Option<f64>,
}

impl SessionStats {
    pub fn record(&mut self, bpm: u16, now: f64) {
        self.sum += f64::from(bpm);
        self.count += 1;
        self.min = Some(self.min.map_or(bpm, |m| m.min(bpm)));
        self.max = Some(self.max.map_or(bpm, |m| m.max(bpm)));

        let due = self
            .last_score_time
            .map_or(true, |t| now - t >= SCORE_SAMPLE_SECS);
        if due {
            if let Some(score) = self.score() {
                self.scores.push((now, score));
                self.last_score_time = Some(now);
            }
        }
    }

    pub fn min(&self) -> Option<u16> {
        self.min
    }

    pub fn max(&self) -> Option<u16> {
        self.max
    }

    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / f64::from(self.count))
    }

    pub fn score(&self) -> Option<f64> {
        Some(self.average()? + f64::from(self.min?) + f64::from(self.max?))
    }

    pub fn timeline(&self) -> &[(f64, f64)] {
        &self.scores
    }

    pub fn summary(&self) -> Option<String> {
        Some(format!(
            "Avg: {:.1} Min: {} Max: {}",
            self.average()?,
            self.min?,
            self.max?
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Winner(String),
    Tie,
    NotEnoughPlayers,
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Winner(name) => write!(f, "Winner: {name} (lower score)"),
            SessionOutcome::Tie => write!(f, "Tie"),
            SessionOutcome::NotEnoughPlayers => write!(f, "Not enough players to score"),
        }
    }
}

/// Scores the first two players, in display order, that produced samples.
pub fn decide<'a>(players: impl IntoIterator<Item = (&'a str, &'a SessionStats)>) -> SessionOutcome {
    let mut scored = players
        .into_iter()
        .filter_map(|(name, stats)| Some((name, stats.score()?)));

    let (Some((name_a, score_a)), Some((name_b, score_b))) = (scored.next(), scored.next()) else {
        return SessionOutcome::NotEnoughPlayers;
    };

    if score_a > score_b {
        SessionOutcome::Winner(name_b.to_string())
    } else if score_b > score_a {
        SessionOutcome::Winner(name_a.to_string())
    } else {
        SessionOutcome::Tie
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum SessionTimer {
    #[default]
    Idle,
    Running {
        start: f64,
        end: f64,
    },
    Finished {
        start: f64,
        end: f64,
        outcome: SessionOutcome,
    },
}

impl SessionTimer {
    /// Parses the minutes field and starts a new session.
    pub fn start(&mut self, minutes: &str, now: f64) -> Result<f64, String> {
        let minutes: f64 = minutes
            .trim()
            .parse()
            .map_err(|_| "Invalid minutes".to_string())?;
        if !(minutes > 0.0) || !minutes.is_finite() {
            return Err("Minutes must be > 0".to_string());
        }
        *self = SessionTimer::Running {
            start: now,
            end: now + minutes * 60.0,
        };
        Ok(minutes)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SessionTimer::Running { .. })
    }

    pub fn is_visible(&self) -> bool {
        !matches!(self, SessionTimer::Idle)
    }

    pub fn remaining(&self, now: f64) -> Option<f64> {
        match self {
            SessionTimer::Running { end, .. } => Some((end - now).max(0.0)),
            _ => None,
        }
    }

    /// Time span the score timeline covers.
    pub fn span(&self, now: f64) -> Option<(f64, f64)> {
        let (start, end) = match self {
            SessionTimer::Idle => return None,
            SessionTimer::Running { start, .. } => (*start, now),
            SessionTimer::Finished { start, end, .. } => (*start, *end),
        };
        Some((start, end.max(start + 1.0)))
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        match self {
            SessionTimer::Finished { outcome, .. } => Some(outcome),
            _ => None,
        }
    }

    pub fn finish(&mut self, outcome: SessionOutcome) {
        if let SessionTimer::Running { start, end } = *self {
            *self = SessionTimer::Finished { start, end, outcome };
        }
    }

    pub fn label(&self, now: f64) -> String {
        match self {
            SessionTimer::Idle => "Timer: --".to_string(),
            SessionTimer::Running { .. } => {
                let remaining = self.remaining(now).unwrap_or(0.0);
                let mins = (remaining / 60.0).floor() as u64;
                let secs = (remaining % 60.0).floor() as u64;
                format!("Timer: {mins:02}:{secs:02}")
            }
            SessionTimer::Finished { .. } => "Timer: done".to_string(),
        }
    }
}
