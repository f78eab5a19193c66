use std::collections::{HashMap, VecDeque};
use std::fmt;

use eframe::egui::Color32;

use crate::breathing::{Pulse, Theme, SCORE_COLORS};
use crate::session::SessionStats;

const ROLLING_SECS: f64 = 5.0;
const LOG_REPEAT_SECS: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Waiting,
    Live,
    Disconnected,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkStatus::Waiting => "WAITING",
            LinkStatus::Live => "LIVE",
            LinkStatus::Disconnected => "DISCONNECTED",
        })
    }
}

/// Everything the display keeps about one source.
pub struct Player {
    pub source: String,
    pub history: VecDeque<(f64, u16)>,
    pub current_hr: Option<u16>,
    pub last_sample_time: Option<f64>,
    pub pulse: Pulse,
    pub theme: Theme,
    pub score_color: Color32,
    pub session: SessionStats,
    pub hidden: bool,
    last_state: LinkStatus,
    last_log: Option<(f64, u16)>,
}

impl Player {
    pub fn new(source: impl Into<String>, score_color: Color32) -> Self {
        Player {
            source: source.into(),
            history: VecDeque::new(),
            current_hr: None,
            last_sample_time: None,
            pulse: Pulse::default(),
            theme: Theme::neutral(),
            score_color,
            session: SessionStats::default(),
            hidden: false,
            last_state: LinkStatus::Waiting,
            last_log: None,
        }
    }

    /// Records a sample. Returns true when the value is worth a log line:
    /// it changed, or the last line is older than a couple of seconds.
    pub fn push(&mut self, bpm: u16, now: f64, session_active: bool) -> bool {
        self.current_hr = Some(bpm);
        self.last_sample_time = Some(now);
        self.history.push_back((now, bpm));
        if session_active {
            self.session.record(bpm, now);
        }

        let should_log = self
            .last_log
            .map_or(true, |(t, last)| last != bpm || now - t > LOG_REPEAT_SECS);
        if should_log {
            self.last_log = Some((now, bpm));
        }
        should_log
    }

    pub fn trim_history(&mut self, cutoff: f64) {
        while self.history.front().is_some_and(|(t, _)| *t < cutoff) {
            self.history.pop_front();
        }
    }

    pub fn silence(&self, now: f64) -> Option<f64> {
        self.last_sample_time.map(|t| now - t)
    }

    pub fn is_stale(&self, now: f64, stale_seconds: f64) -> bool {
        self.silence(now).map_or(true, |gap| gap > stale_seconds)
    }

    /// Average over the last few seconds, falling back to the latest value.
    pub fn rolling_avg(&self, now: f64) -> f64 {
        let cutoff = now - ROLLING_SECS;
        let recent: Vec<f64> = self
            .history
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, v)| f64::from(*v))
            .collect();
        if !recent.is_empty() {
            recent.iter().sum::<f64>() / recent.len() as f64
        } else {
            self.current_hr.map_or(60.0, f64::from)
        }
    }

    pub fn status(&self, now: f64, stale_seconds: f64) -> LinkStatus {
        if self.current_hr.is_none() {
            LinkStatus::Waiting
        } else if self.is_stale(now, stale_seconds) {
            LinkStatus::Disconnected
        } else {
            LinkStatus::Live
        }
    }

    /// Stores the new status and returns it when it is a transition worth
    /// logging.
    pub fn transition(&mut self, status: LinkStatus) -> Option<LinkStatus> {
        let changed = status != self.last_state;
        self.last_state = status;
        (changed && status != LinkStatus::Waiting).then_some(status)
    }

    pub fn reset_session(&mut self) {
        self.session = SessionStats::default();
    }
}

/// What a new sample did to the set of panels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    New,
    Returned,
    Present,
}

/// Secondary panels (index 1 and up) go away after `hide_seconds` of
/// silence. Zero disables hiding.
pub fn hide_due(index: usize, silence: Option<f64>, hide_seconds: f64) -> bool {
    index >= 1 && hide_seconds > 0.0 && silence.is_some_and(|gap| gap > hide_seconds)
}

/// All players the display has seen, and which of them have a panel.
#[derive(Default)]
pub struct Roster {
    players: HashMap<String, Player>,
    // visible panels, in display order
    order: Vec<String>,
    // every source ever seen, in detection order
    known: Vec<String>,
}

impl Roster {
    /// Makes sure `source` has a visible panel.
    pub fn ensure(&mut self, source: &str) -> Arrival {
        if let Some(player) = self.players.get_mut(source) {
            if !player.hidden {
                return Arrival::Present;
            }
            player.hidden = false;
            if !self.order.iter().any(|s| s == source) {
                self.order.push(source.to_string());
            }
            return Arrival::Returned;
        }

        let color = SCORE_COLORS[self.players.len() % SCORE_COLORS.len()];
        self.players.insert(source.to_string(), Player::new(source, color));
        self.order.push(source.to_string());
        self.known.push(source.to_string());
        Arrival::New
    }

    /// Removes the panel of `source`. False when it had none.
    pub fn hide(&mut self, source: &str) -> bool {
        let Some(player) = self.players.get_mut(source) else {
            return false;
        };
        if player.hidden {
            return false;
        }
        player.hidden = true;
        self.order.retain(|s| s != source);
        true
    }

    pub fn get(&self, source: &str) -> Option<&Player> {
        self.players.get(source)
    }

    pub fn get_mut(&mut self, source: &str) -> Option<&mut Player> {
        self.players.get_mut(source)
    }

    pub fn visible(&self) -> &[String] {
        &self.order
    }

    /// Every player, in detection order.
    pub fn players(&self) -> impl Iterator<Item = &Player> + '_ {
        self.known.iter().filter_map(|s| self.players.get(s))
    }

    pub fn players_mut(&mut self) -> impl Iterator<Item = &mut Player> + '_ {
        self.players.values_mut()
    }

    /// Visible players in display order, then hidden ones in detection
    /// order. This is the order sessions are scored in.
    pub fn ranked(&self) -> impl Iterator<Item = &Player> + '_ {
        let hidden = self.known.iter().filter(|s| !self.order.contains(*s));
        self.order
            .iter()
            .chain(hidden)
            .filter_map(|s| self.players.get(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_logs_on_change_or_after_a_while() {
        let mut p = Player::new("a", Color32::RED);
        assert!(p.push(60, 0.0, false));
        assert!(!p.push(60, 1.0, false));
        assert!(p.push(61, 1.5, false));
        assert!(!p.push(61, 3.0, false));
        assert!(p.push(61, 3.6, false));
        assert_eq!(p.session.average(), None);

        p.push(70, 4.0, true);
        assert_eq!(p.session.average(), Some(70.0));
    }

    #[test]
    fn history_window_and_rolling_average() {
        let mut p = Player::new("a", Color32::RED);
        assert_eq!(p.rolling_avg(0.0), 60.0);
        for (t, bpm) in [(0.0, 50), (10.0, 60), (11.0, 70), (12.0, 80)] {
            p.push(bpm, t, false);
        }
        assert_eq!(p.rolling_avg(12.0), 70.0);
        assert_eq!(p.rolling_avg(100.0), 80.0);

        p.trim_history(10.5);
        assert_eq!(p.history.len(), 2);
    }

    #[test]
    fn status_transitions() {
        let mut p = Player::new("a", Color32::RED);
        assert_eq!(p.status(0.0, 5.0), LinkStatus::Waiting);
        assert_eq!(p.transition(LinkStatus::Waiting), None);

        p.push(60, 0.0, false);
        assert_eq!(p.status(1.0, 5.0), LinkStatus::Live);
        assert_eq!(p.transition(LinkStatus::Live), Some(LinkStatus::Live));
        assert_eq!(p.transition(LinkStatus::Live), None);

        assert_eq!(p.status(6.0, 5.0), LinkStatus::Disconnected);
        assert_eq!(
            p.transition(LinkStatus::Disconnected),
            Some(LinkStatus::Disconnected)
        );
        assert_eq!(LinkStatus::Disconnected.to_string(), "DISCONNECTED");
    }

    #[test]
    fn secondary_panels_hide_after_silence() {
        assert!(!hide_due(0, Some(60.0), 12.0));
        assert!(hide_due(1, Some(12.5), 12.0));
        assert!(!hide_due(1, Some(11.0), 12.0));
        assert!(!hide_due(2, Some(60.0), 0.0));
        assert!(!hide_due(1, None, 12.0));
    }

    #[test]
    fn hidden_panels_return_on_new_data() {
        let mut roster = Roster::default();
        assert_eq!(roster.ensure("a"), Arrival::New);
        assert_eq!(roster.ensure("b"), Arrival::New);
        assert_eq!(roster.ensure("c"), Arrival::New);
        assert_eq!(roster.ensure("a"), Arrival::Present);
        assert_ne!(roster.get("a").unwrap().score_color, roster.get("b").unwrap().score_color);

        assert!(roster.hide("b"));
        assert!(!roster.hide("b"));
        assert_eq!(roster.visible(), ["a", "c"]);
        assert!(roster.get("b").unwrap().hidden);

        let ranked: Vec<&str> = roster.ranked().map(|p| p.source.as_str()).collect();
        assert_eq!(ranked, ["a", "c", "b"]);

        assert_eq!(roster.ensure("b"), Arrival::Returned);
        assert_eq!(roster.visible(), ["a", "c", "b"]);
        assert!(!roster.get("b").unwrap().hidden);
        let detected: Vec<&str> = roster.players().map(|p| p.source.as_str()).collect();
        assert_eq!(detected, ["a", "b", "c"]);
    }
}
