//! The short rolling log shown over the first panel.

use std::collections::VecDeque;

const MAX_LINES: usize = 7;

const LISTENER_KEYWORDS: [&str; 6] = [
    "disconnected",
    "reconnecting",
    "reconnect attempt",
    "failed to connect",
    "listening for heart rate",
    "connect failed",
];

pub fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii() { c } else { '?' })
        .collect()
}

/// Connection events worth surfacing from the listener's log file, with the
/// `tracing` prefix (timestamp, level, target) stripped.
pub fn listener_event(line: &str) -> Option<&str> {
    let text = line.trim();
    if text.is_empty() {
        return None;
    }
    let lower = text.to_lowercase();
    if !LISTENER_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return None;
    }

    let levels = [" INFO ", " WARN ", " ERROR ", " DEBUG "];
    let message = levels
        .iter()
        .find_map(|level| text.find(level).map(|i| &text[i + level.len()..]))
        .and_then(|rest| rest.split_once(": ").map(|(_, msg)| msg))
        .unwrap_or(text);
    Some(message.trim())
}

#[derive(Debug, Default)]
pub struct ActivityLog {
    lines: VecDeque<String>,
}

impl ActivityLog {
    pub fn push(&mut self, message: &str) {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        self.lines.push_back(format!("[{stamp}] {}", sanitize(message)));
        while self.lines.len() > MAX_LINES {
            self.lines.pop_front();
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_lines() {
        let mut log = ActivityLog::default();
        for i in 0..10 {
            log.push(&format!("line {i}"));
        }
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), MAX_LINES);
        assert!(lines[0].ends_with("line 3"));
        assert!(lines[6].ends_with("line 9"));
        assert!(lines[0].starts_with('['));
    }

    #[test]
    fn non_ascii_is_replaced() {
        assert_eq!(sanitize("Jörg’s band"), "J?rg?s band");
    }

    #[test]
    fn listener_lines_are_filtered_and_stripped() {
        let line = "2026-10-18T10:00:00.000000Z  WARN hrlight::listener: Disconnected. Reconnecting in 5.0s... (Polar H10)";
        assert_eq!(
            listener_event(line),
            Some("Disconnected. Reconnecting in 5.0s... (Polar H10)")
        );
        assert_eq!(
            listener_event("Listening for Heart Rate..."),
            Some("Listening for Heart Rate...")
        );
        assert_eq!(listener_event(" INFO hrlight::listener: Polar HR=61 bpm"), None);
        assert_eq!(listener_event("   "), None);
    }
}
