use std::time::{Duration, Instant};

use eframe::egui::{self, Align2, FontId, Rect, Stroke, Vec2};
use egui_plot::{Legend, Line, Plot, PlotPoints, Points};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{Receiver as TokioReceiver, Sender as TokioSender};
use tracing::{debug, warn};

use crate::activity::{listener_event, sanitize, ActivityLog};
use crate::ble;
use crate::breathing::{color_for_bpm, mix, Theme, GREEN};
use crate::config::DisplayConfig;
use crate::player::{hide_due, Arrival, LinkStatus, Player, Roster};
use crate::scan;
use crate::session::{self, SessionTimer};
use crate::signal::ScanSignal;
use crate::sources::SourceCache;
use crate::stream::{now_secs, parse_line, FileTail, StreamRecord};
use crate::widget;

const DATA_POLL: Duration = Duration::from_millis(200);
const LOG_POLL: Duration = Duration::from_millis(500);
const FRAME: Duration = Duration::from_millis(33);

pub fn format_window(secs: u64) -> String {
    if secs >= 3600 {
        format!("{:.1} h", secs as f64 / 3600.0)
    } else if secs >= 60 {
        format!("{} min", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Whether a stream record belongs on screen: not older than `cutoff` and,
/// when a source filter is set, matching it.
pub fn accept_record(record: &StreamRecord, cutoff: f64, source_filter: &[String]) -> bool {
    if record.ts.is_some_and(|ts| ts < cutoff) {
        return false;
    }
    source_filter.is_empty() || ble::matches_any(&[record.source.as_str()], source_filter)
}

/// One entry per player with a session score, in detection order.
pub fn score_summary<'a>(players: impl Iterator<Item = &'a Player>) -> String {
    players
        .filter_map(|player| {
            let stats = &player.session;
            Some(format!(
                "{}: score {:.1} (avg {:.1}, min {}, max {})",
                sanitize(&player.source),
                stats.score()?,
                stats.average()?,
                stats.min()?,
                stats.max()?
            ))
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

pub struct HrDisplayApp {
    config: DisplayConfig,
    runtime: Handle,
    tail: FileTail,
    listener_tail: Option<FileTail>,
    roster: Roster,
    source_filter: Vec<String>,
    log: ActivityLog,
    timer: SessionTimer,
    timer_minutes: String,
    timeline_window_open: bool,
    inline_timeline: bool,
    always_on_top: bool,
    show_logs: bool,
    scan_forced_logs: bool,
    scan_busy: bool,
    tx_from_scan: TokioSender<ScanSignal>,
    rx_from_scan: TokioReceiver<ScanSignal>,
    global_status: LinkStatus,
    last_layout_count: usize,
    last_data_poll: Option<Instant>,
    last_log_poll: Option<Instant>,
    started: Instant,
}

impl HrDisplayApp {
    pub fn new(_cc: &eframe::CreationContext<'_>, config: DisplayConfig, runtime: Handle) -> Self {
        let (tx_from_scan, rx_from_scan) = tokio::sync::mpsc::channel(4);
        let mut app = HrDisplayApp {
            tail: FileTail::from_end(&config.file),
            listener_tail: config.listener_log.as_ref().map(FileTail::new),
            source_filter: config.sources.iter().map(|s| s.to_lowercase()).collect(),
            config,
            runtime,
            roster: Roster::default(),
            log: ActivityLog::default(),
            timer: SessionTimer::default(),
            timer_minutes: "2".to_string(),
            timeline_window_open: true,
            inline_timeline: false,
            always_on_top: false,
            show_logs: true,
            scan_forced_logs: false,
            scan_busy: false,
            tx_from_scan,
            rx_from_scan,
            global_status: LinkStatus::Waiting,
            last_layout_count: 0,
            last_data_poll: None,
            last_log_poll: None,
            started: Instant::now(),
        };
        app.load_sources();
        app
    }

    fn load_sources(&mut self) {
        let cache = match SourceCache::load(&self.config.sources_file) {
            Ok(cache) if !cache.is_empty() => cache,
            Ok(_) => return,
            Err(e) => {
                warn!("{e}");
                return;
            }
        };
        let labels = cache.preferred_labels();
        if labels.is_empty() {
            return;
        }
        let mut preview = labels.iter().take(4).cloned().collect::<Vec<_>>().join(", ");
        if labels.len() > 4 {
            preview.push_str("...");
        }
        self.log.push(&format!("Saved sources: {preview}"));
    }

    fn due(last: &mut Option<Instant>, every: Duration) -> bool {
        if last.is_some_and(|t| t.elapsed() < every) {
            return false;
        }
        *last = Some(Instant::now());
        true
    }

    fn update_data(&mut self, now: f64) {
        let lines = self.tail.read_new_lines().unwrap_or_else(|e| {
            warn!("{e}");
            vec![]
        });

        let cutoff = now - self.config.window as f64;
        for line in lines {
            let Some(record) = parse_line(&line) else {
                continue;
            };
            if !accept_record(&record, cutoff, &self.source_filter) {
                continue;
            }
            if self.roster.ensure(&record.source) == Arrival::New {
                self.log.push(&format!("Detected source: {}", record.source));
            }

            let session_active = self.timer.is_running();
            let Some(player) = self.roster.get_mut(&record.source) else {
                continue;
            };
            if player.push(record.bpm, now, session_active) {
                self.log.push(&format!("{}: {} bpm", record.source, record.bpm));
            }
        }

        for player in self.roster.players_mut() {
            player.trim_history(cutoff);
        }
    }

    fn update_listener_log(&mut self) {
        let Some(tail) = self.listener_tail.as_mut() else {
            return;
        };
        let lines = tail.read_new_lines().unwrap_or_else(|e| {
            debug!("{e}");
            vec![]
        });
        for line in lines {
            if let Some(event) = listener_event(&line) {
                self.log.push(event);
            }
        }
    }

    fn update_breathing(&mut self, now: f64) {
        if self.timer.is_running() && self.timer.remaining(now).is_some_and(|r| r <= 0.01) {
            self.finish_timer();
        }

        let (hr_min, hr_max) = (self.config.hr_min, self.config.hr_max);
        let mut statuses = vec![];
        let visible = self.roster.visible().to_vec();
        for (idx, source) in visible.iter().enumerate() {
            let Some(player) = self.roster.get_mut(source) else {
                continue;
            };
            if hide_due(idx, player.silence(now), self.config.hide_seconds) {
                if self.roster.hide(source) {
                    self.log.push(&format!("{source}: hidden"));
                }
                continue;
            }

            let stale = player.is_stale(now, self.config.stale_seconds);
            let rolling = player.rolling_avg(now);
            player.pulse.tick(now, rolling, stale, hr_min, hr_max);
            let hr = player.pulse.hr_smoothed.unwrap_or(rolling);
            player.theme = Theme::from_base(color_for_bpm(hr, hr_min, hr_max));

            let status = player.status(now, self.config.stale_seconds);
            match player.transition(status) {
                Some(LinkStatus::Disconnected) => self.log.push(&format!("{source}: disconnected")),
                Some(LinkStatus::Live) => self.log.push(&format!("{source}: connected")),
                _ => {}
            }
            statuses.push(status);
        }

        self.global_status = if statuses.contains(&LinkStatus::Live) {
            LinkStatus::Live
        } else if statuses.contains(&LinkStatus::Disconnected) {
            LinkStatus::Disconnected
        } else {
            LinkStatus::Waiting
        };
    }

    fn start_timer(&mut self) {
        match self.timer.start(&self.timer_minutes, now_secs()) {
            Ok(minutes) => {
                self.reset_session_stats();
                self.timeline_window_open = true;
                self.log.push(&format!("Timer started: {minutes:.2} min"));
            }
            Err(message) => self.log.push(&message),
        }
    }

    fn reset_timer(&mut self) {
        self.timer = SessionTimer::Idle;
        self.reset_session_stats();
        self.log.push("Timer reset");
    }

    fn reset_session_stats(&mut self) {
        for player in self.roster.players_mut() {
            player.reset_session();
        }
    }

    fn finish_timer(&mut self) {
        let ranked = self.roster.ranked().map(|p| (p.source.as_str(), &p.session));
        let outcome = session::decide(ranked);
        self.log.push(&outcome.to_string());
        self.timer.finish(outcome);
    }

    fn scan_sources(&mut self) {
        if self.scan_busy {
            return;
        }
        self.scan_busy = true;
        if !self.show_logs {
            self.show_logs = true;
            self.scan_forced_logs = true;
        }
        self.log.push("Scan started");

        let config = self.config.scan_config();
        let tx = self.tx_from_scan.clone();
        self.runtime.spawn(async move {
            let signal = match scan::scan_sources(&config).await {
                Ok(report) => ScanSignal::Finished(report),
                Err(e) => ScanSignal::Failed(format!("{e:#}")),
            };
            let _ = tx.send(signal).await;
        });
    }

    fn read_channel(&mut self) {
        let Ok(signal) = self.rx_from_scan.try_recv() else {
            return;
        };
        self.scan_busy = false;
        match signal {
            ScanSignal::Finished(report) => {
                self.log.push("Scan finished");
                self.log.push(&report.summary());
            }
            ScanSignal::Failed(reason) => {
                self.log.push("Scan failed");
                self.log.push(&reason);
            }
        }
        self.load_sources();
        if self.scan_forced_logs {
            self.show_logs = false;
            self.scan_forced_logs = false;
        }
    }

    fn global_theme(&self) -> Theme {
        match self.roster.visible() {
            [only] => self.roster.get(only).map_or_else(Theme::neutral, |p| p.theme),
            _ => Theme::neutral(),
        }
    }

    fn mean_hr(&self) -> Option<f64> {
        let values: Vec<f64> = self
            .roster
            .players()
            .filter_map(|p| p.session.average().or(p.current_hr.map(f64::from)))
            .collect();
        (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
    }

    fn subtitle(&self) -> String {
        let label = if !self.source_filter.is_empty() {
            format!("filter: {}", sanitize(&self.source_filter.join(", ")))
        } else {
            match self.roster.visible() {
                [] => String::new(),
                [only] => sanitize(only),
                many => format!("players: {}", many.len()),
            }
        };
        if label.is_empty() {
            "breathing light + live chart".to_string()
        } else {
            format!("breathing light + live chart | {label}")
        }
    }

    fn resize_for_players(&mut self, ctx: &egui::Context) {
        let count = self.roster.visible().len();
        if count == self.last_layout_count {
            return;
        }
        self.last_layout_count = count;
        let size = match count {
            0 | 1 => [980.0, 560.0],
            2 => [1200.0, 640.0],
            _ => [1200.0, 760.0],
        };
        ctx.send_viewport_cmd(egui::ViewportCommand::InnerSize(size.into()));
    }

    fn draw_header(&mut self, ui: &mut egui::Ui, theme: &Theme, now: f64) {
        ui.horizontal(|ui| {
            ui.label(
                egui::RichText::new("Smart LED Heart Rate")
                    .color(theme.text)
                    .strong()
                    .size(20.0),
            );
            ui.add(widget::get_muted_label(self.subtitle(), theme));
            if let Some(outcome) = self.timer.outcome() {
                ui.add(widget::get_muted_label(outcome.to_string(), theme));
            }
        });

        ui.horizontal(|ui| {
            let status = self.global_status.to_string();
            ui.add(widget::get_status_label(
                &status,
                self.global_status == LinkStatus::Live,
                theme,
            ));

            let scan_text = if self.scan_busy { "Scanning..." } else { "Scan all sources" };
            if ui
                .add_enabled(!self.scan_busy, widget::get_control_button(scan_text, theme))
                .clicked()
            {
                self.scan_sources();
            }

            ui.separator();
            ui.add(widget::get_muted_label(self.timer.label(now), theme));
            ui.add(
                egui::TextEdit::singleline(&mut self.timer_minutes)
                    .desired_width(36.0),
            );
            ui.add(widget::get_muted_label("min", theme));
            if ui.add(widget::get_control_button("Start", theme)).clicked() {
                self.start_timer();
            }
            if ui.add(widget::get_control_button("Reset", theme)).clicked() {
                self.reset_timer();
            }

            ui.separator();
            ui.checkbox(&mut self.inline_timeline, "Inline timeline");
            if ui.checkbox(&mut self.always_on_top, "Always on top").changed() {
                let level = if self.always_on_top {
                    egui::viewport::WindowLevel::AlwaysOnTop
                } else {
                    egui::viewport::WindowLevel::Normal
                };
                ui.ctx().send_viewport_cmd(egui::ViewportCommand::WindowLevel(level));
            }
            if ui.checkbox(&mut self.show_logs, "Show logs").changed() {
                self.scan_forced_logs = false;
            }
        });
    }

    fn draw_player(&self, ui: &mut egui::Ui, player: &Player, first: bool, now: f64, height: f32) {
        let theme = player.theme;
        egui::Frame::none()
            .fill(theme.bg)
            .rounding(10.0)
            .inner_margin(10.0)
            .show(ui, |ui| {
                ui.set_min_height(height);
                ui.add(widget::get_source_label(&sanitize(&player.source), &theme));
                let hr_display = player.pulse.hr_smoothed.map(|hr| hr.round() as u16);
                ui.add(widget::get_heart_rate_label(hr_display, &theme));

                let light_height = (height * 0.42).max(120.0);
                let size = Vec2::new(ui.available_width(), light_height);
                let (response, painter) = ui.allocate_painter(size, egui::Sense::hover());
                self.paint_light(&painter, response.rect, player, now);
                if first && self.show_logs && !self.log.is_empty() {
                    self.paint_log(&painter, response.rect, &theme);
                }

                ui.add_space(6.0);
                self.draw_chart(ui, player, now, (height * 0.30).max(100.0));
                ui.add(widget::get_muted_label(self.stats_line(player, now), &theme));
            });
    }

    fn paint_light(&self, painter: &egui::Painter, rect: Rect, player: &Player, now: f64) {
        let theme = player.theme;
        painter.rect_filled(rect, 8.0, theme.panel);

        let (hr_min, hr_max) = (self.config.hr_min, self.config.hr_max);
        let hr = player.pulse.hr_smoothed.unwrap_or(60.0);
        let base = color_for_bpm(hr, hr_min, hr_max);
        let intensity = player.pulse.intensity;
        let scale = player.pulse.scale(hr_min, hr_max) as f32;

        let size = rect.width().min(rect.height());
        let outer = size * 0.36 * scale;
        let inner = size * 0.27 * scale;
        let center = rect.center();
        painter.circle_filled(center, outer, mix(theme.bg, base, intensity * 0.55));
        painter.circle_filled(center, inner, mix(theme.bg, base, intensity));

        let status = player.status(now, self.config.stale_seconds);
        let color = if status == LinkStatus::Live { theme.text } else { theme.muted };
        painter.text(
            center - Vec2::new(0.0, outer + 6.0),
            Align2::CENTER_BOTTOM,
            status.to_string(),
            FontId::proportional(11.0),
            color,
        );
    }

    fn paint_log(&self, painter: &egui::Painter, rect: Rect, theme: &Theme) {
        let line_h = 14.0;
        let count = self.log.lines().count() as f32;
        let width = 320.0_f32.min(rect.width() - 16.0);
        let panel = Rect::from_min_size(
            rect.min + Vec2::new(8.0, 8.0),
            Vec2::new(width, 20.0 + line_h * count),
        );
        let fill = mix(theme.panel, theme.bg, 0.7);
        let border = mix(theme.grid, theme.bg, 0.5);
        painter.rect(panel, 4.0, fill, Stroke::new(1.0, border));
        for (i, line) in self.log.lines().enumerate() {
            painter.text(
                panel.min + Vec2::new(10.0, 10.0 + line_h * i as f32),
                Align2::LEFT_TOP,
                line,
                FontId::monospace(10.0),
                theme.text,
            );
        }
    }

    fn draw_chart(&self, ui: &mut egui::Ui, player: &Player, now: f64, height: f32) {
        let window = self.config.window as f64;
        let title = format!("Heart Rate (last {})", format_window(self.config.window));
        ui.add(widget::get_muted_label(title, &player.theme));

        let (v_min, v_max) = match (
            player.history.iter().map(|(_, v)| *v).min(),
            player.history.iter().map(|(_, v)| *v).max(),
        ) {
            (Some(lo), Some(hi)) => {
                let lo = f64::from(lo.saturating_sub(5).max(self.config.hr_min));
                let hi = f64::from(hi.saturating_add(5).min(self.config.hr_max));
                (lo, if hi > lo { hi } else { lo + 1.0 })
            }
            _ => (f64::from(self.config.hr_min), f64::from(self.config.hr_max)),
        };

        let points: PlotPoints = player
            .history
            .iter()
            .map(|(t, v)| [t - now, f64::from(*v)])
            .collect();

        Plot::new(format!("chart-{}", player.source))
            .height(height)
            .allow_drag(false)
            .allow_zoom(false)
            .allow_scroll(false)
            .allow_boxed_zoom(false)
            .show_x(false)
            .include_x(-window)
            .include_x(0.0)
            .include_y(v_min)
            .include_y(v_max)
            .show(ui, |plot_ui| {
                plot_ui.line(Line::new(points).color(player.theme.line).width(2.0));
            });
    }

    fn stats_line(&self, player: &Player, now: f64) -> String {
        let window = format_window(self.config.window);
        let mut stats = match player.current_hr {
            Some(hr) => format!("Now: {hr} bpm | Window: {window}"),
            None => "Waiting for data...".to_string(),
        };
        if let Some(gap) = player.silence(now).filter(|g| *g > self.config.stale_seconds) {
            stats.push_str(&format!(" | Last: {}s ago", gap as u64));
        }
        if let Some(summary) = player.session.summary() {
            stats.push_str(&format!(" | {summary}"));
        }
        stats
    }

    fn draw_timeline(&self, ui: &mut egui::Ui, now: f64) {
        let base = self
            .mean_hr()
            .map_or(GREEN, |hr| color_for_bpm(hr, self.config.hr_min, self.config.hr_max));
        let theme = Theme::from_base(base);

        egui::Frame::none()
            .fill(theme.bg)
            .rounding(10.0)
            .inner_margin(12.0)
            .show(ui, |ui| {
                ui.horizontal(|ui| {
                    ui.add(widget::get_result_label("Score timeline", theme.text));
                    ui.add(widget::get_muted_label("lower score wins", &theme));
                });

                let (start, _) = self.timer.span(now).unwrap_or((now - 1.0, now));
                Plot::new("score-timeline")
                    .height((ui.available_height() - 60.0).max(160.0))
                    .legend(Legend::default())
                    .allow_drag(false)
                    .allow_zoom(false)
                    .allow_scroll(false)
                    .show(ui, |plot_ui| {
                        for player in self.roster.players() {
                            let timeline = player.session.timeline();
                            let Some((t_last, score_last)) = timeline.last() else {
                                continue;
                            };
                            let points: PlotPoints =
                                timeline.iter().map(|(t, s)| [t - start, *s]).collect();
                            plot_ui.line(
                                Line::new(points)
                                    .color(player.score_color)
                                    .width(2.0)
                                    .name(format!("{} {:.1}", sanitize(&player.source), score_last)),
                            );
                            plot_ui.points(
                                Points::new(vec![[t_last - start, *score_last]])
                                    .radius(3.0)
                                    .color(player.score_color),
                            );
                        }
                    });

                let summary = score_summary(self.roster.players());
                ui.add(widget::get_muted_label(summary, &theme).wrap());
                if let Some(outcome) = self.timer.outcome() {
                    ui.add(widget::get_result_label(&outcome.to_string(), theme.text));
                }
            });
    }
}

impl eframe::App for HrDisplayApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let now = now_secs();

        if Self::due(&mut self.last_data_poll, DATA_POLL) {
            self.update_data(now);
        }
        if Self::due(&mut self.last_log_poll, LOG_POLL) {
            self.update_listener_log();
        }
        self.read_channel();
        self.update_breathing(now);
        self.resize_for_players(ctx);

        let theme = self.global_theme();

        egui::TopBottomPanel::top("header")
            .frame(egui::Frame::side_top_panel(&ctx.style()).fill(theme.bg).inner_margin(12.0))
            .show(ctx, |ui| self.draw_header(ui, &theme, now));

        if self.timer.is_visible() {
            if self.inline_timeline {
                egui::TopBottomPanel::bottom("timeline")
                    .resizable(true)
                    .default_height(260.0)
                    .frame(egui::Frame::side_top_panel(&ctx.style()).fill(theme.bg))
                    .show(ctx, |ui| self.draw_timeline(ui, now));
            } else {
                let mut open = self.timeline_window_open;
                egui::Window::new("Score timeline")
                    .open(&mut open)
                    .default_size([900.0, 460.0])
                    .show(ctx, |ui| self.draw_timeline(ui, now));
                self.timeline_window_open = open;
            }
        }

        egui::CentralPanel::default()
            .frame(egui::Frame::central_panel(&ctx.style()).fill(theme.bg))
            .show(ctx, |ui| {
                let visible = self.roster.visible();
                if visible.is_empty() {
                    ui.centered_and_justified(|ui| {
                        ui.add(widget::get_muted_label("Waiting for data...", &theme));
                    });
                    return;
                }

                let cols = if visible.len() <= 1 { 1 } else { 2 };
                let rows = visible.len().div_ceil(cols);
                let height = (ui.available_height() / rows as f32 - 24.0).max(260.0);
                egui::ScrollArea::vertical().show(ui, |ui| {
                    ui.columns(cols, |columns| {
                        for (i, source) in visible.iter().enumerate() {
                            if let Some(player) = self.roster.get(source) {
                                self.draw_player(&mut columns[i % cols], player, i == 0, now, height);
                            }
                        }
                    });
                });
            });

        if let Some(duration) = self.config.duration {
            if self.started.elapsed().as_secs_f64() >= duration {
                ctx.send_viewport_cmd(egui::ViewportCommand::Close);
            }
        }

        ctx.request_repaint_after(FRAME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_labels() {
        assert_eq!(format_window(45), "45s");
        assert_eq!(format_window(1800), "30 min");
        assert_eq!(format_window(5400), "1.5 h");
    }

    #[test]
    fn summary_lists_every_scored_player() {
        let mut roster = Roster::default();
        for (i, source) in ["a", "b", "c", "d", "idle"].iter().enumerate() {
            roster.ensure(source);
            if *source != "idle" {
                let player = roster.get_mut(source).unwrap();
                player.push(60 + i as u16, 1.0, true);
            }
        }

        let summary = score_summary(roster.players());
        assert_eq!(summary.split(" | ").count(), 4);
        assert!(summary.starts_with("a: score 180.0 (avg 60.0, min 60, max 60)"));
        assert!(summary.contains("d: score 189.0"));
        assert!(!summary.contains("idle"));
    }

    fn record(ts: Option<f64>, source: &str) -> StreamRecord {
        StreamRecord { ts, bpm: 70, source: source.to_string() }
    }

    #[test]
    fn records_outside_the_window_are_dropped() {
        let cutoff = 1_000.0;
        assert!(accept_record(&record(Some(1_000.5), "a"), cutoff, &[]));
        assert!(!accept_record(&record(Some(999.0), "a"), cutoff, &[]));
        // older producers write no timestamp
        assert!(accept_record(&record(None, "a"), cutoff, &[]));
    }

    #[test]
    fn source_filter_is_a_substring_match() {
        let filter = vec!["polar".to_string()];
        assert!(accept_record(&record(None, "Polar H10 1234"), 0.0, &filter));
        assert!(!accept_record(&record(None, "Apple Watch"), 0.0, &filter));
        assert!(!accept_record(&record(Some(-1.0), "Polar H10"), 0.0, &filter));
    }
}
