use eframe::egui::{Button, Color32, Label, RichText, Rounding};

use crate::breathing::Theme;

pub fn get_heart_rate_label(heart_rate: Option<u16>, theme: &Theme) -> Label {
    let text = match heart_rate {
        Some(hr) => format!("{hr} bpm"),
        None => "-- bpm".to_string(),
    };
    let live_hr_text = RichText::new(text)
        .color(theme.text)
        .strong()
        .size(34.0);

    Label::new(live_hr_text)
}

pub fn get_source_label(name: &str, theme: &Theme) -> Label {
    let text = RichText::new(name)
        .color(theme.muted)
        .strong()
        .size(14.0);

    Label::new(text)
}

pub fn get_control_button<'a>(text: &str, theme: &Theme) -> Button<'a> {
    let text = RichText::new(text)
        .color(theme.text)
        .size(13.0);

    Button::new(text)
        .fill(theme.panel)
        .stroke((1.0, theme.grid))
        .rounding(Rounding::same(6.0))
}

pub fn get_status_label(status: &str, live: bool, theme: &Theme) -> Label {
    let color = if live { theme.text } else { theme.muted };
    let text = RichText::new(status)
        .color(color)
        .size(13.0);

    Label::new(text)
}

pub fn get_muted_label(text: impl Into<String>, theme: &Theme) -> Label {
    Label::new(RichText::new(text).color(theme.muted).size(12.0))
}

pub fn get_result_label(text: &str, color: Color32) -> Label {
    Label::new(RichText::new(text).color(color).strong().size(18.0))
}
