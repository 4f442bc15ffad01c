//! TUI color theme

use crate::client::ConnectionState;
use ratatui::style::Color;

pub const HUD_GREEN: Color = Color::Rgb(0, 255, 0);
pub const CRITICAL_RED: Color = Color::Rgb(255, 0, 0);
pub const CAUTION_AMBER: Color = Color::Rgb(255, 191, 0);
pub const INFO_DIM: Color = Color::Rgb(0, 180, 0);
/// Lines the observer inserted itself (help text, unit lists, errors)
pub const SYSTEM_CYAN: Color = Color::Rgb(0, 200, 200);

#[must_use]
pub fn connection_color(state: ConnectionState) -> Color {
    match state {
        ConnectionState::Connected => HUD_GREEN,
        ConnectionState::Connecting => CAUTION_AMBER,
        ConnectionState::Disconnected => INFO_DIM,
        ConnectionState::DisconnectedErr => CRITICAL_RED,
    }
}

/// Fixed-width text gauge, e.g. `████░░░░░░` for 40%
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn gauge_bar(percentage: f64, width: usize) -> String {
    let filled = ((percentage.clamp(0.0, 100.0) / 100.0) * width as f64).round() as usize;
    let mut bar = "█".repeat(filled);
    bar.push_str(&"░".repeat(width - filled));
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_bar() {
        assert_eq!(gauge_bar(0.0, 4), "░░░░");
        assert_eq!(gauge_bar(50.0, 4), "██░░");
        assert_eq!(gauge_bar(250.0, 4), "████");
    }
}
