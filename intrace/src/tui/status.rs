use ratatui::{
    layout::Rect,
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

use super::theme::{connection_color, gauge_bar, CAUTION_AMBER, HUD_GREEN, INFO_DIM};
use crate::client::{ConnectionState, SessionStatus};
use intrace_common::Toggle;

/// Agent settings and connection overview
pub struct StatusPanel {
    status: SessionStatus,
    displayed: usize,
    total: usize,
    filter_on: bool,
    filter_progress: Option<u8>,
}

impl StatusPanel {
    pub fn new(
        status: SessionStatus,
        (displayed, total): (usize, usize),
        filter_on: bool,
        filter_progress: Option<u8>,
    ) -> Self {
        Self { status, displayed, total, filter_on, filter_progress }
    }

    pub fn render(&self, f: &mut Frame, area: Rect) {
        let state = self.status.connection;
        let mut lines = vec![Line::from(Span::styled(
            format!(" {state}"),
            Style::default().fg(connection_color(state)).add_modifier(Modifier::BOLD),
        ))];
        if let Some(peer) = self.status.peer.filter(|_| state == ConnectionState::Connected) {
            lines.push(Line::from(Span::styled(format!(" {peer}"), Style::default().fg(INFO_DIM))));
        }
        lines.push(Line::from(""));

        lines.push(stat_line("Units   ", self.status.counts.to_string()));
        lines.push(stat_line("Lines   ", format!("{}/{}", self.displayed, self.total)));
        lines.push(stat_line("Filter  ", if self.filter_on { "on" } else { "off" }.to_string()));
        if let Some(percent) = self.filter_progress {
            lines.push(Line::from(vec![
                Span::raw(" "),
                Span::styled(gauge_bar(f64::from(percent), 12), Style::default().fg(CAUTION_AMBER)),
                Span::styled(format!(" {percent}%"), Style::default().fg(CAUTION_AMBER)),
            ]));
        }

        if let Some(settings) = &self.status.settings {
            lines.push(Line::from(""));
            for toggle in Toggle::ALL {
                let enabled = settings.is_enabled(toggle);
                let (mark, color) = if enabled { ("[x]", HUD_GREEN) } else { ("[ ]", INFO_DIM) };
                lines.push(Line::from(vec![
                    Span::styled(format!(" {mark} "), Style::default().fg(color)),
                    Span::styled(toggle.label(), Style::default().fg(color)),
                ]));
            }
            lines.push(Line::from(""));
            lines.push(stat_line("Include ", settings.include_pattern.clone()));
            lines.push(stat_line("Exclude ", settings.exclude_pattern.clone()));
            if let Some(callers) = &settings.callers_pattern {
                lines.push(stat_line("Callers ", callers.clone()));
            }
        }

        let paragraph = Paragraph::new(lines).block(
            Block::default()
                .borders(Borders::ALL)
                .title("Agent")
                .border_style(Style::default().fg(connection_color(state))),
        );
        f.render_widget(paragraph, area);
    }
}

fn stat_line(label: &'static str, value: String) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!(" {label}"), Style::default().fg(INFO_DIM)),
        Span::styled(value, Style::default().fg(HUD_GREEN)),
    ])
}
