//! # Observer Console
//!
//! Interactive terminal UI using `ratatui` over an [`ObserverSession`].
//!
//! ## View Modes
//!
//! - **Trace** - filtered trace with the agent status panel (default)
//! - **Input** - single-line prompt (patterns, find, save path)
//! - **Help** - keyboard shortcuts overlay
//!
//! Re-filtering runs on a worker thread so the console keeps drawing the
//! progress gauge, and `x` can cancel it.

#![allow(clippy::too_many_lines)]

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Terminal,
};
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

mod status;
mod theme;

use crate::client::{
    find_in_text, CancelToken, ConnectionState, FilterOutcome, ObserverSession, TextMirror, TraceBufferFilter,
};
use crate::domain::ClientError;
use intrace_common::Toggle;
use status::StatusPanel;
use theme::{CAUTION_AMBER, CRITICAL_RED, HUD_GREEN, INFO_DIM, SYSTEM_CYAN};

const STYLE_HEADING: Style = Style::new().fg(HUD_GREEN).add_modifier(Modifier::BOLD);
const STYLE_DIM: Style = Style::new().fg(INFO_DIM);
const STYLE_KEY: Style = Style::new().fg(CAUTION_AMBER);
const STYLE_TEXT: Style = Style::new().fg(ratatui::style::Color::White);

const UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Agent toggle bound to each key
const TOGGLE_KEYS: [(char, Toggle); 9] = [
    ('i', Toggle::Instrumentation),
    ('e', Toggle::EntryExit),
    ('b', Toggle::Branch),
    ('a', Toggle::Args),
    ('o', Toggle::StdOut),
    ('f', Toggle::FileOut),
    ('n', Toggle::NetworkOut),
    ('w', Toggle::SaveInstrumented),
    ('v', Toggle::Verbose),
];

#[derive(Debug, Clone, Copy, PartialEq)]
enum ViewMode {
    Trace,
    Input,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Prompt {
    ClassInclude,
    ClassExclude,
    FilterInclude,
    FilterExclude,
    Callers,
    Find,
    Save,
}

impl Prompt {
    fn label(self) -> &'static str {
        match self {
            Prompt::ClassInclude => "Instrument units",
            Prompt::ClassExclude => "Exclude units",
            Prompt::FilterInclude => "Show lines matching",
            Prompt::FilterExclude => "Hide lines matching",
            Prompt::Callers => "Callers of (empty to stop)",
            Prompt::Find => "Find",
            Prompt::Save => "Save to",
        }
    }
}

struct Input {
    prompt: Prompt,
    buffer: String,
    /// Include side entered at the first step of a two-step prompt
    pending: Option<String>,
}

enum FilterRequest {
    Set { include: String, exclude: String },
    Toggle(bool),
}

struct FilterJob {
    percent: Arc<AtomicU8>,
    cancel: CancelToken,
    handle: JoinHandle<Result<FilterOutcome, ClientError>>,
    /// `filter_on` to restore if the pass does not complete
    revert_to: Option<bool>,
}

pub struct Console {
    session: ObserverSession,
    mirror: TextMirror,
    reconnect: Option<(String, u16)>,
    view_mode: ViewMode,
    input: Option<Input>,
    scroll: usize,
    filter_on: bool,
    job: Option<FilterJob>,
    find: Option<(String, usize)>,
    message: String,
    should_quit: bool,
}

impl Console {
    /// `reconnect` is the address `c` connects to; `None` in callback mode
    #[must_use]
    pub fn new(session: ObserverSession, mirror: TextMirror, reconnect: Option<(String, u16)>) -> Self {
        Self {
            session,
            mirror,
            reconnect,
            view_mode: ViewMode::Trace,
            input: None,
            scroll: 0,
            filter_on: true,
            job: None,
            find: None,
            message: "Press ? for help".to_string(),
            should_quit: false,
        }
    }

    fn handle_key(&mut self, key: KeyCode) {
        match self.view_mode {
            ViewMode::Help => self.view_mode = ViewMode::Trace,
            ViewMode::Input => self.handle_input_key(key),
            ViewMode::Trace => match key {
                KeyCode::Char('q' | 'Q') => self.should_quit = true,
                KeyCode::Char('c') => self.toggle_connection(),
                KeyCode::Char('r') => {
                    let current = self.session.status().settings.map(|s| s.include_pattern).unwrap_or_default();
                    self.open_prompt(Prompt::ClassInclude, current);
                }
                KeyCode::Char('/') => {
                    let (include, _) = self.session.filter().last_entered().unwrap_or_default();
                    self.open_prompt(Prompt::FilterInclude, include);
                }
                KeyCode::Char('m') => {
                    let current = self.session.status().settings.and_then(|s| s.callers_pattern);
                    self.open_prompt(Prompt::Callers, current.unwrap_or_default());
                }
                KeyCode::Char('g') => {
                    let needle = self.find.as_ref().map(|(needle, _)| needle.clone()).unwrap_or_default();
                    self.open_prompt(Prompt::Find, needle);
                }
                KeyCode::Char('G') => self.find_next(true),
                KeyCode::Char('p') => self.find_next(false),
                KeyCode::Char('s') => self.open_prompt(Prompt::Save, "trace.txt".to_string()),
                KeyCode::Char('t') => self.toggle_filter(),
                KeyCode::Char('x') => self.cancel_filter(),
                KeyCode::Char('k') => {
                    let result = self.session.filter().set_clear_trace();
                    self.scroll = 0;
                    self.report(result.map(|()| "Trace cleared".to_string()));
                }
                KeyCode::Char('l') => {
                    let result = self.session.list_modified_units();
                    self.report(result.map(|units| format!("{} instrumented units", units.len())));
                }
                KeyCode::Char('h') => {
                    let result = self.session.add_help_text();
                    self.report(result.map(|()| "Trace format explained below".to_string()));
                }
                KeyCode::Char('?') => self.view_mode = ViewMode::Help,
                KeyCode::Char(c) => {
                    if let Some((_, toggle)) = TOGGLE_KEYS.iter().find(|(key, _)| *key == c) {
                        let result = self.session.toggle(*toggle);
                        self.report(result.map(|enabled| {
                            format!("{} {}", toggle.label(), if enabled { "enabled" } else { "disabled" })
                        }));
                    }
                }
                KeyCode::Up => self.scroll = self.scroll.saturating_add(1),
                KeyCode::Down => self.scroll = self.scroll.saturating_sub(1),
                KeyCode::PageUp => self.scroll = self.scroll.saturating_add(20),
                KeyCode::PageDown => self.scroll = self.scroll.saturating_sub(20),
                KeyCode::Home => self.scroll = self.mirror.line_count(),
                KeyCode::End => self.scroll = 0,
                _ => {}
            },
        }
    }

    fn handle_input_key(&mut self, key: KeyCode) {
        let Some(input) = self.input.as_mut() else {
            self.view_mode = ViewMode::Trace;
            return;
        };
        match key {
            KeyCode::Esc => {
                self.input = None;
                self.view_mode = ViewMode::Trace;
            }
            KeyCode::Enter => {
                if let Some(input) = self.input.take() {
                    self.view_mode = ViewMode::Trace;
                    self.submit(input);
                }
            }
            KeyCode::Backspace => {
                input.buffer.pop();
            }
            KeyCode::Char(c) => input.buffer.push(c),
            _ => {}
        }
    }

    fn open_prompt(&mut self, prompt: Prompt, initial: String) {
        self.input = Some(Input { prompt, buffer: initial, pending: None });
        self.view_mode = ViewMode::Input;
    }

    fn submit(&mut self, input: Input) {
        let Input { prompt, buffer, pending } = input;
        match prompt {
            Prompt::ClassInclude => {
                let current = self.session.status().settings.map(|s| s.exclude_pattern).unwrap_or_default();
                self.open_prompt(Prompt::ClassExclude, current);
                if let Some(next) = self.input.as_mut() {
                    next.pending = Some(buffer);
                }
            }
            Prompt::ClassExclude => {
                let include = pending.unwrap_or_default();
                let result = self.session.set_regex(Some(&include), Some(&buffer));
                self.report(result.map(|()| "Unit patterns updated".to_string()));
            }
            Prompt::FilterInclude => {
                let (_, exclude) = self.session.filter().last_entered().unwrap_or_default();
                self.open_prompt(Prompt::FilterExclude, exclude);
                if let Some(next) = self.input.as_mut() {
                    next.pending = Some(buffer);
                }
            }
            Prompt::FilterExclude => {
                let include = pending.unwrap_or_default();
                self.filter_on = true;
                self.start_filter(FilterRequest::Set { include, exclude: buffer }, None);
            }
            Prompt::Callers => {
                let pattern = Some(buffer.trim()).filter(|p| !p.is_empty());
                let result = self.session.set_callers_regex(pattern);
                self.report(result.map(|()| match pattern {
                    Some(pattern) => format!("Tracing callers of {pattern}"),
                    None => "Callers tracing stopped".to_string(),
                }));
            }
            Prompt::Find => {
                self.find = Some((buffer, 0));
                self.find_next(true);
            }
            Prompt::Save => {
                let result = self.session.filter().save(&buffer);
                self.report(result.map(|()| format!("Saved to {buffer}")));
            }
        }
    }

    fn report<T: Into<String>>(&mut self, result: Result<T, ClientError>) {
        self.message = match result {
            Ok(message) => message.into(),
            Err(e) => e.to_string(),
        };
    }

    fn toggle_connection(&mut self) {
        if self.session.is_connected() {
            self.session.disconnect();
            self.message = "Disconnected".to_string();
            return;
        }
        match self.reconnect.clone() {
            Some((host, port)) => {
                let result = self.session.connect(&host, port);
                self.report(result.map(|()| format!("Connected to {host}:{port}")));
            }
            None => self.message = "Restart the agent with a callback port to reconnect".to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Filter jobs
    // -------------------------------------------------------------------------

    fn toggle_filter(&mut self) {
        let enabled = !self.filter_on;
        self.filter_on = enabled;
        self.start_filter(FilterRequest::Toggle(enabled), Some(!enabled));
    }

    fn start_filter(&mut self, request: FilterRequest, revert_to: Option<bool>) {
        if self.job.is_some() {
            self.message = "Filter already running (x to cancel)".to_string();
            if let Some(previous) = revert_to {
                self.filter_on = previous;
            }
            return;
        }

        let percent = Arc::new(AtomicU8::new(0));
        let cancel = CancelToken::new();
        let filter: TraceBufferFilter = self.session.filter().clone();
        let (job_percent, job_cancel) = (percent.clone(), cancel.clone());
        let spawned = thread::Builder::new().name("intrace-filter-job".to_string()).spawn(move || {
            let progress = move |value: u8| {
                job_percent.store(value, Ordering::Relaxed);
                job_cancel.control()
            };
            match request {
                FilterRequest::Set { include, exclude } => filter.set_filter(&include, &exclude, progress),
                FilterRequest::Toggle(enabled) => filter.toggle_filter(enabled, progress),
            }
        });

        match spawned {
            Ok(handle) => {
                self.message = "Filtering...".to_string();
                self.job = Some(FilterJob { percent, cancel, handle, revert_to });
            }
            Err(e) => {
                if let Some(previous) = revert_to {
                    self.filter_on = previous;
                }
                self.message = format!("Failed to start filter: {e}");
            }
        }
    }

    fn cancel_filter(&mut self) {
        if let Some(job) = &self.job {
            job.cancel.cancel();
            self.message = "Cancelling filter...".to_string();
        }
    }

    fn poll_filter(&mut self) {
        if !self.job.as_ref().is_some_and(|job| job.handle.is_finished()) {
            return;
        }
        let Some(job) = self.job.take() else {
            return;
        };
        let completed = match job.handle.join() {
            Ok(Ok(FilterOutcome::Applied)) => {
                self.message = "Filter applied".to_string();
                true
            }
            Ok(Ok(FilterOutcome::Unchanged)) => {
                self.message = "Filter unchanged".to_string();
                true
            }
            Ok(Ok(FilterOutcome::Cancelled)) => {
                self.message = "Filter cancelled".to_string();
                false
            }
            Ok(Err(e)) => {
                self.message = e.to_string();
                false
            }
            Err(_) => {
                self.message = "Filter job panicked".to_string();
                false
            }
        };
        if !completed {
            if let Some(previous) = job.revert_to {
                self.filter_on = previous;
            }
        }
        self.scroll = 0;
    }

    fn filter_progress(&self) -> Option<u8> {
        self.job.as_ref().map(|job| job.percent.load(Ordering::Relaxed))
    }

    // -------------------------------------------------------------------------
    // Find
    // -------------------------------------------------------------------------

    fn find_next(&mut self, forward: bool) {
        let Some((needle, from)) = self.find.clone() else {
            self.message = "Nothing to find (g)".to_string();
            return;
        };
        let text = self.mirror.text();
        // Backwards search must start before the current match
        let start = if forward { from } else { from.saturating_sub(needle.len() + 1) };
        match find_in_text(&text, &needle, start, forward) {
            Some(pos) => {
                let line = text[..pos].matches('\n').count();
                self.scroll = self.mirror.line_count().saturating_sub(line + 1);
                self.find = Some((needle.clone(), pos + needle.len()));
                self.message = format!("Found \"{needle}\" on line {}", line + 1);
            }
            None => self.message = format!("\"{needle}\" not found"),
        }
    }

    // -------------------------------------------------------------------------
    // Rendering
    // -------------------------------------------------------------------------

    fn render(&self, f: &mut ratatui::Frame) {
        let outer = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Fill(1), Constraint::Length(1), Constraint::Length(1)])
            .split(f.area());
        let main = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Fill(1), Constraint::Length(34)])
            .split(outer[0]);

        self.render_trace(f, main[0]);
        StatusPanel::new(self.session.status(), self.mirror.counts(), self.filter_on, self.filter_progress())
            .render(f, main[1]);
        self.render_message(f, outer[1]);
        self.render_footer(f, outer[2]);

        if self.view_mode == ViewMode::Help {
            render_help_overlay(f, f.area());
        }
    }

    fn render_trace(&self, f: &mut ratatui::Frame, area: Rect) {
        let height = area.height.saturating_sub(2) as usize;
        let max_scroll = self.mirror.line_count().saturating_sub(height);
        let needle = self.find.as_ref().map(|(needle, _)| needle.as_str()).filter(|n| !n.is_empty());

        let lines: Vec<Line> = self
            .mirror
            .window(height, self.scroll.min(max_scroll))
            .into_iter()
            .map(|line| {
                let style = if needle.is_some_and(|n| line.contains(n)) {
                    Style::new().fg(CAUTION_AMBER).add_modifier(Modifier::BOLD)
                } else if line.starts_with('[') {
                    Style::new().fg(HUD_GREEN)
                } else {
                    Style::new().fg(SYSTEM_CYAN)
                };
                Line::from(Span::styled(line, style))
            })
            .collect();

        let title = if self.scroll > 0 { " Trace (scrolled, End to follow) " } else { " Trace " };
        let trace = Paragraph::new(lines).block(
            Block::default().borders(Borders::ALL).title(title).border_style(Style::default().fg(HUD_GREEN)),
        );
        f.render_widget(trace, area);
    }

    fn render_message(&self, f: &mut ratatui::Frame, area: Rect) {
        let line = match (&self.input, self.view_mode) {
            (Some(input), ViewMode::Input) => Line::from(vec![
                Span::styled(format!(" {}: ", input.prompt.label()), STYLE_KEY),
                Span::styled(format!("{}_", input.buffer), STYLE_TEXT),
            ]),
            _ => {
                let color = if self.session.status().connection == ConnectionState::DisconnectedErr {
                    CRITICAL_RED
                } else {
                    INFO_DIM
                };
                Line::from(Span::styled(format!(" {}", self.message), Style::new().fg(color)))
            }
        };
        f.render_widget(Paragraph::new(line), area);
    }

    fn render_footer(&self, f: &mut ratatui::Frame, area: Rect) {
        let mut spans = Vec::new();
        let hints = [
            ("c", "Connect"),
            ("r", "Units"),
            ("/", "Filter"),
            ("t", "Filter on/off"),
            ("g", "Find"),
            ("?", "Help"),
            ("q", "Quit"),
        ];
        for (key, label) in hints {
            spans.push(Span::styled(format!(" {key}"), STYLE_KEY));
            spans.push(Span::styled(format!(" {label} "), STYLE_DIM));
        }
        f.render_widget(Paragraph::new(Line::from(spans)), area);
    }

    /// Run the console until the user quits
    ///
    /// # Errors
    /// Returns the terminal I/O error if the terminal cannot be driven
    pub fn run(mut self) -> Result<()> {
        // -------------------------------------------------------------------------
        // Terminal Setup
        // -------------------------------------------------------------------------
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let mut last_update = Instant::now();
        // Forces the first draw
        let mut last_revision = u64::MAX;

        // -------------------------------------------------------------------------
        // Main Event Loop
        // -------------------------------------------------------------------------
        let outcome = loop {
            self.poll_filter();

            let revision = self.mirror.revision();
            if revision != last_revision || last_update.elapsed() >= UPDATE_INTERVAL {
                if let Err(e) = terminal.draw(|f| self.render(f)) {
                    break Err(e);
                }
                last_revision = revision;
                last_update = Instant::now();
            }

            match event::poll(Duration::from_millis(50)) {
                Ok(true) => match event::read() {
                    Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => self.handle_key(key.code),
                    Ok(_) => {}
                    Err(e) => break Err(e),
                },
                Ok(false) => {}
                Err(e) => break Err(e),
            }

            if self.should_quit {
                break Ok(());
            }
        };

        if let Some(job) = &self.job {
            job.cancel.cancel();
        }

        // Cleanup terminal
        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        Ok(outcome?)
    }
}

/// Render the help overlay with keyboard shortcuts
fn render_help_overlay(f: &mut ratatui::Frame, area: Rect) {
    let popup_area = centered_popup(area, 70, 26);

    let key_line = |key: &'static str, text: &'static str| {
        Line::from(vec![Span::styled(format!("  {key:<10}"), STYLE_KEY), Span::styled(text, STYLE_TEXT)])
    };
    let mut help_text = vec![Line::from(""), Line::from(Span::styled("  Agent", STYLE_HEADING))];
    help_text.push(key_line("c", "Connect / disconnect"));
    help_text.push(key_line("r", "Choose units to instrument"));
    help_text.push(key_line("m", "Trace callers of a unit:method pattern"));
    help_text.push(key_line("l", "List instrumented units"));
    let toggles: Vec<String> =
        TOGGLE_KEYS.iter().map(|(key, toggle)| format!("{key} {}", toggle.label())).collect();
    help_text.push(Line::from(Span::styled(format!("  {}", toggles.join("  ")), STYLE_DIM)));
    help_text.push(Line::from(""));
    help_text.push(Line::from(Span::styled("  Trace", STYLE_HEADING)));
    help_text.push(key_line("/", "Filter lines by include / exclude regex"));
    help_text.push(key_line("t", "Filter on / off"));
    help_text.push(key_line("x", "Cancel a running filter"));
    help_text.push(key_line("g  G  p", "Find, find next, find previous"));
    help_text.push(key_line("k", "Clear trace"));
    help_text.push(key_line("s", "Save displayed trace"));
    help_text.push(key_line("h", "Explain the trace line format"));
    help_text.push(key_line("↑↓ PgUp/Dn", "Scroll (End follows)"));
    help_text.push(key_line("q", "Quit"));
    help_text.push(Line::from(""));
    help_text.push(Line::from(Span::styled("  Press any key to close", STYLE_DIM)));

    let help_widget = Paragraph::new(help_text).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Help ")
            .style(Style::new().bg(ratatui::style::Color::Black).fg(HUD_GREEN)),
    );

    f.render_widget(ratatui::widgets::Clear, popup_area);
    f.render_widget(help_widget, popup_area);
}

/// Create a centered popup area with given width percentage and height in lines
fn centered_popup(area: Rect, width_percent: u16, height_lines: u16) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Fill(1), Constraint::Length(height_lines), Constraint::Fill(1)])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - width_percent) / 2),
            Constraint::Percentage(width_percent),
            Constraint::Percentage((100 - width_percent) / 2),
        ])
        .split(vertical[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_keys_are_unique() {
        for (i, (key, _)) in TOGGLE_KEYS.iter().enumerate() {
            assert!(TOGGLE_KEYS[i + 1..].iter().all(|(other, _)| other != key));
            assert!(!"qcrmgGpstxklh?/".contains(*key), "{key} shadows a console command");
        }
    }

    #[test]
    fn test_centered_popup_fits() {
        let area = Rect::new(0, 0, 100, 40);
        let popup = centered_popup(area, 70, 26);
        assert_eq!(popup.height, 26);
        assert!(popup.x >= 14 && popup.right() <= 86);
    }
}
