//! # Trace Buffer Filter
//!
//! Append-only store of every received line plus the currently displayed
//! (filtered) text.
//!
//! A dedicated thread owns all state and serves requests in order:
//!
//! ```text
//! receiver ─ append ─┐
//! UI ─ apply_filter ─┼──▶ [ request channel ] ──▶ filter thread ──▶ FilterListener
//! UI ─ clear/save ───┘
//! ```
//!
//! While a re-filter pass runs, appends wait in the channel and are applied
//! afterwards against whichever pair the pass left active. A pass walks the
//! buffer in chunks of [`FILTER_CHUNK_LINES`], reporting percent after each
//! chunk; the progress callback may cancel before the next chunk, which rolls
//! the active pair back and leaves the displayed text untouched.

use super::patterns::{extend_pattern, pattern_from_selection, PatternPair, MATCH_ALL_SOURCE, MATCH_NONE_SOURCE};
use crate::domain::ClientError;
use crate::util::lock;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::debug;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Lines filtered between progress reports
pub const FILTER_CHUNK_LINES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Streamed trace event
    Trace,
    /// Diagnostic or help text; always displayed
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLine {
    pub text: String,
    pub kind: LineKind,
}

/// Receives displayed-text updates from the filter thread
pub trait FilterListener: Send {
    /// Displayed text replaced (pass completed or buffer cleared)
    fn set_text(&mut self, text: &str);
    /// One line appended to the displayed text
    fn append_text(&mut self, line: &str);
    fn set_status(&mut self, displayed: usize, total: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterControl {
    Continue,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Applied,
    /// Patterns textually identical to the active pair; nothing scanned
    Unchanged,
    /// Cancelled mid-pass; the previous pair is active again
    Cancelled,
}

/// Shared cancel flag for a running pass
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn control(&self) -> FilterControl {
        if self.is_cancelled() {
            FilterControl::Cancel
        } else {
            FilterControl::Continue
        }
    }
}

/// Point-in-time copy of the filter state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSnapshot {
    pub text: String,
    pub displayed: usize,
    pub total: usize,
    pub active: (String, String),
    pub last_entered: (String, String),
}

type ProgressFn = Box<dyn FnMut(u8) -> FilterControl + Send>;

enum Request {
    Append(TraceLine),
    Apply { pair: PatternPair, remember: bool, progress: ProgressFn, reply: Sender<FilterOutcome> },
    LastEntered(Sender<(String, String)>),
    Clear,
    Snapshot(Sender<FilterSnapshot>),
    Save(PathBuf, Sender<std::io::Result<()>>),
}

/// Handle to the filter thread; cheap to clone
#[derive(Clone)]
pub struct TraceBufferFilter {
    tx: Sender<Request>,
}

impl TraceBufferFilter {
    /// Start the filter thread
    ///
    /// # Errors
    /// Returns the I/O error if the thread cannot be spawned
    pub fn spawn(listener: impl FilterListener + 'static) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let state = FilterState::new(Box::new(listener));
        thread::Builder::new().name("intrace-filter".to_string()).spawn(move || state.run(&rx))?;
        Ok(Self { tx })
    }

    /// # Errors
    /// Returns [`ClientError::FilterStopped`] if the filter thread is gone
    pub fn append(&self, line: impl Into<String>) -> Result<(), ClientError> {
        self.send(Request::Append(TraceLine { text: line.into(), kind: LineKind::Trace }))
    }

    /// # Errors
    /// Returns [`ClientError::FilterStopped`] if the filter thread is gone
    pub fn append_system(&self, line: impl Into<String>) -> Result<(), ClientError> {
        self.send(Request::Append(TraceLine { text: line.into(), kind: LineKind::System }))
    }

    /// Replace the active pair and recompute the displayed text.
    ///
    /// Blocks until the pass completes or is cancelled by `progress`.
    ///
    /// # Errors
    /// Returns [`ClientError::Pattern`] for a malformed regex (active pair
    /// unchanged) or [`ClientError::FilterStopped`]
    pub fn apply_filter(
        &self,
        include: &str,
        exclude: &str,
        progress: impl FnMut(u8) -> FilterControl + Send + 'static,
    ) -> Result<FilterOutcome, ClientError> {
        let pair = PatternPair::compile(include, exclude)?;
        self.run_pass(pair, false, Box::new(progress))
    }

    /// Like [`apply_filter`](Self::apply_filter), also recording the pair as
    /// the last one the user entered
    ///
    /// # Errors
    /// See [`apply_filter`](Self::apply_filter)
    pub fn set_filter(
        &self,
        include: &str,
        exclude: &str,
        progress: impl FnMut(u8) -> FilterControl + Send + 'static,
    ) -> Result<FilterOutcome, ClientError> {
        let pair = PatternPair::compile(include, exclude)?;
        self.run_pass(pair, true, Box::new(progress))
    }

    /// Apply the last entered pair (on) or the match-everything defaults (off)
    ///
    /// # Errors
    /// See [`apply_filter`](Self::apply_filter)
    pub fn toggle_filter(
        &self,
        enabled: bool,
        progress: impl FnMut(u8) -> FilterControl + Send + 'static,
    ) -> Result<FilterOutcome, ClientError> {
        if enabled {
            let (include, exclude) = self.last_entered()?;
            self.apply_filter(&include, &exclude, progress)
        } else {
            self.apply_filter(MATCH_ALL_SOURCE, MATCH_NONE_SOURCE, progress)
        }
    }

    /// Show only lines containing `selection` (OR-ed into the last include)
    ///
    /// # Errors
    /// See [`apply_filter`](Self::apply_filter)
    pub fn include_text(
        &self,
        selection: &str,
        progress: impl FnMut(u8) -> FilterControl + Send + 'static,
    ) -> Result<FilterOutcome, ClientError> {
        let (include, exclude) = self.last_entered()?;
        let include = extend_pattern(&include, &pattern_from_selection(selection));
        self.set_filter(&include, &exclude, progress)
    }

    /// Hide lines containing `selection` (OR-ed into the last exclude)
    ///
    /// # Errors
    /// See [`apply_filter`](Self::apply_filter)
    pub fn exclude_text(
        &self,
        selection: &str,
        progress: impl FnMut(u8) -> FilterControl + Send + 'static,
    ) -> Result<FilterOutcome, ClientError> {
        let (include, exclude) = self.last_entered()?;
        let exclude = extend_pattern(&exclude, &pattern_from_selection(selection));
        self.set_filter(&include, &exclude, progress)
    }

    /// Empty the buffer and displayed text; patterns are kept
    ///
    /// # Errors
    /// Returns [`ClientError::FilterStopped`] if the filter thread is gone
    pub fn set_clear_trace(&self) -> Result<(), ClientError> {
        self.send(Request::Clear)
    }

    /// # Errors
    /// Returns [`ClientError::FilterStopped`] if the filter thread is gone
    pub fn snapshot(&self) -> Result<FilterSnapshot, ClientError> {
        let (reply, rx) = bounded(1);
        self.send(Request::Snapshot(reply))?;
        rx.recv().map_err(|_| ClientError::FilterStopped)
    }

    /// Write the displayed text to `path`
    ///
    /// # Errors
    /// Returns the I/O error or [`ClientError::FilterStopped`]
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ClientError> {
        let (reply, rx) = bounded(1);
        self.send(Request::Save(path.as_ref().to_path_buf(), reply))?;
        Ok(rx.recv().map_err(|_| ClientError::FilterStopped)??)
    }

    /// # Errors
    /// Returns [`ClientError::FilterStopped`] if the filter thread is gone
    pub fn last_entered(&self) -> Result<(String, String), ClientError> {
        let (reply, rx) = bounded(1);
        self.send(Request::LastEntered(reply))?;
        rx.recv().map_err(|_| ClientError::FilterStopped)
    }

    fn run_pass(&self, pair: PatternPair, remember: bool, progress: ProgressFn) -> Result<FilterOutcome, ClientError> {
        let (reply, rx) = bounded(1);
        self.send(Request::Apply { pair, remember, progress, reply })?;
        rx.recv().map_err(|_| ClientError::FilterStopped)
    }

    fn send(&self, request: Request) -> Result<(), ClientError> {
        self.tx.send(request).map_err(|_| ClientError::FilterStopped)
    }
}

/// Byte offset of the next occurrence of `needle` starting at `from`,
/// searching forwards or backwards, wrapping once around the text
#[must_use]
pub fn find_in_text(text: &str, needle: &str, from: usize, forward: bool) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let from = from.min(text.len());
    if forward {
        let after = text.get(from..).and_then(|tail| tail.find(needle)).map(|i| i + from);
        after.or_else(|| text.find(needle))
    } else {
        let before = text.get(..from).and_then(|head| head.rfind(needle));
        before.or_else(|| text.rfind(needle))
    }
}

// ============================================================================
// Filter Thread
// ============================================================================

struct FilterState {
    lines: Vec<TraceLine>,
    text: String,
    displayed: usize,
    active: PatternPair,
    last_entered: PatternPair,
    listener: Box<dyn FilterListener>,
}

impl FilterState {
    fn new(listener: Box<dyn FilterListener>) -> Self {
        Self {
            lines: Vec::new(),
            text: String::new(),
            displayed: 0,
            active: PatternPair::default(),
            last_entered: PatternPair::default(),
            listener,
        }
    }

    fn run(mut self, rx: &Receiver<Request>) {
        while let Ok(request) = rx.recv() {
            match request {
                Request::Append(line) => self.append(line),
                Request::Apply { pair, remember, mut progress, reply } => {
                    if remember {
                        self.last_entered = pair.clone();
                    }
                    let outcome = self.apply(pair, &mut *progress);
                    let _ = reply.send(outcome);
                }
                Request::LastEntered(reply) => {
                    let _ = reply.send(self.last_entered.sources());
                }
                Request::Clear => self.clear(),
                Request::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Request::Save(path, reply) => {
                    let _ = reply.send(self.save(&path));
                }
            }
        }
        debug!("Filter thread finished");
    }

    fn is_shown(&self, line: &TraceLine) -> bool {
        line.kind == LineKind::System || self.active.matches(&line.text)
    }

    fn append(&mut self, line: TraceLine) {
        if self.is_shown(&line) {
            self.text.push_str(&line.text);
            self.text.push('\n');
            self.displayed += 1;
            self.listener.append_text(&line.text);
        }
        self.lines.push(line);
        self.listener.set_status(self.displayed, self.lines.len());
    }

    fn apply(&mut self, pair: PatternPair, progress: &mut dyn FnMut(u8) -> FilterControl) -> FilterOutcome {
        if pair.same_source(&self.active) {
            return FilterOutcome::Unchanged;
        }

        let old = std::mem::replace(&mut self.active, pair);
        let total = self.lines.len();
        let mut scratch = String::new();
        let mut displayed = 0;
        let mut processed = 0;

        for chunk in self.lines.chunks(FILTER_CHUNK_LINES) {
            processed += chunk.len();
            for line in chunk {
                if line.kind == LineKind::System || self.active.matches(&line.text) {
                    scratch.push_str(&line.text);
                    scratch.push('\n');
                    displayed += 1;
                }
            }
            #[allow(clippy::cast_possible_truncation)]
            let percent = (processed * 100 / total) as u8;
            if progress(percent) == FilterControl::Cancel && percent < 100 {
                self.active = old;
                debug!("Filter pass cancelled at {percent}%");
                return FilterOutcome::Cancelled;
            }
        }
        if total == 0 {
            progress(100);
        }

        self.text = scratch;
        self.displayed = displayed;
        self.listener.set_text(&self.text);
        self.listener.set_status(self.displayed, total);
        FilterOutcome::Applied
    }

    fn clear(&mut self) {
        self.lines.clear();
        self.text.clear();
        self.displayed = 0;
        self.listener.set_text("");
        self.listener.set_status(0, 0);
    }

    fn snapshot(&self) -> FilterSnapshot {
        FilterSnapshot {
            text: self.text.clone(),
            displayed: self.displayed,
            total: self.lines.len(),
            active: self.active.sources(),
            last_entered: self.last_entered.sources(),
        }
    }

    fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(self.text.as_bytes())?;
        writer.flush()
    }
}

// ============================================================================
// Text Mirror
// ============================================================================

#[derive(Debug, Default)]
struct MirrorState {
    lines: Vec<String>,
    displayed: usize,
    total: usize,
    revision: u64,
}

/// A [`FilterListener`] keeping a line-oriented copy of the displayed text
/// for renderers on other threads
#[derive(Debug, Clone, Default)]
pub struct TextMirror(Arc<Mutex<MirrorState>>);

impl TextMirror {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// (displayed, total) line counts
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        let state = lock(&self.0);
        (state.displayed, state.total)
    }

    /// Bumped on every change
    #[must_use]
    pub fn revision(&self) -> u64 {
        lock(&self.0).revision
    }

    #[must_use]
    pub fn line_count(&self) -> usize {
        lock(&self.0).lines.len()
    }

    /// Up to `height` displayed lines ending `scroll` lines above the bottom
    #[must_use]
    pub fn window(&self, height: usize, scroll: usize) -> Vec<String> {
        let state = lock(&self.0);
        let end = state.lines.len().saturating_sub(scroll);
        let start = end.saturating_sub(height);
        state.lines[start..end].to_vec()
    }

    #[must_use]
    pub fn text(&self) -> String {
        let state = lock(&self.0);
        let mut text = String::new();
        for line in &state.lines {
            text.push_str(line);
            text.push('\n');
        }
        text
    }
}

impl FilterListener for TextMirror {
    fn set_text(&mut self, text: &str) {
        let mut state = lock(&self.0);
        state.lines = text.lines().map(str::to_string).collect();
        state.revision += 1;
    }

    fn append_text(&mut self, line: &str) {
        let mut state = lock(&self.0);
        state.lines.push(line.to_string());
        state.revision += 1;
    }

    fn set_status(&mut self, displayed: usize, total: usize) {
        let mut state = lock(&self.0);
        state.displayed = displayed;
        state.total = total;
        state.revision += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn continue_always(_: u8) -> FilterControl {
        FilterControl::Continue
    }

    #[test]
    fn test_find_in_text() {
        let text = "alpha\nbeta\nalpha\n";
        assert_eq!(find_in_text(text, "alpha", 0, true), Some(0));
        assert_eq!(find_in_text(text, "alpha", 1, true), Some(11));
        assert_eq!(find_in_text(text, "alpha", 12, true), Some(0));
        assert_eq!(find_in_text(text, "alpha", 11, false), Some(0));
        assert_eq!(find_in_text(text, "alpha", 0, false), Some(11));
        assert_eq!(find_in_text(text, "gamma", 0, true), None);
        assert_eq!(find_in_text(text, "", 0, true), None);
    }

    #[test]
    fn test_system_lines_bypass_patterns() {
        let mirror = TextMirror::new();
        let filter = TraceBufferFilter::spawn(mirror.clone()).unwrap();
        filter.apply_filter(".*keep.*", "", continue_always).unwrap();
        filter.append("drop me").unwrap();
        filter.append_system("Settings received").unwrap();
        filter.append("keep me").unwrap();

        let snapshot = filter.snapshot().unwrap();
        assert_eq!(snapshot.text, "Settings received\nkeep me\n");
        assert_eq!((snapshot.displayed, snapshot.total), (2, 3));
        assert_eq!(mirror.counts(), (2, 3));
        assert_eq!(mirror.window(10, 0), vec!["Settings received", "keep me"]);
    }

    #[test]
    fn test_malformed_pattern_keeps_active_pair() {
        let filter = TraceBufferFilter::spawn(TextMirror::new()).unwrap();
        filter.apply_filter(".*a.*", "", continue_always).unwrap();
        let err = filter.apply_filter("(", "", continue_always).unwrap_err();
        assert!(matches!(err, ClientError::Pattern(_)));
        assert_eq!(filter.snapshot().unwrap().active, (".*a.*".to_string(), String::new()));
    }

    #[test]
    fn test_empty_buffer_pass_reports_completion() {
        let filter = TraceBufferFilter::spawn(TextMirror::new()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let outcome = filter
            .apply_filter(".*x.*", "", move |pct| {
                sink.lock().unwrap().push(pct);
                FilterControl::Continue
            })
            .unwrap();
        assert_eq!(outcome, FilterOutcome::Applied);
        assert_eq!(*seen.lock().unwrap(), vec![100]);
    }

    #[test]
    fn test_progress_tracks_lines_processed() {
        let filter = TraceBufferFilter::spawn(TextMirror::new()).unwrap();
        for i in 0..=FILTER_CHUNK_LINES {
            filter.append(format!("line {i}")).unwrap();
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        filter
            .apply_filter(".*1.*", "", move |pct| {
                sink.lock().unwrap().push(pct);
                FilterControl::Continue
            })
            .unwrap();
        // 500 of 501 lines
        assert_eq!(*seen.lock().unwrap(), vec![99, 100]);
    }

    #[test]
    fn test_save_writes_displayed_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.txt");
        let filter = TraceBufferFilter::spawn(TextMirror::new()).unwrap();
        filter.append("one").unwrap();
        filter.append("two").unwrap();
        filter.save(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert_eq!(token.control(), FilterControl::Continue);
        token.clone().cancel();
        assert_eq!(token.control(), FilterControl::Cancel);
    }
}
