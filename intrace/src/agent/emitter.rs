//! # Trace Emitter
//!
//! Formats trace events and fans them out to the enabled sinks.
//!
//! ## Line Format
//!
//! ```text
//! [24/03/05 14:02:11.042]:[3]:demo::net::Server:handle: {:42
//!  └─ local timestamp ─┘  └ctx┘ └──── unit ────┘ └method┘ └body┘
//! ```
//!
//! | Body             | Event        |
//! |------------------|--------------|
//! | `{:<line>`       | entry        |
//! | `}:<line>`       | exit         |
//! | `/:<line>`       | branch taken |
//! | `Arg: <value>`   | argument     |
//! | `Return: <value>`| return value |
//! | `Callers: a -> b`| caller chain |
//!
//! ## Sinks
//!
//! - **stdout**: one line per event
//! - **file**: appended to the configured trace file
//! - **network**: queued for attached observers (best-effort, see
//!   [`TraceServer`])

use super::pattern::GlobPattern;
use super::trace_server::TraceServer;
use crate::domain::ContextId;
use crate::util::lock;
use chrono::Local;
use log::{debug, warn};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Timestamp layout: `yy/mm/dd HH:MM:SS.mmm`
pub const TIMESTAMP_FORMAT: &str = "%y/%m/%d %H:%M:%S%.3f";

/// Default trace file, relative to the working directory
pub const DEFAULT_TRACE_FILE: &str = "trc.txt";

/// One trace event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent<'a> {
    Entry(u32),
    Exit(u32),
    Branch(u32),
    Arg(&'a str),
    Return(&'a str),
    Callers(&'a str),
}

impl fmt::Display for TraceEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::Entry(line) => write!(f, "{{:{line}"),
            TraceEvent::Exit(line) => write!(f, "}}:{line}"),
            TraceEvent::Branch(line) => write!(f, "/:{line}"),
            TraceEvent::Arg(value) => write!(f, "Arg: {value}"),
            TraceEvent::Return(value) => write!(f, "Return: {value}"),
            TraceEvent::Callers(path) => write!(f, "Callers: {path}"),
        }
    }
}

/// Build a complete trace line
#[must_use]
pub fn format_line(context: ContextId, unit: &str, method: &str, event: TraceEvent<'_>) -> String {
    let timestamp = Local::now().format(TIMESTAMP_FORMAT);
    format!("[{timestamp}]:[{context}]:{unit}:{method}: {event}")
}

pub struct TraceEmitter {
    stdout: AtomicBool,
    file_enabled: AtomicBool,
    network: AtomicBool,
    file: Mutex<Option<BufWriter<File>>>,
    file_path: Mutex<PathBuf>,
    trace_server: Option<Arc<TraceServer>>,
    callers: RwLock<Option<GlobPattern>>,
    emitted: AtomicU64,
}

impl TraceEmitter {
    #[must_use]
    pub fn new(trace_server: Option<Arc<TraceServer>>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            stdout: AtomicBool::new(false),
            file_enabled: AtomicBool::new(false),
            network: AtomicBool::new(false),
            file: Mutex::new(None),
            file_path: Mutex::new(file_path.into()),
            trace_server,
            callers: RwLock::new(None),
            emitted: AtomicU64::new(0),
        }
    }

    /// Format an event for the calling thread and send it to every enabled sink
    pub fn emit(&self, unit: &str, method: &str, event: TraceEvent<'_>) {
        if !self.is_output_enabled() {
            return;
        }
        let line = format_line(ContextId::current(), unit, method, event);
        self.emit_line(&line);
    }

    /// Send a preformatted line to every enabled sink
    pub fn emit_line(&self, line: &str) {
        self.emitted.fetch_add(1, Ordering::Relaxed);

        if self.stdout.load(Ordering::Relaxed) {
            let mut out = io::stdout().lock();
            let _ = writeln!(out, "{line}");
        }

        if self.file_enabled.load(Ordering::Relaxed) {
            if let Some(writer) = lock(&self.file).as_mut() {
                if let Err(e) = writeln!(writer, "{line}") {
                    warn!("Trace file write failed: {e}");
                }
            }
        }

        if self.network.load(Ordering::Relaxed) {
            if let Some(server) = &self.trace_server {
                server.publish(line);
            }
        }
    }

    pub fn set_stdout(&self, enabled: bool) {
        self.stdout.store(enabled, Ordering::Relaxed);
    }

    pub fn set_network(&self, enabled: bool) {
        self.network.store(enabled, Ordering::Relaxed);
    }

    /// Open (append) or close the trace file
    ///
    /// # Errors
    /// Returns the I/O error if the file cannot be opened; the sink stays off
    pub fn set_file(&self, enabled: bool) -> io::Result<()> {
        let mut file = lock(&self.file);
        self.file_enabled.store(false, Ordering::Relaxed);
        if let Some(mut writer) = file.take() {
            if let Err(e) = writer.flush() {
                warn!("Trace file flush failed: {e}");
            }
        }
        if enabled {
            let path = lock(&self.file_path).clone();
            *file = Some(BufWriter::new(open_append(&path)?));
            self.file_enabled.store(true, Ordering::Relaxed);
            debug!("Trace file sink writing to {}", path.display());
        }
        Ok(())
    }

    #[must_use]
    pub fn is_file_enabled(&self) -> bool {
        self.file_enabled.load(Ordering::Relaxed)
    }

    /// Change the trace file; an open file sink moves to the new path
    ///
    /// # Errors
    /// Returns the I/O error if the new file cannot be opened, leaving the
    /// file sink off
    pub fn set_file_path(&self, path: impl Into<PathBuf>) -> io::Result<()> {
        *lock(&self.file_path) = path.into();
        if self.is_file_enabled() {
            self.set_file(true)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn file_path(&self) -> PathBuf {
        lock(&self.file_path).clone()
    }

    /// Arm (Some) or disarm (None) callers tracing
    pub fn set_callers(&self, pattern: Option<GlobPattern>) {
        let mut callers = self.callers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *callers = pattern;
    }

    /// Whether entry into `unit:method` should report its caller chain
    #[must_use]
    pub fn callers_match(&self, unit: &str, method: &str) -> bool {
        let callers = self.callers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        callers.as_ref().is_some_and(|p| p.matches(&format!("{unit}:{method}")))
    }

    #[must_use]
    pub fn is_output_enabled(&self) -> bool {
        self.stdout.load(Ordering::Relaxed)
            || self.file_enabled.load(Ordering::Relaxed)
            || self.network.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn emitted_lines(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn flush(&self) {
        if let Some(writer) = lock(&self.file).as_mut() {
            if let Err(e) = writer.flush() {
                warn!("Trace file flush failed: {e}");
            }
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
