//! # Instrumentor
//!
//! Decides which loaded code units carry instrumentation and keeps that
//! decision current as settings change.
//!
//! A unit is instrumented iff instrumentation is enabled AND its name matches
//! the include pattern AND does not match the exclude pattern. Every change to
//! patterns, trace kinds or the enable flag runs a pass over all loaded units:
//!
//! ```text
//! selected + any state   → instrument (re-arms with current kinds)
//! unselected + armed     → revert
//! unselected + unarmed   → untouched
//! ```
//!
//! Progress `(processed, total, done)` is reported to an optional sink at the
//! start of a pass, every [`PROGRESS_INTERVAL`] units, and at the end.

use super::pattern::PatternMatcher;
use super::probe::{CodeUnit, Transformer, UnitArtifact};
use crate::domain::{InstrumentationError, PassProgress, PatternError, TraceKinds, UnitCounts};
use crate::util::sanitize_file_name;
use log::{debug, info, warn};
use std::fmt;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

/// Units processed between progress reports
pub const PROGRESS_INTERVAL: usize = 10;

/// Default directory for saved instrumented-unit descriptions
pub const DEFAULT_ARTIFACT_DIR: &str = "genbin";

pub type ProgressFn = Arc<dyn Fn(PassProgress) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDecision {
    Instrument,
    Skip,
}

/// Outcome of one instrumentation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub processed: usize,
    pub total: usize,
    pub instrumented: usize,
    pub reverted: usize,
    /// Units that were selected but could not be instrumented
    pub failed: Vec<String>,
}

enum Action {
    Instrument,
    Revert,
}

pub struct Instrumentor {
    transformer: Box<dyn Transformer>,
    units: Vec<CodeUnit>,
    matcher: PatternMatcher,
    kinds: TraceKinds,
    enabled: bool,
    verbose: bool,
    save_artifacts: bool,
    artifact_dir: PathBuf,
    progress: Option<ProgressFn>,
}

impl Instrumentor {
    #[must_use]
    pub fn new(transformer: Box<dyn Transformer>) -> Self {
        Self {
            transformer,
            units: Vec::new(),
            matcher: PatternMatcher::default(),
            kinds: TraceKinds::default(),
            enabled: true,
            verbose: false,
            save_artifacts: false,
            artifact_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
            progress: None,
        }
    }

    pub fn set_progress_sink(&mut self, sink: ProgressFn) {
        self.progress = Some(sink);
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn set_save_artifacts(&mut self, save: bool) {
        self.save_artifacts = save;
    }

    pub fn set_artifact_dir(&mut self, dir: impl Into<PathBuf>) {
        self.artifact_dir = dir.into();
    }

    /// Replace patterns without running a pass (startup configuration)
    ///
    /// # Errors
    /// Returns [`PatternError`] and keeps the current patterns if either fails to compile
    pub fn set_patterns(&mut self, include: &str, exclude: &str) -> Result<(), PatternError> {
        self.matcher = PatternMatcher::new(include, exclude)?;
        Ok(())
    }

    /// Register a newly loaded unit and instrument it if selected
    pub fn on_code_unit_load(&mut self, unit: &CodeUnit) -> LoadDecision {
        self.units.push(unit.clone());

        if !self.is_selected(unit.name()) {
            self.decision(format_args!("Skipping {} (not selected)", unit.name()));
            return LoadDecision::Skip;
        }
        match self.instrument(unit) {
            Ok(()) => LoadDecision::Instrument,
            Err(e) => {
                self.decision(format_args!("{e}"));
                LoadDecision::Skip
            }
        }
    }

    /// Recompile patterns and re-evaluate every loaded unit.
    ///
    /// # Errors
    /// Returns [`PatternError`] and leaves the previous patterns (and every
    /// unit) untouched if either pattern fails to compile
    pub fn apply_pattern_change(&mut self, include: &str, exclude: &str) -> Result<PassReport, PatternError> {
        self.matcher = PatternMatcher::new(include, exclude)?;
        info!("Unit patterns changed: include=\"{include}\" exclude=\"{exclude}\"");
        Ok(self.run_pass())
    }

    /// Change the injected trace kinds; every selected unit is re-instrumented
    pub fn set_trace_kinds(&mut self, kinds: TraceKinds) -> PassReport {
        self.kinds = kinds;
        self.run_pass()
    }

    /// Disabling reverts every instrumented unit; enabling runs a full pass
    pub fn set_enabled(&mut self, enabled: bool) -> PassReport {
        self.enabled = enabled;
        info!("Instrumentation {}", if enabled { "enabled" } else { "disabled" });
        self.run_pass()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn kinds(&self) -> TraceKinds {
        self.kinds
    }

    #[must_use]
    pub fn matcher(&self) -> &PatternMatcher {
        &self.matcher
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&CodeUnit> {
        self.units.iter().find(|unit| unit.name() == name)
    }

    #[must_use]
    pub fn counts(&self) -> UnitCounts {
        UnitCounts {
            instrumented: self.units.iter().filter(|u| u.is_instrumented()).count(),
            total: self.units.len(),
        }
    }

    /// Names of currently instrumented units, sorted
    #[must_use]
    pub fn modified_units(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .units
            .iter()
            .filter(|u| u.is_instrumented())
            .map(|u| u.name().to_string())
            .collect();
        names.sort();
        names
    }

    fn is_selected(&self, name: &str) -> bool {
        self.enabled && self.matcher.matches(name)
    }

    fn run_pass(&mut self) -> PassReport {
        let worklist: Vec<(CodeUnit, Action)> = self
            .units
            .iter()
            .filter_map(|unit| {
                if self.is_selected(unit.name()) {
                    Some((unit.clone(), Action::Instrument))
                } else if unit.is_instrumented() {
                    Some((unit.clone(), Action::Revert))
                } else {
                    None
                }
            })
            .collect();

        let mut report = PassReport { total: worklist.len(), ..PassReport::default() };
        self.report_progress(0, report.total, false);

        for (unit, action) in worklist {
            match action {
                Action::Instrument => match self.instrument(&unit) {
                    Ok(()) => report.instrumented += 1,
                    Err(e) => {
                        warn!("{e}");
                        report.failed.push(unit.name().to_string());
                    }
                },
                Action::Revert => {
                    self.transformer.revert(&unit);
                    self.decision(format_args!("Reverted {}", unit.name()));
                    report.reverted += 1;
                }
            }
            report.processed += 1;
            if report.processed % PROGRESS_INTERVAL == 0 && report.processed < report.total {
                self.report_progress(report.processed, report.total, false);
            }
        }

        self.report_progress(report.processed, report.total, true);
        debug!(
            "Pass complete: {} processed, {} instrumented, {} reverted, {} failed",
            report.processed,
            report.instrumented,
            report.reverted,
            report.failed.len()
        );
        report
    }

    fn instrument(&self, unit: &CodeUnit) -> Result<(), InstrumentationError> {
        if let Err(e) = self.transformer.instrument(unit, self.kinds) {
            // A failed re-instrument must not leave stale probes armed
            self.transformer.revert(unit);
            return Err(e);
        }
        self.decision(format_args!("Instrumented {}", unit.name()));

        if self.save_artifacts {
            if let Err(e) = self.save_artifact(unit) {
                warn!("{e}");
            }
        }
        Ok(())
    }

    fn save_artifact(&self, unit: &CodeUnit) -> Result<(), InstrumentationError> {
        let save_failed = |source: std::io::Error| InstrumentationError::SaveFailed { unit: unit.name().to_string(), source };

        fs::create_dir_all(&self.artifact_dir).map_err(save_failed)?;
        let path = self.artifact_dir.join(format!("{}.instr", sanitize_file_name(unit.name())));
        let file = File::create(&path).map_err(save_failed)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &UnitArtifact::of(unit))
            .map_err(|e| save_failed(e.into()))?;
        Ok(())
    }

    fn report_progress(&self, processed: usize, total: usize, done: bool) {
        if let Some(sink) = &self.progress {
            sink(PassProgress { processed, total, done });
        }
    }

    fn decision(&self, message: fmt::Arguments<'_>) {
        if self.verbose {
            info!("{message}");
        } else {
            debug!("{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::emitter::TraceEmitter;
    use crate::agent::probe::{ProbeTransformer, UnitDescriptor};
    use std::sync::Mutex;

    fn load(instrumentor: &mut Instrumentor, names: &[&str]) -> Vec<CodeUnit> {
        let emitter = Arc::new(TraceEmitter::new(None, "unused.txt"));
        names
            .iter()
            .map(|name| {
                let unit = CodeUnit::new(UnitDescriptor::new(*name), emitter.clone());
                instrumentor.on_code_unit_load(&unit);
                unit
            })
            .collect()
    }

    fn recorder(instrumentor: &mut Instrumentor) -> Arc<Mutex<Vec<PassProgress>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        instrumentor.set_progress_sink(Arc::new(move |p| sink.lock().unwrap().push(p)));
        seen
    }

    #[test]
    fn test_include_exclude_policy() {
        let mut instrumentor = Instrumentor::new(Box::new(ProbeTransformer));
        instrumentor.set_patterns("com.*", "*Test").unwrap();
        let units = load(&mut instrumentor, &["com.foo.Bar", "com.foo.BarTest", "org.Other"]);

        assert!(units[0].is_instrumented());
        assert!(!units[1].is_instrumented());
        assert!(!units[2].is_instrumented());
        assert_eq!(instrumentor.counts(), UnitCounts { instrumented: 1, total: 3 });
    }

    #[test]
    fn test_load_decision() {
        let mut instrumentor = Instrumentor::new(Box::new(ProbeTransformer));
        instrumentor.set_patterns("demo::*", "").unwrap();
        let emitter = Arc::new(TraceEmitter::new(None, "unused.txt"));
        let selected = CodeUnit::new(UnitDescriptor::new("demo::A"), emitter.clone());
        let sealed = CodeUnit::new(UnitDescriptor::new("demo::B").sealed(), emitter.clone());
        let other = CodeUnit::new(UnitDescriptor::new("other::C"), emitter);

        assert_eq!(instrumentor.on_code_unit_load(&selected), LoadDecision::Instrument);
        assert_eq!(instrumentor.on_code_unit_load(&sealed), LoadDecision::Skip);
        assert_eq!(instrumentor.on_code_unit_load(&other), LoadDecision::Skip);
    }

    #[test]
    fn test_pattern_change_reverts_and_instruments() {
        let mut instrumentor = Instrumentor::new(Box::new(ProbeTransformer));
        instrumentor.set_patterns("demo::a::*", "").unwrap();
        let units = load(&mut instrumentor, &["demo::a::One", "demo::b::Two"]);

        let report = instrumentor.apply_pattern_change("demo::b::*", "").unwrap();
        assert!(!units[0].is_instrumented());
        assert!(units[1].is_instrumented());
        assert_eq!(report.instrumented, 1);
        assert_eq!(report.reverted, 1);
        assert_eq!(report.total, 2);
    }

    #[test]
    fn test_disable_enable_reruns_full_pass() {
        let mut instrumentor = Instrumentor::new(Box::new(ProbeTransformer));
        instrumentor.set_patterns("demo::*", "").unwrap();
        let names: Vec<String> = (0..25).map(|i| format!("demo::Unit{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        load(&mut instrumentor, &refs);
        load(&mut instrumentor, &["skipped::Unit"]);
        let seen = recorder(&mut instrumentor);

        let off = instrumentor.set_enabled(false);
        assert_eq!(off.reverted, 25);
        assert_eq!(instrumentor.counts().instrumented, 0);

        seen.lock().unwrap().clear();
        let on = instrumentor.set_enabled(true);
        assert_eq!(on.processed, 25);
        assert_eq!(on.instrumented, 25);

        let progress = seen.lock().unwrap().clone();
        assert_eq!(progress.first(), Some(&PassProgress { processed: 0, total: 25, done: false }));
        assert_eq!(progress.last(), Some(&PassProgress { processed: 25, total: 25, done: true }));
        assert!(progress.contains(&PassProgress { processed: 10, total: 25, done: false }));
        assert!(progress.contains(&PassProgress { processed: 20, total: 25, done: false }));
    }

    #[test]
    fn test_trace_kinds_rearm_selected_units() {
        let mut instrumentor = Instrumentor::new(Box::new(ProbeTransformer));
        instrumentor.set_patterns("demo::*", "").unwrap();
        let units = load(&mut instrumentor, &["demo::A"]);

        let kinds = TraceKinds { entry_exit: false, branch: true, args: false };
        let report = instrumentor.set_trace_kinds(kinds);
        assert_eq!(report.instrumented, 1);
        assert_eq!(units[0].kinds(), kinds);
    }

    #[test]
    fn test_failed_units_are_counted_not_fatal() {
        let mut instrumentor = Instrumentor::new(Box::new(ProbeTransformer));
        let emitter = Arc::new(TraceEmitter::new(None, "unused.txt"));
        let sealed = CodeUnit::new(UnitDescriptor::new("demo::Sealed").sealed(), emitter.clone());
        let open = CodeUnit::new(UnitDescriptor::new("demo::Open"), emitter);
        instrumentor.on_code_unit_load(&sealed);
        instrumentor.on_code_unit_load(&open);

        let report = instrumentor.apply_pattern_change("demo::*", "").unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.instrumented, 1);
        assert_eq!(report.failed, vec!["demo::Sealed".to_string()]);
        assert_eq!(instrumentor.modified_units(), vec!["demo::Open".to_string()]);
    }

    #[test]
    fn test_saved_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut instrumentor = Instrumentor::new(Box::new(ProbeTransformer));
        instrumentor.set_artifact_dir(dir.path().join("genbin"));
        instrumentor.set_save_artifacts(true);
        instrumentor.set_patterns("demo::*", "").unwrap();
        load(&mut instrumentor, &["demo::net::Server"]);

        let saved = std::fs::read_to_string(dir.path().join("genbin").join("demo__net__Server.instr")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&saved).unwrap();
        assert_eq!(json["unit"], "demo::net::Server");
        assert_eq!(json["kinds"]["entry_exit"], true);
    }
}
