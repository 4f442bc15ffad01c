//! # Code Units and Probes
//!
//! A traced program registers each of its modules/types as a [`CodeUnit`] and
//! calls the unit's probes at interesting points:
//!
//! ```ignore
//! let unit = agent.load_unit(UnitDescriptor::new("demo::Store").with_methods(["put"]));
//!
//! fn put(unit: &CodeUnit, key: &str) {
//!     unit.enter("put", 12);
//!     unit.arg("put", key);
//!     // ...
//!     unit.exit("put", 20);
//! }
//! ```
//!
//! Probes read per-unit atomics only; an uninstrumented unit costs a relaxed
//! load or two per call. Instrumenting a unit means arming that atomic with
//! the active trace kinds, which is what [`ProbeTransformer`] does.

use super::emitter::{TraceEmitter, TraceEvent};
use crate::domain::{InstrumentationError, TraceKinds};
use serde::Serialize;
use std::cell::RefCell;
use std::fmt::Display;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Units under this namespace belong to the agent itself
pub const AGENT_NAMESPACE: &str = "intrace::";

const ARMED: u8 = 0b0001;

/// What a traced program declares about a unit when registering it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDescriptor {
    pub name: String,
    pub methods: Vec<String>,
    /// Sealed units refuse instrumentation
    pub sealed: bool,
}

impl UnitDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), methods: Vec::new(), sealed: false }
    }

    #[must_use]
    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn sealed(mut self) -> Self {
        self.sealed = true;
        self
    }
}

/// Armed flag plus trace kind bits
#[derive(Debug, Default)]
pub struct ProbeState(AtomicU8);

impl ProbeState {
    pub fn arm(&self, kinds: TraceKinds) {
        self.0.store(ARMED | kinds.bits(), Ordering::Release);
    }

    pub fn disarm(&self) {
        self.0.store(0, Ordering::Release);
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::Acquire) & ARMED != 0
    }

    #[must_use]
    pub fn kinds(&self) -> TraceKinds {
        TraceKinds::from_bits(self.0.load(Ordering::Acquire))
    }

    fn load(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

struct UnitInner {
    name: String,
    methods: Vec<String>,
    sealed: bool,
    probe: ProbeState,
    /// Shadow-stack frames pushed and not yet popped, across threads
    open_frames: AtomicUsize,
    emitter: Arc<TraceEmitter>,
}

/// A registered code unit; cheap to clone
#[derive(Clone)]
pub struct CodeUnit(Arc<UnitInner>);

thread_local! {
    static SHADOW_STACK: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

impl CodeUnit {
    #[must_use]
    pub fn new(descriptor: UnitDescriptor, emitter: Arc<TraceEmitter>) -> Self {
        Self(Arc::new(UnitInner {
            name: descriptor.name,
            methods: descriptor.methods,
            sealed: descriptor.sealed,
            probe: ProbeState::default(),
            open_frames: AtomicUsize::new(0),
            emitter,
        }))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[must_use]
    pub fn methods(&self) -> &[String] {
        &self.0.methods
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.0.sealed
    }

    #[must_use]
    pub fn probe(&self) -> &ProbeState {
        &self.0.probe
    }

    #[must_use]
    pub fn is_instrumented(&self) -> bool {
        self.0.probe.is_armed()
    }

    #[must_use]
    pub fn kinds(&self) -> TraceKinds {
        self.0.probe.kinds()
    }

    // ========================================================================
    // Probes
    // ========================================================================

    pub fn enter(&self, method: &str, line: u32) {
        let state = self.0.probe.load();
        if state & ARMED == 0 {
            return;
        }
        let frame = format!("{}:{method}", self.0.name);
        SHADOW_STACK.with(|stack| stack.borrow_mut().push(frame));
        self.0.open_frames.fetch_add(1, Ordering::Relaxed);

        if state & TraceKinds::ENTRY_EXIT != 0 {
            self.0.emitter.emit(&self.0.name, method, TraceEvent::Entry(line));
        }
        if self.0.emitter.callers_match(&self.0.name, method) {
            let path = SHADOW_STACK.with(|stack| stack.borrow().join(" -> "));
            self.0.emitter.emit(&self.0.name, method, TraceEvent::Callers(&path));
        }
    }

    pub fn exit(&self, method: &str, line: u32) {
        let state = self.0.probe.load();
        // A unit disarmed since entry still owes its frame back
        if self.0.open_frames.load(Ordering::Relaxed) > 0 {
            self.pop_frame(method);
        }
        if state & (ARMED | TraceKinds::ENTRY_EXIT) == ARMED | TraceKinds::ENTRY_EXIT {
            self.0.emitter.emit(&self.0.name, method, TraceEvent::Exit(line));
        }
    }

    pub fn branch(&self, method: &str, line: u32) {
        if self.0.probe.load() & (ARMED | TraceKinds::BRANCH) == ARMED | TraceKinds::BRANCH {
            self.0.emitter.emit(&self.0.name, method, TraceEvent::Branch(line));
        }
    }

    pub fn arg(&self, method: &str, value: impl Display) {
        if self.args_armed() {
            self.0.emitter.emit(&self.0.name, method, TraceEvent::Arg(&value.to_string()));
        }
    }

    pub fn ret(&self, method: &str, value: impl Display) {
        if self.args_armed() {
            self.0.emitter.emit(&self.0.name, method, TraceEvent::Return(&value.to_string()));
        }
    }

    /// Enter `method` now and exit it when the guard drops
    #[must_use = "the scope exits when the guard is dropped"]
    pub fn scope<'a>(&'a self, method: &'a str, line: u32) -> ProbeScope<'a> {
        self.enter(method, line);
        ProbeScope { unit: self, method, line }
    }

    fn pop_frame(&self, method: &str) {
        let frame = format!("{}:{method}", self.0.name);
        let popped = SHADOW_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            // Frames above ours belong to scopes that never exited
            let pos = stack.iter().rposition(|f| *f == frame)?;
            stack.truncate(pos);
            Some(())
        });
        if popped.is_some() {
            self.0.open_frames.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn args_armed(&self) -> bool {
        self.0.probe.load() & (ARMED | TraceKinds::ARGS) == ARMED | TraceKinds::ARGS
    }
}

impl std::fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeUnit")
            .field("name", &self.0.name)
            .field("instrumented", &self.is_instrumented())
            .finish_non_exhaustive()
    }
}

/// Exit guard returned by [`CodeUnit::scope`]
pub struct ProbeScope<'a> {
    unit: &'a CodeUnit,
    method: &'a str,
    line: u32,
}

impl Drop for ProbeScope<'_> {
    fn drop(&mut self) {
        self.unit.exit(self.method, self.line);
    }
}

// ============================================================================
// Transformers
// ============================================================================

/// Installs and removes instrumentation on a unit.
///
/// The shipped [`ProbeTransformer`] arms probe state; a byte-level rewriter
/// would plug in here.
pub trait Transformer: Send + Sync {
    /// # Errors
    /// Returns [`InstrumentationError`] if the unit cannot be instrumented
    fn instrument(&self, unit: &CodeUnit, kinds: TraceKinds) -> Result<(), InstrumentationError>;

    fn revert(&self, unit: &CodeUnit);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProbeTransformer;

impl Transformer for ProbeTransformer {
    fn instrument(&self, unit: &CodeUnit, kinds: TraceKinds) -> Result<(), InstrumentationError> {
        if unit.is_sealed() {
            return Err(InstrumentationError::Unsupported {
                unit: unit.name().to_string(),
                reason: "unit is sealed".to_string(),
            });
        }
        if unit.name().starts_with(AGENT_NAMESPACE) {
            return Err(InstrumentationError::Unsupported {
                unit: unit.name().to_string(),
                reason: "agent units are never instrumented".to_string(),
            });
        }
        unit.probe().arm(kinds);
        Ok(())
    }

    fn revert(&self, unit: &CodeUnit) {
        unit.probe().disarm();
    }
}

/// Description written to the artifact directory for each instrumented unit
#[derive(Debug, Serialize)]
pub struct UnitArtifact<'a> {
    pub unit: &'a str,
    pub methods: &'a [String],
    pub kinds: TraceKinds,
}

impl<'a> UnitArtifact<'a> {
    #[must_use]
    pub fn of(unit: &'a CodeUnit) -> Self {
        Self { unit: unit.name(), methods: unit.methods(), kinds: unit.kinds() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_emitter(dir: &tempfile::TempDir) -> (Arc<TraceEmitter>, std::path::PathBuf) {
        let path = dir.path().join("trace.txt");
        let emitter = Arc::new(TraceEmitter::new(None, &path));
        emitter.set_file(true).unwrap();
        (emitter, path)
    }

    fn read_bodies(emitter: &TraceEmitter, path: &std::path::Path) -> Vec<String> {
        emitter.flush();
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| l.split(": ").skip(1).collect::<Vec<_>>().join(": "))
            .collect()
    }

    #[test]
    fn test_unarmed_probes_emit_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (emitter, path) = file_emitter(&dir);
        let unit = CodeUnit::new(UnitDescriptor::new("demo::Quiet"), emitter.clone());
        unit.enter("run", 1);
        unit.arg("run", 5);
        unit.exit("run", 2);
        assert!(read_bodies(&emitter, &path).is_empty());
    }

    #[test]
    fn test_armed_probes_respect_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let (emitter, path) = file_emitter(&dir);
        let unit = CodeUnit::new(UnitDescriptor::new("demo::Loud"), emitter.clone());
        unit.probe().arm(TraceKinds { entry_exit: true, branch: false, args: true });

        {
            let _scope = unit.scope("run", 10);
            unit.arg("run", 5);
            unit.branch("run", 11);
            unit.ret("run", "done");
        }

        assert_eq!(read_bodies(&emitter, &path), vec!["{:10", "Arg: 5", "Return: done", "}:10"]);
    }

    #[test]
    fn test_callers_chain() {
        let dir = tempfile::tempdir().unwrap();
        let (emitter, path) = file_emitter(&dir);
        let outer = CodeUnit::new(UnitDescriptor::new("demo::Api"), emitter.clone());
        let inner = CodeUnit::new(UnitDescriptor::new("demo::Store"), emitter.clone());
        let kinds = TraceKinds { entry_exit: false, branch: false, args: false };
        outer.probe().arm(kinds);
        inner.probe().arm(kinds);
        emitter.set_callers(Some(crate::agent::pattern::GlobPattern::new("demo::Store:put").unwrap()));

        outer.enter("handle", 1);
        inner.enter("put", 2);
        inner.exit("put", 3);
        outer.exit("handle", 4);

        assert_eq!(read_bodies(&emitter, &path), vec!["Callers: demo::Api:handle -> demo::Store:put"]);
    }

    #[test]
    fn test_disarm_inside_scope_releases_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (emitter, path) = file_emitter(&dir);
        let outer = CodeUnit::new(UnitDescriptor::new("demo::Api"), emitter.clone());
        let inner = CodeUnit::new(UnitDescriptor::new("demo::Store"), emitter.clone());
        let kinds = TraceKinds { entry_exit: false, branch: false, args: false };
        outer.probe().arm(kinds);
        inner.probe().arm(kinds);
        emitter.set_callers(Some(crate::agent::pattern::GlobPattern::new("demo::Store:put").unwrap()));

        outer.enter("handle", 1);
        outer.probe().disarm();
        outer.exit("handle", 2);
        inner.enter("put", 3);
        inner.exit("put", 4);

        assert_eq!(read_bodies(&emitter, &path), vec!["Callers: demo::Store:put"]);
    }

    #[test]
    fn test_probe_transformer_refuses_sealed_and_agent_units() {
        let emitter = Arc::new(TraceEmitter::new(None, "unused.txt"));
        let sealed = CodeUnit::new(UnitDescriptor::new("demo::Sealed").sealed(), emitter.clone());
        let agent = CodeUnit::new(UnitDescriptor::new("intrace::agent::Agent"), emitter.clone());
        let plain = CodeUnit::new(UnitDescriptor::new("demo::Plain"), emitter);

        let transformer = ProbeTransformer;
        assert!(transformer.instrument(&sealed, TraceKinds::default()).is_err());
        assert!(transformer.instrument(&agent, TraceKinds::default()).is_err());
        assert!(transformer.instrument(&plain, TraceKinds::default()).is_ok());
        assert!(plain.is_instrumented());
        transformer.revert(&plain);
        assert!(!plain.is_instrumented());
    }
}
