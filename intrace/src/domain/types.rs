//! Domain types providing compile-time safety and self-documentation

use serde::Serialize;
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Execution context ID
///
/// A small per-thread integer, assigned the first time a thread emits a
/// trace line. Unrelated to the OS thread ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CONTEXT_ID: Cell<Option<ContextId>> = const { Cell::new(None) };
}

impl ContextId {
    /// ID of the calling thread, assigning one on first use
    #[must_use]
    pub fn current() -> Self {
        CONTEXT_ID.with(|slot| {
            if let Some(id) = slot.get() {
                return id;
            }
            let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
            slot.set(Some(id));
            id
        })
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which event kinds an instrumented unit reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TraceKinds {
    pub entry_exit: bool,
    pub branch: bool,
    pub args: bool,
}

impl Default for TraceKinds {
    fn default() -> Self {
        Self { entry_exit: true, branch: false, args: true }
    }
}

impl TraceKinds {
    pub const ENTRY_EXIT: u8 = 0b0010;
    pub const BRANCH: u8 = 0b0100;
    pub const ARGS: u8 = 0b1000;

    /// Pack into probe state bits
    #[must_use]
    pub fn bits(self) -> u8 {
        let mut bits = 0;
        if self.entry_exit {
            bits |= Self::ENTRY_EXIT;
        }
        if self.branch {
            bits |= Self::BRANCH;
        }
        if self.args {
            bits |= Self::ARGS;
        }
        bits
    }

    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self {
            entry_exit: bits & Self::ENTRY_EXIT != 0,
            branch: bits & Self::BRANCH != 0,
            args: bits & Self::ARGS != 0,
        }
    }
}

/// Progress of an instrumentation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassProgress {
    pub processed: usize,
    pub total: usize,
    pub done: bool,
}

impl PassProgress {
    /// Completion as a whole percentage (100 for an empty pass)
    #[must_use]
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        #[allow(clippy::cast_possible_truncation)]
        let pct = (self.processed.min(self.total) * 100 / self.total) as u8;
        pct
    }
}

impl fmt::Display for PassProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.done {
            write!(f, "instrumented {}/{} units", self.processed, self.total)
        } else {
            write!(f, "instrumenting {}/{} ({}%)", self.processed, self.total, self.percent())
        }
    }
}

/// Instrumented and total loaded unit counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitCounts {
    pub instrumented: usize,
    pub total: usize,
}

impl fmt::Display for UnitCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} units instrumented", self.instrumented, self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_id_is_stable_per_thread() {
        let here = ContextId::current();
        assert_eq!(here, ContextId::current());
        let other = std::thread::spawn(ContextId::current).join().unwrap();
        assert_ne!(here, other);
    }

    #[test]
    fn test_trace_kinds_bits() {
        let kinds = TraceKinds { entry_exit: true, branch: true, args: false };
        assert_eq!(TraceKinds::from_bits(kinds.bits()), kinds);
        assert_eq!(TraceKinds::default().bits(), TraceKinds::ENTRY_EXIT | TraceKinds::ARGS);
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(PassProgress { processed: 0, total: 0, done: true }.percent(), 100);
        assert_eq!(PassProgress { processed: 5, total: 20, done: false }.percent(), 25);
    }
}
