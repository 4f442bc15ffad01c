//! Observer side: control channel, trace receiver and the filtered trace
//! buffer.

pub mod control;
pub mod filter;
pub mod patterns;
pub mod receiver;
pub mod session;

pub use control::{ConnectionState, ControlChannel, ControlListener};
pub use filter::{
    find_in_text, CancelToken, FilterControl, FilterListener, FilterOutcome, FilterSnapshot, LineKind,
    TextMirror, TraceBufferFilter, TraceLine, FILTER_CHUNK_LINES,
};
pub use patterns::{FilterPattern, PatternPair};
pub use receiver::NetworkTraceReceiver;
pub use session::{ObserverSession, SessionStatus};
