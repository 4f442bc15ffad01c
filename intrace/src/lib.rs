//! # InTrace - Runtime Tracing Agent and Observer
//!
//! InTrace selectively instruments code units inside a running process and
//! streams entry, exit, branch and argument events to any number of attached
//! observers. Observers share one canonical configuration held by the agent.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Traced Application                         │
//! │        registers code units, calls enter/exit/branch probes     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ probe calls (per-unit atomics)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Agent (in-process)                      │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │ Instrumentor │◀──│   Settings   │──▶│ TraceEmitter │         │
//! │  │  (patterns)  │   │   (Mutex)    │   │ stdout/file  │         │
//! │  └──────────────┘   └──────▲───────┘   └──────┬───────┘         │
//! │                            │ commands         │ Trace frames    │
//! │                     ┌──────┴───────┐   ┌──────▼───────┐         │
//! │                     │ControlServer │   │ TraceServer  │         │
//! │                     └──────▲───────┘   └──────┬───────┘         │
//! └────────────────────────────┼──────────────────┼─────────────────┘
//!                              │ control socket   │ trace socket
//! ┌────────────────────────────┼──────────────────┼─────────────────┐
//! │                     ┌──────┴───────┐   ┌──────▼───────┐         │
//! │                     │ControlChannel│   │   Receiver   │         │
//! │                     └──────────────┘   └──────┬───────┘         │
//! │                                        ┌──────▼───────┐         │
//! │          Observer                      │ TraceBuffer  │──▶ TUI  │
//! │                                        │   Filter     │         │
//! │                                        └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`agent`]: the in-process side
//!   - `pattern`: `|`-separated glob matching on unit names
//!   - `probe`: code units, probe state and the `Transformer` seam
//!   - `instrumentor`: selection policy and instrumentation passes
//!   - `emitter`: trace line formatting and sink fan-out
//!   - `trace_server`: best-effort streaming of trace lines
//!   - `server` / `connection`: multi-client control protocol
//!
//! - [`client`]: the observer side
//!   - `control`: half-duplex command channel
//!   - `receiver`: streamed trace reader
//!   - `filter`: trace buffer with cancellable re-filtering
//!   - `session`: connect, toggle and disconnect orchestration
//!
//! - [`tui`]: ratatui observer console
//! - [`cli`]: observer command-line arguments
//! - [`domain`]: shared types and errors
//!
//! ## Typical Usage
//!
//! ```bash
//! # Run the demo program with the agent embedded
//! INTRACE_ARGS="[regex-demo::*[out-stdout-false" cargo run --example traced-app
//!
//! # Attach the console
//! intrace --port 9123
//! ```

pub mod agent;
pub mod cli;
pub mod client;
pub mod domain;
pub mod tui;
pub mod util;
