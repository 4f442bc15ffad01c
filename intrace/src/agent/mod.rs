//! # Agent
//!
//! The in-process half of InTrace. [`Agent::start`] parses the startup
//! argument string, binds the control and trace ports and returns a handle the
//! traced program uses to register code units.
//!
//! ## Threads
//!
//! ```text
//! intrace-control        accept loop, one per agent
//! intrace-conn-<id>      read loop per control connection
//! intrace-trace-accept   trace observer accept loop
//! intrace-trace-<id>     writer per trace observer
//! ```
//!
//! ## Locking
//!
//! Settings and the instrumentor share one mutex. Lock order is always
//! state → connection registry → connection writer. Probes never lock.

pub mod commands;
pub mod connection;
pub mod emitter;
pub mod instrumentor;
pub mod pattern;
pub mod probe;
pub mod server;
pub mod settings;
pub mod trace_server;

pub use commands::Reply;
pub use connection::ControlConnection;
pub use emitter::{TraceEmitter, TraceEvent};
pub use instrumentor::{Instrumentor, LoadDecision, PassReport};
pub use pattern::{GlobPattern, PatternMatcher};
pub use probe::{CodeUnit, ProbeTransformer, Transformer, UnitDescriptor};
pub use server::{ConnectionRegistry, ControlServer};
pub use settings::AgentSettings;
pub use trace_server::TraceServer;

use crate::domain::{AgentError, PassProgress, UnitCounts};
use crate::util::lock;
use crossbeam_channel::{bounded, Receiver, Sender};
use intrace_common::Message;
use log::{info, warn};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Environment variable read by [`Agent::from_env`]
pub const ARGS_ENV: &str = "INTRACE_ARGS";

pub(crate) struct AgentState {
    pub(crate) settings: AgentSettings,
    pub(crate) instrumentor: Instrumentor,
}

/// State shared by the agent handle and every server thread
pub struct AgentShared {
    pub(crate) state: Mutex<AgentState>,
    pub(crate) emitter: Arc<TraceEmitter>,
    pub(crate) trace_server: Arc<TraceServer>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    start_tx: Sender<()>,
    start_rx: Receiver<()>,
    shutdown: AtomicBool,
}

impl AgentShared {
    /// Encode one settings snapshot under the state lock and send it to every
    /// connection except `exclude`
    pub fn broadcast_settings(&self, exclude: Option<u64>) {
        let state = lock(&self.state);
        let map = state.settings.to_map(state.instrumentor.counts(), self.trace_server.port());
        self.registry.broadcast(&Message::Settings(map), exclude);
    }

    pub fn remove_connection(&self, id: u64) {
        if let Some(connection) = self.registry.remove(id) {
            connection.close();
        }
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn broadcast_status(&self, counts: UnitCounts) {
        self.registry.broadcast(
            &Message::Status { instrumented: counts.instrumented, total: counts.total },
            None,
        );
    }
}

pub struct Agent {
    shared: Arc<AgentShared>,
    control_port: u16,
}

impl Agent {
    /// Start an agent from a startup argument string
    ///
    /// # Errors
    /// Returns [`AgentError`] if a port cannot be bound or a startup pattern
    /// is invalid
    pub fn start(args: &str) -> Result<Self, AgentError> {
        Self::start_with(AgentSettings::parse(args), Box::new(ProbeTransformer))
    }

    /// Start an agent configured by the `INTRACE_ARGS` environment variable
    ///
    /// # Errors
    /// See [`Agent::start`]
    pub fn from_env() -> Result<Self, AgentError> {
        let args = std::env::var(ARGS_ENV).unwrap_or_default();
        Self::start(&args)
    }

    /// Start an agent with explicit settings and transformer.
    ///
    /// Blocks until a `[start` command arrives when the settings ask for
    /// start-wait.
    ///
    /// # Errors
    /// See [`Agent::start`]
    pub fn start_with(mut settings: AgentSettings, transformer: Box<dyn Transformer>) -> Result<Self, AgentError> {
        let trace_server = TraceServer::bind(0)?;
        let emitter = Arc::new(TraceEmitter::new(Some(trace_server.clone()), settings.trace_file.clone()));
        let registry = Arc::new(ConnectionRegistry::default());

        let configured = configure(&mut settings, &emitter, &registry, transformer)
            .and_then(|instrumentor| Ok((instrumentor, ControlServer::bind(settings.server_port)?)));
        let (instrumentor, server) = match configured {
            Ok(parts) => parts,
            Err(e) => {
                trace_server.shutdown();
                return Err(e);
            }
        };

        let control_port = server.port();
        let callback_port = settings.callback_port;
        let start_wait = settings.start_wait;
        let (start_tx, start_rx) = bounded(1);

        let shared = Arc::new(AgentShared {
            state: Mutex::new(AgentState { settings, instrumentor }),
            emitter,
            trace_server,
            registry,
            start_tx,
            start_rx,
            shutdown: AtomicBool::new(false),
        });
        let agent = Self { shared: shared.clone(), control_port };

        server.spawn(shared.clone())?;
        eprintln!("## Listening on port {control_port}");
        info!("Agent control port {control_port}, trace port {}", agent.trace_port());

        if let Some(port) = callback_port {
            if let Err(e) = ControlServer::connect_back(&shared, port) {
                warn!("{e}");
            }
        }

        if start_wait {
            eprintln!("## Waiting for [start command");
            let _ = shared.start_rx.recv();
        }

        Ok(agent)
    }

    /// Register a code unit, instrumenting it if currently selected.
    ///
    /// Registering the same name twice returns the existing unit.
    pub fn load_unit(&self, descriptor: UnitDescriptor) -> CodeUnit {
        let mut state = lock(&self.shared.state);
        if let Some(unit) = state.instrumentor.find(&descriptor.name) {
            return unit.clone();
        }
        let unit = CodeUnit::new(descriptor, self.shared.emitter.clone());
        state.instrumentor.on_code_unit_load(&unit);
        unit
    }

    /// Apply a command as if it came from a control connection; returns the
    /// reply lines (empty for `OK`)
    pub fn handle_command(&self, command: &str) -> Vec<String> {
        match self.shared.dispatch(intrace_common::Command::parse(command)) {
            Reply::Broadcast => Vec::new(),
            Reply::Commands(lines) | Reply::Lines(lines) => lines,
        }
    }

    #[must_use]
    pub fn settings_map(&self) -> BTreeMap<String, String> {
        let state = lock(&self.shared.state);
        state.settings.to_map(state.instrumentor.counts(), self.trace_port())
    }

    #[must_use]
    pub fn settings(&self) -> AgentSettings {
        lock(&self.shared.state).settings.clone()
    }

    #[must_use]
    pub fn counts(&self) -> UnitCounts {
        lock(&self.shared.state).instrumentor.counts()
    }

    #[must_use]
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    #[must_use]
    pub fn trace_port(&self) -> u16 {
        self.shared.trace_server.port()
    }

    #[must_use]
    pub fn trace_observer_count(&self) -> usize {
        self.shared.trace_server.observer_count()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    #[must_use]
    pub fn dropped_lines(&self) -> u64 {
        self.shared.trace_server.dropped_lines()
    }

    /// Stop accepting, close every connection and flush the trace file
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake the blocking accept
        let _ = TcpStream::connect((Ipv4Addr::LOCALHOST, self.control_port));
        self.shared.registry.close_all();
        self.shared.trace_server.shutdown();
        self.shared.emitter.flush();
        info!(
            "Agent stopped ({} lines emitted, {} dropped)",
            self.shared.emitter.emitted_lines(),
            self.shared.trace_server.dropped_lines()
        );
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn configure(
    settings: &mut AgentSettings,
    emitter: &TraceEmitter,
    registry: &Arc<ConnectionRegistry>,
    transformer: Box<dyn Transformer>,
) -> Result<Instrumentor, AgentError> {
    emitter.set_stdout(settings.stdout_output);
    emitter.set_network(settings.network_output);
    if settings.file_output {
        if let Err(e) = emitter.set_file(true) {
            warn!("Failed to open trace file {}: {e}", settings.trace_file.display());
            settings.file_output = false;
        }
    }
    if let Some(callers) = &settings.callers_pattern {
        emitter.set_callers(Some(GlobPattern::new(callers)?));
    }

    let mut instrumentor = Instrumentor::new(transformer);
    instrumentor.set_patterns(&settings.include_pattern, &settings.exclude_pattern)?;
    instrumentor.set_verbose(settings.verbose);
    instrumentor.set_save_artifacts(settings.save_instrumented);
    instrumentor.set_artifact_dir(settings.artifact_dir.clone());
    instrumentor.set_trace_kinds(settings.kinds);
    instrumentor.set_enabled(settings.instrumentation);

    let progress_registry = registry.clone();
    instrumentor.set_progress_sink(Arc::new(move |progress: PassProgress| {
        progress_registry.broadcast(
            &Message::Progress {
                processed: progress.processed,
                total: progress.total,
                done: progress.done,
            },
            None,
        );
    }));
    Ok(instrumentor)
}
