//! Observer session orchestration
//!
//! ```text
//! connect ──▶ getsettings ──▶ [out-network ──▶ receiver on <peer ip>:<port>
//!    │
//!    └─ every mutating command is followed by getsettings
//! ```

use super::control::{ConnectionState, ControlChannel, ControlListener};
use super::filter::TraceBufferFilter;
use super::receiver::NetworkTraceReceiver;
use crate::domain::{ClientError, PassProgress, UnitCounts};
use crate::util::lock;
use intrace_common::{
    parse_list_reply, ParsedSettings, Toggle, CALLERS_END, CALLERS_START, EXCLUDE_REGEX, GET_SETTINGS,
    HELP, LIST_MODIFIED, NETWORK_PORT, REGEX, REPLY_OK,
};
use log::{info, warn};
use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};

/// What the observer currently knows about its agent
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub connection: ConnectionState,
    pub peer: Option<SocketAddr>,
    pub settings: Option<ParsedSettings>,
    pub progress: Option<PassProgress>,
    pub counts: UnitCounts,
    pub message: String,
}

struct SessionEvents {
    status: Arc<Mutex<SessionStatus>>,
    filter: TraceBufferFilter,
}

impl ControlListener for SessionEvents {
    fn settings(&self, settings: &BTreeMap<String, String>) {
        let parsed = ParsedSettings::from_map(settings);
        let mut status = lock(&self.status);
        status.counts = UnitCounts { instrumented: parsed.instrumented_units, total: parsed.total_units };
        status.settings = Some(parsed);
        status.message = "Latest settings received".to_string();
    }

    fn progress(&self, progress: PassProgress) {
        let mut status = lock(&self.status);
        status.message = progress.to_string();
        status.progress = Some(progress);
    }

    fn status(&self, counts: UnitCounts) {
        lock(&self.status).counts = counts;
    }

    fn disconnected(&self, error: Option<String>) {
        let mut status = lock(&self.status);
        if let Some(error) = error {
            status.connection = ConnectionState::DisconnectedErr;
            status.message = format!("Disconnected: {error}");
            let _ = self.filter.append_system(format!("Disconnected: {error}"));
        } else {
            status.connection = ConnectionState::Disconnected;
            status.message = "Disconnected".to_string();
        }
    }
}

pub struct ObserverSession {
    status: Arc<Mutex<SessionStatus>>,
    filter: TraceBufferFilter,
    control: Option<ControlChannel>,
    receiver: Option<NetworkTraceReceiver>,
}

impl ObserverSession {
    #[must_use]
    pub fn new(filter: TraceBufferFilter) -> Self {
        Self { status: Arc::new(Mutex::new(SessionStatus::default())), filter, control: None, receiver: None }
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        lock(&self.status).clone()
    }

    #[must_use]
    pub fn filter(&self) -> &TraceBufferFilter {
        &self.filter
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.status).connection == ConnectionState::Connected
    }

    /// Connect to an agent's control port and start receiving trace
    ///
    /// # Errors
    /// Returns [`ClientError`] if the connection or the initial exchange fails;
    /// the session is then in [`ConnectionState::DisconnectedErr`]
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), ClientError> {
        self.disconnect();
        self.set_connection(ConnectionState::Connecting, format!("Connecting to {host}:{port}"));

        match ControlChannel::connect(&format!("{host}:{port}"), self.events()) {
            Ok(channel) => self.attach(channel),
            Err(e) => {
                self.set_connection(ConnectionState::DisconnectedErr, e.to_string());
                Err(e)
            }
        }
    }

    /// Accept an agent connecting back to `listener` (callback mode)
    ///
    /// # Errors
    /// See [`connect`](Self::connect)
    pub fn accept_callback(&mut self, listener: &TcpListener) -> Result<(), ClientError> {
        self.disconnect();
        self.set_connection(ConnectionState::Connecting, "Waiting for agent callback".to_string());

        let accepted = listener
            .accept()
            .map_err(ClientError::from)
            .and_then(|(stream, _)| ControlChannel::from_stream(stream, self.events()));
        match accepted {
            Ok(channel) => self.attach(channel),
            Err(e) => {
                self.set_connection(ConnectionState::DisconnectedErr, e.to_string());
                Err(e)
            }
        }
    }

    fn events(&self) -> Arc<dyn ControlListener> {
        Arc::new(SessionEvents { status: self.status.clone(), filter: self.filter.clone() })
    }

    fn attach(&mut self, channel: ControlChannel) -> Result<(), ClientError> {
        let peer = channel.peer_addr();
        {
            let mut status = lock(&self.status);
            status.connection = ConnectionState::Connected;
            status.peer = Some(peer);
            status.message = format!("Connected to {peer}");
        }
        info!("Connected to agent at {peer}");

        let setup = channel.send_message(GET_SETTINGS).and_then(|()| {
            let reply = channel.request(NETWORK_PORT)?;
            reply
                .trim()
                .parse::<u16>()
                .map_err(|_| ClientError::UnexpectedReply { command: NETWORK_PORT.to_string(), reply })
        });
        let trace_port = match setup {
            Ok(port) => port,
            Err(e) => {
                channel.disconnect();
                self.set_connection(ConnectionState::DisconnectedErr, e.to_string());
                return Err(e);
            }
        };

        match NetworkTraceReceiver::start(SocketAddr::new(peer.ip(), trace_port), self.filter.clone()) {
            Ok(receiver) => self.receiver = Some(receiver),
            Err(e) => {
                warn!("{e}");
                let _ = self.filter.append_system(format!("Failed to setup network trace: {e}"));
            }
        }
        self.control = Some(channel);
        Ok(())
    }

    /// Close both channels; safe to call when not connected
    pub fn disconnect(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.disconnect();
        }
        if let Some(control) = self.control.take() {
            control.disconnect();
            self.set_connection(ConnectionState::Disconnected, "Disconnected".to_string());
        }
    }

    fn set_connection(&self, connection: ConnectionState, message: String) {
        let mut status = lock(&self.status);
        status.connection = connection;
        status.message = message;
    }

    fn channel(&self) -> Result<&ControlChannel, ClientError> {
        match &self.control {
            Some(channel) if !channel.is_closed() => Ok(channel),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Send a command, wait for its reply and refresh settings
    ///
    /// # Errors
    /// Returns [`ClientError`] if not connected or the transport fails
    pub fn command(&self, command: &str) -> Result<String, ClientError> {
        let channel = self.channel()?;
        let reply = channel.request(command)?;
        channel.send_message(GET_SETTINGS)?;
        Ok(reply)
    }

    fn command_ok(&self, command: &str) -> Result<(), ClientError> {
        let reply = self.command(command)?;
        if reply == REPLY_OK {
            Ok(())
        } else {
            Err(ClientError::UnexpectedReply { command: command.to_string(), reply })
        }
    }

    /// Flip a toggle relative to the last known settings; returns the new value
    ///
    /// # Errors
    /// See [`command`](Self::command)
    pub fn toggle(&self, toggle: Toggle) -> Result<bool, ClientError> {
        let current = lock(&self.status).settings.as_ref().is_some_and(|s| s.is_enabled(toggle));
        self.set_toggle(toggle, !current)?;
        Ok(!current)
    }

    /// # Errors
    /// See [`command`](Self::command)
    pub fn set_toggle(&self, toggle: Toggle, enabled: bool) -> Result<(), ClientError> {
        self.command_ok(&toggle.command(enabled))
    }

    /// Set the agent's unit include/exclude patterns; an omitted side keeps
    /// its current value
    ///
    /// # Errors
    /// Returns [`ClientError::UnexpectedReply`] carrying the agent's error if
    /// a pattern is rejected
    pub fn set_regex(&self, include: Option<&str>, exclude: Option<&str>) -> Result<(), ClientError> {
        let command = match (include, exclude) {
            (Some(include), Some(exclude)) => format!("{REGEX}{include}{EXCLUDE_REGEX}{exclude}"),
            (Some(include), None) => format!("{REGEX}{include}"),
            (None, Some(exclude)) => format!("{EXCLUDE_REGEX}{exclude}"),
            (None, None) => return Ok(()),
        };
        self.command_ok(&command)
    }

    /// Arm callers tracing for a `unit:method` pattern, or disarm it with `None`
    ///
    /// # Errors
    /// See [`set_regex`](Self::set_regex)
    pub fn set_callers_regex(&self, pattern: Option<&str>) -> Result<(), ClientError> {
        match pattern {
            Some(pattern) => self.command_ok(&format!("{CALLERS_START}{pattern}")),
            None => self.command_ok(CALLERS_END),
        }
    }

    /// Query instrumented units and echo them into the trace as system lines
    ///
    /// # Errors
    /// See [`command`](Self::command)
    pub fn list_modified_units(&self) -> Result<Vec<String>, ClientError> {
        let reply = self.channel()?.request(LIST_MODIFIED)?;
        let units = parse_list_reply(&reply);
        if units.is_empty() {
            self.filter.append_system("No instrumented classes")?;
        }
        for unit in &units {
            self.filter.append_system(format!("Instrumented: {unit}"))?;
        }
        Ok(units)
    }

    /// Command tokens the agent recognises
    ///
    /// # Errors
    /// See [`command`](Self::command)
    pub fn help(&self) -> Result<Vec<String>, ClientError> {
        let reply = self.channel()?.request(HELP)?;
        Ok(reply.lines().map(str::to_string).collect())
    }

    /// Explain the trace line format with a worked example
    ///
    /// # Errors
    /// Returns [`ClientError::FilterStopped`] if the filter thread is gone
    pub fn add_help_text(&self) -> Result<(), ClientError> {
        let filter = &self.filter;
        filter.append_system("Here is some example trace:")?;
        for line in [
            "[24/05/27 14:14:30.120]:[1]:example::Calculator:multiply: {:100",
            "[24/05/27 14:14:30.120]:[1]:example::Calculator:multiply: Arg: 2",
            "[24/05/27 14:14:30.120]:[1]:example::Calculator:multiply: Arg: 4",
            "[24/05/27 14:14:30.121]:[1]:example::Calculator:multiply: /:101",
            "[24/05/27 14:14:30.121]:[1]:example::Calculator:multiply: Return: 8",
            "[24/05/27 14:14:30.121]:[1]:example::Calculator:multiply: }:105",
        ] {
            filter.append(line)?;
        }
        for line in [
            "",
            "This means the following:",
            "[24/05/27 14:14:30.120] is a timestamp; the date is in the format yy/mm/dd",
            "[1] is the execution context (thread) ID",
            "example::Calculator:multiply is the unit and method being traced",
            "{:100 means the method was entered on source line 100",
            "Arg: 2 means the first argument had value 2",
            "Arg: 4 means the second argument had value 4",
            "/:101 means an optional block starting at source line 101 was executed",
            "Return: 8 means the method returned value 8",
            "}:105 means the method returned on source line 105",
            "",
        ] {
            filter.append_system(line)?;
        }
        Ok(())
    }
}

impl Drop for ObserverSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}
