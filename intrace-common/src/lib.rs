//! # Shared Wire Protocol (Agent ↔ Observer)
//!
//! Defines the command grammar, settings keys and framing shared between the
//! in-process agent and the observers that attach to it.
//!
//! ## Commands
//!
//! Commands are ASCII tokens starting with [`COMMAND_MARKER`]. Toggles take a
//! `-true`/`-false` suffix, pattern commands carry their payload after the
//! prefix:
//!
//! ```text
//! [instru-true                      enable instrumentation
//! [regex-app::*[excluderegex-*Test  set include and exclude unit patterns
//! [out-network                      query the trace streaming port
//! getsettings                       broadcast a settings snapshot
//! ```
//!
//! Agent startup arguments use the same grammar, concatenated:
//! `[serverport-9123[regex-app::*[out-stdout-true`.
//!
//! ## Key Types
//!
//! - [`Command`] - a parsed control command
//! - [`Toggle`] - every boolean setting together with its command prefix
//! - [`ParsedSettings`] - observer-side view of a settings snapshot
//! - [`Message`] - one frame on the control or trace socket

use std::collections::BTreeMap;

pub mod frame;

pub use frame::{encode, read_frame, write_frame, FrameError, Message, MAX_FRAME_LEN};

// ============================================================================
// Command Tokens
// ============================================================================

/// Every bracketed command starts with this character
pub const COMMAND_MARKER: char = '[';

/// Request a settings snapshot; the agent broadcasts it to every client
pub const GET_SETTINGS: &str = "getsettings";

/// Request the set of recognised command tokens
pub const HELP: &str = "help";

/// Reply sent for commands that produce no output
pub const REPLY_OK: &str = "OK";

pub const REGEX: &str = "[regex-";
pub const EXCLUDE_REGEX: &str = "[excluderegex-";
pub const CALLERS_START: &str = "[callers-start-";
pub const CALLERS_END: &str = "[callers-end";
pub const LIST_MODIFIED: &str = "[listmodifiedclasses";

/// Bare `[out-network` asks for the trace streaming port
pub const NETWORK_PORT: &str = "[out-network";

/// Releases an agent started with [`START_WAIT`]
pub const START: &str = "[start";

// Startup-only arguments
pub const SERVER_PORT: &str = "[serverport-";
pub const CALLBACK_PORT: &str = "[callbackport-";
pub const START_WAIT: &str = "[startwait";
pub const OUT_FILE_PATH: &str = "[out-file-path-";

// Settings snapshot keys that are not command prefixes
pub const KEY_NUM_INSTRUMENTED: &str = "num-instrumented";
pub const KEY_NUM_TOTAL: &str = "num-total";
pub const KEY_NETWORK_PORT: &str = "network-port";

/// Default control port when no `[serverport-` argument is given
pub const DEFAULT_SERVER_PORT: u16 = 9123;

// ============================================================================
// Toggles
// ============================================================================

/// A boolean agent setting and its `[prefix-true` / `[prefix-false` commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Toggle {
    Instrumentation,
    EntryExit,
    Branch,
    Args,
    StdOut,
    FileOut,
    NetworkOut,
    SaveInstrumented,
    Verbose,
}

impl Toggle {
    pub const ALL: [Toggle; 9] = [
        Toggle::Instrumentation,
        Toggle::EntryExit,
        Toggle::Branch,
        Toggle::Args,
        Toggle::StdOut,
        Toggle::FileOut,
        Toggle::NetworkOut,
        Toggle::SaveInstrumented,
        Toggle::Verbose,
    ];

    /// Command prefix, also used as the settings snapshot key
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Toggle::Instrumentation => "[instru-",
            Toggle::EntryExit => "[trace-ee-",
            Toggle::Branch => "[trace-branch-",
            Toggle::Args => "[trace-args-",
            Toggle::StdOut => "[out-stdout-",
            Toggle::FileOut => "[out-file-",
            Toggle::NetworkOut => "[out-network-",
            Toggle::SaveInstrumented => "[saveinstru-",
            Toggle::Verbose => "[verbose-",
        }
    }

    /// Short human label for status displays
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Toggle::Instrumentation => "Instrumentation",
            Toggle::EntryExit => "Entry/Exit",
            Toggle::Branch => "Branch",
            Toggle::Args => "Args",
            Toggle::StdOut => "StdOut",
            Toggle::FileOut => "File",
            Toggle::NetworkOut => "Network",
            Toggle::SaveInstrumented => "Save Instru",
            Toggle::Verbose => "Verbose",
        }
    }

    /// Build the command that sets this toggle to `enabled`
    #[must_use]
    pub fn command(self, enabled: bool) -> String {
        format!("{}{enabled}", self.prefix())
    }
}

// ============================================================================
// Command Parsing
// ============================================================================

/// A parsed control command or startup argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetSettings,
    Help,
    Toggle(Toggle, bool),
    /// Either side may be absent when given as a separate startup argument
    Regex {
        include: Option<String>,
        exclude: Option<String>,
    },
    CallersStart(String),
    CallersEnd,
    ListModified,
    NetworkPort,
    Start,
    ServerPort(u16),
    CallbackPort(u16),
    StartWait,
    OutFilePath(String),
    Unknown(String),
}

impl Command {
    /// Parse a single command message
    #[must_use]
    pub fn parse(message: &str) -> Command {
        let message = message.trim();

        match message {
            GET_SETTINGS => return Command::GetSettings,
            HELP => return Command::Help,
            LIST_MODIFIED => return Command::ListModified,
            NETWORK_PORT => return Command::NetworkPort,
            START => return Command::Start,
            START_WAIT => return Command::StartWait,
            CALLERS_END => return Command::CallersEnd,
            _ => {}
        }

        if let Some(rest) = message.strip_prefix(REGEX) {
            let (include, exclude) = match rest.split_once(EXCLUDE_REGEX) {
                Some((include, exclude)) => (include, Some(exclude.to_string())),
                None => (rest, None),
            };
            return Command::Regex { include: Some(include.to_string()), exclude };
        }
        if let Some(rest) = message.strip_prefix(EXCLUDE_REGEX) {
            return Command::Regex { include: None, exclude: Some(rest.to_string()) };
        }
        if let Some(rest) = message.strip_prefix(CALLERS_START) {
            return Command::CallersStart(rest.to_string());
        }
        if let Some(rest) = message.strip_prefix(OUT_FILE_PATH) {
            return Command::OutFilePath(rest.to_string());
        }
        if let Some(rest) = message.strip_prefix(SERVER_PORT) {
            return rest
                .parse()
                .map_or_else(|_| Command::Unknown(message.to_string()), Command::ServerPort);
        }
        if let Some(rest) = message.strip_prefix(CALLBACK_PORT) {
            return rest
                .parse()
                .map_or_else(|_| Command::Unknown(message.to_string()), Command::CallbackPort);
        }

        for toggle in Toggle::ALL {
            if let Some(value) = message.strip_prefix(toggle.prefix()) {
                return match value {
                    "true" => Command::Toggle(toggle, true),
                    "false" => Command::Toggle(toggle, false),
                    _ => Command::Unknown(message.to_string()),
                };
            }
        }

        Command::Unknown(message.to_string())
    }
}

/// Split an agent startup argument string into commands.
///
/// Patterns given as startup arguments cannot contain `[`.
#[must_use]
pub fn parse_args(args: &str) -> Vec<Command> {
    args.split(COMMAND_MARKER)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| Command::parse(&format!("{COMMAND_MARKER}{token}")))
        .collect()
}

/// Every command token the agent recognises, as returned by `help`
#[must_use]
pub fn all_command_tokens() -> Vec<String> {
    let mut tokens: Vec<String> = Toggle::ALL
        .iter()
        .flat_map(|toggle| [toggle.command(true), toggle.command(false)])
        .collect();
    tokens.extend(
        [
            format!("{REGEX}<pattern>{EXCLUDE_REGEX}<pattern>"),
            format!("{CALLERS_START}<pattern>"),
            CALLERS_END.to_string(),
            LIST_MODIFIED.to_string(),
            NETWORK_PORT.to_string(),
            START.to_string(),
            GET_SETTINGS.to_string(),
            HELP.to_string(),
        ]
        .into_iter(),
    );
    tokens.sort();
    tokens
}

/// Parse a `[a, b, c]` list reply (as sent for `[listmodifiedclasses`)
#[must_use]
pub fn parse_list_reply(reply: &str) -> Vec<String> {
    let inner = reply.trim().trim_start_matches('[').trim_end_matches(']');
    inner.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

// ============================================================================
// Settings Snapshot
// ============================================================================

/// Observer-side view of an agent settings snapshot.
///
/// Missing or malformed entries fall back to defaults, so a snapshot from an
/// older agent still parses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSettings {
    pub instrumentation: bool,
    pub entry_exit: bool,
    pub branch: bool,
    pub args: bool,
    pub stdout_output: bool,
    pub file_output: bool,
    pub network_output: bool,
    pub save_instrumented: bool,
    pub verbose: bool,
    pub include_pattern: String,
    pub exclude_pattern: String,
    pub callers_pattern: Option<String>,
    pub instrumented_units: usize,
    pub total_units: usize,
    pub network_port: Option<u16>,
}

impl ParsedSettings {
    #[must_use]
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let flag = |toggle: Toggle| map.get(toggle.prefix()).is_some_and(|v| v == "true");
        let text = |key: &str| map.get(key).cloned().unwrap_or_default();
        let count = |key: &str| map.get(key).and_then(|v| v.parse().ok()).unwrap_or(0);

        Self {
            instrumentation: flag(Toggle::Instrumentation),
            entry_exit: flag(Toggle::EntryExit),
            branch: flag(Toggle::Branch),
            args: flag(Toggle::Args),
            stdout_output: flag(Toggle::StdOut),
            file_output: flag(Toggle::FileOut),
            network_output: flag(Toggle::NetworkOut),
            save_instrumented: flag(Toggle::SaveInstrumented),
            verbose: flag(Toggle::Verbose),
            include_pattern: text(REGEX),
            exclude_pattern: text(EXCLUDE_REGEX),
            callers_pattern: map.get(CALLERS_START).cloned(),
            instrumented_units: count(KEY_NUM_INSTRUMENTED),
            total_units: count(KEY_NUM_TOTAL),
            network_port: map.get(KEY_NETWORK_PORT).and_then(|v| v.parse().ok()),
        }
    }

    #[must_use]
    pub fn is_enabled(&self, toggle: Toggle) -> bool {
        match toggle {
            Toggle::Instrumentation => self.instrumentation,
            Toggle::EntryExit => self.entry_exit,
            Toggle::Branch => self.branch,
            Toggle::Args => self.args,
            Toggle::StdOut => self.stdout_output,
            Toggle::FileOut => self.file_output,
            Toggle::NetworkOut => self.network_output,
            Toggle::SaveInstrumented => self.save_instrumented,
            Toggle::Verbose => self.verbose,
        }
    }
}
