//! Command dispatch against the shared agent state

use super::pattern::GlobPattern;
use super::{AgentShared, AgentState, PassReport};
use crate::util::lock;
use intrace_common::{all_command_tokens, Command, Toggle};
use log::{debug, info};

/// How a control connection answers a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A settings snapshot was broadcast to every connection
    Broadcast,
    /// Recognised command tokens
    Commands(Vec<String>),
    /// One frame per line; no lines means `OK`
    Lines(Vec<String>),
}

impl AgentShared {
    pub(crate) fn dispatch(&self, command: Command) -> Reply {
        match command {
            Command::GetSettings => {
                self.broadcast_settings(None);
                Reply::Broadcast
            }
            Command::Help => Reply::Commands(all_command_tokens()),
            Command::NetworkPort => Reply::Lines(vec![self.trace_server.port().to_string()]),
            Command::ListModified => {
                let names = lock(&self.state).instrumentor.modified_units();
                Reply::Lines(vec![format!("[{}]", names.join(", "))])
            }
            Command::Start => {
                if self.start_tx.try_send(()).is_ok() {
                    info!("Start signal received");
                }
                Reply::Lines(Vec::new())
            }
            other => Reply::Lines(self.apply(&other)),
        }
    }

    /// Apply a settings-mutating command; returns error lines for the reply
    fn apply(&self, command: &Command) -> Vec<String> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let mut lines = Vec::new();

        let pass = match command {
            Command::Toggle(toggle, enabled) => match self.apply_toggle(state, *toggle, *enabled) {
                Ok(pass) => pass,
                Err(line) => {
                    lines.push(line);
                    None
                }
            },
            Command::Regex { include, exclude } => {
                let include = include.clone().unwrap_or_else(|| state.settings.include_pattern.clone());
                let exclude = exclude.clone().unwrap_or_else(|| state.settings.exclude_pattern.clone());
                match state.instrumentor.apply_pattern_change(&include, &exclude) {
                    Ok(report) => {
                        state.settings.apply(command);
                        Some(report)
                    }
                    Err(e) => {
                        lines.push(e.to_string());
                        None
                    }
                }
            }
            Command::CallersStart(pattern) => {
                match GlobPattern::new(pattern) {
                    Ok(glob) => {
                        self.emitter.set_callers(Some(glob));
                        state.settings.apply(command);
                    }
                    Err(e) => lines.push(e.to_string()),
                }
                None
            }
            Command::CallersEnd => {
                self.emitter.set_callers(None);
                state.settings.apply(command);
                None
            }
            Command::OutFilePath(path) => {
                let opened = self.emitter.set_file_path(path);
                state.settings.apply(command);
                state.settings.file_output = self.emitter.is_file_enabled();
                if let Err(e) = opened {
                    lines.push(format!("Failed to open trace file {path}: {e}"));
                }
                None
            }
            Command::Unknown(text) => {
                debug!("Unrecognized command: {text}");
                None
            }
            other => {
                debug!("{other:?} only applies at startup");
                None
            }
        };

        if let Some(report) = pass {
            self.broadcast_status(state.instrumentor.counts());
            if !report.failed.is_empty() {
                info!("{} units could not be instrumented", report.failed.len());
            }
        }
        lines
    }

    fn apply_toggle(
        &self,
        state: &mut AgentState,
        toggle: Toggle,
        enabled: bool,
    ) -> Result<Option<PassReport>, String> {
        state.settings.set_enabled(toggle, enabled);
        let instrumentor = &mut state.instrumentor;

        match toggle {
            Toggle::Instrumentation => return Ok(Some(instrumentor.set_enabled(enabled))),
            Toggle::EntryExit | Toggle::Branch | Toggle::Args => {
                return Ok(Some(instrumentor.set_trace_kinds(state.settings.kinds)));
            }
            Toggle::StdOut => self.emitter.set_stdout(enabled),
            Toggle::NetworkOut => self.emitter.set_network(enabled),
            Toggle::SaveInstrumented => instrumentor.set_save_artifacts(enabled),
            Toggle::Verbose => instrumentor.set_verbose(enabled),
            Toggle::FileOut => {
                let opened = self.emitter.set_file(enabled);
                state.settings.file_output = self.emitter.is_file_enabled();
                opened.map_err(|e| {
                    format!("Failed to open trace file {}: {e}", self.emitter.file_path().display())
                })?;
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentSettings, ProbeTransformer, UnitDescriptor};
    use intrace_common::parse_list_reply;

    fn agent(args: &str) -> Agent {
        let settings = AgentSettings::parse(&format!("[serverport-0{args}"));
        Agent::start_with(settings, Box::new(ProbeTransformer)).unwrap()
    }

    #[test]
    fn test_regex_command_instruments_matching_units() {
        let agent = agent("");
        let bar = agent.load_unit(UnitDescriptor::new("com.foo.Bar"));
        let test = agent.load_unit(UnitDescriptor::new("com.foo.BarTest"));
        assert!(!bar.is_instrumented());

        assert!(agent.handle_command("[regex-com.*[excluderegex-*Test").is_empty());
        assert!(bar.is_instrumented());
        assert!(!test.is_instrumented());
        assert_eq!(agent.settings().include_pattern, "com.*");
        assert_eq!(agent.settings().exclude_pattern, "*Test");
    }

    #[test]
    fn test_list_modified_units() {
        let agent = agent("[regex-demo::*");
        agent.load_unit(UnitDescriptor::new("demo::B"));
        agent.load_unit(UnitDescriptor::new("demo::A"));
        agent.load_unit(UnitDescriptor::new("other::C"));

        let reply = agent.handle_command("[listmodifiedclasses");
        assert_eq!(reply.len(), 1);
        assert_eq!(parse_list_reply(&reply[0]), vec!["demo::A", "demo::B"]);
    }

    #[test]
    fn test_toggle_updates_settings() {
        let agent = agent("");
        assert!(agent.handle_command("[trace-branch-true").is_empty());
        assert!(agent.handle_command("[verbose-true").is_empty());
        let settings = agent.settings();
        assert!(settings.kinds.branch);
        assert!(settings.verbose);
    }

    #[test]
    fn test_instrumentation_toggle_reverts_and_restores() {
        let agent = agent("[regex-demo::*");
        let unit = agent.load_unit(UnitDescriptor::new("demo::A"));
        assert!(unit.is_instrumented());

        agent.handle_command("[instru-false");
        assert!(!unit.is_instrumented());
        agent.handle_command("[instru-true");
        assert!(unit.is_instrumented());
    }

    #[test]
    fn test_file_toggle_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing").join("t.txt");
        let agent = agent(&format!("[out-file-path-{}", missing.display()));

        let reply = agent.handle_command("[out-file-true");
        assert_eq!(reply.len(), 1);
        assert!(reply[0].starts_with("Failed to open trace file"));
        assert!(!agent.settings().file_output);
    }

    #[test]
    fn test_unknown_and_startup_only_commands_reply_ok() {
        let agent = agent("");
        assert!(agent.handle_command("[bogus").is_empty());
        assert!(agent.handle_command("[serverport-1").is_empty());
    }

    #[test]
    fn test_callers_commands() {
        let agent = agent("");
        agent.handle_command("[callers-start-demo::Store:put");
        assert_eq!(agent.settings().callers_pattern.as_deref(), Some("demo::Store:put"));
        agent.handle_command("[callers-end");
        assert_eq!(agent.settings().callers_pattern, None);
    }

    #[test]
    fn test_network_port_reply() {
        let agent = agent("");
        assert_eq!(agent.handle_command("[out-network"), vec![agent.trace_port().to_string()]);
    }
}
