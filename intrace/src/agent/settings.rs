//! Canonical agent settings
//!
//! Built from the startup argument string and mutated only through command
//! handlers. Observers receive snapshots via [`AgentSettings::to_map`].

use super::emitter::DEFAULT_TRACE_FILE;
use super::instrumentor::DEFAULT_ARTIFACT_DIR;
use crate::domain::{TraceKinds, UnitCounts};
use intrace_common::{
    parse_args, Command, Toggle, CALLBACK_PORT, CALLERS_START, DEFAULT_SERVER_PORT, EXCLUDE_REGEX,
    KEY_NETWORK_PORT, KEY_NUM_INSTRUMENTED, KEY_NUM_TOTAL, OUT_FILE_PATH, REGEX, SERVER_PORT,
};
use log::debug;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub instrumentation: bool,
    pub kinds: TraceKinds,
    pub stdout_output: bool,
    pub file_output: bool,
    pub network_output: bool,
    pub include_pattern: String,
    pub exclude_pattern: String,
    pub verbose: bool,
    pub save_instrumented: bool,
    pub callers_pattern: Option<String>,
    pub server_port: u16,
    pub callback_port: Option<u16>,
    pub start_wait: bool,
    pub trace_file: PathBuf,
    pub artifact_dir: PathBuf,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            instrumentation: true,
            kinds: TraceKinds::default(),
            stdout_output: false,
            file_output: false,
            network_output: true,
            include_pattern: String::new(),
            exclude_pattern: String::new(),
            verbose: false,
            save_instrumented: false,
            callers_pattern: None,
            server_port: DEFAULT_SERVER_PORT,
            callback_port: None,
            start_wait: false,
            trace_file: PathBuf::from(DEFAULT_TRACE_FILE),
            artifact_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
        }
    }
}

impl AgentSettings {
    /// Settings from a startup argument string such as
    /// `[serverport-9123[regex-demo::*[out-stdout-true`
    #[must_use]
    pub fn parse(args: &str) -> Self {
        let mut settings = Self::default();
        for command in parse_args(args) {
            settings.apply(&command);
        }
        settings
    }

    /// Record a command's effect on the settings values.
    ///
    /// Returns false for commands that carry no setting.
    pub fn apply(&mut self, command: &Command) -> bool {
        match command {
            Command::Toggle(toggle, enabled) => self.set_enabled(*toggle, *enabled),
            Command::Regex { include, exclude } => {
                if let Some(include) = include {
                    self.include_pattern.clone_from(include);
                }
                if let Some(exclude) = exclude {
                    self.exclude_pattern.clone_from(exclude);
                }
            }
            Command::CallersStart(pattern) => self.callers_pattern = Some(pattern.clone()),
            Command::CallersEnd => self.callers_pattern = None,
            Command::ServerPort(port) => self.server_port = *port,
            Command::CallbackPort(port) => self.callback_port = Some(*port),
            Command::StartWait => self.start_wait = true,
            Command::OutFilePath(path) => self.trace_file = PathBuf::from(path),
            other => {
                debug!("No setting for {other:?}");
                return false;
            }
        }
        true
    }

    #[must_use]
    pub fn is_enabled(&self, toggle: Toggle) -> bool {
        match toggle {
            Toggle::Instrumentation => self.instrumentation,
            Toggle::EntryExit => self.kinds.entry_exit,
            Toggle::Branch => self.kinds.branch,
            Toggle::Args => self.kinds.args,
            Toggle::StdOut => self.stdout_output,
            Toggle::FileOut => self.file_output,
            Toggle::NetworkOut => self.network_output,
            Toggle::SaveInstrumented => self.save_instrumented,
            Toggle::Verbose => self.verbose,
        }
    }

    pub fn set_enabled(&mut self, toggle: Toggle, enabled: bool) {
        let slot = match toggle {
            Toggle::Instrumentation => &mut self.instrumentation,
            Toggle::EntryExit => &mut self.kinds.entry_exit,
            Toggle::Branch => &mut self.kinds.branch,
            Toggle::Args => &mut self.kinds.args,
            Toggle::StdOut => &mut self.stdout_output,
            Toggle::FileOut => &mut self.file_output,
            Toggle::NetworkOut => &mut self.network_output,
            Toggle::SaveInstrumented => &mut self.save_instrumented,
            Toggle::Verbose => &mut self.verbose,
        };
        *slot = enabled;
    }

    /// Full snapshot as sent to observers
    #[must_use]
    pub fn to_map(&self, counts: UnitCounts, network_port: u16) -> BTreeMap<String, String> {
        let mut map: BTreeMap<String, String> = Toggle::ALL
            .iter()
            .map(|toggle| (toggle.prefix().to_string(), self.is_enabled(*toggle).to_string()))
            .collect();

        map.insert(REGEX.to_string(), self.include_pattern.clone());
        map.insert(EXCLUDE_REGEX.to_string(), self.exclude_pattern.clone());
        if let Some(callers) = &self.callers_pattern {
            map.insert(CALLERS_START.to_string(), callers.clone());
        }
        map.insert(SERVER_PORT.to_string(), self.server_port.to_string());
        if let Some(callback) = self.callback_port {
            map.insert(CALLBACK_PORT.to_string(), callback.to_string());
        }
        map.insert(OUT_FILE_PATH.to_string(), self.trace_file.display().to_string());
        map.insert(KEY_NUM_INSTRUMENTED.to_string(), counts.instrumented.to_string());
        map.insert(KEY_NUM_TOTAL.to_string(), counts.total.to_string());
        map.insert(KEY_NETWORK_PORT.to_string(), network_port.to_string());
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intrace_common::ParsedSettings;

    #[test]
    fn test_defaults() {
        let settings = AgentSettings::default();
        assert!(settings.instrumentation);
        assert!(settings.network_output);
        assert!(!settings.stdout_output);
        assert!(settings.kinds.entry_exit);
        assert!(!settings.kinds.branch);
        assert_eq!(settings.server_port, 9123);
        assert_eq!(settings.include_pattern, "");
    }

    #[test]
    fn test_parse_startup_args() {
        let settings = AgentSettings::parse(
            "[serverport-0[regex-demo::*[excluderegex-*Test[out-stdout-true[startwait[out-file-path-/tmp/x.txt",
        );
        assert_eq!(settings.server_port, 0);
        assert_eq!(settings.include_pattern, "demo::*");
        assert_eq!(settings.exclude_pattern, "*Test");
        assert!(settings.stdout_output);
        assert!(settings.start_wait);
        assert_eq!(settings.trace_file, PathBuf::from("/tmp/x.txt"));
    }

    #[test]
    fn test_apply_reports_non_settings() {
        let mut settings = AgentSettings::default();
        assert!(settings.apply(&Command::Toggle(Toggle::Branch, true)));
        assert!(settings.kinds.branch);
        assert!(!settings.apply(&Command::ListModified));
    }

    #[test]
    fn test_snapshot_parses_back() {
        let mut settings = AgentSettings::default();
        settings.set_enabled(Toggle::Verbose, true);
        settings.include_pattern = "demo::*".to_string();
        settings.callers_pattern = Some("demo::Store:put".to_string());

        let map = settings.to_map(UnitCounts { instrumented: 2, total: 5 }, 40000);
        let parsed = ParsedSettings::from_map(&map);
        assert!(parsed.verbose);
        assert!(parsed.instrumentation);
        assert_eq!(parsed.include_pattern, "demo::*");
        assert_eq!(parsed.callers_pattern.as_deref(), Some("demo::Store:put"));
        assert_eq!(parsed.instrumented_units, 2);
        assert_eq!(parsed.total_units, 5);
        assert_eq!(parsed.network_port, Some(40000));
    }
}
