//! CLI argument definitions

use clap::Parser;
use intrace_common::DEFAULT_SERVER_PORT;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "intrace",
    about = "Observe and control a running InTrace agent",
    after_help = "\
EXAMPLES:
    intrace                                     Console attached to localhost:9123
    intrace --host build01 --port 9200          Remote agent
    intrace --headless --include '.*ERROR.*'    Print matching trace lines
    intrace --callback 9300                     Wait for an agent started with [callbackport-9300"
)]
pub struct Args {
    /// Agent host
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Agent control port
    #[arg(short, long, default_value_t = DEFAULT_SERVER_PORT)]
    pub port: u16,

    /// Listen on this port for an agent to connect back instead of connecting out
    #[arg(long, value_name = "PORT", conflicts_with_all = ["host", "port"])]
    pub callback: Option<u16>,

    /// Print trace to stdout instead of running the console
    #[arg(long)]
    pub headless: bool,

    /// Show only trace lines fully matching this regex
    #[arg(long, default_value = ".*")]
    pub include: String,

    /// Hide trace lines fully matching this regex
    #[arg(long, default_value = "")]
    pub exclude: String,

    /// Code units to instrument (`|`-separated globs), sent on connect
    #[arg(long, value_name = "PATTERN")]
    pub classes: Option<String>,

    /// Code units never to instrument, sent on connect
    #[arg(long, value_name = "PATTERN")]
    pub exclude_classes: Option<String>,

    /// Save the displayed trace to FILE on exit
    #[arg(long, value_name = "FILE")]
    pub save: Option<PathBuf>,

    /// Stop after N seconds in headless mode (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["intrace"]);
        assert_eq!(args.host, "localhost");
        assert_eq!(args.port, DEFAULT_SERVER_PORT);
        assert_eq!(args.include, ".*");
        assert_eq!(args.exclude, "");
        assert!(!args.headless);
        assert!(args.callback.is_none());
    }

    #[test]
    fn test_callback_conflicts_with_port() {
        assert!(Args::try_parse_from(["intrace", "--callback", "9300", "--port", "9200"]).is_err());
        let args = Args::parse_from(["intrace", "--callback", "9300", "--headless"]);
        assert_eq!(args.callback, Some(9300));
    }
}
