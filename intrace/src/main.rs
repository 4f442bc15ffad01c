//! # intrace - Observer Entry Point
//!
//! Supports two operational modes:
//! - **Console** (default): interactive TUI attached to an agent
//! - **Headless** (`--headless`): filtered trace printed to stdout until
//!   Ctrl+C, the agent disconnects, or `--duration` elapses

use anyhow::{Context, Result};
use clap::Parser;
use intrace::cli::Args;
use intrace::client::{FilterControl, FilterListener, ObserverSession, TextMirror, TraceBufferFilter};
use intrace::domain::ClientError;
use intrace::tui::Console;
use log::{debug, warn};
use std::io::ErrorKind;
use std::net::TcpListener;
use std::time::{Duration, Instant};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_UNAVAILABLE: i32 = 69;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let refused = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|e| e.kind() == ErrorKind::ConnectionRefused);
    let bad_pattern = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<ClientError>())
        .any(|e| matches!(e, ClientError::Pattern(_)));

    if refused {
        EXIT_UNAVAILABLE
    } else if bad_pattern {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Prints each displayed line as it arrives
struct PrintListener;

impl FilterListener for PrintListener {
    fn set_text(&mut self, text: &str) {
        debug!("Displayed text replaced ({} bytes)", text.len());
    }

    fn append_text(&mut self, line: &str) {
        println!("{line}");
    }

    fn set_status(&mut self, _displayed: usize, _total: usize) {}
}

fn connect(session: &mut ObserverSession, args: &Args) -> Result<Option<(String, u16)>> {
    if let Some(port) = args.callback {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .with_context(|| format!("Failed to listen on callback port {port}"))?;
        if !args.quiet {
            eprintln!("waiting for agent on port {port}");
        }
        session.accept_callback(&listener).context("Agent callback failed")?;
        return Ok(None);
    }

    let target = (args.host.clone(), args.port);
    if let Err(e) = session.connect(&args.host, args.port) {
        if args.headless {
            return Err(e).with_context(|| format!("Cannot reach agent at {}:{}", args.host, args.port));
        }
        // The console starts disconnected and `c` retries
        warn!("{e}");
    }
    Ok(Some(target))
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    let mirror = TextMirror::new();
    let filter = if args.headless {
        TraceBufferFilter::spawn(PrintListener)
    } else {
        TraceBufferFilter::spawn(mirror.clone())
    }
    .context("Failed to start trace filter")?;

    // The buffer is still empty, so this pass finishes immediately
    filter
        .set_filter(&args.include, &args.exclude, |_| FilterControl::Continue)
        .context("Invalid trace filter")?;

    let mut session = ObserverSession::new(filter.clone());
    let reconnect = connect(&mut session, &args)?;

    if session.is_connected() {
        if !quiet {
            if let Some(peer) = session.status().peer {
                eprintln!("connected: {peer}");
            }
        }
        session
            .set_regex(args.classes.as_deref(), args.exclude_classes.as_deref())
            .context("Agent rejected unit patterns")?;
    }

    if args.headless {
        let started = Instant::now();
        let duration_limit =
            if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };

        // Setup Ctrl+C handler
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut exit_reason = "interrupted";
        loop {
            if duration_limit.is_some_and(|limit| started.elapsed() >= limit) {
                exit_reason = "duration limit reached";
                break;
            }
            if !session.is_connected() {
                exit_reason = "agent disconnected";
                break;
            }

            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(100)) => {}
                _ = &mut ctrl_c => break,
            }
        }
        session.disconnect();

        if !quiet {
            let snapshot = filter.snapshot()?;
            eprintln!(
                "\n{exit_reason}: {:.1}s, {} lines received, {} displayed",
                started.elapsed().as_secs_f64(),
                snapshot.total,
                snapshot.displayed,
            );
        }
    } else {
        Console::new(session, mirror, reconnect).run()?;
    }

    if let Some(path) = &args.save {
        filter.save(path).with_context(|| format!("Failed to save trace to {}", path.display()))?;
        if !quiet {
            println!("saved: {}", path.display());
        }
    }

    Ok(())
}
