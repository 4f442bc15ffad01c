//! Demo program with the agent embedded
//!
//! Registers a few code units and keeps calling them, so every probe kind
//! has something to report.
//!
//! ## Usage
//!
//! ```bash
//! # Instrument the demo units from the start and keep stdout quiet
//! INTRACE_ARGS="[regex-demo::*[out-stdout-false" cargo run --example traced-app
//!
//! # In another terminal: attach the console
//! cargo run --bin intrace
//! ```

use anyhow::{Context, Result};
use intrace::agent::{Agent, CodeUnit, UnitDescriptor};
use std::thread;
use std::time::Duration;

struct Calculator {
    unit: CodeUnit,
}

impl Calculator {
    fn multiply(&self, a: i64, b: i64) -> i64 {
        let _scope = self.unit.scope("multiply", 30);
        self.unit.arg("multiply", a);
        self.unit.arg("multiply", b);
        let result = if a == 0 || b == 0 {
            self.unit.branch("multiply", 34);
            0
        } else {
            a * b
        };
        self.unit.ret("multiply", result);
        result
    }
}

struct Greeter {
    unit: CodeUnit,
}

impl Greeter {
    fn greet(&self, name: &str) -> String {
        let _scope = self.unit.scope("greet", 49);
        self.unit.arg("greet", name);
        let greeting = format!("Hello, {name}");
        self.unit.ret("greet", &greeting);
        greeting
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let agent = Agent::from_env().context("Failed to start agent")?;

    let calculator = Calculator {
        unit: agent.load_unit(UnitDescriptor::new("demo::Calculator").with_methods(["multiply"])),
    };
    let greeter =
        Greeter { unit: agent.load_unit(UnitDescriptor::new("demo::Greeter").with_methods(["greet"])) };
    // Never instrumented, whatever the patterns say
    agent.load_unit(UnitDescriptor::new("demo::Sealed").sealed());

    println!("traced-app: control port {}, Ctrl+C to stop", agent.control_port());

    let names = ["alice", "bob", "carol"];
    for tick in 0_i64.. {
        let product = calculator.multiply(tick % 7, tick % 5);
        let greeting = greeter.greet(names[usize::try_from(tick).unwrap_or(0) % names.len()]);
        log::debug!("{greeting}: {product}");
        thread::sleep(Duration::from_millis(500));
    }
    Ok(())
}
