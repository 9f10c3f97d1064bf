//! Logger setup for the CLI binary.
//!
//! The library only emits through the `log` facade and never installs a
//! logger itself; the binary calls [`setup_logging`] once at startup.
//! `RUST_LOG` still overrides everything, so embedding applications keep
//! full control.

use std::io::Write;

use colored::Colorize;
use env_logger::Builder;
use log::{Level, LevelFilter};

/// Install the global logger. `verbose` raises this crate to debug;
/// dependencies stay at warnings either way.
pub fn setup_logging(verbose: bool) {
    let crate_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::from_default_env()
        .filter_level(LevelFilter::Warn)
        .filter_module(env!("CARGO_PKG_NAME"), crate_level)
        .format(|buf, record| {
            let tag = match record.level() {
                Level::Error => "error".red().bold(),
                Level::Warn => " warn".yellow(),
                Level::Info => " info".green(),
                Level::Debug => "debug".blue(),
                Level::Trace => "trace".dimmed(),
            };
            // Errors and warnings name their module; routine lines stay
            // short.
            if record.level() <= Level::Warn {
                writeln!(buf, "{tag} [{}] {}", record.target(), record.args())
            } else {
                writeln!(buf, "{tag} {}", record.args())
            }
        })
        .init();
}
