//! The broker executable entry point (C7).
//!
//! Reads `loglevel`/`servicePort` from the shared preferences store,
//! installs a `SIGTERM` handler that stops the service cleanly, and
//! runs the accept loop until told to stop. Rust's runtime already
//! ignores `SIGPIPE` before `main` runs, so a write to a peer that
//! vanished mid-response can't take the whole process down the way it
//! can in a C program that hasn't masked it.

use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};
use signal_hook::consts::SIGTERM;
use signal_hook::iterator::Signals;

use vcamcore::broker::Service;
use vcamcore::Preferences;

fn preferences() -> Preferences {
    match std::env::var("VCAMCORE_PREFS_PATH") {
        Ok(path) => Preferences::file(&path).unwrap_or_else(|e| {
            eprintln!("failed to open preferences file {path}: {e}; falling back to an in-memory store");
            Preferences::memory()
        }),
        Err(_) => Preferences::memory(),
    }
}

fn init_logger(preferences: &Preferences) {
    let filter = match preferences.log_level() {
        i32::MIN..=0 => log::LevelFilter::Off,
        1..=2 => log::LevelFilter::Error,
        3 => log::LevelFilter::Warn,
        4..=5 => log::LevelFilter::Info,
        6 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(filter).init();
}

fn main() -> ExitCode {
    let preferences = preferences();
    init_logger(&preferences);

    let service = Arc::new(Service::new(&preferences));

    let mut signals = match Signals::new([SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            return ExitCode::FAILURE;
        }
    };
    {
        let service = Arc::clone(&service);
        std::thread::spawn(move || {
            for _ in signals.forever() {
                info!("received SIGTERM, shutting down");
                service.stop();
                break;
            }
        });
    }

    match service.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("broker exited with an error: {e}");
            ExitCode::FAILURE
        }
    }
}
