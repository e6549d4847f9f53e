//! Logger configuration shared by the ECMWF client binaries.
//!
//! Transfer progress (submits, status changes, download rates, daemon
//! task lifecycle) is what users run these binaries for, so the client
//! crates log at INFO by default while the HTTP machinery underneath
//! (reqwest, hyper, ...) only surfaces when something goes wrong. Set
//! `RUST_LOG` to replace the whole filter, e.g.
//! `RUST_LOG=ecmwf_api=debug,warn`.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Crates whose INFO output makes up the user-facing transfer log.
const CLIENT_TARGETS: [&str; 3] = ["ecmwf_api", "ecmwf_daemon", "ecmwf_cli"];

/// Initialize the global `tracing` logger, printing to stdout.
///
/// Call exactly once, early in `main`; panics if another subscriber is
/// already installed.
pub fn init() {
    try_init().expect("Failed to set up logger");
}

/// Like [`init`], but returns an `Err` instead of panicking when a
/// subscriber is already installed.
pub fn try_init() -> Result<(), TryInitError> {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|directives| Targets::from_str(&directives).ok())
        .unwrap_or_else(default_targets);

    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_ansi(true)
        .with_filter(filter);

    tracing_subscriber::registry().with(stdout_log).try_init()
}

/// The default filter: transfer progress from the client crates at INFO,
/// every other crate only from WARN up.
fn default_targets() -> Targets {
    CLIENT_TARGETS
        .iter()
        .fold(Targets::new().with_default(Level::WARN), |targets, name| {
            targets.with_target(*name, Level::INFO)
        })
}
