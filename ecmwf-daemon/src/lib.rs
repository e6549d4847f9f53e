//! Background transfer daemon for the ECMWF data-retrieval API.
//!
//! The daemon owns a TCP command server on port 54500 speaking a
//! length-framed JSON protocol: clients queue transfer requests, list
//! active and completed transfers, cancel queued ones, and stop the
//! daemon. Queued transfers run through a worker pool driving
//! [`ecmwf_api::Client`], so transfers outlive the CLI invocations that
//! submitted them. Nothing is persisted: a daemon restart loses queued
//! and completed state.

pub mod error;
pub mod framed;
pub mod protocol;
pub mod run;
pub mod shutdown;
pub mod store;

mod handler;
mod server;
mod worker;

pub use run::{Daemon, DaemonConfig, DEFAULT_PORT};
