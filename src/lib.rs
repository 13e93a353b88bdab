//! Run a ChartMuseum-style chart repository on AWS Lambda.
//!
//! API Gateway hands us each HTTP request as a JSON "proxy event" rather than
//! a socket. This crate turns those events into ordinary in-process
//! `http::Request`s, runs them through an already-configured
//! [`RequestHandler`](handler::RequestHandler), and turns the buffered
//! response back into the proxy result shape, base64-encoding chart
//! downloads on the way out.
//!
//! The handler is built concurrently with the first invocation (see
//! [`bootstrap`]), so every invocation first waits on the [`Adapter`]'s
//! [`ReadinessGate`].
//!
//! The library is compiled into two executables: `chartmuseum-lambda`, the
//! actual Lambda entry point, and `chartmuseum-lambda-oneshot`, which runs a
//! single event from the command line for local testing.

use tracing_subscriber::EnvFilter;

pub mod adapter;
pub mod bootstrap;
pub mod config;
pub mod dispatch;
pub mod gate;
pub mod handler;
pub mod repo;
pub mod storage;
pub mod translate;

pub use adapter::Adapter;
pub use gate::ReadinessGate;

use config::LogConfig;

/// Set up `tracing` output for CloudWatch.
///
/// `RUST_LOG`, if set, overrides the level implied by `LOG_LEVEL`/`DEBUG`.
pub fn init_logging(log: &LogConfig) {
    let default_level = if log.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false) // don't print the module name
        .without_time(); // don't print time (CloudWatch has it)

    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
