#![allow(unused_macros)]
//! Diagnostics emitted by the trigger runner and the instrumentation setup.
//!
//! Every event carries an explicit `name` and uses the crate name as target,
//! so it can be filtered independently of application logs. These are not
//! meant for function code: the function's own log line goes through
//! `tracing::info!` directly.

// TODO: Remove `name` attribute duplication in logging macros below once `tracing::Fmt` supports displaying `name`.
// See issue: https://github.com/tokio-rs/tracing/issues/2774
macro_rules! trigger_info {
    (name: $name:expr $(,)?) => {
        tracing::info!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        tracing::info!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = $value),+);
    };
}

macro_rules! trigger_warn {
    (name: $name:expr $(,)?) => {
        tracing::warn!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        tracing::warn!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = $value),+);
    };
}

macro_rules! trigger_debug {
    (name: $name:expr $(,)?) => {
        tracing::debug!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        tracing::debug!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = $value),+);
    };
}

macro_rules! trigger_error {
    (name: $name:expr $(,)?) => {
        tracing::error!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        tracing::error!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = $value),+);
    };
}
