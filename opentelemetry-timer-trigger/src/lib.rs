//! # OpenTelemetry Timer Trigger
//!
//! Runs a function on a fixed NCRONTAB cadence and makes every invocation
//! observable: each call is wrapped in exactly one span, and the function's
//! log line is emitted while that span is current so log and trace correlate.
//!
//! The moving parts:
//!
//! * [`initialize_instrumentation`] installs the tracer provider, the logger
//!   provider and the `tracing` subscriber. Call it first thing in `main`.
//! * [`Schedule`] parses six-field NCRONTAB expressions (or `hh:mm:ss`
//!   intervals) and computes the next occurrence.
//! * [`InstrumentedHandler`] is the function body: span, tags, one log line.
//! * [`TimerTrigger`] fires the function whenever the schedule is due.
//!
//! ## Example
//!
//! ```no_run
//! use opentelemetry_timer_trigger::{
//!     initialize_instrumentation, InstrumentationSettings, InstrumentedHandler, Schedule,
//!     TimerTrigger, TimerTriggerConfig,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
//!     let instrumentation = initialize_instrumentation(&InstrumentationSettings::from_env())?;
//!
//!     let schedule: Schedule = "*/1 * * * * *".parse()?;
//!     let config = TimerTriggerConfig::builder("timerTrigger", schedule)
//!         .with_run_on_startup(true)
//!         .build();
//!     let handler = InstrumentedHandler::timer_trigger(instrumentation.tracer());
//!
//!     let runtime = tokio::runtime::Runtime::new()?;
//!     runtime.block_on(TimerTrigger::new(config, handler).run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }));
//!
//!     instrumentation.shutdown()?;
//!     Ok(())
//! }
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

#[macro_use]
mod internal_logging;

mod config;
mod error;
mod handler;
mod instrumentation;
mod schedule;
mod timer;
mod trigger;

pub use config::{
    InvocationContext, TimerTriggerConfig, TimerTriggerConfigBuilder, DEFAULT_BINDING_NAME,
};
pub use error::{ConfigError, FunctionError, InstrumentationError, ScheduleError};
pub use handler::{
    InstrumentedHandler, InstrumentedHandlerBuilder, SpanIdentity, OPERATION_NAME, RESOURCE_NAME,
    SERVICE_NAME, TICK_MESSAGE,
};
pub use instrumentation::{
    initialize_instrumentation, is_initialized, ExporterKind, Instrumentation,
    InstrumentationSettings,
};
pub use schedule::{CronSchedule, Schedule};
pub use timer::{ScheduleStatus, TimerInfo};
pub use trigger::{TimerFunction, TimerTrigger, TriggerSummary};
