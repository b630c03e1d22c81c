//! Errors for schedule parsing, trigger configuration and instrumentation setup.
//!
//! Function bodies are free to fail with anything; their errors travel as
//! [`FunctionError`] and are handed back to the caller untouched.
use opentelemetry_sdk::error::OTelSdkError;
use std::sync::PoisonError;
use thiserror::Error;

/// Error returned by a timer function body.
pub type FunctionError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while parsing a schedule expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ScheduleError {
    /// The expression does not have the six NCRONTAB fields.
    #[error("expected 6 fields in schedule `{expression}`, found {found}")]
    FieldCount {
        /// The offending expression.
        expression: String,
        /// Number of whitespace separated fields found.
        found: usize,
    },

    /// A field item is neither a number, a known name, `*` nor a range.
    #[error("invalid value `{value}` in {field} field")]
    InvalidValue {
        /// Field name, e.g. `minute`.
        field: &'static str,
        /// The raw item text.
        value: String,
    },

    /// A value is outside of what the field allows.
    #[error("{value} is out of range for {field} field ({min}-{max})")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// The parsed value.
        value: u32,
        /// Smallest allowed value.
        min: u32,
        /// Largest allowed value.
        max: u32,
    },

    /// A range whose start is after its end, e.g. `10-5`.
    #[error("range {start}-{end} in {field} field is reversed")]
    ReversedRange {
        /// Field name.
        field: &'static str,
        /// Range start.
        start: u32,
        /// Range end.
        end: u32,
    },

    /// A step of zero, e.g. `*/0`.
    #[error("step must be greater than zero in {field} field")]
    ZeroStep {
        /// Field name.
        field: &'static str,
    },

    /// A `hh:mm:ss` interval that cannot be parsed or is zero.
    #[error("invalid interval `{0}`, expected a non-zero hh:mm:ss value")]
    InvalidInterval(String),
}

/// Errors raised while building a [`TimerTriggerConfig`](crate::TimerTriggerConfig).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read function configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration document is not valid JSON for a function.
    #[error("failed to parse function configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// No binding of type `timerTrigger` was declared.
    #[error("function `{0}` declares no timerTrigger binding")]
    MissingTimerBinding(String),

    /// The timer binding has no `schedule`.
    #[error("timer binding `{0}` has no schedule")]
    MissingSchedule(String),

    /// A `%Setting%` schedule refers to an unset environment variable.
    #[error("app setting `{0}` referenced by the schedule is not set")]
    UnresolvedSetting(String),

    /// The schedule expression is invalid.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Errors raised while installing or tearing down instrumentation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InstrumentationError {
    /// An exporter could not be constructed.
    #[error("failed to build {signal} exporter: {reason}")]
    Exporter {
        /// `traces` or `logs`.
        signal: &'static str,
        /// Underlying failure.
        reason: String,
    },

    /// The settings name an exporter this build does not support.
    #[error("unsupported exporter `{0}`")]
    UnsupportedExporter(String),

    /// A global `tracing` subscriber was installed by someone else.
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),

    /// Another thread panicked while holding the initialization lock.
    #[error("instrumentation lock poisoned: {0}")]
    Poisoned(String),

    /// Flushing or shutting down a provider failed.
    #[error(transparent)]
    Shutdown(#[from] OTelSdkError),
}

impl<T> From<PoisonError<T>> for InstrumentationError {
    fn from(err: PoisonError<T>) -> Self {
        InstrumentationError::Poisoned(err.to_string())
    }
}
