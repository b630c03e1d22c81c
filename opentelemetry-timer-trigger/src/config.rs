//! # Trigger configuration
//!
//! A timer trigger is registered with a function name, a schedule, the name
//! of the binding the [`TimerInfo`](crate::TimerInfo) is delivered under, and
//! whether it fires once on startup. Either build it in code with
//! [`TimerTriggerConfig::builder`], or load a `function.json` document:
//!
//! ```json
//! {
//!   "bindings": [
//!     {
//!       "name": "myTimer",
//!       "type": "timerTrigger",
//!       "direction": "in",
//!       "schedule": "*/1 * * * * *",
//!       "runOnStartup": true
//!     }
//!   ]
//! }
//! ```
//!
//! A schedule of the form `%Name%` is read from the environment variable
//! `Name`, so the cadence can change without editing the document.
use crate::error::ConfigError;
use crate::schedule::Schedule;
use serde::Deserialize;
use std::env;
use std::path::Path;
use uuid::Uuid;

const TIMER_BINDING_TYPE: &str = "timerTrigger";

/// Default binding name of the timer parameter.
pub const DEFAULT_BINDING_NAME: &str = "myTimer";

/// Registration metadata of a timer-triggered function.
#[derive(Clone, Debug, PartialEq)]
pub struct TimerTriggerConfig {
    function_name: String,
    binding_name: String,
    schedule: Schedule,
    run_on_startup: bool,
    disabled: bool,
}

impl TimerTriggerConfig {
    /// Starts a builder for `function_name` firing on `schedule`.
    pub fn builder(function_name: impl Into<String>, schedule: Schedule) -> TimerTriggerConfigBuilder {
        TimerTriggerConfigBuilder {
            config: TimerTriggerConfig {
                function_name: function_name.into(),
                binding_name: DEFAULT_BINDING_NAME.to_string(),
                schedule,
                run_on_startup: false,
                disabled: false,
            },
        }
    }

    /// Parses a `function.json` document for `function_name`.
    pub fn from_function_json(
        function_name: impl Into<String>,
        json: &str,
    ) -> Result<Self, ConfigError> {
        let function_name = function_name.into();
        let document: FunctionDocument = serde_json::from_str(json)?;

        let binding = document
            .bindings
            .into_iter()
            .find(|binding| binding.binding_type == TIMER_BINDING_TYPE)
            .ok_or_else(|| ConfigError::MissingTimerBinding(function_name.clone()))?;
        let expression = binding
            .schedule
            .ok_or_else(|| ConfigError::MissingSchedule(binding.name.clone()))?;
        let schedule: Schedule = resolve_app_setting(&expression)?.parse()?;

        Ok(TimerTriggerConfig {
            function_name,
            binding_name: binding.name,
            schedule,
            run_on_startup: binding.run_on_startup,
            disabled: document.disabled,
        })
    }

    /// Reads and parses a `function.json` file. The function is named after
    /// the directory containing the file, as function hosts lay them out.
    pub fn from_function_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let function_name = path
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_function_json(function_name, &json)
    }

    /// The function name, used for the invocation context.
    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Name under which the timer payload is delivered.
    pub fn binding_name(&self) -> &str {
        &self.binding_name
    }

    /// When the trigger fires.
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Whether one extra invocation fires as soon as the trigger starts.
    pub fn run_on_startup(&self) -> bool {
        self.run_on_startup
    }

    /// Whether the function is switched off.
    pub fn disabled(&self) -> bool {
        self.disabled
    }
}

/// Builder for [`TimerTriggerConfig`].
#[derive(Clone, Debug)]
pub struct TimerTriggerConfigBuilder {
    config: TimerTriggerConfig,
}

impl TimerTriggerConfigBuilder {
    /// Sets the binding name, [`DEFAULT_BINDING_NAME`] by default.
    pub fn with_binding_name(mut self, binding_name: impl Into<String>) -> Self {
        self.config.binding_name = binding_name.into();
        self
    }

    /// Fires one extra invocation on startup. Off by default.
    pub fn with_run_on_startup(mut self, run_on_startup: bool) -> Self {
        self.config.run_on_startup = run_on_startup;
        self
    }

    /// Switches the function off.
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.config.disabled = disabled;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> TimerTriggerConfig {
        self.config
    }
}

/// Per-invocation metadata passed next to the [`TimerInfo`](crate::TimerInfo).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvocationContext {
    invocation_id: Uuid,
    function_name: String,
    binding_name: String,
}

impl InvocationContext {
    /// Creates a context with a fresh invocation id.
    pub fn new(function_name: impl Into<String>, binding_name: impl Into<String>) -> Self {
        InvocationContext {
            invocation_id: Uuid::new_v4(),
            function_name: function_name.into(),
            binding_name: binding_name.into(),
        }
    }

    pub(crate) fn for_trigger(config: &TimerTriggerConfig) -> Self {
        Self::new(config.function_name(), config.binding_name())
    }

    /// Unique id of this invocation.
    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    /// Name of the invoked function.
    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Name under which the timer payload was delivered.
    pub fn binding_name(&self) -> &str {
        &self.binding_name
    }
}

#[derive(Deserialize)]
struct FunctionDocument {
    #[serde(default)]
    bindings: Vec<BindingDocument>,
    #[serde(default)]
    disabled: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindingDocument {
    #[serde(rename = "type")]
    binding_type: String,
    name: String,
    schedule: Option<String>,
    #[serde(default)]
    run_on_startup: bool,
}

fn resolve_app_setting(expression: &str) -> Result<String, ConfigError> {
    let trimmed = expression.trim();
    match trimmed
        .strip_prefix('%')
        .and_then(|rest| rest.strip_suffix('%'))
    {
        Some(setting) if !setting.is_empty() => {
            env::var(setting).map_err(|_| ConfigError::UnresolvedSetting(setting.to_string()))
        }
        _ => Ok(trimmed.to_string()),
    }
}
