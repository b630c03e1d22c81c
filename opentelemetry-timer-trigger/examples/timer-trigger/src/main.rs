use opentelemetry_timer_trigger::{
    initialize_instrumentation, InstrumentationSettings, InstrumentedHandler, TimerTrigger,
    TimerTriggerConfig, RESOURCE_NAME,
};
use std::error::Error;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync + 'static>> {
    // Must precede everything else so the first span and log line are exported.
    let instrumentation = initialize_instrumentation(&InstrumentationSettings::from_env())?;

    let config = TimerTriggerConfig::from_function_json(RESOURCE_NAME, include_str!("../function.json"))?;
    info!(
        target: "timer-trigger",
        function = config.function_name(),
        schedule = %config.schedule(),
        "Timer function loaded"
    );

    let handler = InstrumentedHandler::timer_trigger_builder(instrumentation.tracer())
        .with_service(instrumentation.service_name())
        .build();
    let summary = TimerTrigger::new(config, handler)
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(target: "timer-trigger", error = %err, "Unable to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;
    info!(
        target: "timer-trigger",
        invocations = summary.invocations,
        failures = summary.failures,
        "Timer function stopped"
    );

    instrumentation.shutdown()?;
    Ok(())
}
