//! # Trigger runner
//!
//! Fires a [`TimerFunction`] whenever its schedule is due. Invocations never
//! overlap: the runner waits for one to finish before planning the next.
//! When an invocation overruns one or more occurrences, the first missed
//! occurrence fires immediately as past due and the rest are skipped.
use crate::config::{InvocationContext, TimerTriggerConfig};
use crate::error::FunctionError;
use crate::schedule::Schedule;
use crate::timer::{ScheduleStatus, TimerInfo};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::field::display;

/// A function invoked by a [`TimerTrigger`].
///
/// Implemented for closures taking the timer payload and the invocation
/// context, and for [`InstrumentedHandler`](crate::InstrumentedHandler).
pub trait TimerFunction: Send + Sync + 'static {
    /// Handles one firing.
    fn call(&self, timer: TimerInfo, context: &InvocationContext) -> Result<(), FunctionError>;
}

impl<F> TimerFunction for F
where
    F: Fn(TimerInfo, &InvocationContext) -> Result<(), FunctionError> + Send + Sync + 'static,
{
    fn call(&self, timer: TimerInfo, context: &InvocationContext) -> Result<(), FunctionError> {
        self(timer, context)
    }
}

/// Counters reported when a trigger stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TriggerSummary {
    /// Invocations started.
    pub invocations: u64,
    /// Invocations that returned an error or panicked.
    pub failures: u64,
}

/// Runs a timer function on its schedule.
#[derive(Debug)]
pub struct TimerTrigger<F> {
    config: TimerTriggerConfig,
    function: Arc<F>,
}

impl<F: TimerFunction> TimerTrigger<F> {
    /// Binds `function` to the trigger described by `config`.
    pub fn new(config: TimerTriggerConfig, function: F) -> Self {
        TimerTrigger {
            config,
            function: Arc::new(function),
        }
    }

    /// Fires the function on schedule until `shutdown` completes or the
    /// schedule has no further occurrences.
    ///
    /// Shutdown is observed between invocations; an invocation in flight runs
    /// to completion.
    pub async fn run_until<S>(self, shutdown: S) -> TriggerSummary
    where
        S: Future<Output = ()>,
    {
        let mut summary = TriggerSummary::default();
        let schedule = self.config.schedule().clone();

        if self.config.disabled() {
            trigger_info!(
                name: "TimerTrigger.Disabled",
                function = self.config.function_name().to_string(),
            );
            return summary;
        }

        trigger_info!(
            name: "TimerTrigger.Started",
            function = self.config.function_name().to_string(),
            schedule = schedule.to_string(),
            run_on_startup = self.config.run_on_startup(),
        );

        tokio::pin!(shutdown);
        let mut last: Option<DateTime<Utc>> = None;
        let mut anchor = Utc::now();

        if self.config.run_on_startup() {
            let timer = TimerInfo::new(schedule.clone()).with_schedule_status(ScheduleStatus {
                last: None,
                next: schedule.next_after(anchor),
                last_updated: anchor,
            });
            self.fire(timer, &mut summary).await;
            // occurrences elapsed during the startup invocation are not past due
            anchor = Utc::now();
        }

        loop {
            let now = Utc::now();
            let Some(tick) = plan_tick(&schedule, anchor, now) else {
                trigger_warn!(
                    name: "TimerTrigger.NoFurtherOccurrences",
                    function = self.config.function_name().to_string(),
                    schedule = schedule.to_string(),
                );
                break;
            };

            let wait = (tick.scheduled - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let fired_at = Utc::now();
            let timer = TimerInfo::new(schedule.clone())
                .with_past_due(tick.past_due)
                .with_schedule_status(ScheduleStatus {
                    last,
                    next: schedule.next_after(tick.scheduled),
                    last_updated: fired_at,
                });
            self.fire(timer, &mut summary).await;

            last = Some(tick.scheduled);
            anchor = tick.next_anchor(fired_at);
        }

        trigger_info!(
            name: "TimerTrigger.Stopped",
            function = self.config.function_name().to_string(),
            invocations = summary.invocations,
            failures = summary.failures,
        );
        summary
    }

    async fn fire(&self, timer: TimerInfo, summary: &mut TriggerSummary) {
        let context = InvocationContext::for_trigger(&self.config);
        let invocation_id = context.invocation_id();
        trigger_debug!(
            name: "TimerTrigger.Invoking",
            function = self.config.function_name().to_string(),
            invocation_id = display(invocation_id),
            past_due = timer.is_past_due,
        );

        summary.invocations += 1;
        let function = Arc::clone(&self.function);
        let outcome =
            tokio::task::spawn_blocking(move || function.call(timer, &context)).await;

        match outcome {
            Ok(Ok(())) => {
                trigger_debug!(
                    name: "TimerTrigger.Completed",
                    invocation_id = display(invocation_id),
                );
            }
            Ok(Err(err)) => {
                summary.failures += 1;
                trigger_error!(
                    name: "TimerTrigger.InvocationFailed",
                    function = self.config.function_name().to_string(),
                    invocation_id = display(invocation_id),
                    error = format!("{err}"),
                );
            }
            Err(join_error) => {
                summary.failures += 1;
                trigger_error!(
                    name: "TimerTrigger.InvocationPanicked",
                    function = self.config.function_name().to_string(),
                    invocation_id = display(invocation_id),
                    error = format!("{join_error}"),
                );
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Tick {
    scheduled: DateTime<Utc>,
    past_due: bool,
}

impl Tick {
    /// Where planning resumes once this tick has fired at `fired_at`.
    ///
    /// An on-time tick keeps the cadence anchored on its scheduled instant,
    /// so wake-up latency does not accumulate on interval schedules. A past
    /// due tick re-anchors at the fire time, skipping what it coalesced.
    fn next_anchor(&self, fired_at: DateTime<Utc>) -> DateTime<Utc> {
        if self.past_due {
            self.scheduled.max(fired_at)
        } else {
            self.scheduled
        }
    }
}

/// Picks the occurrence following `anchor`. If it is already behind `now`
/// it fires right away as past due.
fn plan_tick(schedule: &Schedule, anchor: DateTime<Utc>, now: DateTime<Utc>) -> Option<Tick> {
    let scheduled = schedule.next_after(anchor)?;
    Some(Tick {
        scheduled,
        past_due: scheduled <= now,
    })
}
