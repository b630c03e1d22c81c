//! # Instrumented handler
//!
//! Wraps the body of a timer function in exactly one span. The span is
//! started before the body runs, made the current context so that anything
//! logged by the body is correlated with it, and ended by a guard when the
//! body returns, fails or panics.
use crate::config::InvocationContext;
use crate::error::FunctionError;
use crate::timer::TimerInfo;
use crate::trigger::TimerFunction;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, ContextGuard, KeyValue};
use opentelemetry_semantic_conventions::resource::SERVICE_NAME as SERVICE_NAME_KEY;
use std::fmt;

/// Span name of every timer invocation.
pub const OPERATION_NAME: &str = "azure.function.timer";
/// Service the invocation spans are reported under.
///
/// Also the default `service.name` of the resource. When the resource is
/// renamed through `OTEL_SERVICE_NAME`, the span attribute keeps this value
/// unless the handler is built with
/// [`with_service`](InstrumentedHandlerBuilder::with_service).
pub const SERVICE_NAME: &str = "azure-fn-rust";
/// Resource, i.e. the function, the invocation spans are grouped by.
pub const RESOURCE_NAME: &str = "timerTrigger";
/// The line logged once per tick.
pub const TICK_MESSAGE: &str = "Timer tick - trace generated";

const RESOURCE_NAME_KEY: &str = "resource.name";
const FUNCTION_NAME_KEY: &str = "function.name";
const FUNCTION_RUNTIME_KEY: &str = "function.runtime";
const FAAS_TRIGGER_KEY: &str = "faas.trigger";
const FAAS_INVOCATION_ID_KEY: &str = "faas.invocation_id";
const TIMER_PAST_DUE_KEY: &str = "timer.past_due";

/// Names identifying the span of an invocation. None of them depend on the
/// invocation itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanIdentity {
    /// Span name.
    pub operation: String,
    /// Reported service.
    pub service: String,
    /// Reported resource.
    pub resource: String,
}

impl Default for SpanIdentity {
    fn default() -> Self {
        SpanIdentity {
            operation: OPERATION_NAME.to_string(),
            service: SERVICE_NAME.to_string(),
            resource: RESOURCE_NAME.to_string(),
        }
    }
}

/// A timer function body wrapped in a span.
///
/// [`handle`](InstrumentedHandler::handle) runs the default body, which logs
/// [`TICK_MESSAGE`] at INFO. [`invoke`](InstrumentedHandler::invoke) runs any
/// other body under the same span contract.
pub struct InstrumentedHandler<T> {
    tracer: T,
    identity: SpanIdentity,
    tags: Vec<KeyValue>,
}

impl<T> InstrumentedHandler<T>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    /// The handler of the `timerTrigger` function: fixed names and tags
    /// `function.runtime = rust`, `function.name = timerTrigger`.
    pub fn timer_trigger(tracer: T) -> Self {
        InstrumentedHandler::timer_trigger_builder(tracer).build()
    }

    /// A builder preset like [`timer_trigger`](InstrumentedHandler::timer_trigger).
    pub fn timer_trigger_builder(tracer: T) -> InstrumentedHandlerBuilder<T> {
        InstrumentedHandler::builder(tracer).with_tag(KeyValue::new(FUNCTION_NAME_KEY, RESOURCE_NAME))
    }

    /// Starts a builder with the default [`SpanIdentity`] and the
    /// `function.runtime` tag.
    pub fn builder(tracer: T) -> InstrumentedHandlerBuilder<T> {
        InstrumentedHandlerBuilder {
            tracer,
            identity: SpanIdentity::default(),
            tags: vec![KeyValue::new(FUNCTION_RUNTIME_KEY, "rust")],
        }
    }

    /// Names used for every span.
    pub fn identity(&self) -> &SpanIdentity {
        &self.identity
    }

    /// Static tags set on every span.
    pub fn tags(&self) -> &[KeyValue] {
        &self.tags
    }

    /// Runs the default body: one INFO line while the span is current.
    pub fn handle(
        &self,
        timer: &TimerInfo,
        context: &InvocationContext,
    ) -> Result<(), FunctionError> {
        self.invoke(timer, context, log_tick)
    }

    /// Runs `work` inside the invocation span.
    ///
    /// The span ends before this returns on every path. A failure of `work`
    /// sets the span status to error, records the error as an event, and is
    /// returned unchanged.
    pub fn invoke<F>(
        &self,
        timer: &TimerInfo,
        context: &InvocationContext,
        work: F,
    ) -> Result<(), FunctionError>
    where
        F: FnOnce(&TimerInfo) -> Result<(), FunctionError>,
    {
        let active = self.start(timer, context);

        let result = work(timer);
        if let Err(err) = &result {
            let span = active.cx.span();
            span.record_error(&**err);
            span.set_status(Status::error(err.to_string()));
        }

        drop(active);
        result
    }

    fn start(&self, timer: &TimerInfo, context: &InvocationContext) -> ActiveInvocation {
        let mut attributes = Vec::with_capacity(self.tags.len() + 5);
        attributes.push(KeyValue::new(SERVICE_NAME_KEY, self.identity.service.clone()));
        attributes.push(KeyValue::new(RESOURCE_NAME_KEY, self.identity.resource.clone()));
        attributes.extend(self.tags.iter().cloned());
        attributes.push(KeyValue::new(FAAS_TRIGGER_KEY, "timer"));
        attributes.push(KeyValue::new(
            FAAS_INVOCATION_ID_KEY,
            context.invocation_id().to_string(),
        ));
        attributes.push(KeyValue::new(TIMER_PAST_DUE_KEY, timer.is_past_due));

        let span = self
            .tracer
            .span_builder(self.identity.operation.clone())
            .with_kind(SpanKind::Internal)
            .with_attributes(attributes)
            .start(&self.tracer);
        let cx = Context::current_with_span(span);
        let attached = cx.clone().attach();
        ActiveInvocation {
            cx,
            _attached: attached,
        }
    }
}

impl<T> fmt::Debug for InstrumentedHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedHandler")
            .field("identity", &self.identity)
            .field("tags", &self.tags)
            .finish()
    }
}

impl<T> TimerFunction for InstrumentedHandler<T>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    fn call(&self, timer: TimerInfo, context: &InvocationContext) -> Result<(), FunctionError> {
        self.handle(&timer, context)
    }
}

/// Builder for [`InstrumentedHandler`].
pub struct InstrumentedHandlerBuilder<T> {
    tracer: T,
    identity: SpanIdentity,
    tags: Vec<KeyValue>,
}

impl<T> InstrumentedHandlerBuilder<T> {
    /// Overrides the span names.
    pub fn with_identity(mut self, identity: SpanIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Overrides only the reported service, e.g. with
    /// [`Instrumentation::service_name`](crate::Instrumentation::service_name)
    /// so span and resource agree.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.identity.service = service.into();
        self
    }

    /// Adds a static tag. A tag with the same key replaces the earlier one.
    pub fn with_tag(mut self, tag: KeyValue) -> Self {
        self.tags.retain(|existing| existing.key != tag.key);
        self.tags.push(tag);
        self
    }

    /// Builds the handler.
    pub fn build(self) -> InstrumentedHandler<T> {
        InstrumentedHandler {
            tracer: self.tracer,
            identity: self.identity,
            tags: self.tags,
        }
    }
}

impl<T> fmt::Debug for InstrumentedHandlerBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedHandlerBuilder")
            .field("identity", &self.identity)
            .field("tags", &self.tags)
            .finish()
    }
}

/// Keeps the invocation span current and ends it when dropped, including
/// during unwinding.
struct ActiveInvocation {
    cx: Context,
    _attached: ContextGuard,
}

impl Drop for ActiveInvocation {
    fn drop(&mut self) {
        self.cx.span().end();
    }
}

fn log_tick(timer: &TimerInfo) -> Result<(), FunctionError> {
    tracing::info!(target: "function", past_due = timer.is_past_due, "{}", TICK_MESSAGE);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::logs::AnyValue;
    use opentelemetry::trace::{Status, TracerProvider as _};
    use opentelemetry::Value;
    use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
    use opentelemetry_sdk::logs::{InMemoryLogExporter, SdkLoggerProvider};
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    struct Harness {
        spans: InMemorySpanExporter,
        logs: InMemoryLogExporter,
        tracer_provider: SdkTracerProvider,
        logger_provider: SdkLoggerProvider,
    }

    impl Harness {
        fn new() -> Self {
            let spans = InMemorySpanExporter::default();
            let logs = InMemoryLogExporter::default();
            let tracer_provider = SdkTracerProvider::builder()
                .with_simple_exporter(spans.clone())
                .build();
            let logger_provider = SdkLoggerProvider::builder()
                .with_simple_exporter(logs.clone())
                .build();
            Harness {
                spans,
                logs,
                tracer_provider,
                logger_provider,
            }
        }

        // Runs `f` with `tracing` events bridged into the in-memory log exporter.
        fn with_logs<R>(&self, f: impl FnOnce() -> R) -> R {
            let filter = EnvFilter::new("info").add_directive("opentelemetry=off".parse().unwrap());
            let subscriber = tracing_subscriber::registry()
                .with(OpenTelemetryTracingBridge::new(&self.logger_provider).with_filter(filter));
            tracing::subscriber::with_default(subscriber, f)
        }

        fn finished_spans(&self) -> Vec<SpanData> {
            self.spans.get_finished_spans().unwrap()
        }
    }

    fn attribute<'a>(span: &'a SpanData, key: &str) -> Option<&'a Value> {
        span.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    fn timer() -> TimerInfo {
        TimerInfo::new("*/1 * * * * *".parse().unwrap())
    }

    fn context() -> InvocationContext {
        InvocationContext::new(RESOURCE_NAME, "myTimer")
    }

    #[test]
    fn single_invocation_records_one_span_and_one_log() {
        let harness = Harness::new();
        let handler = InstrumentedHandler::timer_trigger(harness.tracer_provider.tracer("handler-test"));

        let result = harness.with_logs(|| handler.handle(&timer(), &context()));
        assert!(result.is_ok());

        let spans = harness.finished_spans();
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.name, OPERATION_NAME);
        assert_eq!(span.span_kind, SpanKind::Internal);
        assert_eq!(span.status, Status::Unset);
        assert_eq!(
            attribute(span, RESOURCE_NAME_KEY),
            Some(&Value::from(RESOURCE_NAME))
        );
        assert_eq!(
            attribute(span, SERVICE_NAME_KEY),
            Some(&Value::from(SERVICE_NAME))
        );
        assert_eq!(attribute(span, FUNCTION_RUNTIME_KEY), Some(&Value::from("rust")));
        assert_eq!(
            attribute(span, FUNCTION_NAME_KEY),
            Some(&Value::from(RESOURCE_NAME))
        );
        assert_eq!(attribute(span, TIMER_PAST_DUE_KEY), Some(&Value::Bool(false)));

        let logs = harness.logs.get_emitted_logs().unwrap();
        assert_eq!(logs.len(), 1);
        let record = &logs[0].record;
        assert!(
            matches!(record.body(), Some(AnyValue::String(body)) if body.as_str() == TICK_MESSAGE)
        );
    }

    #[test]
    fn log_is_emitted_inside_the_span() {
        let harness = Harness::new();
        let handler = InstrumentedHandler::timer_trigger(harness.tracer_provider.tracer("handler-test"));

        harness
            .with_logs(|| handler.handle(&timer(), &context()))
            .unwrap();

        let span = harness.finished_spans().remove(0);
        let logs = harness.logs.get_emitted_logs().unwrap();
        let trace_context = logs[0]
            .record
            .trace_context()
            .expect("log should carry the invocation span context");
        assert_eq!(trace_context.trace_id, span.span_context.trace_id());
        assert_eq!(trace_context.span_id, span.span_context.span_id());

        let observed = logs[0]
            .record
            .observed_timestamp()
            .expect("log should carry an observed timestamp");
        assert!(span.start_time <= observed && observed <= span.end_time);
    }

    #[test]
    fn identity_is_constant_across_invocations() {
        let harness = Harness::new();
        let handler = InstrumentedHandler::timer_trigger(harness.tracer_provider.tracer("handler-test"));

        harness.with_logs(|| {
            for past_due in [false, true, false] {
                handler
                    .handle(&timer().with_past_due(past_due), &context())
                    .unwrap();
            }
        });

        let spans = harness.finished_spans();
        assert_eq!(spans.len(), 3);
        assert_eq!(harness.logs.get_emitted_logs().unwrap().len(), 3);
        for span in &spans {
            assert_eq!(span.name, OPERATION_NAME);
            assert_eq!(
                attribute(span, RESOURCE_NAME_KEY),
                Some(&Value::from(RESOURCE_NAME))
            );
            assert_eq!(
                attribute(span, SERVICE_NAME_KEY),
                Some(&Value::from(SERVICE_NAME))
            );
            assert_eq!(attribute(span, FUNCTION_RUNTIME_KEY), Some(&Value::from("rust")));
        }
        // distinct invocations, distinct spans
        assert_ne!(
            spans[0].span_context.span_id(),
            spans[1].span_context.span_id()
        );
        assert_eq!(attribute(&spans[1], TIMER_PAST_DUE_KEY), Some(&Value::Bool(true)));
    }

    #[test]
    fn failing_work_ends_span_and_propagates_error() {
        let harness = Harness::new();
        let handler = InstrumentedHandler::timer_trigger(harness.tracer_provider.tracer("handler-test"));

        let result = handler.invoke(&timer(), &context(), |_| Err("log sink unavailable".into()));

        let err = result.expect_err("error should propagate");
        assert_eq!(err.to_string(), "log sink unavailable");

        let spans = harness.finished_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, Status::error("log sink unavailable"));
        assert!(spans[0]
            .events
            .events
            .iter()
            .any(|event| event.name == "exception"));
    }

    #[test]
    fn panicking_work_still_ends_span() {
        let harness = Harness::new();
        let handler = InstrumentedHandler::timer_trigger(harness.tracer_provider.tracer("handler-test"));

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            handler.invoke(&timer(), &context(), |_| panic!("boom"))
        }));
        assert!(outcome.is_err());

        let spans = harness.finished_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, OPERATION_NAME);

        // the invocation context must not leak past the handler
        assert!(!Context::current().has_active_span());
    }

    #[test]
    fn span_is_not_current_after_return() {
        let harness = Harness::new();
        let handler = InstrumentedHandler::timer_trigger(harness.tracer_provider.tracer("handler-test"));

        let mut inside = None;
        handler
            .invoke(&timer(), &context(), |_| {
                inside = Some(Context::current().span().span_context().span_id());
                Ok(())
            })
            .unwrap();

        let spans = harness.finished_spans();
        assert_eq!(inside, Some(spans[0].span_context.span_id()));
        assert!(!Context::current().has_active_span());
    }

    #[test]
    fn custom_identity_and_tags() {
        let harness = Harness::new();
        let handler = InstrumentedHandler::builder(harness.tracer_provider.tracer("custom"))
            .with_identity(SpanIdentity {
                operation: "nightly.cleanup".into(),
                service: "maintenance".into(),
                resource: "cleanup".into(),
            })
            .with_tag(KeyValue::new(FUNCTION_RUNTIME_KEY, "rust-musl"))
            .with_tag(KeyValue::new("team", "storage"))
            .build();
        assert_eq!(handler.tags().len(), 2);

        handler.invoke(&timer(), &context(), |_| Ok(())).unwrap();

        let span = harness.finished_spans().remove(0);
        assert_eq!(span.name, "nightly.cleanup");
        assert_eq!(attribute(&span, RESOURCE_NAME_KEY), Some(&Value::from("cleanup")));
        assert_eq!(
            attribute(&span, FUNCTION_RUNTIME_KEY),
            Some(&Value::from("rust-musl"))
        );
        assert_eq!(attribute(&span, "team"), Some(&Value::from("storage")));
    }

    #[test]
    fn service_follows_the_resource_when_overridden() {
        let harness = Harness::new();
        let handler = InstrumentedHandler::timer_trigger_builder(harness.tracer_provider.tracer("service"))
            .with_service("billing-timers")
            .build();
        assert_eq!(handler.identity().operation, OPERATION_NAME);
        assert_eq!(handler.identity().resource, RESOURCE_NAME);

        handler.handle(&timer(), &context()).unwrap();

        let span = harness.finished_spans().remove(0);
        assert_eq!(
            attribute(&span, SERVICE_NAME_KEY),
            Some(&Value::from("billing-timers"))
        );
        assert_eq!(
            attribute(&span, FUNCTION_NAME_KEY),
            Some(&Value::from(RESOURCE_NAME))
        );
    }
}
