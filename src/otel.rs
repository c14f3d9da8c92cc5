// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Context Propagation
//!
//! Messages carry two kinds of trace information:
//!
//! - the `traceId` header, an opaque identifier correlated through retries and
//!   dead-lettering, scoped to the task that processes a delivery;
//! - the OpenTelemetry context, injected into the headers with the global text
//!   map propagator and extracted on delivery to start a consumer span.
//!
//! [`with_trace_id`] and [`current_trace_id`] let application code set and
//! read the identifier that outgoing messages will carry.

use lapin::{
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap, future::Future};
use tracing::error;

tokio::task_local! {
    static TRACE_ID: Option<String>;
}

/// Runs `future` with `trace_id` as the current trace identifier.
///
/// Messages published from inside the future carry it in their `traceId` header.
pub async fn with_trace_id<F: Future>(trace_id: Option<String>, future: F) -> F::Output {
    TRACE_ID.scope(trace_id, future).await
}

/// Returns the trace identifier of the current task.
///
/// Falls back to the trace id of the active OpenTelemetry span, if any.
pub fn current_trace_id() -> Option<String> {
    TRACE_ID
        .try_with(|id| id.clone())
        .ok()
        .flatten()
        .or_else(|| context_trace_id(&Context::current()))
}

fn context_trace_id(ctx: &Context) -> Option<String> {
    let span = ctx.span();
    let span_context = span.span_context();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

/// An adapter for injecting and extracting OpenTelemetry context from RabbitMQ headers.
///
/// This struct implements the OpenTelemetry `Injector` and `Extractor` traits,
/// allowing trace context to be propagated through RabbitMQ message headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    /// Sets a trace context key-value pair in RabbitMQ message headers.
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    /// Gets a trace context value from RabbitMQ message headers.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Injects the current OpenTelemetry context into outgoing headers.
pub(crate) fn inject_context(headers: &mut BTreeMap<ShortString, AMQPValue>) {
    let ctx = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut RabbitMQTracePropagator::new(headers))
    });
}

/// Extracts the OpenTelemetry context carried by a delivery.
pub(crate) fn extract_context(props: &BasicProperties) -> Context {
    let mut headers = crate::message::header_map(props);
    global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
    })
}

/// Creates a new OpenTelemetry span for message processing.
///
/// This function extracts trace context from message properties and
/// creates a new consumer span for processing the message.
///
/// # Returns
/// A tuple containing the trace id to correlate the delivery with (the
/// `traceId` header, or the extracted span's trace id) and the new span
pub(crate) fn new_span(
    props: &BasicProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Option<String>, BoxedSpan) {
    let ctx = extract_context(props);

    let trace_id = crate::message::trace_id(props).or_else(|| context_trace_id(&ctx));

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (trace_id, span)
}
