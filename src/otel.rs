// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels through message headers: the producer injects the
//! current context before publishing and the consumer extracts it to open a
//! consumer span per delivery.

use crate::transport::Headers;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// An adapter for injecting and extracting OpenTelemetry context from message headers.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Headers carrying the given context.
pub(crate) fn inject_headers(ctx: &Context) -> Headers {
    let mut headers = Headers::default();

    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(&mut headers))
    });

    headers
}

/// Creates a consumer span parented on the context found in `headers`.
pub(crate) fn new_span(headers: &mut Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
