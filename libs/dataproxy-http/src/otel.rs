//! Trace context propagation for outgoing requests.
//!
//! The tracing interceptor opens one span per request and hands it to a
//! [`Tracer`] so the span's context can be written into the request headers.
//! - With the `otel` feature: [`OtelTracer`] uses the global OpenTelemetry
//!   propagator (W3C Trace Context by default)
//! - Without it: [`NoopTracer`] leaves headers untouched

use http::HeaderMap;
use tracing::Span;

/// W3C Trace Context header name
pub const TRACEPARENT: &str = "traceparent";

/// Handle used by the tracing interceptor to propagate span context.
pub trait Tracer: Send + Sync + 'static {
    /// Write the context of `span` into outgoing request headers.
    fn inject(&self, span: &Span, headers: &mut HeaderMap);
}

/// Tracer that propagates nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn inject(&self, _span: &Span, _headers: &mut HeaderMap) {}
}

#[cfg(feature = "otel")]
mod imp {
    use super::Tracer;
    use http::{HeaderMap, HeaderName, HeaderValue};
    use opentelemetry::global;
    use opentelemetry::propagation::Injector;
    use tracing::Span;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    struct HeadersInjector<'a>(&'a mut HeaderMap);

    impl Injector for HeadersInjector<'_> {
        fn set(&mut self, key: &str, value: String) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                self.0.insert(name, value);
            }
        }
    }

    /// Tracer backed by the global OpenTelemetry propagator.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct OtelTracer;

    impl Tracer for OtelTracer {
        fn inject(&self, span: &Span, headers: &mut HeaderMap) {
            let cx = span.context();
            global::get_text_map_propagator(|propagator| {
                propagator.inject_context(&cx, &mut HeadersInjector(headers));
            });
        }
    }
}

#[cfg(feature = "otel")]
pub use imp::OtelTracer;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_noop_tracer_leaves_headers() {
        let mut headers = HeaderMap::new();
        NoopTracer.inject(&Span::none(), &mut headers);
        assert!(headers.is_empty());
    }

    #[cfg(feature = "otel")]
    #[test]
    fn test_otel_tracer_without_active_context_is_harmless() {
        let mut headers = HeaderMap::new();
        OtelTracer.inject(&Span::none(), &mut headers);
        assert!(headers.get(TRACEPARENT).is_none());
    }
}
