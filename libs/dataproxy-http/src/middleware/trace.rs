use super::Middleware;
use crate::options::Options;
use crate::otel::Tracer;
use crate::transport::BoxTransport;
use http::{Request, Response};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};
use tracing::Instrument;
use tracing::field::Empty;

pub const TRACING_MIDDLEWARE_NAME: &str = "tracing";

/// Opens an `HTTP Outgoing Request` span around every round trip and
/// propagates its context through the [`Tracer`].
#[derive(Clone)]
pub struct TracingMiddleware {
    tracer: Arc<dyn Tracer>,
}

impl TracingMiddleware {
    #[must_use]
    pub fn new(tracer: Arc<dyn Tracer>) -> Self {
        Self { tracer }
    }
}

impl Middleware for TracingMiddleware {
    fn name(&self) -> &str {
        TRACING_MIDDLEWARE_NAME
    }

    fn wrap(&self, opts: &Options, next: BoxTransport) -> BoxTransport {
        TracingLayer::new(Arc::clone(&self.tracer), opts)
            .layer(next)
            .boxed_clone()
    }
}

#[derive(Clone)]
pub struct TracingLayer {
    tracer: Arc<dyn Tracer>,
    datasource: Option<Arc<str>>,
    labels: Arc<BTreeMap<String, String>>,
}

impl TracingLayer {
    #[must_use]
    pub fn new(tracer: Arc<dyn Tracer>, opts: &Options) -> Self {
        Self {
            tracer,
            datasource: opts.datasource_name().map(Arc::from),
            labels: Arc::new(opts.labels.clone()),
        }
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService {
            inner,
            layer: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TracingService<S> {
    inner: S,
    layer: TracingLayer,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TracingService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: std::fmt::Display + Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let uri = req.uri();
        // Query strings may carry credentials.
        let url = format!(
            "{}://{}{}",
            uri.scheme_str().unwrap_or("http"),
            uri.authority().map_or("", http::uri::Authority::as_str),
            uri.path()
        );

        let span = tracing::info_span!(
            "HTTP Outgoing Request",
            otel.kind = "client",
            http.method = %req.method(),
            http.url = %url,
            datasource.name = self.layer.datasource.as_deref().unwrap_or(""),
            labels = ?self.layer.labels,
            http.status_code = Empty,
            http.content_length = Empty,
            otel.status_code = Empty,
            error = Empty,
        );
        self.layer.tracer.inject(&span, req.headers_mut());

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let result = inner.call(req).instrument(span.clone()).await;

            match &result {
                Ok(response) => {
                    let status = response.status();
                    span.record("http.status_code", status.as_u16());
                    if status.as_u16() >= 400 {
                        span.record("otel.status_code", "ERROR");
                    }
                    let content_length = response
                        .headers()
                        .get(http::header::CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .filter(|len| *len > 0);
                    if let Some(len) = content_length {
                        span.record("http.content_length", len);
                    }
                    tracing::debug!(
                        parent: &span,
                        status = status.as_u16(),
                        "outgoing request completed"
                    );
                }
                Err(e) => {
                    span.record("error", true);
                    span.record("otel.status_code", "ERROR");
                    tracing::debug!(parent: &span, error = %e, "outgoing request failed");
                }
            }

            result
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::middleware::test_support::{failing_transport, recording_transport, request};
    use crate::options::DATASOURCE_NAME_LABEL;
    use http::{HeaderMap, HeaderValue};
    use tracing::Span;
    use tracing_test::traced_test;

    /// Writes a fixed traceparent so propagation is observable.
    struct FixedTracer;

    impl Tracer for FixedTracer {
        fn inject(&self, _span: &Span, headers: &mut HeaderMap) {
            headers.insert(
                crate::otel::TRACEPARENT,
                HeaderValue::from_static("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
            );
        }
    }

    #[traced_test]
    #[tokio::test]
    async fn test_span_and_propagation() {
        let (base, seen) = recording_transport();
        let opts = Options::new().with_label(DATASOURCE_NAME_LABEL, "loki");
        let service = TracingMiddleware::new(Arc::new(FixedTracer)).wrap(&opts, base);

        let response = service
            .oneshot(request("http://example.com/api/v1/query?token=secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        assert!(seen.lock()[0].headers.contains_key(crate::otel::TRACEPARENT));
        assert!(logs_contain("HTTP Outgoing Request"));
        assert!(logs_contain("http://example.com/api/v1/query"));
        assert!(logs_contain("outgoing request completed"));
        assert!(!logs_contain("token=secret"));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_transport_error_is_marked() {
        let service = TracingMiddleware::new(Arc::new(crate::otel::NoopTracer))
            .wrap(&Options::new(), failing_transport());

        let err = service.oneshot(request("http://example.com/")).await.unwrap_err();
        assert!(matches!(err, crate::error::HttpError::Transport(_)));
        assert!(logs_contain("outgoing request failed"));
    }
}
