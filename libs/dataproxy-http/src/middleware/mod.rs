//! Interceptors.
//!
//! Each interceptor is a named [`Middleware`] that turns the next transport
//! into a new one. It may wrap `next` in a tower layer or return it unchanged
//! when the [`Options`] it is bound with do not activate it.
//!
//! [`chain`] folds an ordered list around a base transport: the first entry
//! becomes the outermost layer and sees the request first, the last entry
//! sits next to the wire.

mod basic_auth;
mod custom_headers;
mod datasource_metrics;
mod http_logger;
mod response_limit;
mod sigv4;
mod trace;
mod user_agent;

pub use basic_auth::{BASIC_AUTH_MIDDLEWARE_NAME, BasicAuthLayer, BasicAuthMiddleware};
pub use custom_headers::{
    CUSTOM_HEADERS_MIDDLEWARE_NAME, CustomHeadersLayer, CustomHeadersMiddleware,
};
pub use datasource_metrics::{
    DatasourceMetricNames, METRICS_MIDDLEWARE_NAME, MetricsLayer, MetricsMiddleware,
};
pub use http_logger::{HTTP_LOGGER_MIDDLEWARE_NAME, HttpLoggerLayer, HttpLoggerMiddleware};
pub use response_limit::{
    LimitedBody, RESPONSE_LIMIT_MIDDLEWARE_NAME, ResponseLimitLayer, ResponseLimitMiddleware,
};
pub use sigv4::{
    SIGV4_MIDDLEWARE_NAME, SigV4AuthType, SigV4Config, SigV4Error, SigV4Layer, SigV4Middleware,
    SigningCredentials,
};
pub use trace::{TRACING_MIDDLEWARE_NAME, TracingLayer, TracingMiddleware};
pub use user_agent::{USER_AGENT_MIDDLEWARE_NAME, UserAgentLayer, UserAgentMiddleware};

use crate::options::Options;
use crate::transport::BoxTransport;
use std::sync::Arc;

/// A named transport decorator.
///
/// `wrap` must not fail: an interceptor that cannot activate for the given
/// options returns `next` unchanged.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn wrap(&self, opts: &Options, next: BoxTransport) -> BoxTransport;
}

/// Middleware built from a closure, for one-off decorators.
pub struct NamedMiddleware<F> {
    name: String,
    wrap: F,
}

impl<F> NamedMiddleware<F>
where
    F: Fn(&Options, BoxTransport) -> BoxTransport + Send + Sync,
{
    pub fn new(name: impl Into<String>, wrap: F) -> Self {
        Self {
            name: name.into(),
            wrap,
        }
    }
}

impl<F> Middleware for NamedMiddleware<F>
where
    F: Fn(&Options, BoxTransport) -> BoxTransport + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn wrap(&self, opts: &Options, next: BoxTransport) -> BoxTransport {
        (self.wrap)(opts, next)
    }
}

/// Bind `middlewares` around `base`, first entry outermost.
#[must_use]
pub fn chain(
    middlewares: &[Arc<dyn Middleware>],
    opts: &Options,
    base: BoxTransport,
) -> BoxTransport {
    middlewares
        .iter()
        .rev()
        .fold(base, |next, middleware| middleware.wrap(opts, next))
}


#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::test_support::{recording_transport, request};
    use super::*;
    use http::HeaderValue;
    use tower::{ServiceExt, service_fn};

    /// Appends its name to an `x-order` header.
    fn marker(name: &'static str) -> Arc<dyn Middleware> {
        Arc::new(NamedMiddleware::new(name, move |_opts: &Options, next: BoxTransport| {
            service_fn(move |mut req: http::Request<http_body_util::Full<bytes::Bytes>>| {
                req.headers_mut()
                    .append("x-order", HeaderValue::from_static(name));
                next.clone().oneshot(req)
            })
            .boxed_clone()
        }))
    }

    #[tokio::test]
    async fn test_chain_first_entry_is_outermost() {
        let (base, seen) = recording_transport();
        let middlewares = vec![marker("outer"), marker("middle"), marker("inner")];
        let service = chain(&middlewares, &Options::new(), base);

        service.oneshot(request("http://example.com/")).await.unwrap();

        let seen = seen.lock();
        let order: Vec<_> = seen[0]
            .headers
            .get_all("x-order")
            .iter()
            .map(|v| v.to_str().unwrap().to_owned())
            .collect();
        assert_eq!(order, ["outer", "middle", "inner"]);
    }

    #[tokio::test]
    async fn test_empty_chain_is_base() {
        let (base, seen) = recording_transport();
        let service = chain(&[], &Options::new(), base);
        let response = service.oneshot(request("http://example.com/")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(seen.lock().len(), 1);
    }
}
