use super::Middleware;
use crate::options::Options;
use crate::transport::BoxTransport;
use http::{HeaderValue, Request};
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};

pub const USER_AGENT_MIDDLEWARE_NAME: &str = "user-agent";

/// Stamps a fixed `User-Agent` on every request.
///
/// An empty or invalid value disables the interceptor.
#[derive(Debug, Clone)]
pub struct UserAgentMiddleware {
    user_agent: Option<HeaderValue>,
}

impl UserAgentMiddleware {
    #[must_use]
    pub fn new(user_agent: &str) -> Self {
        let user_agent = if user_agent.is_empty() {
            None
        } else {
            HeaderValue::from_str(user_agent)
                .inspect_err(|e| {
                    tracing::warn!(user_agent, error = %e, "invalid user agent, not setting it");
                })
                .ok()
        };
        Self { user_agent }
    }
}

impl Middleware for UserAgentMiddleware {
    fn name(&self) -> &str {
        USER_AGENT_MIDDLEWARE_NAME
    }

    fn wrap(&self, _opts: &Options, next: BoxTransport) -> BoxTransport {
        match &self.user_agent {
            Some(value) => UserAgentLayer::new(value.clone()).layer(next).boxed_clone(),
            None => next,
        }
    }
}

/// Tower layer that sets the `User-Agent` header, replacing any existing one
#[derive(Clone)]
pub struct UserAgentLayer {
    user_agent: HeaderValue,
}

impl UserAgentLayer {
    #[must_use]
    pub fn new(user_agent: HeaderValue) -> Self {
        Self { user_agent }
    }
}

impl<S> Layer<S> for UserAgentLayer {
    type Service = UserAgentService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UserAgentService {
            inner,
            user_agent: self.user_agent.clone(),
        }
    }
}

#[derive(Clone)]
pub struct UserAgentService<S> {
    inner: S,
    user_agent: HeaderValue,
}

impl<S, ReqBody> Service<Request<ReqBody>> for UserAgentService<S>
where
    S: Service<Request<ReqBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        req.headers_mut()
            .insert(http::header::USER_AGENT, self.user_agent.clone());
        self.inner.call(req)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::middleware::test_support::{recording_transport, request};
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_user_agent_added() {
        let (base, seen) = recording_transport();
        let service = UserAgentMiddleware::new("dataproxy/11.2.0").wrap(&Options::new(), base);

        service.oneshot(request("http://example.com/")).await.unwrap();

        assert_eq!(
            seen.lock()[0].headers.get(http::header::USER_AGENT).unwrap(),
            "dataproxy/11.2.0"
        );
    }

    #[tokio::test]
    async fn test_user_agent_replaces_existing() {
        let (base, seen) = recording_transport();
        let service = UserAgentMiddleware::new("dataproxy/11.2.0").wrap(&Options::new(), base);

        let mut req = request("http://example.com/");
        req.headers_mut()
            .insert(http::header::USER_AGENT, HeaderValue::from_static("curl/8.0"));
        service.oneshot(req).await.unwrap();

        let seen = seen.lock();
        let values: Vec<_> = seen[0].headers.get_all(http::header::USER_AGENT).iter().collect();
        assert_eq!(values, ["dataproxy/11.2.0"]);
    }

    #[tokio::test]
    async fn test_empty_user_agent_passes_through() {
        let (base, seen) = recording_transport();
        let service = UserAgentMiddleware::new("").wrap(&Options::new(), base);

        service.oneshot(request("http://example.com/")).await.unwrap();

        assert!(seen.lock()[0].headers.get(http::header::USER_AGENT).is_none());
    }

    #[traced_test]
    #[test]
    fn test_invalid_user_agent_is_logged_and_disabled() {
        let middleware = UserAgentMiddleware::new("invalid\x00agent");
        assert!(middleware.user_agent.is_none());
        assert!(logs_contain("invalid user agent"));
    }
}
