use super::Middleware;
use crate::options::Options;
use crate::transport::BoxTransport;
use http::{HeaderMap, Request};
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};

pub const CUSTOM_HEADERS_MIDDLEWARE_NAME: &str = "custom-headers";

/// Forces the headers from [`Options::headers`] onto every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct CustomHeadersMiddleware;

impl Middleware for CustomHeadersMiddleware {
    fn name(&self) -> &str {
        CUSTOM_HEADERS_MIDDLEWARE_NAME
    }

    fn wrap(&self, opts: &Options, next: BoxTransport) -> BoxTransport {
        if opts.headers.is_empty() {
            return next;
        }
        CustomHeadersLayer::new(opts.headers.clone())
            .layer(next)
            .boxed_clone()
    }
}

/// Replaces same-named request headers with every configured value.
#[derive(Clone)]
pub struct CustomHeadersLayer {
    headers: HeaderMap,
}

impl CustomHeadersLayer {
    #[must_use]
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }
}

impl<S> Layer<S> for CustomHeadersLayer {
    type Service = CustomHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CustomHeadersService {
            inner,
            headers: self.headers.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CustomHeadersService<S> {
    inner: S,
    headers: HeaderMap,
}

impl<S, ReqBody> Service<Request<ReqBody>> for CustomHeadersService<S>
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
        let target = req.headers_mut();
        for name in self.headers.keys() {
            target.remove(name);
        }
        for (name, value) in &self.headers {
            target.append(name.clone(), value.clone());
        }
        self.inner.call(req)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::middleware::test_support::{recording_transport, request};
    use http::HeaderValue;

    #[tokio::test]
    async fn test_replaces_and_appends_all_values() {
        let mut headers = HeaderMap::new();
        headers.append("x-scope-orgid", HeaderValue::from_static("tenant-a"));
        headers.append("x-tag", HeaderValue::from_static("one"));
        headers.append("x-tag", HeaderValue::from_static("two"));

        let (base, seen) = recording_transport();
        let service = CustomHeadersMiddleware.wrap(&Options::new().with_headers(headers), base);

        let mut req = request("http://example.com/");
        req.headers_mut()
            .insert("x-scope-orgid", HeaderValue::from_static("caller"));
        req.headers_mut()
            .insert("accept", HeaderValue::from_static("application/json"));
        service.oneshot(req).await.unwrap();

        let seen = seen.lock();
        let sent = &seen[0].headers;
        assert_eq!(sent.get("x-scope-orgid").unwrap(), "tenant-a");
        assert_eq!(sent.get_all("x-scope-orgid").iter().count(), 1);
        let tags: Vec<_> = sent.get_all("x-tag").iter().collect();
        assert_eq!(tags, ["one", "two"]);
        assert_eq!(sent.get("accept").unwrap(), "application/json");
    }

    #[tokio::test]
    async fn test_no_headers_passes_through() {
        let (base, seen) = recording_transport();
        let service = CustomHeadersMiddleware.wrap(&Options::new(), base);

        let mut req = request("http://example.com/");
        req.headers_mut()
            .insert("x-scope-orgid", HeaderValue::from_static("caller"));
        service.oneshot(req).await.unwrap();

        assert_eq!(seen.lock()[0].headers.get("x-scope-orgid").unwrap(), "caller");
    }
}
