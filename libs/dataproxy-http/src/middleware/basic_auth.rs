use super::Middleware;
use crate::options::{BasicAuth, Options};
use crate::transport::BoxTransport;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::{HeaderValue, Request};
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};

pub const BASIC_AUTH_MIDDLEWARE_NAME: &str = "basic-auth";

/// Adds `Authorization: Basic ...` when the options carry credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicAuthMiddleware;

impl Middleware for BasicAuthMiddleware {
    fn name(&self) -> &str {
        BASIC_AUTH_MIDDLEWARE_NAME
    }

    fn wrap(&self, opts: &Options, next: BoxTransport) -> BoxTransport {
        let Some(auth) = &opts.basic_auth else {
            return next;
        };
        match BasicAuthLayer::try_new(auth) {
            Some(layer) => layer.layer(next).boxed_clone(),
            None => next,
        }
    }
}

#[derive(Clone)]
pub struct BasicAuthLayer {
    header: HeaderValue,
}

impl BasicAuthLayer {
    /// `None` when the encoded credentials are not a valid header value.
    #[must_use]
    pub fn try_new(auth: &BasicAuth) -> Option<Self> {
        let encoded = STANDARD.encode(format!("{}:{}", auth.user, auth.password));
        match HeaderValue::from_str(&format!("Basic {encoded}")) {
            Ok(mut header) => {
                header.set_sensitive(true);
                Some(Self { header })
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot encode basic auth header");
                None
            }
        }
    }
}

impl<S> Layer<S> for BasicAuthLayer {
    type Service = BasicAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BasicAuthService {
            inner,
            header: self.header.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BasicAuthService<S> {
    inner: S,
    header: HeaderValue,
}

impl<S, ReqBody> Service<Request<ReqBody>> for BasicAuthService<S>
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
            .insert(http::header::AUTHORIZATION, self.header.clone());
        self.inner.call(req)
    }
}
