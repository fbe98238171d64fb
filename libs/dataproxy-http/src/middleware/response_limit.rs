use super::Middleware;
use crate::error::{BoxError, HttpError};
use crate::options::Options;
use crate::response::ResponseBody;
use crate::transport::BoxTransport;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tower::{Layer, Service, ServiceExt};

pub const RESPONSE_LIMIT_MIDDLEWARE_NAME: &str = "response-limit";

/// Caps response bodies at a byte limit.
///
/// The limit comes from [`Options::response_limit`] when set, otherwise from
/// the provider-wide default. A limit of `0` disables the interceptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseLimitMiddleware {
    default_limit: u64,
}

impl ResponseLimitMiddleware {
    #[must_use]
    pub fn new(default_limit: u64) -> Self {
        Self { default_limit }
    }
}

impl Middleware for ResponseLimitMiddleware {
    fn name(&self) -> &str {
        RESPONSE_LIMIT_MIDDLEWARE_NAME
    }

    fn wrap(&self, opts: &Options, next: BoxTransport) -> BoxTransport {
        let limit = opts.response_limit.unwrap_or(self.default_limit);
        if limit == 0 {
            return next;
        }
        ResponseLimitLayer::new(limit).layer(next).boxed_clone()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResponseLimitLayer {
    limit: u64,
}

impl ResponseLimitLayer {
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }
}

impl<S> Layer<S> for ResponseLimitLayer {
    type Service = ResponseLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ResponseLimitService {
            inner,
            limit: self.limit,
        }
    }
}

#[derive(Clone)]
pub struct ResponseLimitService<S> {
    inner: S,
    limit: u64,
}

impl<S, ReqBody> Service<Request<ReqBody>> for ResponseLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResponseBody>, Error = HttpError>,
    S::Future: Send + 'static,
{
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, HttpError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let limit = self.limit;
        let response = self.inner.call(req);
        Box::pin(async move {
            let response = response.await?;
            // Upgraded connections carry no bounded body.
            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                return Ok(response);
            }
            Ok(response.map(|body| LimitedBody::new(body, limit).boxed()))
        })
    }
}

pin_project! {
    /// Body wrapper failing with [`HttpError::ResponseLimitExceeded`] once
    /// more than `limit` bytes have been read.
    ///
    /// After the limit trips every further poll yields the same error, so
    /// no reader above it ever sees the body complete successfully.
    pub struct LimitedBody {
        #[pin]
        inner: ResponseBody,
        limit: u64,
        read: u64,
        exceeded: bool,
    }
}

impl LimitedBody {
    #[must_use]
    pub fn new(inner: ResponseBody, limit: u64) -> Self {
        Self {
            inner,
            limit,
            read: 0,
            exceeded: false,
        }
    }

    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    fn limit_error(limit: u64) -> BoxError {
        Box::new(HttpError::ResponseLimitExceeded { limit })
    }
}

impl Body for LimitedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        if *this.exceeded {
            return Poll::Ready(Some(Err(Self::limit_error(*this.limit))));
        }

        let frame = ready!(this.inner.poll_frame(cx));
        if let Some(Ok(frame)) = &frame
            && let Some(data) = frame.data_ref()
        {
            let len = u64::try_from(data.len()).unwrap_or(u64::MAX);
            *this.read = this.read.saturating_add(len);
            if *this.read > *this.limit {
                *this.exceeded = true;
                tracing::debug!(limit = *this.limit, "response body exceeded the response limit");
                return Poll::Ready(Some(Err(Self::limit_error(*this.limit))));
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        !self.exceeded && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
