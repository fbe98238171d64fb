use crate::error::HttpError;
use crate::request::RequestBuilder;
use crate::response::ResponseBody;
use crate::transport::{BoxTransport, TransportSecurity};
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use std::future::Future;
use std::pin::Pin;
use tower::Service;
use tower::buffer::Buffer;

/// Requests queued per client before callers get [`HttpError::Overloaded`].
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Future of the composed per-datasource transport
pub type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, HttpError>> + Send>>;

/// Composed transport behind a `tower` buffer
pub type BufferedService = Buffer<Request<Full<Bytes>>, ServiceFuture>;

/// Client bound to one datasource's interceptor chain.
///
/// Built by [`Provider::new_client`](crate::Provider::new_client). Cloning is
/// cheap and every clone shares the same chain, connection pool and HAR
/// capture file.
///
/// ```ignore
/// let client = provider.new_client(options)?;
/// let series: Vec<Series> = client
///     .get("https://prometheus.internal/api/v1/series")
///     .send()
///     .await?
///     .json()
///     .await?;
/// ```
#[derive(Clone)]
pub struct HttpClient {
    pub(crate) service: BufferedService,
    pub(crate) transport_security: TransportSecurity,
}

impl HttpClient {
    /// Wrap a composed transport. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn from_transport(
        transport: BoxTransport,
        transport_security: TransportSecurity,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            service: Buffer::new(transport, buffer_capacity.max(1)),
            transport_security,
        }
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(http::Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(http::Method::POST, url)
    }

    pub fn put(&self, url: &str) -> RequestBuilder {
        self.request(http::Method::PUT, url)
    }

    pub fn patch(&self, url: &str) -> RequestBuilder {
        self.request(http::Method::PATCH, url)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.request(http::Method::DELETE, url)
    }

    /// Request builder for an arbitrary method.
    ///
    /// The URL must be absolute; `http://` is refused when the client was
    /// built with [`TransportSecurity::TlsOnly`].
    pub fn request(&self, method: http::Method, url: &str) -> RequestBuilder {
        RequestBuilder::new(
            self.service.clone(),
            method,
            url.to_owned(),
            self.transport_security,
        )
    }
}

/// Map buffer errors to `HttpError`
///
/// Buffer can return `ServiceError` which wraps the inner service error,
/// or `Closed` if the buffer worker has shut down.
pub fn map_buffer_error(err: tower::BoxError) -> HttpError {
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(err) => {
            tracing::error!(
                error = %err,
                "buffer worker closed unexpectedly; service unavailable"
            );
            HttpError::ServiceClosed
        }
    }
}

/// Try to acquire a buffer slot with fail-fast semantics.
///
/// If the buffer is full, returns `HttpError::Overloaded` immediately instead
/// of blocking.
pub async fn try_acquire_buffer_slot(service: &mut BufferedService) -> Result<(), HttpError> {
    use std::task::Poll;

    let poll_result = std::future::poll_fn(|cx| match service.poll_ready(cx) {
        Poll::Ready(result) => Poll::Ready(Some(result)),
        Poll::Pending => Poll::Ready(None),
    })
    .await;

    match poll_result {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(map_buffer_error(e)),
        None => Err(HttpError::Overloaded),
    }
}
