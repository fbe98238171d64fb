//! Base transport.
//!
//! [`Transport`] is the plain description of how one target is reached:
//! timeout and pool policy, TLS settings and a pluggable dial step.
//! Interceptors never see it; they wrap the [`BoxTransport`] service produced
//! by [`Transport::into_service`].
//!
//! Layering from the wire outwards:
//!
//! ```text
//! Dial (TCP, maybe tagged) -> TLS -> connect deadline -> hyper pool
//!     -> request deadline (body included) -> per-target concurrency limit
//! ```

use crate::conntrack::{Dial, DialConnector, DialFn, TcpDial};
use crate::error::{BoxError, HttpError};
use crate::response::ResponseBody;
use crate::timeouts::{TimeoutOptions, non_zero};
use crate::tls;
use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body::{Body, Frame, SizeHint};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use pin_project_lite::pin_project;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tower::limit::ConcurrencyLimitLayer;
use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder, ServiceExt};

/// Type-erased transport that interceptors wrap.
pub type BoxTransport = BoxCloneService<Request<Full<Bytes>>, Response<ResponseBody>, HttpError>;

/// Root certificates used to verify upstream servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsRootConfig {
    /// Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// OS native root certificate store
    Native,
}

/// Which URL schemes a transport may dial.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportSecurity {
    /// Only `https://` upstreams
    TlsOnly,
    /// Both `http://` and `https://` upstreams
    #[default]
    AllowInsecureHttp,
}

/// Configured, not yet built, base transport for one target.
#[derive(Clone)]
pub struct Transport {
    pub timeouts: TimeoutOptions,
    pub security: TransportSecurity,
    pub tls_roots: TlsRootConfig,
    /// Dial step; `None` selects a TCP dialer built from `timeouts`
    pub dial: Option<DialFn>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("timeouts", &self.timeouts)
            .field("security", &self.security)
            .field("tls_roots", &self.tls_roots)
            .field("dial", &self.dial.as_ref().map(|d| d.connection_tag()))
            .finish()
    }
}

impl Transport {
    #[must_use]
    pub fn new(timeouts: TimeoutOptions) -> Self {
        Self {
            timeouts,
            security: TransportSecurity::default(),
            tls_roots: TlsRootConfig::default(),
            dial: None,
        }
    }

    #[must_use]
    pub fn with_security(mut self, security: TransportSecurity) -> Self {
        self.security = security;
        self
    }

    #[must_use]
    pub fn with_tls_roots(mut self, tls_roots: TlsRootConfig) -> Self {
        self.tls_roots = tls_roots;
        self
    }

    #[must_use]
    pub fn with_dial(mut self, dial: DialFn) -> Self {
        self.dial = Some(dial);
        self
    }

    /// Name sockets of this transport are registered under, if tagged.
    #[must_use]
    pub fn connection_tag(&self) -> Option<&str> {
        self.dial.as_deref().and_then(Dial::connection_tag)
    }

    /// Build the pooled hyper client and its timeout/limit layers.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// Returns `HttpError::Tls` if the TLS root store cannot be built.
    pub fn into_service(self) -> Result<BoxTransport, HttpError> {
        let Transport {
            timeouts,
            security,
            tls_roots,
            dial,
        } = self;

        let dial = dial.unwrap_or_else(|| Arc::new(TcpDial::new(&timeouts)));
        let https = tls::https_connector(tls_roots, security, DialConnector::new(dial))?;
        let connector = ConnectDeadline::new(https, timeouts.connect_deadline());

        let mut builder = Client::builder(TokioExecutor::new());
        // pool_idle_timeout only takes effect with a pool timer
        builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(timeouts.effective_max_idle_per_host())
            .pool_idle_timeout(timeouts.pool_idle_timeout())
            .http2_only(false);
        let client = builder.build::<_, Full<Bytes>>(connector);

        let mut service = client
            .map_response(|response| response.map(|body| body.map_err(box_error).boxed()))
            .map_err(HttpError::from)
            .boxed_clone();

        if let Some(timeout) = non_zero(timeouts.timeout) {
            service = RequestDeadline::new(service, timeout).boxed_clone();
        }

        if timeouts.max_conns_per_host > 0 {
            service = ServiceBuilder::new()
                .layer(ConcurrencyLimitLayer::new(timeouts.max_conns_per_host))
                .service(service)
                .boxed_clone();
        }

        Ok(service)
    }
}

fn box_error(err: hyper::Error) -> BoxError {
    Box::new(err)
}

/// Bounds the whole exchange by one deadline, reading the body included.
///
/// Headers arriving late fail the call with [`HttpError::Timeout`]; a body
/// still streaming at the deadline fails its next frame with the same error.
#[derive(Clone)]
struct RequestDeadline<S> {
    inner: S,
    timeout: Duration,
}

impl<S> RequestDeadline<S> {
    fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<S> Service<Request<Full<Bytes>>> for RequestDeadline<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResponseBody>, Error = HttpError>,
    S::Future: Send + 'static,
{
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, HttpError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        let timeout = self.timeout;
        let deadline = Instant::now() + timeout;
        let response = self.inner.call(req);

        Box::pin(async move {
            let Ok(result) = tokio::time::timeout_at(deadline, response).await else {
                return Err(HttpError::Timeout(timeout));
            };
            let response = result?;
            Ok(response.map(|body| DeadlineBody::new(body, deadline, timeout).boxed()))
        })
    }
}

pin_project! {
    struct DeadlineBody<B> {
        #[pin]
        inner: B,
        #[pin]
        sleep: Sleep,
        timeout: Duration,
    }
}

impl<B> DeadlineBody<B> {
    fn new(inner: B, deadline: Instant, timeout: Duration) -> Self {
        Self {
            inner,
            sleep: tokio::time::sleep_until(deadline),
            timeout,
        }
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body<Data = Bytes, Error = BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        if this.sleep.poll(cx).is_ready() {
            return Poll::Ready(Some(Err(HttpError::Timeout(*this.timeout).into())));
        }
        this.inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Bounds dial plus TLS handshake by a single deadline.
#[derive(Clone)]
struct ConnectDeadline<S> {
    inner: S,
    deadline: Option<Duration>,
}

impl<S> ConnectDeadline<S> {
    fn new(inner: S, deadline: Option<Duration>) -> Self {
        Self { inner, deadline }
    }
}

impl<S> Service<Uri> for ConnectDeadline<S>
where
    S: Service<Uri>,
    S::Response: Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connecting = self.inner.call(uri);
        let deadline = self.deadline;
        Box::pin(async move {
            let Some(deadline) = deadline else {
                return connecting.await.map_err(Into::into);
            };
            match tokio::time::timeout(deadline, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_elapsed) => Err(Box::new(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connection not established within {}ms", deadline.as_millis()),
                )) as BoxError),
            }
        })
    }
}
