//! Connection tagging for outbound sockets.
//!
//! A [`Transport`] dials through an [`Dial`] implementation. [`tag_connections`]
//! wraps that single capability in a [`TaggedDial`] which performs the same
//! dial and registers every connection under a name, so open/closed
//! connections can be counted per datasource. Nothing else about the
//! transport changes.
//!
//! Metrics (all labelled `dialer_name`):
//! - `net_conntrack_dialer_conn_attempted_total`
//! - `net_conntrack_dialer_conn_established_total`
//! - `net_conntrack_dialer_conn_failed_total` (extra `reason` label)
//! - `net_conntrack_dialer_conn_closed_total`

use crate::error::BoxError;
use crate::timeouts::{TimeoutOptions, non_zero};
use crate::transport::Transport;
use http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tower::{Service, ServiceExt};

pub const CONN_ATTEMPTED_TOTAL: &str = "net_conntrack_dialer_conn_attempted_total";
pub const CONN_ESTABLISHED_TOTAL: &str = "net_conntrack_dialer_conn_established_total";
pub const CONN_FAILED_TOTAL: &str = "net_conntrack_dialer_conn_failed_total";
pub const CONN_CLOSED_TOTAL: &str = "net_conntrack_dialer_conn_closed_total";

/// Future returned by [`Dial::dial`].
pub type DialFuture = Pin<Box<dyn Future<Output = Result<Conn, BoxError>> + Send>>;

/// Shared dial capability stored on a [`Transport`].
pub type DialFn = Arc<dyn Dial>;

/// Opens the raw socket for a request URI.
pub trait Dial: Send + Sync + 'static {
    fn dial(&self, uri: Uri) -> DialFuture;

    /// Name connections are registered under, if this dialer tags them.
    fn connection_tag(&self) -> Option<&str> {
        None
    }
}

/// Plain TCP dialer configured from the timeout policy.
#[derive(Clone, Debug)]
pub struct TcpDial {
    connector: HttpConnector,
}

impl TcpDial {
    #[must_use]
    pub fn new(timeouts: &TimeoutOptions) -> Self {
        let mut connector = HttpConnector::new();
        // TLS is layered on top, so https URIs must reach the TCP dialer.
        connector.enforce_http(false);
        connector.set_nodelay(true);
        connector.set_connect_timeout(non_zero(timeouts.dial_timeout));
        connector.set_keepalive(non_zero(timeouts.keep_alive));
        Self { connector }
    }
}

impl Dial for TcpDial {
    fn dial(&self, uri: Uri) -> DialFuture {
        let connector = self.connector.clone();
        Box::pin(async move {
            let io = connector.oneshot(uri).await?;
            Ok(Conn::new(io))
        })
    }
}

/// Dialer that registers every connection under a name.
pub struct TaggedDial {
    name: Arc<str>,
    inner: DialFn,
}

impl TaggedDial {
    #[must_use]
    pub fn new(name: &str, inner: DialFn) -> Self {
        Self {
            name: Arc::from(name),
            inner,
        }
    }
}

impl Dial for TaggedDial {
    fn dial(&self, uri: Uri) -> DialFuture {
        let name = Arc::clone(&self.name);
        let dialing = self.inner.dial(uri);
        Box::pin(async move {
            metrics::counter!(CONN_ATTEMPTED_TOTAL, "dialer_name" => name.to_string()).increment(1);
            match dialing.await {
                Ok(conn) => {
                    metrics::counter!(CONN_ESTABLISHED_TOTAL, "dialer_name" => name.to_string())
                        .increment(1);
                    tracing::trace!(dialer_name = %name, "connection established");
                    Ok(conn.with_guard(ConnGuard { name }))
                }
                Err(err) => {
                    let reason = failure_reason(err.as_ref());
                    metrics::counter!(
                        CONN_FAILED_TOTAL,
                        "dialer_name" => name.to_string(),
                        "reason" => reason
                    )
                    .increment(1);
                    tracing::debug!(dialer_name = %name, reason, error = %err, "dial failed");
                    Err(err)
                }
            }
        })
    }

    fn connection_tag(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// Replace the transport's dial step with one that tags connections.
///
/// A transport without a dialer gets the default TCP dialer built from its
/// own timeout policy first, so tagging never loses dial timeouts.
#[must_use]
pub fn tag_connections(name: &str, mut transport: Transport) -> Transport {
    let inner = transport
        .dial
        .take()
        .unwrap_or_else(|| Arc::new(TcpDial::new(&transport.timeouts)));
    transport.dial = Some(Arc::new(TaggedDial::new(name, inner)));
    transport
}

fn failure_reason(err: &(dyn std::error::Error + 'static)) -> &'static str {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.to_string().starts_with("dns error") {
            return "resolution";
        }
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return "refused",
                io::ErrorKind::TimedOut => return "timeout",
                _ => {}
            }
        }
        current = e.source();
    }
    "unknown"
}

/// Records the close of a tagged connection when dropped.
struct ConnGuard {
    name: Arc<str>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        metrics::counter!(CONN_CLOSED_TOTAL, "dialer_name" => self.name.to_string()).increment(1);
        tracing::trace!(dialer_name = %self.name, "connection closed");
    }
}

/// Connected socket handed to the TLS layer and the hyper pool.
pub struct Conn {
    io: TokioIo<TcpStream>,
    guard: Option<ConnGuard>,
}

impl Conn {
    #[must_use]
    pub fn new(io: TokioIo<TcpStream>) -> Self {
        Self { io, guard: None }
    }

    fn with_guard(mut self, guard: ConnGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Name this connection is registered under, if any.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.guard.as_ref().map(|g| &*g.name)
    }
}

impl Connection for Conn {
    fn connected(&self) -> Connected {
        self.io.connected()
    }
}

impl Read for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl Write for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write_vectored(cx, bufs)
    }
}

/// `tower` connector over a [`Dial`], as required by hyper's pooled client.
#[derive(Clone)]
pub(crate) struct DialConnector {
    dial: DialFn,
}

impl DialConnector {
    pub(crate) fn new(dial: DialFn) -> Self {
        Self { dial }
    }
}

impl Service<Uri> for DialConnector {
    type Response = Conn;
    type Error = BoxError;
    type Future = DialFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        self.dial.dial(uri)
    }
}
