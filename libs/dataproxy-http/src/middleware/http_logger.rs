use super::Middleware;
use crate::error::{BoxError, HttpError};
use crate::har::{
    HarCache, HarContent, HarEntry, HarNameValue, HarPostData, HarRecorder, HarRequest,
    HarResponse, HarTimings, default_path, format_started,
};
use crate::options::Options;
use crate::response::ResponseBody;
use crate::transport::BoxTransport;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Request, Response, Version};
use http_body::{Body, Frame, SizeHint};
use http_body_util::{BodyExt, Full};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;
use time::OffsetDateTime;
use tower::{Layer, Service, ServiceExt};

pub const HTTP_LOGGER_MIDDLEWARE_NAME: &str = "http-logger";

/// Captures traffic of opted-in datasources into a HAR file.
///
/// Active only when [`Options::har_log`] resolves; captured entries may
/// contain credentials, so nothing is recorded by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpLoggerMiddleware;

impl Middleware for HttpLoggerMiddleware {
    fn name(&self) -> &str {
        HTTP_LOGGER_MIDDLEWARE_NAME
    }

    fn wrap(&self, opts: &Options, next: BoxTransport) -> BoxTransport {
        let Some(har) = opts.har_log() else {
            return next;
        };
        let path = har
            .path
            .unwrap_or_else(|| default_path(&har.datasource_name));
        tracing::debug!(
            datasource = %har.datasource_name,
            path = %path.display(),
            "HAR capture enabled"
        );
        HttpLoggerLayer::new(Arc::new(HarRecorder::new(path)))
            .layer(next)
            .boxed_clone()
    }
}

#[derive(Clone)]
pub struct HttpLoggerLayer {
    recorder: Arc<HarRecorder>,
}

impl HttpLoggerLayer {
    #[must_use]
    pub fn new(recorder: Arc<HarRecorder>) -> Self {
        Self { recorder }
    }
}

impl<S> Layer<S> for HttpLoggerLayer {
    type Service = HttpLoggerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpLoggerService {
            inner,
            recorder: Arc::clone(&self.recorder),
        }
    }
}

#[derive(Clone)]
pub struct HttpLoggerService<S> {
    inner: S,
    recorder: Arc<HarRecorder>,
}

impl<S> Service<Request<Full<Bytes>>> for HttpLoggerService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResponseBody>, Error = HttpError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, HttpError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        let recorder = Arc::clone(&self.recorder);
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let started_at = OffsetDateTime::now_utc();
            let started = Instant::now();

            let (parts, body) = req.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(never) => match never {},
            };
            let request = har_request(&parts, &body);
            let result = inner.call(Request::from_parts(parts, Full::new(body))).await;
            let wait = millis(started);

            let mut entry = HarEntry {
                started_date_time: format_started(started_at),
                time: wait,
                request,
                response: failed_response(),
                cache: HarCache::default(),
                timings: HarTimings {
                    send: 0.0,
                    wait,
                    receive: 0.0,
                },
                comment: None,
            };

            match result {
                Ok(response) => {
                    entry.response = har_response(&response);
                    let capture = Capture {
                        recorder,
                        entry: Some(entry),
                        started,
                        received: Instant::now(),
                        buf: Vec::new(),
                    };
                    Ok(response.map(|body| CapturingBody { inner: body, capture }.boxed()))
                }
                Err(e) => {
                    entry.comment = Some(e.to_string());
                    recorder.record(entry);
                    Err(e)
                }
            }
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn millis(since: Instant) -> f64 {
    since.elapsed().as_micros() as f64 / 1000.0
}

fn name_values(headers: &HeaderMap) -> Vec<HarNameValue> {
    headers
        .iter()
        .map(|(name, value)| HarNameValue {
            name: name.as_str().to_owned(),
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        })
        .collect()
}

fn mime_type(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

fn query_string(query: Option<&str>) -> Vec<HarNameValue> {
    query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            HarNameValue {
                name: decode(name),
                value: decode(value),
            }
        })
        .collect()
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw).map_or_else(|_| raw.to_owned(), std::borrow::Cow::into_owned)
}

fn http_version(version: Version) -> &'static str {
    match version {
        v if v == Version::HTTP_09 => "HTTP/0.9",
        v if v == Version::HTTP_10 => "HTTP/1.0",
        v if v == Version::HTTP_2 => "HTTP/2.0",
        v if v == Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn len_i64(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

fn har_request(parts: &http::request::Parts, body: &Bytes) -> HarRequest {
    let post_data = (!body.is_empty()).then(|| HarPostData {
        mime_type: mime_type(&parts.headers),
        text: String::from_utf8_lossy(body).into_owned(),
    });
    HarRequest {
        method: parts.method.as_str().to_owned(),
        url: parts.uri.to_string(),
        http_version: http_version(parts.version).to_owned(),
        cookies: Vec::new(),
        headers: name_values(&parts.headers),
        query_string: query_string(parts.uri.query()),
        post_data,
        headers_size: -1,
        body_size: len_i64(body.len()),
    }
}

fn har_response(response: &Response<ResponseBody>) -> HarResponse {
    let status = response.status();
    HarResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_owned(),
        http_version: http_version(response.version()).to_owned(),
        cookies: Vec::new(),
        headers: name_values(response.headers()),
        content: HarContent {
            size: 0,
            mime_type: mime_type(response.headers()),
            text: None,
        },
        redirect_url: response
            .headers()
            .get(http::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned(),
        headers_size: -1,
        body_size: 0,
    }
}

/// Response placeholder for round trips that never got one.
fn failed_response() -> HarResponse {
    HarResponse {
        status: 0,
        status_text: String::new(),
        http_version: String::new(),
        cookies: Vec::new(),
        headers: Vec::new(),
        content: HarContent {
            size: 0,
            mime_type: String::new(),
            text: None,
        },
        redirect_url: String::new(),
        headers_size: -1,
        body_size: -1,
    }
}

/// Pending entry completed once the body ends, fails or is dropped.
struct Capture {
    recorder: Arc<HarRecorder>,
    entry: Option<HarEntry>,
    started: Instant,
    received: Instant,
    buf: Vec<u8>,
}

impl Capture {
    fn finish(&mut self, comment: Option<String>) {
        let Some(mut entry) = self.entry.take() else {
            return;
        };
        let size = len_i64(self.buf.len());
        entry.response.content.size = size;
        entry.response.content.text = Some(String::from_utf8_lossy(&self.buf).into_owned());
        entry.response.body_size = size;
        entry.timings.receive = millis(self.received);
        entry.time = millis(self.started);
        entry.comment = comment;
        self.recorder.record(entry);
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.finish(None);
    }
}

pin_project! {
    struct CapturingBody {
        #[pin]
        inner: ResponseBody,
        capture: Capture,
    }
}

impl Body for CapturingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));
        match &frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.capture.buf.extend_from_slice(data);
                }
            }
            Some(Err(e)) => this.capture.finish(Some(e.to_string())),
            None => this.capture.finish(None),
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
