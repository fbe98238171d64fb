//! Per-datasource request metrics.
//!
//! Metrics (prefix is the application name):
//! - `<prefix>_datasource_request_total` counter
//! - `<prefix>_datasource_request_duration_seconds` histogram
//! - `<prefix>_datasource_response_size_bytes` histogram
//! - `<prefix>_datasource_request_in_flight` gauge
//!
//! Request metrics are labelled `datasource`, `datasource_type`, `code` and
//! `method`; size and in-flight metrics only carry the datasource labels.

use super::Middleware;
use crate::error::{BoxError, HttpError};
use crate::options::Options;
use crate::response::ResponseBody;
use crate::sanitize::sanitize_label_name;
use crate::transport::BoxTransport;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;
use tower::{Layer, Service, ServiceExt};

pub const METRICS_MIDDLEWARE_NAME: &str = "metrics";

/// Fully prefixed metric names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasourceMetricNames {
    pub request_total: String,
    pub request_duration_seconds: String,
    pub response_size_bytes: String,
    pub request_in_flight: String,
}

impl DatasourceMetricNames {
    #[must_use]
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            request_total: format!("{prefix}_datasource_request_total"),
            request_duration_seconds: format!("{prefix}_datasource_request_duration_seconds"),
            response_size_bytes: format!("{prefix}_datasource_response_size_bytes"),
            request_in_flight: format!("{prefix}_datasource_request_in_flight"),
        }
    }
}

impl Default for DatasourceMetricNames {
    fn default() -> Self {
        Self::with_prefix("dataproxy")
    }
}

/// Records request metrics for clients with a named and typed datasource.
///
/// Both the `datasource_name` and `datasource_type` labels must be present
/// and survive sanitization, otherwise the interceptor passes through.
#[derive(Debug, Clone, Default)]
pub struct MetricsMiddleware {
    names: Arc<DatasourceMetricNames>,
}

impl MetricsMiddleware {
    #[must_use]
    pub fn new(names: DatasourceMetricNames) -> Self {
        Self {
            names: Arc::new(names),
        }
    }
}

impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        METRICS_MIDDLEWARE_NAME
    }

    fn wrap(&self, opts: &Options, next: BoxTransport) -> BoxTransport {
        let (Some(name), Some(kind)) = (opts.datasource_name(), opts.datasource_type()) else {
            return next;
        };
        let datasource = match sanitize_label_name(name) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "skipping datasource metrics");
                return next;
            }
        };
        let datasource_type = match sanitize_label_name(kind) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "skipping datasource metrics");
                return next;
            }
        };
        MetricsLayer::new(Arc::clone(&self.names), datasource, datasource_type)
            .layer(next)
            .boxed_clone()
    }
}

#[derive(Debug)]
struct Target {
    names: Arc<DatasourceMetricNames>,
    datasource: String,
    datasource_type: String,
}

#[derive(Clone)]
pub struct MetricsLayer {
    target: Arc<Target>,
}

impl MetricsLayer {
    #[must_use]
    pub fn new(
        names: Arc<DatasourceMetricNames>,
        datasource: String,
        datasource_type: String,
    ) -> Self {
        Self {
            target: Arc::new(Target {
                names,
                datasource,
                datasource_type,
            }),
        }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            target: Arc::clone(&self.target),
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    target: Arc<Target>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for MetricsService<S>
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
        let target = Arc::clone(&self.target);
        let method = req.method().as_str().to_owned();
        let in_flight = InFlight::start(&target);
        let start = Instant::now();
        let response = self.inner.call(req);

        Box::pin(async move {
            let result = response.await;
            drop(in_flight);

            let code = match &result {
                Ok(response) => response.status().as_str().to_owned(),
                Err(_) => "error".to_owned(),
            };
            let labels = [
                ("datasource", target.datasource.clone()),
                ("datasource_type", target.datasource_type.clone()),
                ("code", code),
                ("method", method),
            ];
            metrics::counter!(target.names.request_total.clone(), &labels).increment(1);
            metrics::histogram!(target.names.request_duration_seconds.clone(), &labels)
                .record(start.elapsed().as_secs_f64());

            let response = result?;
            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                return Ok(response);
            }
            let size = metrics::histogram!(
                target.names.response_size_bytes.clone(),
                "datasource" => target.datasource.clone(),
                "datasource_type" => target.datasource_type.clone()
            );
            Ok(response.map(|body| CountingBody::new(body, size).boxed()))
        })
    }
}

/// Keeps the in-flight gauge raised until the response head arrives or the
/// request is dropped.
struct InFlight(metrics::Gauge);

impl InFlight {
    fn start(target: &Target) -> Self {
        let gauge = metrics::gauge!(
            target.names.request_in_flight.clone(),
            "datasource" => target.datasource.clone(),
            "datasource_type" => target.datasource_type.clone()
        );
        gauge.increment(1.0);
        Self(gauge)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.decrement(1.0);
    }
}

/// Observes the bytes read once the body is finished or dropped.
struct SizeObserver {
    histogram: metrics::Histogram,
    read: u64,
}

impl Drop for SizeObserver {
    #[allow(clippy::cast_precision_loss)]
    fn drop(&mut self) {
        self.histogram.record(self.read as f64);
    }
}

pin_project! {
    struct CountingBody {
        #[pin]
        inner: ResponseBody,
        observer: SizeObserver,
    }
}

impl CountingBody {
    fn new(inner: ResponseBody, histogram: metrics::Histogram) -> Self {
        Self {
            inner,
            observer: SizeObserver { histogram, read: 0 },
        }
    }
}

impl Body for CountingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));
        if let Some(Ok(frame)) = &frame
            && let Some(data) = frame.data_ref()
        {
            let len = u64::try_from(data.len()).unwrap_or(u64::MAX);
            this.observer.read = this.observer.read.saturating_add(len);
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

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::middleware::test_support::{failing_transport, request, stub_transport};
    use crate::options::{DATASOURCE_NAME_LABEL, DATASOURCE_TYPE_LABEL};
    use crate::response::collect_body;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};

    fn find(snapshotter: &Snapshotter, name: &str) -> Vec<(Vec<(String, String)>, DebugValue)> {
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == name)
            .map(|(key, _, _, value)| {
                let labels = key
                    .key()
                    .labels()
                    .map(|l| (l.key().to_owned(), l.value().to_owned()))
                    .collect();
                (labels, value)
            })
            .collect()
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn opts() -> Options {
        Options::new()
            .with_label(DATASOURCE_NAME_LABEL, "My DB!")
            .with_label(DATASOURCE_TYPE_LABEL, "prometheus")
    }

    #[test]
    fn test_records_request_and_size() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            runtime().block_on(async {
                let service = MetricsMiddleware::default()
                    .wrap(&opts(), stub_transport(StatusCode::OK, &["hello", "!"]));
                let response = service.oneshot(request("http://example.com/")).await.unwrap();
                collect_body(response.into_body()).await.unwrap();
            });
        });

        let total = find(&snapshotter, "dataproxy_datasource_request_total");
        assert_eq!(total.len(), 1);
        let (labels, value) = &total[0];
        assert!(labels.contains(&("datasource".to_owned(), "My_DB".to_owned())));
        assert!(labels.contains(&("datasource_type".to_owned(), "prometheus".to_owned())));
        assert!(labels.contains(&("code".to_owned(), "200".to_owned())));
        assert!(labels.contains(&("method".to_owned(), "GET".to_owned())));
        assert_eq!(value, &DebugValue::Counter(1));

        let sizes = find(&snapshotter, "dataproxy_datasource_response_size_bytes");
        match &sizes[0].1 {
            DebugValue::Histogram(values) => {
                assert_eq!(values.len(), 1);
                assert!((values[0].into_inner() - 6.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected value {other:?}"),
        }

        let in_flight = find(&snapshotter, "dataproxy_datasource_request_in_flight");
        match &in_flight[0].1 {
            DebugValue::Gauge(v) => assert!(v.into_inner().abs() < f64::EPSILON),
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn test_transport_error_is_counted() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            runtime().block_on(async {
                let service = MetricsMiddleware::new(DatasourceMetricNames::with_prefix("grafana"))
                    .wrap(&opts(), failing_transport());
                assert!(service.oneshot(request("http://example.com/")).await.is_err());
            });
        });

        let total = find(&snapshotter, "grafana_datasource_request_total");
        assert!(total[0].0.contains(&("code".to_owned(), "error".to_owned())));
        assert!(find(&snapshotter, "grafana_datasource_response_size_bytes").is_empty());
    }

    #[test]
    fn test_missing_or_invalid_labels_pass_through() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            runtime().block_on(async {
                for opts in [
                    Options::new().with_label(DATASOURCE_NAME_LABEL, "loki"),
                    Options::new()
                        .with_label(DATASOURCE_NAME_LABEL, "!!!")
                        .with_label(DATASOURCE_TYPE_LABEL, "loki"),
                ] {
                    let service = MetricsMiddleware::default()
                        .wrap(&opts, stub_transport(StatusCode::OK, &["x"]));
                    service.oneshot(request("http://example.com/")).await.unwrap();
                }
            });
        });

        assert!(snapshotter.snapshot().into_vec().is_empty());
    }

    #[test]
    fn test_metric_names_prefix() {
        let names = DatasourceMetricNames::with_prefix("grafana");
        assert_eq!(names.request_total, "grafana_datasource_request_total");
        assert_eq!(
            names.request_in_flight,
            "grafana_datasource_request_in_flight"
        );
    }
}
