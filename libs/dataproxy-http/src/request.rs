use crate::client::{BufferedService, map_buffer_error, try_acquire_buffer_slot};
use crate::error::{HttpError, InvalidUriKind};
use crate::response::HttpResponse;
use crate::transport::TransportSecurity;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{Request, Uri};
use http_body_util::Full;
use serde::Serialize;
use tower::Service;

#[derive(Clone, Debug)]
enum BodyKind {
    Empty,
    Bytes(Bytes),
    Json(Bytes),
    Form(Bytes),
}

/// Fluent request builder returned by [`HttpClient`](crate::HttpClient).
///
/// Header and body errors are deferred to [`send`](RequestBuilder::send).
#[must_use = "RequestBuilder does nothing until .send() is called"]
pub struct RequestBuilder {
    service: BufferedService,
    method: http::Method,
    url: String,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: BodyKind,
    error: Option<HttpError>,
    transport_security: TransportSecurity,
}

impl RequestBuilder {
    pub(crate) fn new(
        service: BufferedService,
        method: http::Method,
        url: String,
        transport_security: TransportSecurity,
    ) -> Self {
        Self {
            service,
            method,
            url,
            headers: Vec::new(),
            body: BodyKind::Empty,
            error: None,
            transport_security,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }

        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => self.headers.push((name, value)),
            (Err(e), _) => self.error = Some(HttpError::InvalidHeaderName(e)),
            (_, Err(e)) => self.error = Some(HttpError::InvalidHeaderValue(e)),
        }
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in headers {
            self = self.header(name.as_ref(), value.as_ref());
        }
        self
    }

    /// JSON body; `Content-Type: application/json` unless one was set.
    ///
    /// # Errors
    /// Returns `HttpError::Json` if serialization fails, or an earlier
    /// deferred header error.
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.body = BodyKind::Json(Bytes::from(serde_json::to_vec(body)?));
        Ok(self)
    }

    /// URL-encoded form body.
    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        let encoded = fields
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        self.body = BodyKind::Form(Bytes::from(encoded));
        self
    }

    pub fn body_bytes(mut self, body: Bytes) -> Self {
        self.body = BodyKind::Bytes(body);
        self
    }

    pub fn body_string(mut self, body: String) -> Self {
        self.body = BodyKind::Bytes(Bytes::from(body));
        self
    }

    fn validate_url(&self) -> Result<Uri, HttpError> {
        validate_url(&self.url, self.transport_security)
    }

    fn build(&mut self) -> Result<Request<Full<Bytes>>, HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        let uri = self.validate_url()?;
        let mut builder = Request::builder().method(self.method.clone()).uri(uri);

        let has_content_type = self.headers.iter().any(|(name, _)| name == CONTENT_TYPE);
        if !has_content_type {
            match &self.body {
                BodyKind::Json(_) => builder = builder.header(CONTENT_TYPE, "application/json"),
                BodyKind::Form(_) => {
                    builder = builder.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
                }
                BodyKind::Empty | BodyKind::Bytes(_) => {}
            }
        }
        for (name, value) in self.headers.drain(..) {
            builder = builder.header(name, value);
        }

        let body = match std::mem::replace(&mut self.body, BodyKind::Empty) {
            BodyKind::Empty => Bytes::new(),
            BodyKind::Bytes(b) | BodyKind::Json(b) | BodyKind::Form(b) => b,
        };
        Ok(builder.body(Full::new(body))?)
    }

    /// Send the request through the client's interceptor chain.
    ///
    /// # Errors
    /// Deferred build errors, URL/scheme validation, `Overloaded` when the
    /// client's queue is full, and every transport or interceptor error.
    pub async fn send(mut self) -> Result<HttpResponse, HttpError> {
        let request = self.build()?;
        try_acquire_buffer_slot(&mut self.service).await?;
        let inner = self.service.call(request).await.map_err(map_buffer_error)?;
        Ok(HttpResponse { inner })
    }
}

/// Parse an absolute URL and check its scheme against `security`.
pub(crate) fn validate_url(url: &str, security: TransportSecurity) -> Result<Uri, HttpError> {
    let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| HttpError::InvalidUri {
        url: url.to_owned(),
        kind: InvalidUriKind::ParseError,
        reason: e.to_string(),
    })?;

    if uri.authority().is_none() {
        return Err(HttpError::InvalidUri {
            url: url.to_owned(),
            kind: InvalidUriKind::MissingAuthority,
            reason: "missing host/authority".to_owned(),
        });
    }

    match uri.scheme_str() {
        Some("https") => Ok(uri),
        Some("http") => match security {
            TransportSecurity::AllowInsecureHttp => Ok(uri),
            TransportSecurity::TlsOnly => Err(HttpError::InvalidScheme {
                scheme: "http".to_owned(),
                reason: "HTTPS required (transport security is TlsOnly)".to_owned(),
            }),
        },
        Some(scheme) => Err(HttpError::InvalidScheme {
            scheme: scheme.to_owned(),
            reason: "only http:// and https:// schemes are supported".to_owned(),
        }),
        None => Err(HttpError::InvalidUri {
            url: url.to_owned(),
            kind: InvalidUriKind::MissingScheme,
            reason: "missing scheme".to_owned(),
        }),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::client::{DEFAULT_BUFFER_CAPACITY, HttpClient};
    use crate::middleware::test_support::recording_transport;

    fn client(security: TransportSecurity) -> (HttpClient, crate::middleware::test_support::Seen) {
        let (transport, seen) = recording_transport();
        (
            HttpClient::from_transport(transport, security, DEFAULT_BUFFER_CAPACITY),
            seen,
        )
    }

    #[test]
    fn test_validate_url_kinds() {
        let allow = TransportSecurity::AllowInsecureHttp;
        assert!(validate_url("https://example.com/x", allow).is_ok());
        assert!(validate_url("http://example.com/x", allow).is_ok());
        assert!(matches!(
            validate_url("/relative", allow),
            Err(HttpError::InvalidUri {
                kind: InvalidUriKind::MissingAuthority,
                ..
            })
        ));
        assert!(matches!(
            validate_url("not a url", allow),
            Err(HttpError::InvalidUri {
                kind: InvalidUriKind::ParseError,
                ..
            })
        ));
        assert!(matches!(
            validate_url("ftp://example.com/", allow),
            Err(HttpError::InvalidScheme { .. })
        ));
        assert!(matches!(
            validate_url("http://example.com/", TransportSecurity::TlsOnly),
            Err(HttpError::InvalidScheme { .. })
        ));
    }

    #[tokio::test]
    async fn test_json_sets_content_type() {
        let (client, seen) = client(TransportSecurity::AllowInsecureHttp);
        client
            .post("http://example.com/api/ds/query")
            .header("x-request-id", "abc")
            .json(&serde_json::json!({"queries": []}))
            .unwrap()
            .send()
            .await
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen[0].headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(seen[0].headers.get("x-request-id").unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_explicit_content_type_wins() {
        let (client, seen) = client(TransportSecurity::AllowInsecureHttp);
        client
            .post("http://example.com/")
            .header("content-type", "application/x-ndjson")
            .form(&[("a", "b c")])
            .send()
            .await
            .unwrap();

        let seen = seen.lock();
        let values: Vec<_> = seen[0].headers.get_all(CONTENT_TYPE).iter().collect();
        assert_eq!(values, ["application/x-ndjson"]);
    }

    #[tokio::test]
    async fn test_deferred_header_error() {
        let (client, seen) = client(TransportSecurity::AllowInsecureHttp);
        let err = client
            .get("http://example.com/")
            .header("bad header", "value")
            .send()
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidHeaderName(_)));
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_tls_only_rejects_plain_http_before_sending() {
        let (client, seen) = client(TransportSecurity::TlsOnly);
        let err = client.get("http://example.com/").send().await.unwrap_err();
        assert!(matches!(err, HttpError::InvalidScheme { .. }));
        assert!(seen.lock().is_empty());
    }
}
