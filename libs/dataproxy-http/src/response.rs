use crate::error::{BoxError, HttpError};
use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;

/// Type-erased response body flowing through the interceptor chain.
///
/// Body wrappers (size limit, metrics, HAR capture) box their errors so an
/// [`HttpError`] raised deep in the chain reaches the caller unchanged.
pub type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Response returned by [`HttpClient`](crate::HttpClient).
///
/// Every status is returned as `Ok`; the proxy forwards upstream errors as
/// they are. Body helpers report a tripped response limit as
/// [`HttpError::ResponseLimitExceeded`].
#[derive(Debug)]
pub struct HttpResponse {
    pub(crate) inner: Response<ResponseBody>,
}

impl HttpResponse {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Consume the wrapper and return the raw response.
    #[must_use]
    pub fn into_inner(self) -> Response<ResponseBody> {
        self.inner
    }

    /// Body stream for incremental reads (e.g. piping to the proxied caller).
    #[must_use]
    pub fn into_body(self) -> ResponseBody {
        self.inner.into_body()
    }

    /// Read the whole body.
    ///
    /// # Errors
    /// Returns `HttpError::ResponseLimitExceeded` when the body is larger than
    /// the configured limit, `HttpError::Transport` on read failures.
    pub async fn bytes(self) -> Result<Bytes, HttpError> {
        collect_body(self.inner.into_body()).await
    }

    /// Read the body as UTF-8 text, replacing invalid sequences.
    ///
    /// # Errors
    /// Same as [`bytes`](Self::bytes).
    pub async fn text(self) -> Result<String, HttpError> {
        let body = self.bytes().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Read and deserialize a JSON body.
    ///
    /// # Errors
    /// Same as [`bytes`](Self::bytes), plus `HttpError::Json`.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, HttpError> {
        let body = self.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

pub(crate) async fn collect_body(body: ResponseBody) -> Result<Bytes, HttpError> {
    let collected = body.collect().await.map_err(HttpError::from_boxed)?;
    Ok(collected.to_bytes())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::middleware::test_support::{FailingBody, chunked_body};
    use http_body_util::Full;

    fn response(body: ResponseBody) -> HttpResponse {
        HttpResponse {
            inner: Response::builder().status(200).body(body).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_text_and_json() {
        let body = Full::new(Bytes::from_static(br#"{"status":"ok"}"#))
            .map_err(|never| match never {})
            .boxed();
        let value: serde_json::Value = response(body).json().await.unwrap();
        assert_eq!(value["status"], "ok");

        let body = Full::new(Bytes::from_static(b"plain"))
            .map_err(|never| match never {})
            .boxed();
        assert_eq!(response(body).text().await.unwrap(), "plain");
    }

    #[tokio::test]
    async fn test_limit_error_survives_boxing() {
        let body = chunked_body(&["ab", "c"]);
        let failing = FailingBody::new(HttpError::ResponseLimitExceeded { limit: 2 }).boxed();
        assert_eq!(response(body).bytes().await.unwrap(), "abc");
        let err = response(failing).bytes().await.unwrap_err();
        assert!(err.is_response_limit_exceeded());
    }
}
