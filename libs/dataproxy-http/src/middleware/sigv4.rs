//! AWS Signature Version 4 request signing.
//!
//! Credentials are resolved once when the chain is bound; each request is
//! then signed by `aws-sigv4` just before it reaches the transport. Any
//! `Authorization` or `x-amz-*` header already on the request is replaced.

use super::Middleware;
use crate::error::{BoxError, HttpError};
use crate::options::Options;
use crate::transport::BoxTransport;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    PayloadChecksumKind, PercentEncodingMode, SignableBody, SignableRequest, SigningParams,
    SigningSettings, UriPathNormalizationMode, sign,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::{HeaderName, Request};
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;
use thiserror::Error;
use tower::{Layer, Service, ServiceExt};

pub const SIGV4_MIDDLEWARE_NAME: &str = "sigv4";

/// Headers never included in the signature.
const UNSIGNED_HEADERS: [&str; 4] = [
    "authorization",
    "user-agent",
    "x-amzn-trace-id",
    "x-forwarded-for",
];

/// Errors raised while resolving credentials or signing a request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SigV4Error {
    #[error("no credentials available for SigV4 auth type {0:?}")]
    MissingCredentials(SigV4AuthType),

    #[error("SigV4 auth type {0:?} is not supported")]
    UnsupportedAuthType(SigV4AuthType),

    #[error("SigV4 {0} must not be empty")]
    MissingField(&'static str),

    #[error("SigV4 signing failed: {0}")]
    Signing(#[source] BoxError),
}

impl SigV4Error {
    fn signing(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        SigV4Error::Signing(Box::new(err))
    }
}

/// Where signing credentials come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigV4AuthType {
    /// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`
    #[default]
    Default,
    /// Static keys from [`SigV4Config`]
    Keys,
    /// Shared credentials file profile
    Credentials,
    /// EC2 instance metadata role
    Ec2IamRole,
    /// Role assumed by the proxy itself
    GrafanaAssumeRole,
}

/// Per-datasource signing configuration.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigV4Config {
    pub auth_type: SigV4AuthType,
    pub region: String,
    pub service: String,
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    pub assume_role_arn: Option<String>,
    pub external_id: Option<String>,
    pub profile: Option<String>,
}

impl fmt::Debug for SigV4Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigV4Config")
            .field("auth_type", &self.auth_type)
            .field("region", &self.region)
            .field("service", &self.service)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("assume_role_arn", &self.assume_role_arn)
            .field("external_id", &self.external_id)
            .field("profile", &self.profile)
            .finish()
    }
}

impl SigV4Config {
    /// Resolve the credentials for this configuration.
    ///
    /// # Errors
    /// Returns `SigV4Error` for unsupported auth types or when no credentials
    /// are available.
    pub fn credentials(&self) -> Result<SigningCredentials, SigV4Error> {
        match self.auth_type {
            SigV4AuthType::Keys => SigningCredentials::new(
                &self.access_key,
                &self.secret_key,
                self.session_token.clone(),
            )
            .ok_or(SigV4Error::MissingCredentials(self.auth_type)),
            SigV4AuthType::Default => {
                let access_key = std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default();
                let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default();
                let session_token = std::env::var("AWS_SESSION_TOKEN")
                    .ok()
                    .filter(|t| !t.is_empty());
                SigningCredentials::new(&access_key, &secret_key, session_token)
                    .ok_or(SigV4Error::MissingCredentials(self.auth_type))
            }
            other => Err(SigV4Error::UnsupportedAuthType(other)),
        }
    }
}

/// Resolved AWS credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl SigningCredentials {
    fn new(access_key: &str, secret_key: &str, session_token: Option<String>) -> Option<Self> {
        if access_key.is_empty() || secret_key.is_empty() {
            return None;
        }
        Some(Self {
            access_key: access_key.to_owned(),
            secret_key: secret_key.to_owned(),
            session_token,
        })
    }
}

impl fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Signs requests of clients whose options carry a [`SigV4Config`].
///
/// Clients without one, or whose credentials cannot be resolved, are left
/// unsigned.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigV4Middleware {
    verbose: bool,
}

impl SigV4Middleware {
    /// `verbose` logs every signed request and its signature at debug level.
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl Middleware for SigV4Middleware {
    fn name(&self) -> &str {
        SIGV4_MIDDLEWARE_NAME
    }

    fn wrap(&self, opts: &Options, next: BoxTransport) -> BoxTransport {
        let Some(config) = &opts.sigv4 else {
            return next;
        };
        match SigV4Layer::try_new(config, self.verbose) {
            Ok(layer) => layer.layer(next).boxed_clone(),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    datasource = opts.datasource_name().unwrap_or_default(),
                    "SigV4 signing disabled"
                );
                next
            }
        }
    }
}

struct Signer {
    identity: Identity,
    region: String,
    service: String,
    verbose: bool,
}

impl Signer {
    fn from_config(config: &SigV4Config, verbose: bool) -> Result<Self, SigV4Error> {
        if config.region.is_empty() {
            return Err(SigV4Error::MissingField("region"));
        }
        if config.service.is_empty() {
            return Err(SigV4Error::MissingField("service"));
        }
        Ok(Self::new(
            config.credentials()?,
            &config.region,
            &config.service,
            verbose,
        ))
    }

    fn new(credentials: SigningCredentials, region: &str, service: &str, verbose: bool) -> Self {
        let SigningCredentials {
            access_key,
            secret_key,
            session_token,
        } = credentials;
        let credentials =
            Credentials::new(access_key, secret_key, session_token, None, "dataproxy");
        Self {
            identity: credentials.into(),
            region: region.to_owned(),
            service: service.to_owned(),
            verbose,
        }
    }

    fn settings(&self) -> SigningSettings {
        let mut settings = SigningSettings::default();
        if self.service == "s3" {
            settings.payload_checksum_kind = PayloadChecksumKind::XAmzSha256;
            settings.percent_encoding_mode = PercentEncodingMode::Single;
            settings.uri_path_normalization_mode = UriPathNormalizationMode::Disabled;
        }
        settings
    }

    fn sign(&self, req: &mut Request<Bytes>, now: SystemTime) -> Result<(), SigV4Error> {
        strip_signature_headers(req.headers_mut());

        let params: SigningParams<'_> = v4::SigningParams::builder()
            .identity(&self.identity)
            .region(&self.region)
            .name(&self.service)
            .time(now)
            .settings(self.settings())
            .build()
            .map_err(SigV4Error::signing)?
            .into();

        let uri = req.uri().to_string();
        let headers = req
            .headers()
            .iter()
            .filter(|(name, _)| !UNSIGNED_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)));
        let signable = SignableRequest::new(
            req.method().as_str(),
            uri.as_str(),
            headers,
            SignableBody::Bytes(req.body()),
        )
        .map_err(SigV4Error::signing)?;
        let (instructions, signature) = sign(signable, &params)
            .map_err(SigV4Error::signing)?
            .into_parts();

        if self.verbose {
            tracing::debug!(
                method = req.method().as_str(),
                uri = %uri,
                region = %self.region,
                service = %self.service,
                signature = %signature,
                "SigV4 signed request"
            );
        }

        instructions.apply_to_request_http1x(req);
        if let Some(authorization) = req.headers_mut().get_mut(AUTHORIZATION) {
            authorization.set_sensitive(true);
        }
        Ok(())
    }
}

fn strip_signature_headers(headers: &mut http::HeaderMap) {
    headers.remove(AUTHORIZATION);
    let stale: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("x-amz-"))
        .cloned()
        .collect();
    for name in stale {
        headers.remove(name);
    }
}

#[derive(Clone)]
pub struct SigV4Layer {
    signer: Arc<Signer>,
}

impl SigV4Layer {
    /// # Errors
    /// Returns `SigV4Error` when region or service is empty or credentials
    /// cannot be resolved.
    pub fn try_new(config: &SigV4Config, verbose: bool) -> Result<Self, SigV4Error> {
        Ok(Self {
            signer: Arc::new(Signer::from_config(config, verbose)?),
        })
    }
}

impl<S> Layer<S> for SigV4Layer {
    type Service = SigV4Service<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SigV4Service {
            inner,
            signer: Arc::clone(&self.signer),
        }
    }
}

#[derive(Clone)]
pub struct SigV4Service<S> {
    inner: S,
    signer: Arc<Signer>,
}

impl<S> Service<Request<Full<Bytes>>> for SigV4Service<S>
where
    S: Service<Request<Full<Bytes>>, Error = HttpError> + Clone + Send + 'static,
    S::Future: Send,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, HttpError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        let signer = Arc::clone(&self.signer);
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(never) => match never {},
            };
            let mut req = Request::from_parts(parts, body);
            signer.sign(&mut req, SystemTime::now())?;
            inner.call(req.map(Full::new)).await
        })
    }
}
