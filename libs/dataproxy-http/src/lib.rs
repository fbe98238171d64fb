#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Outbound HTTP clients for the multi-tenant data proxy
//!
//! Every datasource gets its own client: a pooled hyper transport wrapped in
//! an ordered chain of interceptors built from the organisation policy.
//! - Tracing span per request with optional W3C trace-context propagation
//! - Per-datasource request metrics and connection tagging
//! - Opt-in HAR capture of traffic
//! - User-Agent, basic auth and custom header injection
//! - Response size limit surfaced as a distinct error
//! - Optional AWS SigV4 request signing
//!
//! # Example
//!
//! ```ignore
//! use dataproxy_http::{NoopTracer, Options, ProxySettings, new_provider};
//! use std::sync::Arc;
//!
//! let settings = ProxySettings::load(None)?;
//! let provider = new_provider(&settings, Arc::new(NoopTracer));
//!
//! let client = provider.new_client(
//!     &Options::new()
//!         .with_label("datasource_name", "prometheus-eu")
//!         .with_label("datasource_type", "prometheus"),
//! )?;
//! let body = client
//!     .get("https://prometheus.internal/api/v1/query?query=up")
//!     .send()
//!     .await?
//!     .text()
//!     .await?;
//! ```

mod client;
pub mod conntrack;
mod datasource;
mod error;
pub mod har;
pub mod middleware;
mod options;
pub mod otel;
mod provider;
mod request;
mod response;
mod sanitize;
mod settings;
mod timeouts;
mod tls;
mod transport;

pub use client::{DEFAULT_BUFFER_CAPACITY, HttpClient};
pub use datasource::new_provider;
pub use error::{BoxError, HttpError, InvalidUriKind};
pub use middleware::{Middleware, NamedMiddleware, SigV4AuthType, SigV4Config, chain};
pub use options::{
    BasicAuth, DATASOURCE_NAME_LABEL, DATASOURCE_TYPE_LABEL, HAR_LOG_ENABLED_LABEL,
    HAR_LOG_PATH_LABEL, HarLogOptions, Options,
};
pub use otel::{NoopTracer, Tracer};
pub use provider::{ConfigureTransportFn, Provider, ProviderOptions};
pub use request::RequestBuilder;
pub use response::{HttpResponse, ResponseBody};
pub use sanitize::{SanitizeError, sanitize_label_name};
pub use settings::{ENV_PREFIX, ProxySettings, SettingsError};
pub use timeouts::{TimeoutOptions, resolve_timeout_options};
pub use transport::{BoxTransport, TlsRootConfig, Transport, TransportSecurity};
