//! Client factory.
//!
//! A [`Provider`] holds the ordered interceptor list and the default
//! transport policy. Every [`Provider::new_client`] call builds a fresh base
//! transport for the given [`Options`], lets the configure hook adjust it,
//! and binds the interceptors around it.

use crate::client::{DEFAULT_BUFFER_CAPACITY, HttpClient};
use crate::error::HttpError;
use crate::middleware::{Middleware, chain};
use crate::options::Options;
use crate::timeouts::TimeoutOptions;
use crate::transport::{BoxTransport, TlsRootConfig, Transport, TransportSecurity};
use std::fmt;
use std::sync::Arc;

/// Hook adjusting the base transport of one client before it is built.
pub type ConfigureTransportFn = Arc<dyn Fn(&Options, Transport) -> Transport + Send + Sync>;

/// Inputs of a [`Provider`].
#[derive(Clone, Default)]
pub struct ProviderOptions {
    /// Interceptors, outermost first
    pub middlewares: Vec<Arc<dyn Middleware>>,
    /// Transport policy used when [`Options::timeouts`] is unset
    pub timeouts: TimeoutOptions,
    pub configure_transport: Option<ConfigureTransportFn>,
    pub security: TransportSecurity,
    pub tls_roots: TlsRootConfig,
    /// Per-client request queue; `0` selects the default
    pub buffer_capacity: usize,
}

impl fmt::Debug for ProviderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderOptions")
            .field(
                "middlewares",
                &self.middlewares.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .field("timeouts", &self.timeouts)
            .field("configure_transport", &self.configure_transport.is_some())
            .field("security", &self.security)
            .field("tls_roots", &self.tls_roots)
            .field("buffer_capacity", &self.buffer_capacity)
            .finish()
    }
}

/// Builds per-datasource clients sharing one interceptor list.
#[derive(Debug, Clone)]
pub struct Provider {
    opts: Arc<ProviderOptions>,
}

impl Provider {
    #[must_use]
    pub fn new(opts: ProviderOptions) -> Self {
        Self {
            opts: Arc::new(opts),
        }
    }

    /// Interceptor names, outermost first.
    #[must_use]
    pub fn middleware_names(&self) -> Vec<&str> {
        self.opts.middlewares.iter().map(|m| m.name()).collect()
    }

    #[must_use]
    pub fn security(&self) -> TransportSecurity {
        self.opts.security
    }

    /// The base transport for `opts`, configured but not yet built.
    #[must_use]
    pub fn configure_transport(&self, opts: &Options) -> Transport {
        let timeouts = opts
            .timeouts
            .clone()
            .unwrap_or_else(|| self.opts.timeouts.clone());
        let transport = Transport::new(timeouts)
            .with_security(self.opts.security)
            .with_tls_roots(self.opts.tls_roots);
        match &self.opts.configure_transport {
            Some(configure) => configure(opts, transport),
            None => transport,
        }
    }

    /// Build the base transport for `opts` and bind every interceptor.
    ///
    /// # Errors
    /// Returns `HttpError::Tls` if the TLS root store cannot be built.
    pub fn transport(&self, opts: &Options) -> Result<BoxTransport, HttpError> {
        let base = self.configure_transport(opts).into_service()?;
        Ok(chain(&self.opts.middlewares, opts, base))
    }

    /// Client for one datasource. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// Returns `HttpError::Tls` if the TLS root store cannot be built.
    pub fn new_client(&self, opts: &Options) -> Result<HttpClient, HttpError> {
        let transport = self.transport(opts)?;
        let capacity = match self.opts.buffer_capacity {
            0 => DEFAULT_BUFFER_CAPACITY,
            n => n,
        };
        tracing::debug!(
            datasource = opts.datasource_name().unwrap_or_default(),
            middlewares = ?self.middleware_names(),
            "built datasource http client"
        );
        Ok(HttpClient::from_transport(
            transport,
            self.opts.security,
            capacity,
        ))
    }
}
