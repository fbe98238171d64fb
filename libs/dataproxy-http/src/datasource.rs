//! Data proxy wiring of the generic [`Provider`].

use crate::conntrack::tag_connections;
use crate::middleware::{
    BasicAuthMiddleware, CustomHeadersMiddleware, DatasourceMetricNames, HttpLoggerMiddleware,
    MetricsMiddleware, Middleware, ResponseLimitMiddleware, SigV4Middleware, TracingMiddleware,
    UserAgentMiddleware,
};
use crate::options::Options;
use crate::otel::Tracer;
use crate::provider::{Provider, ProviderOptions};
use crate::sanitize::sanitize_label_name;
use crate::settings::ProxySettings;
use crate::timeouts::resolve_timeout_options;
use crate::transport::{Transport, TransportSecurity};
use std::sync::Arc;

/// Provider with the data proxy's interceptor chain and transport policy.
///
/// Interceptors, outermost first: tracing, metrics, HAR logger, user agent,
/// basic auth, custom headers, response limit, then SigV4 signing when
/// `sigv4_auth_enabled` is set. Connections of named datasources are tagged
/// with the sanitized datasource name.
#[must_use]
pub fn new_provider(settings: &ProxySettings, tracer: Arc<dyn Tracer>) -> Provider {
    let user_agent = format!("{}/{}", settings.app_name, settings.build_version);

    let mut middlewares: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(TracingMiddleware::new(tracer)),
        Arc::new(MetricsMiddleware::new(DatasourceMetricNames::with_prefix(
            &settings.app_name,
        ))),
        Arc::new(HttpLoggerMiddleware),
        Arc::new(UserAgentMiddleware::new(&user_agent)),
        Arc::new(BasicAuthMiddleware),
        Arc::new(CustomHeadersMiddleware),
        Arc::new(ResponseLimitMiddleware::new(settings.response_limit)),
    ];
    if settings.sigv4_auth_enabled {
        middlewares.push(Arc::new(SigV4Middleware::new(settings.sigv4_verbose_logging)));
    }

    let security = if settings.https_only {
        TransportSecurity::TlsOnly
    } else {
        TransportSecurity::AllowInsecureHttp
    };

    Provider::new(ProviderOptions {
        middlewares,
        timeouts: resolve_timeout_options(settings),
        configure_transport: Some(Arc::new(tag_datasource_connections)),
        security,
        ..ProviderOptions::default()
    })
}

/// Tag dialed connections with the sanitized datasource name.
fn tag_datasource_connections(opts: &Options, transport: Transport) -> Transport {
    let Some(name) = opts.datasource_name() else {
        return transport;
    };
    match sanitize_label_name(name) {
        Ok(label) => tag_connections(&label, transport),
        Err(e) => {
            tracing::debug!(datasource = name, error = %e, "connection tagging skipped");
            transport
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::options::DATASOURCE_NAME_LABEL;
    use crate::otel::NoopTracer;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[test]
    fn test_chain_order_without_sigv4() {
        let provider = new_provider(&ProxySettings::default(), Arc::new(NoopTracer));
        assert_eq!(
            provider.middleware_names(),
            [
                "tracing",
                "metrics",
                "http-logger",
                "user-agent",
                "basic-auth",
                "custom-headers",
                "response-limit",
            ]
        );
    }

    #[test]
    fn test_sigv4_appended_last_when_enabled() {
        let settings = ProxySettings {
            sigv4_auth_enabled: true,
            ..ProxySettings::default()
        };
        let provider = new_provider(&settings, Arc::new(NoopTracer));
        let names = provider.middleware_names();
        assert_eq!(names.len(), 8);
        assert_eq!(names.last(), Some(&"sigv4"));
    }

    #[test]
    fn test_settings_reach_transport() {
        let settings = ProxySettings {
            dataproxy_timeout: 45,
            https_only: true,
            ..ProxySettings::default()
        };
        let provider = new_provider(&settings, Arc::new(NoopTracer));
        let transport = provider.configure_transport(&Options::new());
        assert_eq!(transport.timeouts.timeout, Duration::from_secs(45));
        assert_eq!(transport.security, TransportSecurity::TlsOnly);
        assert_eq!(provider.security(), TransportSecurity::TlsOnly);
    }

    #[test]
    fn test_named_datasource_connections_are_tagged() {
        let provider = new_provider(&ProxySettings::default(), Arc::new(NoopTracer));

        let tagged = provider
            .configure_transport(&Options::new().with_label(DATASOURCE_NAME_LABEL, "My DB!"));
        assert_eq!(tagged.connection_tag(), Some("My_DB"));

        let untagged = provider.configure_transport(&Options::new());
        assert_eq!(untagged.connection_tag(), None);
    }

    #[traced_test]
    #[test]
    fn test_unsanitizable_name_leaves_transport_untagged() {
        let provider = new_provider(&ProxySettings::default(), Arc::new(NoopTracer));
        let transport =
            provider.configure_transport(&Options::new().with_label(DATASOURCE_NAME_LABEL, "!!!"));
        assert_eq!(transport.connection_tag(), None);
        assert!(logs_contain("connection tagging skipped"));
    }
}
