//! Transport timeout and pool policy.
//!
//! [`resolve_timeout_options`] turns the seconds/count values of
//! [`ProxySettings`] into a [`TimeoutOptions`] value. The result is handed to
//! the provider as plain data, so transports built from one provider never
//! observe a policy resolved later for another.

use crate::settings::ProxySettings;
use std::time::Duration;

/// Go-style default for idle connections kept per host when no limit is set.
const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 2;

/// Timeouts and connection pool limits applied to a base transport.
///
/// A zero duration disables the corresponding timeout. A zero connection
/// count means "no limit", except for `max_idle_conns_per_host` where zero
/// falls back to a small default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutOptions {
    /// Whole-exchange timeout, reading the response body included
    pub timeout: Duration,
    /// TCP connect timeout
    pub dial_timeout: Duration,
    /// TCP keep-alive interval
    pub keep_alive: Duration,
    /// Upper bound on the TLS handshake after the socket is connected
    pub tls_handshake_timeout: Duration,
    /// Kept for policy parity; hyper's client never sends `Expect: 100-continue`
    pub expect_continue_timeout: Duration,
    /// Maximum concurrent requests per target transport.
    ///
    /// Enforced as a request concurrency limit whose permit is released once
    /// response headers arrive. Bodies still streaming no longer count, so
    /// more sockets than this can be open at the same time.
    pub max_conns_per_host: usize,
    /// Maximum idle pooled connections
    pub max_idle_conns: usize,
    /// Maximum idle pooled connections per host
    pub max_idle_conns_per_host: usize,
    /// How long an idle pooled connection is kept
    pub idle_conn_timeout: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            expect_continue_timeout: Duration::from_secs(1),
            max_conns_per_host: 0,
            max_idle_conns: 100,
            max_idle_conns_per_host: 100,
            idle_conn_timeout: Duration::from_secs(90),
        }
    }
}

impl TimeoutOptions {
    /// Idle pool size per host as understood by hyper's single knob.
    ///
    /// hyper only limits idle connections per host, so the total idle limit
    /// caps the per-host one.
    #[must_use]
    pub fn effective_max_idle_per_host(&self) -> usize {
        let per_host = if self.max_idle_conns_per_host == 0 {
            DEFAULT_MAX_IDLE_CONNS_PER_HOST
        } else {
            self.max_idle_conns_per_host
        };
        if self.max_idle_conns == 0 {
            per_host
        } else {
            per_host.min(self.max_idle_conns)
        }
    }

    /// Idle timeout for the hyper pool; `None` keeps connections indefinitely.
    #[must_use]
    pub fn pool_idle_timeout(&self) -> Option<Duration> {
        non_zero(self.idle_conn_timeout)
    }

    /// Deadline for establishing a connection (dial plus TLS handshake).
    #[must_use]
    pub fn connect_deadline(&self) -> Option<Duration> {
        match (non_zero(self.dial_timeout), non_zero(self.tls_handshake_timeout)) {
            (Some(dial), Some(tls)) => Some(dial + tls),
            _ => None,
        }
    }
}

pub(crate) fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

/// Derive the default transport policy from process settings.
///
/// Call once while building the provider. The idle limit is used for both
/// the total and the per-host idle pool size.
#[must_use]
pub fn resolve_timeout_options(settings: &ProxySettings) -> TimeoutOptions {
    let options = TimeoutOptions {
        timeout: Duration::from_secs(settings.dataproxy_timeout),
        dial_timeout: Duration::from_secs(settings.dataproxy_dial_timeout),
        keep_alive: Duration::from_secs(settings.dataproxy_keep_alive),
        tls_handshake_timeout: Duration::from_secs(settings.dataproxy_tls_handshake_timeout),
        expect_continue_timeout: Duration::from_secs(settings.dataproxy_expect_continue_timeout),
        max_conns_per_host: settings.dataproxy_max_conns_per_host,
        max_idle_conns: settings.dataproxy_max_idle_conns,
        max_idle_conns_per_host: settings.dataproxy_max_idle_conns,
        idle_conn_timeout: Duration::from_secs(settings.dataproxy_idle_conn_timeout),
    };
    tracing::debug!(?options, "resolved default transport timeouts");
    options
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_maps_seconds_and_counts() {
        let settings = ProxySettings {
            dataproxy_timeout: 45,
            dataproxy_dial_timeout: 5,
            dataproxy_keep_alive: 15,
            dataproxy_tls_handshake_timeout: 3,
            dataproxy_expect_continue_timeout: 2,
            dataproxy_max_conns_per_host: 8,
            dataproxy_max_idle_conns: 16,
            dataproxy_idle_conn_timeout: 60,
            ..ProxySettings::default()
        };

        let t = resolve_timeout_options(&settings);
        assert_eq!(t.timeout, Duration::from_secs(45));
        assert_eq!(t.dial_timeout, Duration::from_secs(5));
        assert_eq!(t.keep_alive, Duration::from_secs(15));
        assert_eq!(t.tls_handshake_timeout, Duration::from_secs(3));
        assert_eq!(t.expect_continue_timeout, Duration::from_secs(2));
        assert_eq!(t.max_conns_per_host, 8);
        assert_eq!(t.max_idle_conns, 16);
        assert_eq!(t.max_idle_conns_per_host, 16);
        assert_eq!(t.idle_conn_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_default_settings_resolve_to_default_options() {
        assert_eq!(
            resolve_timeout_options(&ProxySettings::default()),
            TimeoutOptions::default()
        );
    }

    #[test]
    fn test_effective_idle_per_host() {
        let mut t = TimeoutOptions::default();
        assert_eq!(t.effective_max_idle_per_host(), 100);

        t.max_idle_conns = 10;
        assert_eq!(t.effective_max_idle_per_host(), 10);

        t.max_idle_conns_per_host = 0;
        assert_eq!(t.effective_max_idle_per_host(), 2);

        t.max_idle_conns = 0;
        t.max_idle_conns_per_host = 50;
        assert_eq!(t.effective_max_idle_per_host(), 50);
    }

    #[test]
    fn test_zero_durations_disable() {
        let t = TimeoutOptions {
            idle_conn_timeout: Duration::ZERO,
            tls_handshake_timeout: Duration::ZERO,
            ..TimeoutOptions::default()
        };
        assert_eq!(t.pool_idle_timeout(), None);
        assert_eq!(t.connect_deadline(), None);
        assert_eq!(
            TimeoutOptions::default().connect_deadline(),
            Some(Duration::from_secs(20))
        );
    }
}
