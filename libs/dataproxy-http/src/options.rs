//! Per-client options.
//!
//! [`Options`] is built by the caller that asks for a client and is read by
//! every interceptor while the chain is bound. Labels stay an open
//! string map for metadata; authentication, headers, limits and signing are
//! typed fields.

use crate::middleware::SigV4Config;
use crate::timeouts::TimeoutOptions;
use http::HeaderMap;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Label carrying the logical datasource (target) name.
pub const DATASOURCE_NAME_LABEL: &str = "datasource_name";
/// Label carrying the datasource plugin type.
pub const DATASOURCE_TYPE_LABEL: &str = "datasource_type";
/// Label enabling HAR capture when exactly `"true"`.
pub const HAR_LOG_ENABLED_LABEL: &str = "har_log_enabled";
/// Label overriding the HAR output path.
pub const HAR_LOG_PATH_LABEL: &str = "har_log_path";

/// Basic authentication credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Resolved HAR capture settings for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarLogOptions {
    pub datasource_name: String,
    /// Output file; `None` selects the default location
    pub path: Option<PathBuf>,
}

/// Configuration for one built client.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Free-form metadata (see the `*_LABEL` constants)
    pub labels: BTreeMap<String, String>,
    /// Overrides the provider's default timeout policy
    pub timeouts: Option<TimeoutOptions>,
    pub basic_auth: Option<BasicAuth>,
    /// Headers forced onto every request
    pub headers: HeaderMap,
    /// Overrides the provider's response limit (bytes, `0` = unlimited)
    pub response_limit: Option<u64>,
    pub sigv4: Option<SigV4Config>,
}

impl Options {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutOptions) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    #[must_use]
    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some(BasicAuth {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_response_limit(mut self, limit: u64) -> Self {
        self.response_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_sigv4(mut self, config: SigV4Config) -> Self {
        self.sigv4 = Some(config);
        self
    }

    /// Raw label lookup.
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Target identity, if present and non-empty.
    #[must_use]
    pub fn datasource_name(&self) -> Option<&str> {
        self.label(DATASOURCE_NAME_LABEL).filter(|s| !s.is_empty())
    }

    #[must_use]
    pub fn datasource_type(&self) -> Option<&str> {
        self.label(DATASOURCE_TYPE_LABEL).filter(|s| !s.is_empty())
    }

    /// HAR capture settings.
    ///
    /// Active only with a non-empty datasource name and `har_log_enabled`
    /// equal to the exact string `"true"`.
    #[must_use]
    pub fn har_log(&self) -> Option<HarLogOptions> {
        let datasource_name = self.datasource_name()?;
        if self.label(HAR_LOG_ENABLED_LABEL) != Some("true") {
            return None;
        }
        Some(HarLogOptions {
            datasource_name: datasource_name.to_owned(),
            path: self
                .label(HAR_LOG_PATH_LABEL)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_datasource_name_requires_non_empty() {
        assert_eq!(Options::new().datasource_name(), None);
        assert_eq!(
            Options::new()
                .with_label(DATASOURCE_NAME_LABEL, "")
                .datasource_name(),
            None
        );
        assert_eq!(
            Options::new()
                .with_label(DATASOURCE_NAME_LABEL, "loki")
                .datasource_name(),
            Some("loki")
        );
    }

    #[test]
    fn test_har_log_only_for_exact_true() {
        for value in ["false", "TRUE", "True", "1", "yes", " true", ""] {
            let opts = Options::new()
                .with_label(DATASOURCE_NAME_LABEL, "loki")
                .with_label(HAR_LOG_ENABLED_LABEL, value);
            assert_eq!(opts.har_log(), None, "value {value:?} must not activate");
        }

        let opts = Options::new()
            .with_label(DATASOURCE_NAME_LABEL, "My DB!")
            .with_label(HAR_LOG_ENABLED_LABEL, "true");
        assert_eq!(
            opts.har_log(),
            Some(HarLogOptions {
                datasource_name: "My DB!".to_owned(),
                path: None,
            })
        );
    }

    #[test]
    fn test_har_log_requires_datasource_name() {
        let opts = Options::new().with_label(HAR_LOG_ENABLED_LABEL, "true");
        assert_eq!(opts.har_log(), None);
    }

    #[test]
    fn test_har_log_path_override() {
        let opts = Options::new()
            .with_label(DATASOURCE_NAME_LABEL, "loki")
            .with_label(HAR_LOG_ENABLED_LABEL, "true")
            .with_label(HAR_LOG_PATH_LABEL, "/var/log/loki.har");
        assert_eq!(
            opts.har_log().unwrap().path,
            Some(PathBuf::from("/var/log/loki.har"))
        );
    }

    #[test]
    fn test_basic_auth_debug_redacts_password() {
        let opts = Options::new().with_basic_auth("admin", "hunter2");
        let debug = format!("{opts:?}");
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }
}
