//! Process-wide data proxy policy.
//!
//! [`ProxySettings`] is read once at startup and handed to
//! [`new_provider`](crate::new_provider). Values are layered with `figment`:
//! built-in defaults, then an optional YAML file, then `DATAPROXY_*`
//! environment variables.

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Environment variable prefix for settings overrides.
pub const ENV_PREFIX: &str = "DATAPROXY_";

/// Errors raised while loading [`ProxySettings`].
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The merged configuration could not be extracted
    #[error("invalid data proxy settings: {0}")]
    Figment(#[from] Box<figment::Error>),
}

impl From<figment::Error> for SettingsError {
    fn from(err: figment::Error) -> Self {
        SettingsError::Figment(Box::new(err))
    }
}

/// Organisation-wide outbound HTTP policy.
///
/// Durations are whole seconds and connection limits are counts, matching
/// the operator-facing configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Product name used for the User-Agent and as the metrics prefix
    pub app_name: String,
    /// Build version stamped into the User-Agent
    pub build_version: String,
    /// Maximum response body size in bytes (`0` = unlimited)
    pub response_limit: u64,
    /// Append the SigV4 signing interceptor to every chain
    pub sigv4_auth_enabled: bool,
    /// Log canonical requests produced while signing
    pub sigv4_verbose_logging: bool,
    /// Refuse plain `http://` upstreams
    pub https_only: bool,

    pub dataproxy_timeout: u64,
    pub dataproxy_dial_timeout: u64,
    pub dataproxy_keep_alive: u64,
    pub dataproxy_tls_handshake_timeout: u64,
    pub dataproxy_expect_continue_timeout: u64,
    pub dataproxy_max_conns_per_host: usize,
    pub dataproxy_max_idle_conns: usize,
    pub dataproxy_idle_conn_timeout: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            app_name: "dataproxy".to_owned(),
            build_version: env!("CARGO_PKG_VERSION").to_owned(),
            response_limit: 0,
            sigv4_auth_enabled: false,
            sigv4_verbose_logging: false,
            https_only: false,
            dataproxy_timeout: 30,
            dataproxy_dial_timeout: 10,
            dataproxy_keep_alive: 30,
            dataproxy_tls_handshake_timeout: 10,
            dataproxy_expect_continue_timeout: 1,
            dataproxy_max_conns_per_host: 0,
            dataproxy_max_idle_conns: 100,
            dataproxy_idle_conn_timeout: 90,
        }
    }
}

impl ProxySettings {
    /// Load settings from defaults, an optional YAML file and the environment.
    ///
    /// # Errors
    /// Returns `SettingsError` if a value has the wrong type or the YAML file
    /// is malformed. A missing file is not an error.
    pub fn load(config_file: Option<&Path>) -> Result<Self, SettingsError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));
        Self::from_figment(&figment)
    }

    /// Extract settings from an existing figment (e.g. a host application's).
    ///
    /// # Errors
    /// Returns `SettingsError` if extraction fails.
    pub fn from_figment(figment: &Figment) -> Result<Self, SettingsError> {
        let settings: Self = figment.extract()?;
        tracing::debug!(
            app_name = %settings.app_name,
            response_limit = settings.response_limit,
            sigv4 = settings.sigv4_auth_enabled,
            "data proxy settings loaded"
        );
        Ok(settings)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        let s = ProxySettings::default();
        assert_eq!(s.dataproxy_timeout, 30);
        assert_eq!(s.dataproxy_dial_timeout, 10);
        assert_eq!(s.dataproxy_idle_conn_timeout, 90);
        assert_eq!(s.dataproxy_max_idle_conns, 100);
        assert_eq!(s.response_limit, 0);
        assert!(!s.sigv4_auth_enabled);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let s = ProxySettings::load(None).map_err(|e| e.to_string())?;
            assert_eq!(s, ProxySettings::default());
            Ok(())
        });
    }

    #[test]
    fn test_yaml_then_env_precedence() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "dataproxy.yaml",
                r"
build_version: 11.2.0
response_limit: 2048
dataproxy_timeout: 45
sigv4_auth_enabled: true
",
            )?;
            jail.set_env("DATAPROXY_DATAPROXY_TIMEOUT", "60");

            let s = ProxySettings::load(Some(Path::new("dataproxy.yaml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(s.build_version, "11.2.0");
            assert_eq!(s.response_limit, 2048);
            assert!(s.sigv4_auth_enabled);
            assert_eq!(s.dataproxy_timeout, 60);
            assert_eq!(s.dataproxy_dial_timeout, 10);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_type_is_reported() {
        Jail::expect_with(|jail| {
            jail.set_env("DATAPROXY_DATAPROXY_MAX_IDLE_CONNS", "lots");
            let result = ProxySettings::load(None);
            assert!(matches!(result, Err(SettingsError::Figment(_))));
            Ok(())
        });
    }
}
