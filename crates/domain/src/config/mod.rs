mod dialer;
mod observability;
mod proxy;
mod registration;
mod server;

pub use dialer::*;
pub use observability::*;
pub use proxy::*;
pub use registration::*;
pub use server::*;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hostname::compile_hostname_pattern;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub dialer: DialerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigError {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

/// Every error-severity issue found by [`Config::validate`], reported
/// together so an operator can fix them in one pass.
#[derive(Debug, Clone)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl ValidationErrors {
    /// Keep only error-severity issues; `None` when there are none.
    pub fn from_issues(issues: &[ConfigError]) -> Option<Self> {
        let errors: Vec<ConfigError> = issues
            .iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .cloned()
            .collect();
        if errors.is_empty() {
            None
        } else {
            Some(Self(errors))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "config validation failed with {} error(s):", self.0.len())?;
        for issue in &self.0 {
            writeln!(f, "  {issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

// ── named validators ────────────────────────────────────────────────

/// Required absolute http(s) URL.
fn required_url(field: &str, value: &str, errors: &mut Vec<ConfigError>) {
    if value.trim().is_empty() {
        errors.push(ConfigError::error(field, "is required, got the zero value"));
        return;
    }
    match url::Url::parse(value) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
        Ok(u) => errors.push(ConfigError::error(
            field,
            format!("scheme must be http or https, got {:?}", u.scheme()),
        )),
        Err(e) => errors.push(ConfigError::error(field, format!("invalid URL: {e}"))),
    }
}

fn not_empty(field: &str, value: Option<&str>, errors: &mut Vec<ConfigError>) {
    if value.map(str::trim).unwrap_or("").is_empty() {
        errors.push(ConfigError::error(field, "is required, got the zero value"));
    }
}

fn positive(field: &str, value: u64, errors: &mut Vec<ConfigError>) {
    if value == 0 {
        errors.push(ConfigError::error(field, "must be greater than 0"));
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.  Callers decide
    /// what to do with warnings; any error-severity issue must prevent the
    /// node from starting.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        required_url("proxy.primary_url", &self.proxy.primary_url, &mut errors);
        required_url("proxy.access_url", &self.proxy.access_url, &mut errors);
        not_empty(
            "proxy.session_token",
            self.proxy.resolve_session_token().as_deref(),
            &mut errors,
        );

        if !self.proxy.app_hostname.is_empty() {
            if let Err(e) = compile_hostname_pattern(&self.proxy.app_hostname) {
                errors.push(ConfigError::error("proxy.app_hostname", e.to_string()));
            }
        }

        if self.proxy.relay_enabled && self.proxy.relay_address.is_empty() {
            errors.push(ConfigError::warning(
                "proxy.relay_address",
                "relay enabled without a relay address; siblings cannot mesh with this proxy",
            ));
        }
        if !self.proxy.relay_address.is_empty() {
            required_url("proxy.relay_address", &self.proxy.relay_address, &mut errors);
        }

        positive("registration.interval_secs", self.registration.interval_secs, &mut errors);
        positive(
            "registration.attempt_timeout_secs",
            self.registration.attempt_timeout_secs,
            &mut errors,
        );
        if self.registration.close_grace_secs <= self.registration.attempt_timeout_secs {
            errors.push(ConfigError::warning(
                "registration.close_grace_secs",
                "grace period should exceed the attempt timeout or shutdown may report a spurious timeout",
            ));
        }

        if self.dialer.strategy == DialerStrategy::Cache {
            positive("dialer.cache_max_entries", self.dialer.cache_max_entries as u64, &mut errors);
        }

        if let Some(endpoint) = self.observability.export_endpoint() {
            required_url("observability.otlp_endpoint", endpoint, &mut errors);
        }
        if !(0.0..=1.0).contains(&self.observability.sample_rate) {
            errors.push(ConfigError::error(
                "observability.sample_rate",
                "must be between 0.0 and 1.0",
            ));
        }

        if self.server.port == 0 {
            errors.push(ConfigError::error("server.port", "port must be greater than 0"));
        }
        if self.server.host.is_empty() {
            errors.push(ConfigError::error("server.host", "host must not be empty"));
        }
        if self.server.cors.allow_all {
            errors.push(ConfigError::warning(
                "server.cors.allow_all",
                "all origins allowed (not recommended for production)",
            ));
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut cfg = Config::default();
        cfg.proxy.primary_url = "https://coder.example.com".into();
        cfg.proxy.access_url = "https://eu.proxy.example.com".into();
        cfg.proxy.session_token = Some("proxy-token".into());
        cfg.proxy.relay_address = "http://10.0.0.5:3001".into();
        cfg
    }

    fn errors_of(cfg: &Config) -> Vec<ConfigError> {
        cfg.validate()
            .into_iter()
            .filter(|e| e.severity == ConfigSeverity::Error)
            .collect()
    }

    #[test]
    fn valid_config_has_no_errors() {
        assert!(errors_of(&valid()).is_empty());
    }

    #[test]
    fn all_missing_fields_reported_together() {
        let mut cfg = Config::default();
        cfg.proxy.session_token_env = "WSP_TEST_TOKEN_THAT_IS_NEVER_SET".into();
        let errors = errors_of(&cfg);
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"proxy.primary_url"));
        assert!(fields.contains(&"proxy.access_url"));
        assert!(fields.contains(&"proxy.session_token"));

        let agg = ValidationErrors::from_issues(&cfg.validate()).unwrap();
        let text = agg.to_string();
        assert!(text.contains("proxy.primary_url"));
        assert!(text.contains("proxy.session_token"));
        assert_eq!(text.lines().count(), errors.len() + 1);
    }

    #[test]
    fn non_http_url_rejected() {
        let mut cfg = valid();
        cfg.proxy.access_url = "ftp://proxy.example.com".into();
        let errors = errors_of(&cfg);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "proxy.access_url");
    }

    #[test]
    fn invalid_app_hostname_rejected() {
        let mut cfg = valid();
        cfg.proxy.app_hostname = "apps.example.com".into();
        let errors = errors_of(&cfg);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "proxy.app_hostname");
    }

    #[test]
    fn trace_export_settings_checked() {
        let mut cfg = valid();
        cfg.observability.otlp_endpoint = Some("localhost:4317".into());
        cfg.observability.sample_rate = 1.5;
        let fields: Vec<String> = errors_of(&cfg).into_iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["observability.otlp_endpoint", "observability.sample_rate"]
        );
    }

    #[test]
    fn warnings_do_not_block() {
        let mut cfg = valid();
        cfg.server.cors.allow_all = true;
        assert!(ValidationErrors::from_issues(&cfg.validate()).is_none());
        assert!(cfg
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Warning));
    }
}
