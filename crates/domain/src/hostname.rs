//! Wildcard application hostnames.
//!
//! A wildcard hostname such as `*.apps.example.com` or
//! `*--apps.example.com` names the host every subdomain application is
//! served under.  The pattern is compiled once into a [`Regex`] whose first
//! capture group is the application subdomain.

use regex::Regex;

use crate::error::{Error, Result};

/// Compile a wildcard hostname into a host-matching regex.
///
/// Rules:
/// - exactly one `*`, and it must be the first character
/// - no scheme, path or port
/// - the suffix after `*` must be non-empty and must not end with `.`
///
/// The resulting regex matches a full `Host` value (optionally with a port)
/// case-insensitively and captures the part replaced by `*`.
pub fn compile_hostname_pattern(pattern: &str) -> Result<Regex> {
    let pattern = pattern.trim().to_ascii_lowercase();

    if pattern.contains("://") {
        return Err(Error::Config(format!(
            "wildcard hostname {pattern:?} must not include a scheme"
        )));
    }
    if pattern.contains('/') || pattern.contains(':') {
        return Err(Error::Config(format!(
            "wildcard hostname {pattern:?} must not include a path or port"
        )));
    }
    if !pattern.starts_with('*') {
        return Err(Error::Config(format!(
            "wildcard hostname {pattern:?} must start with '*'"
        )));
    }
    if pattern.matches('*').count() != 1 {
        return Err(Error::Config(format!(
            "wildcard hostname {pattern:?} must contain exactly one '*'"
        )));
    }

    let suffix = &pattern[1..];
    if suffix.is_empty() || suffix == "." {
        return Err(Error::Config(format!(
            "wildcard hostname {pattern:?} must have a suffix after '*'"
        )));
    }
    if suffix.ends_with('.') {
        return Err(Error::Config(format!(
            "wildcard hostname {pattern:?} must not end with '.'"
        )));
    }
    if !suffix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(Error::Config(format!(
            "wildcard hostname {pattern:?} contains invalid characters"
        )));
    }

    let regex = format!(r"(?i)^([^.]+){}(:\d+)?$", regex::escape(suffix));
    Regex::new(&regex).map_err(|e| Error::Config(format!("compile {pattern:?}: {e}")))
}

/// Hostname this replica reports to the primary and to trace collectors.
pub fn replica_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract the application subdomain from `host` using a compiled pattern.
pub fn app_subdomain<'a>(pattern: &Regex, host: &'a str) -> Option<&'a str> {
    pattern
        .captures(host)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_suffix_pattern_matches_subdomains() {
        let re = compile_hostname_pattern("*.apps.example.com").unwrap();
        assert_eq!(
            app_subdomain(&re, "code--main--ws--alice.apps.example.com"),
            Some("code--main--ws--alice")
        );
        assert_eq!(app_subdomain(&re, "x.APPS.example.com:8443"), Some("x"));
        assert_eq!(app_subdomain(&re, "a.b.apps.example.com"), None);
        assert_eq!(app_subdomain(&re, "apps.example.com"), None);
    }

    #[test]
    fn dash_suffix_pattern_matches_subdomains() {
        let re = compile_hostname_pattern("*--apps.example.com").unwrap();
        assert_eq!(app_subdomain(&re, "term--apps.example.com"), Some("term"));
        assert_eq!(app_subdomain(&re, "term.apps.example.com"), None);
    }

    #[test]
    fn invalid_patterns_rejected() {
        for bad in [
            "apps.example.com",
            "https://*.apps.example.com",
            "*.apps.example.com:8080",
            "*.*.example.com",
            "*.apps.example.com.",
            "*",
            "*.apps_example.com",
        ] {
            assert!(compile_hostname_pattern(bad).is_err(), "{bad} should be rejected");
        }
    }
}
