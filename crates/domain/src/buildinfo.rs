//! Build metadata and version comparison.
//!
//! The proxy reports its own version to the primary on every registration
//! and compares it against the primary's version during health checks.
//! Only the major and minor components take part in the comparison.

/// Version string compiled into this binary.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Link to the source of this build, when the build pipeline provided one.
pub fn external_url() -> &'static str {
    option_env!("WSPROXY_EXTERNAL_URL").unwrap_or("")
}

/// Build identity of the running process.
///
/// Held as a value (rather than read from globals at each call site) so the
/// health checks can be exercised against arbitrary versions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: String,
    pub external_url: String,
}

impl BuildInfo {
    /// Metadata of the binary that is currently running.
    pub fn current() -> Self {
        Self {
            version: version().to_owned(),
            external_url: external_url().to_owned(),
        }
    }

    /// Development builds never report version skew.
    pub fn is_dev(&self) -> bool {
        is_dev_version(&self.version)
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::current()
    }
}

/// Whether `version` identifies a development build.
///
/// Development builds carry a `-devel` pre-release tag or the `0.0.0`
/// placeholder version.
pub fn is_dev_version(version: &str) -> bool {
    let v = version.trim().trim_start_matches('v');
    v.starts_with("0.0.0") || v.contains("-devel")
}

/// Compare two versions on their major and minor components.
///
/// Patch versions, pre-release tags and build metadata are ignored. When
/// either side cannot be parsed the versions are assumed to match, so a
/// malformed version string never produces a spurious warning.
pub fn versions_match(a: &str, b: &str) -> bool {
    match (major_minor(a), major_minor(b)) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

fn major_minor(version: &str) -> Option<(u64, u64)> {
    let v = version.trim().trim_start_matches('v');
    let core = v.split(['-', '+']).next()?;
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
