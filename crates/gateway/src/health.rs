//! Proxy self-diagnosis served at `/healthz-report`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use wsp_domain::buildinfo::{versions_match, BuildInfo};
use wsp_protocol::ProxyHealthReport;
use wsp_sdk::PrimaryApi;

/// Body returned while the node is closing.
pub const SHUTTING_DOWN_MESSAGE: &str = "workspace proxy in middle of shutting down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    /// The node is closing; no checks were run.
    ShuttingDown,
    Report(ProxyHealthReport),
}

pub struct HealthReporter {
    primary: Arc<dyn PrimaryApi>,
    build: BuildInfo,
    shutdown: CancellationToken,
}

impl HealthReporter {
    pub fn new(primary: Arc<dyn PrimaryApi>, build: BuildInfo, shutdown: CancellationToken) -> Self {
        Self {
            primary,
            build,
            shutdown,
        }
    }

    /// Run the checks against the primary.
    ///
    /// A build-info failure ends the report early.  A primary that is
    /// itself a proxy is an error; version skew is only a warning and is
    /// skipped for development builds.
    pub async fn check_health(&self) -> HealthOutcome {
        if self.shutdown.is_cancelled() {
            return HealthOutcome::ShuttingDown;
        }

        let mut report = ProxyHealthReport::default();
        let primary = match self.primary.build_info().await {
            Ok(info) => info,
            Err(e) => {
                report.errors.push(format!("failed to get build info: {e}"));
                return HealthOutcome::Report(report);
            }
        };

        if primary.workspace_proxy {
            report.errors.push(format!(
                "dashboard url ({}) is a workspace proxy, must be a primary coderd",
                self.primary.primary_url()
            ));
        }

        if !self.build.is_dev() && !versions_match(&primary.version, &self.build.version) {
            report.warnings.push(format!(
                "version mismatch: primary coderd ({}) != workspace proxy ({})",
                primary.version, self.build.version
            ));
        }

        HealthOutcome::Report(report)
    }
}
