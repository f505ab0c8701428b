use serde::{Deserialize, Serialize};

use crate::buildinfo;

/// `service.name` reported when none is configured.
pub const DEFAULT_SERVICE_NAME: &str = "wsproxy";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trace export
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// OpenTelemetry trace export.
///
/// Structured JSON logs are always on.  Setting `otlp_endpoint` also
/// forwards every span over OTLP/gRPC, tagged with the build version and
/// the replica's hostname so spans from sibling replicas can be told apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`.  Unset or empty
    /// disables export.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Overrides [`DEFAULT_SERVICE_NAME`].
    #[serde(default)]
    pub service_name: Option<String>,

    /// Fraction of traces kept, in `[0.0, 1.0]`.
    #[serde(default = "d_sample_rate")]
    pub sample_rate: f64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: None,
            sample_rate: d_sample_rate(),
        }
    }
}

impl ObservabilityConfig {
    /// The endpoint to export to, when export is enabled.
    pub fn export_endpoint(&self) -> Option<&str> {
        self.otlp_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }

    pub fn service_name(&self) -> &str {
        self.service_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SERVICE_NAME)
    }

    /// Resource attributes identifying one replica to the collector,
    /// besides `service.name`.
    pub fn replica_attributes(&self, replica_hostname: &str) -> Vec<(&'static str, String)> {
        vec![
            ("service.version", buildinfo::version().to_owned()),
            ("service.instance.id", replica_hostname.to_owned()),
        ]
    }
}

fn d_sample_rate() -> f64 {
    1.0
}
