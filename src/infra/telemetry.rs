//! Crash and system report sinks.

use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use crate::domain::{SystemReport, TelemetrySink};

/// Posts reports as JSON to a collector endpoint.
///
/// Every report is sent from a detached task; delivery failures are logged
/// at debug level and otherwise ignored.
#[derive(Debug, Clone)]
pub struct HttpTelemetrySink {
    http_client: Client,
    url: String,
}

impl HttpTelemetrySink {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            http_client,
            url: url.into(),
        }
    }

    fn send(&self, payload: serde_json::Value) {
        let client = self.http_client.clone();
        let url = self.url.clone();
        // No runtime (e.g. a panic during shutdown): drop the report.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            if let Err(e) = client.post(&url).json(&payload).send().await {
                debug!(error = %e, "Telemetry delivery failed");
            }
        });
    }
}

impl TelemetrySink for HttpTelemetrySink {
    fn report_panic(&self, message: String) {
        self.send(json!({
            "kind": "panic",
            "message": message,
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": Utc::now(),
        }));
    }

    fn report_system(&self, report: SystemReport) {
        self.send(json!({
            "kind": "system",
            "report": report,
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

/// Sink used when no collector is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetrySink;

impl TelemetrySink for NoopTelemetrySink {
    fn report_panic(&self, _message: String) {}

    fn report_system(&self, _report: SystemReport) {}
}
