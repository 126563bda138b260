//! Mock implementations for testing.

use async_trait::async_trait;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::domain::{
    AppError, AuthorizationService, ExternalServiceError, GrantRecord, SystemReport,
    TelemetrySink, TipProbe, UpstreamError,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }

    fn message(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "Mock error".to_string())
    }
}

/// Mock authorization service for testing
pub struct MockAuthorizationService {
    grants: Arc<Mutex<HashMap<String, GrantRecord>>>,
    usage: Arc<Mutex<Vec<(String, u64)>>>,
    config: MockConfig,
    failing: AtomicBool,
    resolve_calls: AtomicUsize,
}

impl MockAuthorizationService {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        let failing = AtomicBool::new(config.should_fail);
        Self {
            grants: Arc::new(Mutex::new(HashMap::new())),
            usage: Arc::new(Mutex::new(Vec::new())),
            config,
            failing,
            resolve_calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails as if the service were unreachable
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn insert(&self, record: GrantRecord) {
        self.grants
            .lock()
            .unwrap()
            .insert(record.access_id.clone(), record);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Number of `resolve` calls received
    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::Relaxed)
    }

    /// Successful usage updates, in order
    pub fn usage_updates(&self) -> Vec<(String, u64)> {
        self.usage.lock().unwrap().clone()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(AppError::ExternalService(ExternalServiceError::Network(
                self.config.message(),
            )));
        }
        Ok(())
    }
}

impl Default for MockAuthorizationService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthorizationService for MockAuthorizationService {
    async fn resolve(&self, access_id: &str) -> Result<GrantRecord, AppError> {
        self.resolve_calls.fetch_add(1, Ordering::Relaxed);
        self.check_should_fail()?;
        self.grants
            .lock()
            .unwrap()
            .get(access_id)
            .cloned()
            .ok_or_else(|| AppError::Authorization(format!("Unknown access id {}", access_id)))
    }

    async fn update_usage(&self, grant_id: &str, delta: u64) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.usage
            .lock()
            .unwrap()
            .push((grant_id.to_string(), delta));
        Ok(())
    }
}

/// Mock tip probe answering fixed heights per endpoint
#[derive(Default)]
pub struct MockTipProbe {
    heights: Mutex<HashMap<String, u64>>,
    calls: AtomicUsize,
}

impl MockTipProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_height(&self, endpoint: &Url, height: u64) {
        self.heights
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), height);
    }

    /// Unknown endpoints fail their probe
    pub fn set_failing(&self, endpoint: &Url) {
        self.heights.lock().unwrap().remove(endpoint.as_str());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TipProbe for MockTipProbe {
    async fn latest_block_height(&self, endpoint: &Url) -> Result<u64, AppError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.heights
            .lock()
            .unwrap()
            .get(endpoint.as_str())
            .copied()
            .ok_or_else(|| UpstreamError::Transport(format!("{} unreachable", endpoint)).into())
    }
}

/// Mock telemetry sink recording every report
#[derive(Default)]
pub struct MockTelemetrySink {
    panics: Mutex<Vec<String>>,
    reports: Mutex<Vec<SystemReport>>,
}

impl MockTelemetrySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn panics(&self) -> Vec<String> {
        self.panics.lock().unwrap().clone()
    }

    pub fn system_reports(&self) -> Vec<SystemReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl TelemetrySink for MockTelemetrySink {
    fn report_panic(&self, message: String) {
        self.panics.lock().unwrap().push(message);
    }

    fn report_system(&self, report: SystemReport) {
        self.reports.lock().unwrap().push(report);
    }
}
