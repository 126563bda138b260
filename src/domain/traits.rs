//! Domain traits defining contracts for external systems.

use async_trait::async_trait;
use reqwest::Url;

use super::error::AppError;
use super::types::{GrantRecord, SystemReport};

/// Authorization service resolving access identifiers to grants
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    /// Fetch the grant for an access identifier.
    ///
    /// Returns `AppError::Authorization` when the identifier is unknown and
    /// `AppError::ExternalService` when the service cannot be reached.
    async fn resolve(&self, access_id: &str) -> Result<GrantRecord, AppError>;

    /// Add `delta` calls to the persisted usage of a grant
    async fn update_usage(&self, grant_id: &str, delta: u64) -> Result<(), AppError>;
}

/// Chain-tip query used by the health checker
#[async_trait]
pub trait TipProbe: Send + Sync {
    /// Latest block height reported by the node at `endpoint`
    async fn latest_block_height(&self, endpoint: &Url) -> Result<u64, AppError>;
}

/// Crash and telemetry reporting sink.
///
/// Reports are fire-and-forget; implementations swallow their own failures.
pub trait TelemetrySink: Send + Sync {
    fn report_panic(&self, message: String);

    fn report_system(&self, report: SystemReport);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(u64);

    #[async_trait]
    impl TipProbe for FixedProbe {
        async fn latest_block_height(&self, _endpoint: &Url) -> Result<u64, AppError> {
            Ok(self.0)
        }
    }

    struct DenyAll;

    #[async_trait]
    impl AuthorizationService for DenyAll {
        async fn resolve(&self, access_id: &str) -> Result<GrantRecord, AppError> {
            Err(AppError::Authorization(format!("unknown access id {}", access_id)))
        }

        async fn update_usage(&self, _grant_id: &str, _delta: u64) -> Result<(), AppError> {
            Err(AppError::Authorization("unknown grant".to_string()))
        }
    }

    #[tokio::test]
    async fn test_trait_objects_are_usable_behind_arc() {
        let probe: std::sync::Arc<dyn TipProbe> = std::sync::Arc::new(FixedProbe(42));
        let url = Url::parse("http://localhost:8545").unwrap();
        assert_eq!(probe.latest_block_height(&url).await.unwrap(), 42);

        let auth: std::sync::Arc<dyn AuthorizationService> = std::sync::Arc::new(DenyAll);
        assert!(matches!(
            auth.resolve("abc").await,
            Err(AppError::Authorization(_))
        ));
    }
}
