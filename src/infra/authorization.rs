//! HTTP client for the external authorization service.
//!
//! Grants are looked up with `GET {base}/access/{access_id}` and usage is
//! reported with `POST {base}/grants/{grant_id}/usage`. Both calls carry the
//! service bearer token. Identifiers are sent as single percent-encoded
//! path segments.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, error, instrument, warn};
use validator::Validate;

use crate::domain::{
    AppError, AuthorizationService, ConfigError, ExternalServiceError, GrantRecord,
};

/// Default timeout for authorization calls
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize)]
struct UsageUpdate {
    delta: u64,
}

/// Bearer-token authenticated authorization client
#[derive(Debug, Clone)]
pub struct HttpAuthorizationService {
    http_client: Client,
    base_url: Url,
    token: SecretString,
}

impl HttpAuthorizationService {
    pub fn new(base_url: &str, token: SecretString, timeout: Duration) -> Result<Self, AppError> {
        let http_client = Client::builder().timeout(timeout).build().map_err(|e| {
            AppError::Config(ConfigError::InvalidValue {
                key: "AUTH_SERVICE_TIMEOUT_MS".to_string(),
                message: e.to_string(),
            })
        })?;

        let invalid_url = |message: String| {
            AppError::Config(ConfigError::InvalidValue {
                key: "AUTH_SERVICE_URL".to_string(),
                message,
            })
        };
        let base_url = Url::parse(base_url).map_err(|e| invalid_url(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid_url(format!("{} cannot carry a path", base_url)));
        }

        Ok(Self {
            http_client,
            base_url,
            token,
        })
    }

    /// Base URL extended with one path segment per element. Segments that
    /// would change the path structure are rejected before encoding.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, AppError> {
        if let Some(segment) = segments
            .iter()
            .find(|s| matches!(**s, "" | "." | ".."))
        {
            return Err(AppError::Authorization(format!(
                "Invalid identifier {:?}",
                segment
            )));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                AppError::Config(ConfigError::InvalidValue {
                    key: "AUTH_SERVICE_URL".to_string(),
                    message: "URL cannot carry a path".to_string(),
                })
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }
}

#[async_trait]
impl AuthorizationService for HttpAuthorizationService {
    #[instrument(skip(self))]
    async fn resolve(&self, access_id: &str) -> Result<GrantRecord, AppError> {
        let url = self.endpoint(&["access", access_id])?;
        debug!(url = %url, "Resolving access grant");

        let response = self
            .http_client
            .get(url)
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Authorization service request failed");
                AppError::ExternalService(ExternalServiceError::from(e))
            })?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => {
                warn!(access_id = %access_id, "Unknown access id");
                return Err(AppError::Authorization(format!(
                    "Unknown access id {}",
                    access_id
                )));
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                error!(status = %status, body = %body, "Authorization service returned error");
                return Err(AppError::ExternalService(ExternalServiceError::ApiError {
                    status_code: status.as_u16(),
                    message: body,
                }));
            }
        }

        let record: GrantRecord = response.json().await.map_err(|e| {
            warn!(access_id = %access_id, error = %e, "Malformed grant record");
            AppError::Authorization(format!("Malformed grant for access id {}", access_id))
        })?;

        record.validate().map_err(|e| {
            warn!(access_id = %access_id, error = %e, "Invalid grant record");
            AppError::Authorization(format!("Invalid grant for access id {}", access_id))
        })?;

        if record.access_id != access_id {
            warn!(
                access_id = %access_id,
                returned = %record.access_id,
                "Grant belongs to a different access id"
            );
            return Err(AppError::Authorization(format!(
                "Grant mismatch for access id {}",
                access_id
            )));
        }

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn update_usage(&self, grant_id: &str, delta: u64) -> Result<(), AppError> {
        let url = self.endpoint(&["grants", grant_id, "usage"])?;

        let response = self
            .http_client
            .post(url)
            .header("Authorization", self.bearer())
            .json(&UsageUpdate { delta })
            .send()
            .await
            .map_err(|e| AppError::ExternalService(ExternalServiceError::from(e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalService(ExternalServiceError::ApiError {
                status_code: status.as_u16(),
                message: body,
            }));
        }

        debug!(grant_id = %grant_id, delta = delta, "Usage reported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let service = HttpAuthorizationService::new(
            "http://auth.internal/v1/",
            SecretString::from("token".to_string()),
            DEFAULT_AUTH_TIMEOUT,
        )
        .unwrap();
        assert_eq!(
            service.endpoint(&["access", "abc"]).unwrap().as_str(),
            "http://auth.internal/v1/access/abc"
        );
        assert_eq!(service.bearer(), "Bearer token");
    }

    #[test]
    fn test_identifiers_stay_in_one_segment() {
        let service = HttpAuthorizationService::new(
            "http://auth.internal",
            SecretString::from("token".to_string()),
            DEFAULT_AUTH_TIMEOUT,
        )
        .unwrap();
        let url = service
            .endpoint(&["access", "../grants/x/usage?admin=1#top"])
            .unwrap();
        assert_eq!(url.path(), "/access/..%2Fgrants%2Fx%2Fusage%3Fadmin=1%23top");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);

        for id in ["", ".", ".."] {
            assert!(matches!(
                service.endpoint(&["access", id]),
                Err(AppError::Authorization(_))
            ));
        }
    }

    #[test]
    fn test_unusable_base_url_is_rejected() {
        for base in ["not a url", "mailto:auth@example.com"] {
            let result = HttpAuthorizationService::new(
                base,
                SecretString::from("token".to_string()),
                DEFAULT_AUTH_TIMEOUT,
            );
            assert!(matches!(result, Err(AppError::Config(_))));
        }
    }

    #[test]
    fn test_token_is_not_debug_printed() {
        let service = HttpAuthorizationService::new(
            "http://auth.internal",
            SecretString::from("super-secret".to_string()),
            DEFAULT_AUTH_TIMEOUT,
        )
        .unwrap();
        assert!(!format!("{:?}", service).contains("super-secret"));
    }
}
