//! Authenticated request path for feature code.
//!
//! Every outbound storefront call goes through [`RequestGateway`]. It attaches
//! the current access credential, backs off on rate limiting, and on a 401
//! asks the [`RefreshCoordinator`] for a fresh credential and retries once.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::transport::{OutgoingRequest, Transport, TransportResponse};
use super::ApiError;
use crate::auth::{RefreshCoordinator, SessionStore};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Clone)]
pub struct RequestGateway {
    transport: Arc<dyn Transport>,
    store: Arc<SessionStore>,
    coordinator: Arc<RefreshCoordinator>,
}

impl RequestGateway {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<SessionStore>,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            transport,
            store,
            coordinator,
        }
    }

    /// Send a request with the current credential.
    ///
    /// A 401 triggers one coordinated renewal and one retry with the renewed
    /// credential. If the store already holds a different credential than the
    /// one sent, the retry uses it without renewing. If the renewal fails, or the retry is rejected again, the
    /// caller gets [`ApiError::Unauthorized`].
    pub async fn send(&self, request: &OutgoingRequest) -> Result<TransportResponse, ApiError> {
        // Reading the snapshot never starts a renewal.
        let credential = self.store.read().access_credential().map(str::to_owned);
        let response = self.send_with_backoff(request, credential.as_deref()).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Self::check_response(response);
        }

        let current = self.store.read().access_credential().map(str::to_owned);
        let fresh = match current {
            // Another request's renewal landed while this one was on the wire.
            Some(current) if credential.as_deref() != Some(current.as_str()) => {
                debug!(path = %request.path, "Request unauthorized, retrying with newer credential");
                current
            }
            _ => {
                debug!(path = %request.path, "Request unauthorized, renewing session");
                match self.coordinator.ensure_fresh().await {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        warn!(path = %request.path, error = %e, "Session renewal failed");
                        return Err(ApiError::Unauthorized);
                    }
                }
            }
        };

        let retried = self.send_with_backoff(request, Some(&fresh)).await?;
        if retried.status == StatusCode::UNAUTHORIZED {
            warn!(path = %request.path, "Request still unauthorized after renewal");
        }
        Self::check_response(retried)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(&OutgoingRequest::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(&OutgoingRequest::post(path, body)?).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(&OutgoingRequest::delete(path)).await.map(|_| ())
    }

    /// Send, retrying with exponential backoff while the server answers 429.
    async fn send_with_backoff(
        &self,
        request: &OutgoingRequest,
        credential: Option<&str>,
    ) -> Result<TransportResponse, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self.transport.execute(request, credential).await?;
            if response.status != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(path = %request.path, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }

    /// Check if response is successful, returning an error with body if not.
    fn check_response(response: TransportResponse) -> Result<TransportResponse, ApiError> {
        if response.status.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }
}
