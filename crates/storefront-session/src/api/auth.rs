//! Client for the storefront authentication service: login and renewal.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ApiError, RenewalError};
use crate::auth::{Session, UserProfile};
use crate::config::Config;

/// Credentials issued by a successful renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewedCredentials {
    pub access_credential: String,
    /// Present only when the service rotated the renewal credential.
    pub renewal_credential: Option<String>,
}

/// The renewal collaborator of the [`RefreshCoordinator`](crate::auth::RefreshCoordinator).
#[async_trait]
pub trait RenewalService: Send + Sync {
    async fn renew(&self, renewal_credential: &str) -> Result<RenewedCredentials, RenewalError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    user: UserProfile,
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

impl LoginResponse {
    fn into_session(self) -> Session {
        let session_id = self.session_id.unwrap_or_else(new_session_id);
        Session::authenticated(self.user, self.access_token, self.refresh_token, Some(session_id))
    }
}

/// Random correlation id for sessions the server did not label.
fn new_session_id() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

/// HTTP client for the authentication endpoints.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpAuthService {
    client: Client,
    auth_base_url: String,
}

impl HttpAuthService {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            auth_base_url: config.auth_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Log in with email and password, returning the new session.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        let url = format!("{}/login", self.auth_base_url);

        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&LoginRequest { email, password })
            .send()
            .await
            .context("Failed to send login request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body).into());
        }

        let login: LoginResponse = response.json().await.context("Failed to parse login response")?;
        if login.refresh_token.is_none() {
            warn!("Login response carried no renewal credential, session cannot be renewed");
        }
        Ok(login.into_session())
    }
}

#[async_trait]
impl RenewalService for HttpAuthService {
    async fn renew(&self, renewal_credential: &str) -> Result<RenewedCredentials, RenewalError> {
        let url = format!("{}/token/refresh", self.auth_base_url);

        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&RefreshRequest {
                refresh_token: renewal_credential,
            })
            .send()
            .await
            .map_err(|e| RenewalError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(%status, "Renewal request refused");
            return Err(renewal_error_for(status, &body));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RenewalError::Transport(format!("Failed to parse renewal response: {}", e)))?;
        Ok(RenewedCredentials {
            access_credential: body.access_token,
            renewal_credential: body.refresh_token,
        })
    }
}

/// 400/401/403 mean the renewal credential itself is no good.
fn renewal_error_for(status: StatusCode, body: &str) -> RenewalError {
    let body = ApiError::truncate_body(body);
    match status.as_u16() {
        400 | 401 | 403 => RenewalError::Rejected(format!("status {}: {}", status, body)),
        _ => RenewalError::Transport(format!("status {}: {}", status, body)),
    }
}
