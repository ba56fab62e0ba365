//! The outbound HTTP boundary.
//!
//! [`Transport`] sends one request with whatever credential the caller hands
//! it and reports the raw status. Deciding what a 401 or 429 means is the
//! gateway's job.

use async_trait::async_trait;
use reqwest::{header, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::ApiError;
use crate::config::Config;

/// A request as issued by feature code, without any credential attached.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl OutgoingRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::DELETE,
            path: path.into(),
            body: None,
        }
    }

    pub fn post<B: Serialize>(path: impl Into<String>, body: &B) -> Result<Self, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode request body: {}", e)))?;
        Ok(Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: &OutgoingRequest,
        credential: Option<&str>,
    ) -> Result<TransportResponse, ApiError>;
}

/// reqwest-backed transport against the storefront API.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: &OutgoingRequest,
        credential: Option<&str>,
    ) -> Result<TransportResponse, ApiError> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path))
            .header(header::ACCEPT, "application/json");
        if let Some(token) = credential {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok(TransportResponse { status, body })
    }
}
