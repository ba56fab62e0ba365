use thiserror::Error;

/// Failure of a request sent through the storefront gateway.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Signed in, but the account lacks the role (e.g. a shopper on an admin route).
    #[error("Not permitted for this account: {0}")]
    AccessDenied(String),

    #[error("Not logged in, or the session could not be renewed")]
    Unauthorized,

    /// 400 or 422: the storefront refused the payload (cart, checkout, profile).
    #[error("Request rejected by the storefront: {0}")]
    Rejected(String),

    #[error("No such storefront resource: {0}")]
    NotFound(String),

    #[error("Storefront is rate limiting this client")]
    RateLimited,

    #[error("Storefront unavailable: {0}")]
    ServerError(String),

    #[error("Could not reach the storefront: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Unexpected storefront response: {0}")]
    InvalidResponse(String),
}

/// Failure reported by the renewal service.
///
/// Both kinds end the session; they are kept apart for logging and for
/// callers that want to tell a revoked login from an outage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    #[error("renewal credential invalid or expired: {0}")]
    Rejected(String),

    #[error("renewal service unreachable: {0}")]
    Transport(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            400 | 422 => ApiError::Rejected(truncated),
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}
