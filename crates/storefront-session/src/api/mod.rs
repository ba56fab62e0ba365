//! Network side of the session coordinator.
//!
//! This module provides the `RequestGateway` that feature code sends every
//! storefront request through, the `Transport` boundary it sends on, and the
//! `HttpAuthService` that logs in and renews credentials.
//!
//! The API uses bearer token authentication. Access tokens are short-lived
//! JWTs; a longer-lived refresh token obtains new ones.

pub mod auth;
pub mod error;
pub mod gateway;
pub mod transport;

pub use auth::{HttpAuthService, RenewalService, RenewedCredentials};
pub use error::{ApiError, RenewalError};
pub use gateway::RequestGateway;
pub use transport::{HttpTransport, OutgoingRequest, Transport, TransportResponse};
