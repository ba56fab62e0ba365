//! storefront-session - client-side login session for the storefront
//!
//! This crate keeps the shopper's or administrator's session alive:
//! - Session snapshot owned by a single `SessionStore`, persisted between runs
//! - Proactive renewal shortly before the access token expires
//! - Single-flight renewal: concurrent callers share one renewal call
//! - `RequestGateway` attaching credentials and retrying once after a 401
//! - Logout cascade when the renewal credential is gone or rejected

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
#[cfg(test)]
pub mod testutil;

pub use api::{ApiError, HttpAuthService, OutgoingRequest, RequestGateway};
pub use auth::{RefreshCoordinator, RefreshError, Session, SessionStore, UserProfile};
pub use config::Config;
pub use context::AuthContext;
