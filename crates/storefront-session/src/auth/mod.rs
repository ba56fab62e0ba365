//! Authentication module for holding and renewing the login session.
//!
//! This module provides:
//! - `Session` / `SessionStore`: the current login and its single owner
//! - `SessionStorage`: durable backends (file, OS keychain, memory)
//! - `ExpiryClock`: renewal deadline from the access token's `exp` claim
//! - `RefreshCoordinator`: single-flight renewal shared by all callers
//! - `ScheduledRenewal`: the timer that renews shortly before expiry
//!
//! Access tokens are renewed 5 minutes before they expire by default.

pub mod coordinator;
pub mod expiry;
pub mod schedule;
pub mod session;
pub mod storage;

pub use coordinator::{RefreshCoordinator, RefreshError};
pub use expiry::ExpiryClock;
pub use schedule::ScheduledRenewal;
pub use session::{Session, SessionStore, UserProfile};
pub use storage::{
    FileSessionStorage, KeyringSessionStorage, MemorySessionStorage, SessionStorage, StorageKind,
};
