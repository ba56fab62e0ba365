//! Shared test doubles for the session components.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use reqwest::StatusCode;
use tokio::sync::Notify;

use crate::api::{ApiError, OutgoingRequest, RenewalError, RenewalService, RenewedCredentials};
use crate::api::{Transport, TransportResponse};
use crate::auth::{
    ExpiryClock, MemorySessionStorage, RefreshCoordinator, ScheduledRenewal, Session,
    SessionStore, UserProfile,
};

/// JWT-shaped token with an arbitrary payload segment.
pub fn token_with_payload(payload: &str) -> String {
    format!(
        "{}.{}.signature",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(payload)
    )
}

/// JWT-shaped token whose `exp` is `secs` from now.
pub fn token_expiring_in(secs: i64) -> String {
    token_with_payload(&format!(
        r#"{{"sub":"u-1","exp":{}}}"#,
        Utc::now().timestamp() + secs
    ))
}

pub fn signed_in(access: &str, renewal: Option<&str>) -> Session {
    signed_in_as("u-1", access, renewal)
}

pub fn signed_in_as(user_id: &str, access: &str, renewal: Option<&str>) -> Session {
    let user = UserProfile {
        id: user_id.to_string(),
        email: Some("shopper@example.com".to_string()),
        display_name: Some("Shopper".to_string()),
        roles: vec!["customer".to_string()],
    };
    Session::authenticated(
        user,
        access.to_string(),
        renewal.map(str::to_string),
        Some("session-1".to_string()),
    )
}

/// Store backed by memory plus a coordinator wired to `service`.
pub fn harness(service: ScriptedRenewal) -> (Arc<SessionStore>, Arc<RefreshCoordinator>) {
    let store = Arc::new(SessionStore::new(
        Arc::new(MemorySessionStorage::new()),
        ScheduledRenewal::new(ExpiryClock::default()),
    ));
    let coordinator = RefreshCoordinator::new(Arc::clone(&store), Arc::new(service));
    (store, coordinator)
}

/// Yield until `count` callers are queued on the coordinator.
pub async fn wait_for_waiters(coordinator: &RefreshCoordinator, count: usize) {
    while coordinator.pending_waiters() < count {
        tokio::task::yield_now().await;
    }
}

/// Renewal service returning a fixed outcome, optionally held open until
/// [`release`](Self::release) is called.
#[derive(Clone)]
pub struct ScriptedRenewal {
    outcome: Result<RenewedCredentials, RenewalError>,
    calls: Arc<AtomicUsize>,
    last_credential: Arc<Mutex<Option<String>>>,
    gate: Option<Arc<Notify>>,
    panics: bool,
}

impl ScriptedRenewal {
    fn with_outcome(outcome: Result<RenewedCredentials, RenewalError>) -> Self {
        Self {
            outcome,
            calls: Arc::new(AtomicUsize::new(0)),
            last_credential: Arc::new(Mutex::new(None)),
            gate: None,
            panics: false,
        }
    }

    pub fn succeeding(access: &str) -> Self {
        Self::with_outcome(Ok(RenewedCredentials {
            access_credential: access.to_string(),
            renewal_credential: None,
        }))
    }

    pub fn rotating(access: &str, renewal: &str) -> Self {
        Self::with_outcome(Ok(RenewedCredentials {
            access_credential: access.to_string(),
            renewal_credential: Some(renewal.to_string()),
        }))
    }

    pub fn rejecting(reason: &str) -> Self {
        Self::with_outcome(Err(RenewalError::Rejected(reason.to_string())))
    }

    pub fn failing(reason: &str) -> Self {
        Self::with_outcome(Err(RenewalError::Transport(reason.to_string())))
    }

    /// Service whose every call panics.
    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Self::failing("unreachable")
        }
    }

    /// Hold each renewal until released.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Notify::new()));
        self
    }

    pub fn release(&self) {
        if let Some(ref gate) = self.gate {
            gate.notify_one();
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_credential(&self) -> Option<String> {
        self.last_credential.lock().expect("lock").clone()
    }
}

#[async_trait]
impl RenewalService for ScriptedRenewal {
    async fn renew(&self, renewal_credential: &str) -> Result<RenewedCredentials, RenewalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_credential.lock().expect("lock") = Some(renewal_credential.to_string());
        if let Some(ref gate) = self.gate {
            gate.notified().await;
        }
        if self.panics {
            panic!("renewal service crashed");
        }
        self.outcome.clone()
    }
}

#[derive(Clone)]
enum Policy {
    /// 200 for this credential, 401 for anything else.
    Accept(String),
    /// 200 regardless of credential.
    Public,
    Status(StatusCode),
}

/// Transport that answers according to a fixed policy and records which
/// credential each request carried.
#[derive(Clone)]
pub struct ScriptedTransport {
    policy: Policy,
    rate_limited: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Option<String>>>>,
}

impl ScriptedTransport {
    fn with_policy(policy: Policy) -> Self {
        Self {
            policy,
            rate_limited: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn accepting(credential: &str) -> Self {
        Self::with_policy(Policy::Accept(credential.to_string()))
    }

    pub fn public() -> Self {
        Self::with_policy(Policy::Public)
    }

    pub fn with_status(status: StatusCode) -> Self {
        Self::with_policy(Policy::Status(status))
    }

    /// Answer the first `count` requests with 429.
    pub fn rate_limited_first(self, count: usize) -> Self {
        self.rate_limited.store(count, Ordering::SeqCst);
        self
    }

    pub fn credentials_seen(&self) -> Vec<Option<String>> {
        self.seen.lock().expect("lock").clone()
    }

    pub fn requests(&self) -> usize {
        self.seen.lock().expect("lock").len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(
        &self,
        _request: &OutgoingRequest,
        credential: Option<&str>,
    ) -> Result<TransportResponse, ApiError> {
        self.seen.lock().expect("lock").push(credential.map(str::to_string));

        let limited = self
            .rate_limited
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if limited {
            return Ok(TransportResponse::new(StatusCode::TOO_MANY_REQUESTS, ""));
        }

        let ok = TransportResponse::new(StatusCode::OK, r#"{"ok": true}"#);
        Ok(match &self.policy {
            Policy::Accept(expected) if credential == Some(expected.as_str()) => ok,
            Policy::Accept(_) => TransportResponse::new(StatusCode::UNAUTHORIZED, "token expired"),
            Policy::Public => ok,
            Policy::Status(status) => TransportResponse::new(*status, "denied"),
        })
    }
}
