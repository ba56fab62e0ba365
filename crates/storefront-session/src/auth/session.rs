use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::schedule::ScheduledRenewal;
use super::storage::SessionStorage;

/// Role name carried by back-office accounts
const ADMIN_ROLE: &str = "admin";

/// Profile of the logged-in shopper or administrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserProfile {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == ADMIN_ROLE)
    }

    /// Name to show in status output, falling back to email then id.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }
}

/// Immutable snapshot of the current login.
///
/// A `Session` is never edited in place. Every transition builds a new value
/// and hands it to [`SessionStore::replace`], so a reader holding an
/// `Arc<Session>` always sees a complete record.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    user: Option<UserProfile>,
    #[serde(default)]
    access_credential: Option<String>,
    #[serde(default)]
    renewal_credential: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

impl Session {
    /// The logged-out session.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A fully logged-in session as returned by the login endpoint.
    pub fn authenticated(
        user: UserProfile,
        access_credential: String,
        renewal_credential: Option<String>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            user: Some(user),
            access_credential: Some(access_credential),
            renewal_credential,
            session_id,
        }
    }

    /// Successor session after a renewal. The renewal credential is only
    /// replaced when the service rotated it.
    pub fn renewed(&self, access_credential: String, rotated: Option<String>) -> Self {
        Self {
            user: self.user.clone(),
            access_credential: Some(access_credential),
            renewal_credential: rotated.or_else(|| self.renewal_credential.clone()),
            session_id: self.session_id.clone(),
        }
    }

    pub fn user(&self) -> Option<&UserProfile> {
        self.user.as_ref()
    }

    pub fn access_credential(&self) -> Option<&str> {
        self.access_credential.as_deref().filter(|c| !c.is_empty())
    }

    pub fn renewal_credential(&self) -> Option<&str> {
        self.renewal_credential.as_deref().filter(|c| !c.is_empty())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_credential().is_some()
    }

    /// No user may be present without an access credential.
    pub fn is_consistent(&self) -> bool {
        self.access_credential().is_some() || self.user.is_none()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::empty()
    }
}

// Credentials stay out of logs.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user.as_ref().map(|u| &u.id))
            .field("access_credential_set", &self.access_credential().is_some())
            .field("renewal_credential_set", &self.renewal_credential().is_some())
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Owner of the current [`Session`].
///
/// All mutation goes through [`replace`](Self::replace) and
/// [`clear`](Self::clear), or their epoch-checked variants used by renewals.
/// Each persists the change and rearm the scheduled
/// renewal before returning, so nobody observes a session whose timer state
/// lags behind it.
pub struct SessionStore {
    current: RwLock<Arc<Session>>,
    /// Serializes transitions so install, persist and rearm happen as one step.
    transition: Mutex<()>,
    /// Incremented by every transition not made by a renewal; lets an
    /// in-flight renewal detect a logout or a new login.
    epoch: AtomicU64,
    storage: Arc<dyn SessionStorage>,
    schedule: ScheduledRenewal,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn SessionStorage>, schedule: ScheduledRenewal) -> Self {
        Self {
            current: RwLock::new(Arc::new(Session::empty())),
            transition: Mutex::new(()),
            epoch: AtomicU64::new(0),
            storage,
            schedule,
        }
    }

    /// Current snapshot.
    pub fn read(&self) -> Arc<Session> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn schedule(&self) -> &ScheduledRenewal {
        &self.schedule
    }

    /// Number of logouts, logins and restores seen so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Current snapshot together with the epoch it belongs to.
    pub fn read_with_epoch(&self) -> (u64, Arc<Session>) {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        (self.epoch(), self.read())
    }

    /// Install a new session, persist it and rearm the renewal timer.
    ///
    /// Any renewal still in flight for the previous session is invalidated.
    pub fn replace(&self, next: Session) {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.install_and_persist(next);
        self.schedule.rearm(&self.read());
    }

    /// Install the result of a renewal started at `epoch`, unless the session
    /// was logged out or replaced since. Returns whether it was installed.
    pub fn replace_if_current(&self, epoch: u64, next: Session) -> bool {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        if self.epoch() != epoch {
            debug!(observed = epoch, current = self.epoch(), "Discarding renewal for a superseded session");
            return false;
        }
        self.install_and_persist(next);
        self.schedule.rearm_renewed(&self.read());
        true
    }

    /// Log out: drop the in-memory session, erase the durable record and
    /// cancel any scheduled renewal.
    pub fn clear(&self) {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        self.clear_locked();
    }

    /// Log out only if nothing changed the session since `epoch`. Returns
    /// whether the session was cleared.
    pub fn clear_if_current(&self, epoch: u64) -> bool {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        if self.epoch() != epoch {
            debug!(observed = epoch, current = self.epoch(), "Keeping session that replaced the failed one");
            return false;
        }
        self.clear_locked();
        true
    }

    /// Restore the session saved by a previous run.
    ///
    /// A well-formed record is installed without being written back; the
    /// renewal timer is then armed from its access credential. Missing or
    /// malformed records leave the store logged out. Returns whether a session
    /// was restored.
    pub fn hydrate(&self) -> bool {
        match self.storage.load() {
            Ok(Some(session)) if session.is_consistent() => {
                let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
                self.epoch.fetch_add(1, Ordering::SeqCst);
                self.install(session);
                let current = self.read();
                self.schedule.rearm(&current);
                debug!(authenticated = current.is_authenticated(), "Session hydrated");
                current.is_authenticated()
            }
            Ok(Some(_)) => {
                warn!("Persisted session has a user without an access credential, discarding");
                self.clear();
                false
            }
            Ok(None) => {
                debug!("No persisted session found");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to load persisted session, starting logged out");
                self.clear();
                false
            }
        }
    }

    fn install_and_persist(&self, next: Session) {
        self.install(next);
        if let Err(e) = self.storage.save(&self.read()) {
            warn!(error = %e, "Failed to save session");
        }
    }

    fn clear_locked(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let was_authenticated = self.install(Session::empty()).is_authenticated();
        if let Err(e) = self.storage.remove() {
            warn!(error = %e, "Failed to remove persisted session");
        }
        self.schedule.disarm();
        if was_authenticated {
            info!("Session cleared");
        }
    }

    /// Swap the snapshot, returning the previous one.
    fn install(&self, next: Session) -> Arc<Session> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, Arc::new(next))
    }
}
