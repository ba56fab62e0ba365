use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::session::SessionStore;
use crate::api::{RenewalError, RenewalService};

/// Outcome of a renewal as seen by every caller that waited on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No renewal credential available - login required")]
    MissingRenewalCredential,

    #[error("Renewal credential rejected: {0}")]
    Rejected(String),

    #[error("Renewal request failed: {0}")]
    Transport(String),

    #[error("Session was logged out while renewing")]
    LoggedOut,

    #[error("A new login replaced the session while renewing")]
    Superseded,

    #[error("Renewal ended without a result")]
    Abandoned,
}

impl From<RenewalError> for RefreshError {
    fn from(err: RenewalError) -> Self {
        match err {
            RenewalError::Rejected(reason) => RefreshError::Rejected(reason),
            RenewalError::Transport(reason) => RefreshError::Transport(reason),
        }
    }
}

type Waiter = oneshot::Sender<Result<String, RefreshError>>;

enum FlightState {
    Idle,
    /// Everyone waiting on the running renewal, including whoever started it.
    RenewalInFlight { waiters: Vec<Waiter> },
}

/// Single-flight renewal of the access credential.
///
/// However many callers ask for a fresh credential while a renewal is running,
/// only one call reaches the [`RenewalService`]. Every caller gets the same
/// outcome once it settles. A failed renewal logs the session out.
pub struct RefreshCoordinator {
    store: Arc<SessionStore>,
    service: Arc<dyn RenewalService>,
    state: Mutex<FlightState>,
    renewals_started: AtomicU64,
}

impl RefreshCoordinator {
    /// Create the coordinator and attach it to the store's scheduled renewal.
    pub fn new(store: Arc<SessionStore>, service: Arc<dyn RenewalService>) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            store: Arc::clone(&store),
            service,
            state: Mutex::new(FlightState::Idle),
            renewals_started: AtomicU64::new(0),
        });
        store.schedule().bind(Arc::downgrade(&coordinator));
        coordinator
    }

    /// Number of renewal calls issued over the coordinator's lifetime.
    pub fn renewals_started(&self) -> u64 {
        self.renewals_started.load(Ordering::SeqCst)
    }

    /// Callers currently waiting on a renewal.
    pub fn pending_waiters(&self) -> usize {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            FlightState::Idle => 0,
            FlightState::RenewalInFlight { waiters } => waiters.len(),
        }
    }

    pub fn is_renewing(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            FlightState::RenewalInFlight { .. }
        )
    }

    /// Obtain a freshly renewed access credential.
    ///
    /// Starts a renewal if none is running, otherwise joins the running one.
    /// Without a renewal credential this fails at once, logs the session out
    /// and makes no network call.
    pub async fn ensure_fresh(self: &Arc<Self>) -> Result<String, RefreshError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &mut *state {
                FlightState::RenewalInFlight { waiters } => {
                    waiters.push(tx);
                    debug!(waiters = waiters.len(), "Joined in-flight renewal");
                }
                FlightState::Idle => {
                    let (epoch, session) = self.store.read_with_epoch();
                    let Some(renewal_credential) = session.renewal_credential() else {
                        drop(state);
                        warn!("Renewal requested without a renewal credential, logging out");
                        self.store.clear();
                        return Err(RefreshError::MissingRenewalCredential);
                    };

                    *state = FlightState::RenewalInFlight { waiters: vec![tx] };
                    self.renewals_started.fetch_add(1, Ordering::SeqCst);
                    debug!(epoch, "Starting renewal");
                    // Spawned so the renewal settles even if this caller goes away.
                    tokio::spawn(Arc::clone(self).run_flight(renewal_credential.to_string(), epoch));
                }
            }
        }

        rx.await.unwrap_or(Err(RefreshError::Abandoned))
    }

    async fn run_flight(self: Arc<Self>, renewal_credential: String, epoch: u64) {
        let mut settlement = Settlement {
            coordinator: Arc::clone(&self),
            outcome: None,
        };

        let outcome = match self.service.renew(&renewal_credential).await {
            Ok(renewed) => {
                let access = renewed.access_credential.clone();
                let next = self
                    .store
                    .read()
                    .renewed(renewed.access_credential, renewed.renewal_credential);
                if self.store.replace_if_current(epoch, next) {
                    info!("Access credential renewed");
                    Ok(access)
                } else {
                    info!("Session changed during renewal, discarding renewed credential");
                    Err(self.displaced())
                }
            }
            Err(e) => {
                if self.store.clear_if_current(epoch) {
                    warn!(error = %e, "Renewal failed, logging out");
                    Err(RefreshError::from(e))
                } else {
                    info!(error = %e, "Renewal failed for a session that is already gone");
                    Err(self.displaced())
                }
            }
        };
        settlement.outcome = Some(outcome);
    }

    /// Why a renewal's result no longer applies.
    fn displaced(&self) -> RefreshError {
        if self.store.read().is_authenticated() {
            RefreshError::Superseded
        } else {
            RefreshError::LoggedOut
        }
    }

    fn settle(&self, outcome: Result<String, RefreshError>) {
        let waiters = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *state, FlightState::Idle) {
                FlightState::RenewalInFlight { waiters } => waiters,
                FlightState::Idle => Vec::new(),
            }
        };
        debug!(waiters = waiters.len(), ok = outcome.is_ok(), "Renewal settled");
        for waiter in waiters {
            // A waiter that went away no longer needs the result.
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Resolves the flight's waiters when the flight task ends, including by
/// panic or abort, in which case they get [`RefreshError::Abandoned`].
struct Settlement {
    coordinator: Arc<RefreshCoordinator>,
    outcome: Option<Result<String, RefreshError>>,
}

impl Drop for Settlement {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or(Err(RefreshError::Abandoned));
        self.coordinator.settle(outcome);
    }
}
