//! Per-process wiring of the session components.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::api::{HttpAuthService, HttpTransport, RenewalService, RequestGateway, Transport};
use crate::auth::{
    storage, ExpiryClock, RefreshCoordinator, RefreshError, ScheduledRenewal, Session,
    SessionStorage, SessionStore,
};
use crate::config::Config;

/// One session store, one renewal coordinator and one gateway, shared by all
/// feature code in the process.
pub struct AuthContext {
    store: Arc<SessionStore>,
    coordinator: Arc<RefreshCoordinator>,
    gateway: RequestGateway,
}

impl AuthContext {
    pub fn new(
        config: &Config,
        storage: Arc<dyn SessionStorage>,
        service: Arc<dyn RenewalService>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let schedule = ScheduledRenewal::new(ExpiryClock::new(config.renewal_margin()));
        let store = Arc::new(SessionStore::new(storage, schedule));
        let coordinator = RefreshCoordinator::new(Arc::clone(&store), service);
        let gateway = RequestGateway::new(transport, Arc::clone(&store), Arc::clone(&coordinator));
        Self {
            store,
            coordinator,
            gateway,
        }
    }

    /// Build the HTTP-backed context described by `config`, returning the auth
    /// service as well so the caller can log in with it.
    pub fn from_config(config: &Config) -> Result<(Self, Arc<HttpAuthService>)> {
        let storage = storage::open(config)?;
        let auth = Arc::new(HttpAuthService::new(config)?);
        let transport = Arc::new(HttpTransport::new(config)?);
        let context = Self::new(config, storage, Arc::clone(&auth) as Arc<dyn RenewalService>, transport);
        Ok((context, auth))
    }

    /// Restore the previous run's session. Returns whether one was restored.
    pub fn hydrate(&self) -> bool {
        self.store.hydrate()
    }

    /// Install the session returned by a login.
    pub fn establish(&self, session: Session) {
        debug!(session = ?session, "Establishing session");
        self.store.replace(session);
        info!("Login successful");
    }

    /// The only teardown path: forget the session everywhere.
    pub fn logout(&self) {
        self.store.clear();
    }

    /// Renew now, sharing any renewal already in flight.
    pub async fn refresh(&self) -> Result<String, RefreshError> {
        self.coordinator.ensure_fresh().await
    }

    pub fn session(&self) -> Arc<Session> {
        self.store.read()
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }
}
