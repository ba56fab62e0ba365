use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::coordinator::RefreshCoordinator;
use super::expiry::ExpiryClock;
use super::session::Session;

/// Shortest wait before renewing a credential that was itself just issued
const MIN_RENEWAL_INTERVAL_SECS: i64 = 30;

/// The one outstanding renewal timer.
pub struct ScheduledRenewalHandle {
    deadline: DateTime<Utc>,
    fired: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ScheduledRenewalHandle {
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Still waiting for its deadline.
    pub fn is_pending(&self) -> bool {
        !self.fired.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    fn cancel(self) {
        self.task.abort();
    }
}

/// Proactive renewal: keeps a single timer that calls
/// [`RefreshCoordinator::ensure_fresh`] shortly before the access credential
/// expires.
///
/// The timer only triggers the coordinator. Retries and failure handling
/// belong to the coordinator, the same as for a reactive renewal.
pub struct ScheduledRenewal {
    clock: ExpiryClock,
    armed: Mutex<Option<ScheduledRenewalHandle>>,
    coordinator: OnceLock<Weak<RefreshCoordinator>>,
}

impl ScheduledRenewal {
    pub fn new(clock: ExpiryClock) -> Self {
        Self {
            clock,
            armed: Mutex::new(None),
            coordinator: OnceLock::new(),
        }
    }

    pub fn clock(&self) -> &ExpiryClock {
        &self.clock
    }

    /// Attach the coordinator that fired timers call into. Only the first
    /// binding takes effect.
    pub fn bind(&self, coordinator: Weak<RefreshCoordinator>) {
        if self.coordinator.set(coordinator).is_err() {
            warn!("Scheduled renewal already bound to a coordinator");
        }
    }

    /// Cancel the current timer and arm a new one for `session`, if its
    /// access credential carries an expiry. A deadline already behind us
    /// fires on the next tick.
    pub fn rearm(&self, session: &Session) {
        self.arm(session, false);
    }

    /// Like [`rearm`](Self::rearm), for a credential the renewal service just
    /// issued. If it already sits inside the margin, the timer waits half its
    /// remaining lifetime (at least `MIN_RENEWAL_INTERVAL_SECS`) instead of
    /// firing at once.
    pub fn rearm_renewed(&self, session: &Session) {
        self.arm(session, true);
    }

    fn arm(&self, session: &Session, just_issued: bool) {
        let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = armed.take() {
            previous.cancel();
        }

        let Some(credential) = session.access_credential() else {
            return;
        };
        let Some(mut deadline) = self.clock.deadline_for(credential) else {
            debug!("Access credential has no readable expiry, renewal will be reactive only");
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available, scheduled renewal disabled");
            return;
        };

        let now = Utc::now();
        if just_issued && deadline <= now {
            let remaining = self.clock.expires_at(credential).map_or(Duration::zero(), |exp| exp - now);
            let wait = (remaining / 2).max(Duration::seconds(MIN_RENEWAL_INTERVAL_SECS));
            let Some(later) = now.checked_add_signed(wait) else {
                return;
            };
            warn!(remaining_secs = remaining.num_seconds(), "Renewed credential expires within the renewal margin");
            deadline = later;
        }

        let delay = (deadline - now).to_std().unwrap_or_default();
        let fired = Arc::new(AtomicBool::new(false));
        let coordinator = self.coordinator.get().cloned();

        debug!(%deadline, delay_secs = delay.as_secs(), "Scheduled renewal armed");
        let task = runtime.spawn(Self::fire_after(delay, Arc::clone(&fired), coordinator));
        *armed = Some(ScheduledRenewalHandle { deadline, fired, task });
    }

    /// Cancel the current timer without arming another.
    pub fn disarm(&self) {
        let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = armed.take() {
            previous.cancel();
            debug!("Scheduled renewal disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(ScheduledRenewalHandle::is_pending)
    }

    /// Deadline of the pending timer, if any.
    pub fn armed_deadline(&self) -> Option<DateTime<Utc>> {
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|handle| handle.is_pending())
            .map(ScheduledRenewalHandle::deadline)
    }

    async fn fire_after(
        delay: std::time::Duration,
        fired: Arc<AtomicBool>,
        coordinator: Option<Weak<RefreshCoordinator>>,
    ) {
        tokio::time::sleep(delay).await;
        fired.store(true, Ordering::SeqCst);

        let Some(coordinator) = coordinator.as_ref().and_then(Weak::upgrade) else {
            debug!("Scheduled renewal fired with no coordinator attached");
            return;
        };
        info!("Access credential nearing expiry, renewing");
        if let Err(e) = coordinator.ensure_fresh().await {
            warn!(error = %e, "Scheduled renewal failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testutil::{harness, signed_in, token_expiring_in, ScriptedRenewal};

    /// Let spawned tasks run to their next suspension point.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_on_replace_keeps_single_timer() {
        let service = ScriptedRenewal::succeeding(&token_expiring_in(7200));
        let (store, _coordinator) = harness(service.clone());

        let first = token_expiring_in(10 * 60);
        store.replace(signed_in(&first, Some("renew")));
        let first_deadline = store.schedule().clock().deadline_for(&first);
        assert_eq!(store.schedule().armed_deadline(), first_deadline);

        let second = token_expiring_in(30 * 60);
        store.replace(signed_in(&second, Some("renew")));
        let second_deadline = store.schedule().clock().deadline_for(&second);
        assert_eq!(store.schedule().armed_deadline(), second_deadline);

        // The first timer (due after 5 minutes) must not fire.
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        settle().await;
        assert_eq!(service.calls(), 0);

        // The second one (due after 25 minutes) does, exactly once.
        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        settle().await;
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_inside_margin_fires_immediately() {
        let renewed = token_expiring_in(3600);
        let service = ScriptedRenewal::succeeding(&renewed);
        let (store, _coordinator) = harness(service.clone());

        // Four minutes left is already inside the five minute margin.
        store.replace(signed_in(&token_expiring_in(4 * 60), Some("renew")));
        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;

        assert_eq!(service.calls(), 1);
        assert_eq!(store.read().access_credential(), Some(renewed.as_str()));
        // Rearmed against the renewed credential.
        assert!(store.schedule().is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_credential_leaves_timer_unarmed() {
        let service = ScriptedRenewal::succeeding("unused");
        let (store, _coordinator) = harness(service.clone());

        store.replace(signed_in(&token_expiring_in(3600), Some("renew")));
        assert!(store.schedule().is_armed());

        store.replace(signed_in("opaque-token", Some("renew")));
        assert!(!store.schedule().is_armed());
        assert!(store.read().is_authenticated());

        tokio::time::advance(Duration::from_secs(24 * 3600)).await;
        settle().await;
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_cancels_timer() {
        let service = ScriptedRenewal::succeeding("unused");
        let (store, _coordinator) = harness(service.clone());

        store.replace(signed_in(&token_expiring_in(10 * 60), Some("renew")));
        store.clear();
        assert!(!store.schedule().is_armed());

        tokio::time::advance(Duration::from_secs(3600)).await;
        settle().await;
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fired_timer_failure_logs_out() {
        let service = ScriptedRenewal::rejecting("refresh token revoked");
        let (store, _coordinator) = harness(service.clone());

        store.replace(signed_in(&token_expiring_in(6 * 60), Some("renew")));
        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;

        assert_eq!(service.calls(), 1);
        assert!(store.read().is_empty());
        assert!(!store.schedule().is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_lived_renewals_do_not_loop() {
        // Every renewal hands out a credential already inside the margin.
        let service = ScriptedRenewal::succeeding(&token_expiring_in(4 * 60));
        let (store, _coordinator) = harness(service.clone());

        store.replace(signed_in(&token_expiring_in(4 * 60), Some("renew")));
        for _ in 0..50 {
            tokio::time::advance(Duration::from_millis(1)).await;
            settle().await;
        }
        assert_eq!(service.calls(), 1);
        assert!(store.read().is_authenticated());

        let deadline = store.schedule().armed_deadline().expect("armed after renewal");
        assert!(deadline > Utc::now() + chrono::Duration::seconds(60));

        // Half of the remaining four minutes later it renews again, once.
        tokio::time::advance(Duration::from_secs(121)).await;
        settle().await;
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_credential_already_expired_waits_minimum_interval() {
        let service = ScriptedRenewal::succeeding(&token_expiring_in(-60));
        let (store, _coordinator) = harness(service.clone());

        store.replace(signed_in(&token_expiring_in(60), Some("renew")));
        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(service.calls(), 1);

        tokio::time::advance(Duration::from_secs(MIN_RENEWAL_INTERVAL_SECS as u64 - 1)).await;
        settle().await;
        assert_eq!(service.calls(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(service.calls(), 2);
    }

    #[test]
    fn test_rearm_without_runtime_is_a_no_op() {
        let schedule = ScheduledRenewal::new(ExpiryClock::default());
        schedule.rearm(&signed_in(&token_expiring_in(3600), Some("renew")));
        assert!(!schedule.is_armed());
    }
}
