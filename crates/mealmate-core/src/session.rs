// Session store: the single owner of the signed-in user's profile.
//
// Consumers never read global state; they hold a `watch::Receiver<Session>`
// (or anything implementing `CurrentSession`) and re-evaluate when it changes.

use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

use crate::api::{ApiError, SessionApi};
use crate::protocol::{AccountStatus, Profile};

/// Snapshot of who is signed in. `profile == None` is the anonymous session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub profile: Option<Profile>,
    /// True until the first profile fetch settles.
    pub loading: bool,
}

impl Session {
    /// The value before anything is known: anonymous and loading.
    pub fn initial() -> Self {
        Session {
            profile: None,
            loading: true,
        }
    }

    pub fn anonymous() -> Self {
        Session {
            profile: None,
            loading: false,
        }
    }

    pub fn signed_in(profile: Profile) -> Self {
        Session {
            profile: Some(profile),
            loading: false,
        }
    }

    pub fn status(&self) -> Option<AccountStatus> {
        self.profile.as_ref().map(|p| p.account_status)
    }

    pub fn is_authenticated(&self) -> bool {
        self.profile.is_some()
    }
}

/// Read access to the current session, however it is provided.
pub trait CurrentSession {
    fn session(&self) -> Session;
}

impl CurrentSession for watch::Receiver<Session> {
    fn session(&self) -> Session {
        self.borrow().clone()
    }
}

impl CurrentSession for Session {
    fn session(&self) -> Session {
        self.clone()
    }
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

pub struct SessionStore<A> {
    api: A,
    tx: watch::Sender<Session>,
    primed: OnceCell<()>,
}

impl<A: SessionApi> SessionStore<A> {
    pub fn new(api: A) -> Self {
        let (tx, _rx) = watch::channel(Session::initial());
        SessionStore {
            api,
            tx,
            primed: OnceCell::new(),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }

    /// Fetch the profile and publish the outcome.
    ///
    /// The CSRF priming request runs once per store, before the first fetch;
    /// its failure never blocks the fetch. Authorization failures settle to
    /// the anonymous session, other failures keep the previous profile.
    /// Either way `loading` ends up false.
    pub async fn refresh(&self) {
        self.primed
            .get_or_init(|| async {
                if let Err(e) = self.api.prime_csrf().await {
                    debug!("CSRF priming failed (ignored): {}", e);
                }
            })
            .await;

        match self.api.fetch_profile().await {
            Ok(profile) => {
                info!(
                    user_id = profile.user_id,
                    status = ?profile.account_status,
                    "Session refreshed"
                );
                self.tx.send_replace(Session::signed_in(profile));
            }
            Err(e) if e.is_unauthorized() => {
                info!("No authenticated session");
                self.tx.send_replace(Session::anonymous());
            }
            Err(e) => {
                warn!("Profile fetch failed, keeping previous session: {}", e);
                self.tx.send_modify(|s| s.loading = false);
            }
        }
    }

    /// Optimistically override the account status after a call known to
    /// change it. Ignored for the anonymous session.
    pub fn set_account_status(&self, status: AccountStatus) {
        self.tx.send_if_modified(|s| match s.profile.as_mut() {
            Some(profile) if profile.account_status != status => {
                debug!(from = ?profile.account_status, to = ?status, "Account status override");
                profile.account_status = status;
                true
            }
            _ => false,
        });
    }

    /// Reset to the anonymous session.
    pub fn clear(&self) {
        self.tx.send_replace(Session::anonymous());
    }

    pub async fn consent_agreements(&self, agreement_ids: &[u64]) -> Result<(), ApiError> {
        self.api.consent_agreements(agreement_ids).await?;
        self.set_account_status(AccountStatus::Onboarding);
        Ok(())
    }

    pub async fn save_preferences(&self, choice_ids: &[u64]) -> Result<(), ApiError> {
        self.api.save_preferences(choice_ids).await?;
        self.set_account_status(AccountStatus::Active);
        Ok(())
    }

    /// Log out. The local session is cleared even when the call fails.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = self.api.logout().await;
        self.clear();
        result
    }

    /// Withdraw the account. The local session is cleared even when the call fails.
    pub async fn withdraw(&self) -> Result<(), ApiError> {
        let result = self.api.withdraw().await;
        self.clear();
        result
    }
}

impl<A: SessionApi> CurrentSession for SessionStore<A> {
    fn session(&self) -> Session {
        self.tx.borrow().clone()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Agreement;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted profile responses; pops from the front on each fetch.
    #[derive(Default)]
    struct FakeApi {
        prime_calls: AtomicUsize,
        prime_fails: bool,
        profiles: Mutex<Vec<Result<Profile, ApiError>>>,
        logout_fails: bool,
    }

    impl FakeApi {
        fn with_profiles(profiles: Vec<Result<Profile, ApiError>>) -> Self {
            FakeApi {
                profiles: Mutex::new(profiles),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl SessionApi for FakeApi {
        async fn prime_csrf(&self) -> Result<(), ApiError> {
            self.prime_calls.fetch_add(1, Ordering::SeqCst);
            if self.prime_fails {
                return Err(status_error(500));
            }
            Ok(())
        }

        async fn fetch_profile(&self) -> Result<Profile, ApiError> {
            let mut profiles = self.profiles.lock().unwrap();
            if profiles.is_empty() {
                return Err(status_error(500));
            }
            profiles.remove(0)
        }

        async fn logout(&self) -> Result<(), ApiError> {
            if self.logout_fails {
                return Err(status_error(502));
            }
            Ok(())
        }

        async fn withdraw(&self) -> Result<(), ApiError> {
            Ok(())
        }

        async fn list_agreements(&self) -> Result<Vec<Agreement>, ApiError> {
            Ok(vec![])
        }

        async fn consent_agreements(&self, _ids: &[u64]) -> Result<(), ApiError> {
            Ok(())
        }

        async fn save_preferences(&self, _ids: &[u64]) -> Result<(), ApiError> {
            Err(status_error(400))
        }
    }

    fn status_error(status: u16) -> ApiError {
        ApiError::Status {
            status,
            message: "boom".into(),
            detail: None,
        }
    }

    fn unauthorized() -> ApiError {
        ApiError::Unauthorized {
            status: 401,
            message: "login required".into(),
        }
    }

    fn profile(status: AccountStatus) -> Profile {
        Profile {
            user_id: 42,
            nickname: "dana".into(),
            account_status: status,
        }
    }

    #[test]
    fn new_store_starts_loading_and_anonymous() {
        let store = SessionStore::new(FakeApi::default());
        assert_eq!(store.session(), Session::initial());
    }

    #[tokio::test]
    async fn refresh_success_sets_profile() {
        let store = SessionStore::new(FakeApi::with_profiles(vec![Ok(profile(
            AccountStatus::Active,
        ))]));
        store.refresh().await;
        assert_eq!(store.session(), Session::signed_in(profile(AccountStatus::Active)));
    }

    #[tokio::test]
    async fn refresh_unauthorized_becomes_anonymous() {
        let store = SessionStore::new(FakeApi::with_profiles(vec![
            Ok(profile(AccountStatus::Active)),
            Err(unauthorized()),
        ]));
        store.refresh().await;
        store.refresh().await;
        assert_eq!(store.session(), Session::anonymous());
    }

    #[tokio::test]
    async fn refresh_other_failure_keeps_previous_profile() {
        let store = SessionStore::new(FakeApi::with_profiles(vec![
            Ok(profile(AccountStatus::Pending)),
            Err(status_error(503)),
        ]));
        store.refresh().await;
        store.refresh().await;
        let session = store.session();
        assert!(!session.loading);
        assert_eq!(session.status(), Some(AccountStatus::Pending));
    }

    #[tokio::test]
    async fn first_refresh_failure_clears_loading() {
        let store = SessionStore::new(FakeApi::with_profiles(vec![Err(status_error(500))]));
        store.refresh().await;
        assert_eq!(store.session(), Session::anonymous());
    }

    #[tokio::test]
    async fn csrf_priming_runs_once_and_failure_is_swallowed() {
        let api = FakeApi {
            prime_fails: true,
            profiles: Mutex::new(vec![
                Ok(profile(AccountStatus::Active)),
                Ok(profile(AccountStatus::Active)),
            ]),
            ..Default::default()
        };
        let store = SessionStore::new(api);
        store.refresh().await;
        store.refresh().await;
        assert_eq!(store.api().prime_calls.load(Ordering::SeqCst), 1);
        assert!(store.session().is_authenticated());
    }

    #[tokio::test]
    async fn subscribers_observe_changes() {
        let store = SessionStore::new(FakeApi::with_profiles(vec![Ok(profile(
            AccountStatus::Onboarding,
        ))]));
        let mut rx = store.subscribe();
        store.refresh().await;
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();
        assert_eq!(rx.session().status(), Some(AccountStatus::Onboarding));
    }

    #[tokio::test]
    async fn set_account_status_overrides_locally() {
        let store = SessionStore::new(FakeApi::with_profiles(vec![Ok(profile(
            AccountStatus::Pending,
        ))]));
        store.refresh().await;
        store.set_account_status(AccountStatus::Onboarding);
        assert_eq!(store.session().status(), Some(AccountStatus::Onboarding));
    }

    #[test]
    fn set_account_status_ignored_when_anonymous() {
        let store = SessionStore::new(FakeApi::default());
        store.clear();
        store.set_account_status(AccountStatus::Active);
        assert_eq!(store.session(), Session::anonymous());
    }

    #[tokio::test]
    async fn consent_advances_to_onboarding() {
        let store = SessionStore::new(FakeApi::with_profiles(vec![Ok(profile(
            AccountStatus::Pending,
        ))]));
        store.refresh().await;
        store.consent_agreements(&[1, 2]).await.unwrap();
        assert_eq!(store.session().status(), Some(AccountStatus::Onboarding));
    }

    #[tokio::test]
    async fn failed_preference_save_keeps_status() {
        let store = SessionStore::new(FakeApi::with_profiles(vec![Ok(profile(
            AccountStatus::Onboarding,
        ))]));
        store.refresh().await;
        assert!(store.save_preferences(&[3]).await.is_err());
        assert_eq!(store.session().status(), Some(AccountStatus::Onboarding));
    }

    #[tokio::test]
    async fn logout_clears_session_even_on_failure() {
        let api = FakeApi {
            logout_fails: true,
            profiles: Mutex::new(vec![Ok(profile(AccountStatus::Active))]),
            ..Default::default()
        };
        let store = SessionStore::new(api);
        store.refresh().await;
        assert!(store.logout().await.is_err());
        assert_eq!(store.session(), Session::anonymous());
    }
}
