use std::{
    error, fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use encore_clock::{Clock, System};
use tokio::sync::watch;

use crate::{
    authority::{dto, AuthorityError, RefreshAuthority, RefreshedToken},
    store::{StoreError, TokenStore},
    AccessToken, RefreshError, TokenError, TokenState, TokenStatus,
};

/// Configuration for when and how tokens are refreshed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    refresh_margin: Duration,
    refresh_timeout: Duration,
    default_expires_in: Duration,
}

impl Default for ManagerConfig {
    /// Default manager configuration
    ///
    /// Refreshes tokens with less than 60 seconds of validity remaining, gives
    /// up on a refresh request after 10 seconds, and assumes a lifetime of one
    /// hour when the authority does not report one.
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(60),
            refresh_timeout: Duration::from_secs(10),
            default_expires_in: Duration::from_secs(3600),
        }
    }
}

impl ManagerConfig {
    /// Sets how long before expiry a token is refreshed proactively
    pub fn with_refresh_margin(mut self, refresh_margin: Duration) -> Self {
        self.refresh_margin = refresh_margin;
        self
    }

    /// Sets how long a refresh request may take before it is abandoned
    pub fn with_refresh_timeout(mut self, refresh_timeout: Duration) -> Self {
        self.refresh_timeout = refresh_timeout;
        self
    }

    /// Sets the lifetime assumed when the authority omits `expires_in`
    pub fn with_default_expires_in(mut self, default_expires_in: Duration) -> Self {
        self.default_expires_in = default_expires_in;
        self
    }

    /// How long before expiry a token is refreshed proactively
    pub fn refresh_margin(&self) -> Duration {
        self.refresh_margin
    }

    /// How long a refresh request may take before it is abandoned
    pub fn refresh_timeout(&self) -> Duration {
        self.refresh_timeout
    }

    /// The lifetime assumed when the authority omits `expires_in`
    pub fn default_expires_in(&self) -> Duration {
        self.default_expires_in
    }
}

type RefreshOutcome = Result<AccessToken, RefreshError>;

enum Flight {
    Idle,
    Refreshing(watch::Receiver<Option<RefreshOutcome>>),
}

/// Owns the token lifecycle of one linked resource-API session
///
/// The manager is a cheap handle; clones share the same store and the same
/// refresh coordinator. At most one refresh is in flight at any time, and
/// every caller that asks for a token while it is in flight observes its
/// result.
pub struct TokenManager<C = System> {
    inner: Arc<Inner<C>>,
}

struct Inner<C> {
    store: TokenStore,
    authority: Box<dyn RefreshAuthority>,
    config: ManagerConfig,
    clock: C,
    flight: Mutex<Flight>,
}

impl<C> Clone for TokenManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for TokenManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("store", &self.inner.store)
            .field("config", &self.inner.config)
            .field("clock", &self.inner.clock)
            .field("refreshing", &self.inner.in_flight().is_some())
            .finish()
    }
}

impl TokenManager<System> {
    /// Constructs a new token manager using the system clock
    pub fn new(
        store: TokenStore,
        authority: impl RefreshAuthority + 'static,
        config: ManagerConfig,
    ) -> Self {
        Self::new_with_clock(store, authority, config, System)
    }
}

impl<C> TokenManager<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a new token manager using the given clock
    pub fn new_with_clock(
        store: TokenStore,
        authority: impl RefreshAuthority + 'static,
        config: ManagerConfig,
        clock: C,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                authority: Box::new(authority),
                config,
                clock,
                flight: Mutex::new(Flight::Idle),
            }),
        }
    }

    /// The manager's configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Gets a usable access token, or `None` if none can be obtained
    ///
    /// Failures are logged; use [`valid_token()`][Self::valid_token()] to
    /// inspect the reason.
    pub async fn get_valid_token(&self) -> Option<AccessToken> {
        match self.valid_token().await {
            Ok(token) => Some(token),
            Err(TokenError::NoToken) => {
                tracing::debug!("no access token available");
                None
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    reconnect = error.requires_reconnect(),
                    "unable to obtain a valid access token"
                );
                None
            }
        }
    }

    /// Gets a usable access token
    ///
    /// If a refresh is in flight, waits for it and returns its result. A stored
    /// token with more than the refresh margin left is returned without any
    /// network call; otherwise the token is refreshed first.
    pub async fn valid_token(&self) -> Result<AccessToken, TokenError> {
        if let Some(rx) = self.inner.in_flight() {
            tracing::trace!("refresh in flight, waiting for its result");
            return Ok(join_flight(rx).await?);
        }

        let state = self.inner.store.load().await?;
        let (access_token, expires_at) = match state.usable_access_token() {
            Some(usable) if state.refresh_token.is_some() => usable,
            _ => return Err(TokenError::NoToken),
        };

        let now = self.inner.clock.now();
        match state.token_status_at(now, self.inner.config.refresh_margin) {
            Some(TokenStatus::Fresh) => Ok(access_token.to_owned()),
            status => {
                tracing::debug!(
                    ?status,
                    expires_at = expires_at.0,
                    until_expired_ms = (expires_at - now).as_millis() as u64,
                    "access token within refresh margin"
                );
                Ok(self.refresh().await?)
            }
        }
    }

    /// Refreshes the access token, joining any refresh already in flight
    pub async fn refresh(&self) -> Result<AccessToken, RefreshError> {
        self.single_flight(false).await
    }

    /// Discards the stored access token and refreshes it
    ///
    /// Used when the resource API rejects a token that looked valid locally.
    /// Only the access token and its expiry are discarded. If a refresh is
    /// already in flight, its result is used instead.
    pub async fn invalidate_and_refresh(&self) -> Result<AccessToken, RefreshError> {
        self.single_flight(true).await
    }

    /// Stores the credentials obtained when the account was linked
    pub async fn connect(&self, state: &TokenState) -> Result<(), StoreError> {
        if state.access_token.is_some() && state.expires_at.is_none() {
            tracing::warn!("linking access token without a known expiry; it will not be used");
        }
        self.inner.store.connect(state).await?;
        tracing::info!("linked account credentials stored");
        Ok(())
    }

    /// Clears all stored credentials and marks the account as unlinked
    ///
    /// Any refresh in flight is allowed to settle first. The clear then holds
    /// the refresh coordinator, so no refresh can start until it completes;
    /// callers asking for a token meanwhile receive
    /// [`RefreshError::NoRefreshToken`].
    pub async fn disconnect(&self) -> Result<(), StoreError> {
        let tx = self.take_flight().await;

        let landing = Landing { inner: &self.inner };
        let cleared = self.inner.store.clear().await;
        drop(landing);

        // Dropping the sender on failure reports an abandoned refresh instead.
        cleared?;
        tx.send_replace(Some(Err(RefreshError::NoRefreshToken)));

        tracing::info!("linked account disconnected");
        Ok(())
    }

    /// Whether the account is currently marked as linked
    pub async fn is_connected(&self) -> Result<bool, StoreError> {
        self.inner.store.is_connected().await
    }

    /// Reads the stored token state
    pub async fn token_state(&self) -> Result<TokenState, StoreError> {
        self.inner.store.load().await
    }

    /// The lifecycle status of the stored access token, if there is one
    pub async fn token_status(&self) -> Result<Option<TokenStatus>, StoreError> {
        let state = self.inner.store.load().await?;
        Ok(state.token_status_at(self.inner.clock.now(), self.inner.config.refresh_margin))
    }

    async fn single_flight(&self, invalidate_first: bool) -> RefreshOutcome {
        let leader = {
            let mut flight = self.inner.flight();
            match &*flight {
                Flight::Refreshing(rx) => Err(rx.clone()),
                Flight::Idle => {
                    let (tx, rx) = watch::channel(None);
                    *flight = Flight::Refreshing(rx);
                    Ok(tx)
                }
            }
        };

        let tx = match leader {
            Ok(tx) => tx,
            Err(rx) => {
                tracing::debug!("joining in-flight refresh");
                return join_flight(rx).await;
            }
        };

        let landing = Landing { inner: &self.inner };
        let outcome = self.inner.perform_refresh(invalidate_first).await;
        drop(landing);

        tx.send_replace(Some(outcome.clone()));
        outcome
    }

    /// Installs this caller as the coordinator's leader, waiting out any
    /// operation already in flight
    async fn take_flight(&self) -> watch::Sender<Option<RefreshOutcome>> {
        loop {
            let rx = {
                let mut flight = self.inner.flight();
                match &*flight {
                    Flight::Refreshing(rx) => rx.clone(),
                    Flight::Idle => {
                        let (tx, rx) = watch::channel(None);
                        *flight = Flight::Refreshing(rx);
                        return tx;
                    }
                }
            };
            tracing::trace!("waiting for in-flight refresh to settle");
            let _ = join_flight(rx).await;
        }
    }
}

/// Returns the coordinator to idle when the leading refresh settles or is
/// cancelled
struct Landing<'a, C> {
    inner: &'a Inner<C>,
}

impl<C> Drop for Landing<'_, C> {
    fn drop(&mut self) {
        *self.inner.flight() = Flight::Idle;
    }
}

async fn join_flight(mut rx: watch::Receiver<Option<RefreshOutcome>>) -> RefreshOutcome {
    let outcome = match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone(),
        Err(_) => None,
    };
    outcome.unwrap_or_else(|| Err(RefreshError::abandoned()))
}

fn is_terminal_rejection(status: u16, body: &str) -> bool {
    status == 400 || status == 401 || dto::is_invalid_grant(body)
}

fn is_transient_rejection(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

impl<C> Inner<C> {
    fn flight(&self) -> MutexGuard<'_, Flight> {
        self.flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> Option<watch::Receiver<Option<RefreshOutcome>>> {
        match &*self.flight() {
            Flight::Refreshing(rx) => Some(rx.clone()),
            Flight::Idle => None,
        }
    }
}

impl<C: Clock> Inner<C> {
    async fn perform_refresh(&self, invalidate_first: bool) -> RefreshOutcome {
        if invalidate_first {
            tracing::debug!("discarding rejected access token");
            self.store.clear_access().await?;
        }

        let state = self.store.load().await?;
        let (identity_token, refresh_token) = match state.refresh_credentials() {
            Some(credentials) => credentials,
            None => {
                tracing::debug!(
                    has_identity_token = state.identity_token.is_some(),
                    has_refresh_token = state.refresh_token.is_some(),
                    "refresh impossible without stored credentials"
                );
                return Err(RefreshError::NoRefreshToken);
            }
        };

        tracing::debug!("requesting new access token");
        let request = self.authority.refresh(identity_token, refresh_token);
        let refreshed = match tokio::time::timeout(self.config.refresh_timeout, request).await {
            Ok(Ok(refreshed)) => refreshed,
            Ok(Err(error)) => return Err(self.handle_failure(error).await),
            Err(elapsed) => {
                tracing::warn!(
                    timeout_ms = self.config.refresh_timeout.as_millis() as u64,
                    "refresh request timed out"
                );
                return Err(RefreshError::TransientRefreshFailure(Arc::new(elapsed)));
            }
        };

        self.store_refreshed(refreshed).await
    }

    async fn store_refreshed(&self, refreshed: RefreshedToken) -> RefreshOutcome {
        // Measured from receipt so that network latency never inflates the
        // remaining lifetime.
        let now = self.clock.now();
        let lifetime = refreshed
            .expires_in
            .unwrap_or(self.config.default_expires_in);
        let expires_at = now + lifetime;

        self.store
            .store_refreshed(
                &refreshed.access_token,
                expires_at,
                refreshed.refresh_token.as_deref(),
            )
            .await?;

        tracing::info!(
            lifetime_s = lifetime.as_secs(),
            expires_at = expires_at.0,
            rotated_refresh_token = refreshed.refresh_token.is_some(),
            "stored refreshed access token"
        );

        Ok(refreshed.access_token)
    }

    async fn handle_failure(&self, error: AuthorityError) -> RefreshError {
        let (status, body) = match error {
            AuthorityError::Rejected { status, body } => (status, body),
            AuthorityError::MalformedResponse(source) => {
                tracing::warn!(
                    error = (&*source as &dyn error::Error),
                    "refresh response was malformed"
                );
                return RefreshError::InvalidResponse(Arc::from(source));
            }
            AuthorityError::Unavailable(source) => {
                tracing::warn!(
                    error = (&*source as &dyn error::Error),
                    "refresh authority unavailable, will retry later"
                );
                return RefreshError::TransientRefreshFailure(Arc::from(source));
            }
        };

        if is_terminal_rejection(status, &body) {
            tracing::warn!(
                status,
                "refresh token rejected, clearing stored credentials"
            );
            if let Err(error) = self.store.clear().await {
                tracing::error!(
                    error = (&error as &dyn error::Error),
                    "unable to clear rejected credentials"
                );
                return RefreshError::from(error);
            }
            RefreshError::RefreshRejected {
                status,
                body,
                terminal: true,
            }
        } else if is_transient_rejection(status) {
            tracing::warn!(status, "refresh authority failed, will retry later");
            RefreshError::TransientRefreshFailure(Arc::new(AuthorityError::Rejected {
                status,
                body,
            }))
        } else {
            tracing::warn!(status, "refresh rejected");
            RefreshError::RefreshRejected {
                status,
                body,
                terminal: false,
            }
        }
    }
}
