//! Proactive bearer-token refresh.
//!
//! The [`TokenRefreshScheduler`] obtains a token from a [`TokenSupplier`],
//! publishes it as a [`Credential`], and asks the supplier again at
//! `expiry - grace_period`. Supplier failures never escape the scheduler:
//! they are logged, broadcast as [`AuthEvent::RefreshFailed`], and retried
//! after the retry interval while readers keep using the last good credential.
//!
//! ```text
//! Idle ──start──▶ Scheduled ──refresh_at──▶ Refreshing ──▶ Scheduled ...
//!                     │                                        │
//!                     └──────────────── stop ─────────────────▶ Stopped
//! ```

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

use crate::{
    error::{MessagingError, MessagingResult},
    types::Headers,
};

/// Header carrying the bearer credential.
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// A token as handed out by the supplier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Instant,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at: Instant) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// A token that expires `ttl` from now.
    pub fn expiring_in(value: impl Into<String>, ttl: Duration) -> Self {
        Self::new(value, Instant::now() + ttl)
    }
}

/// Source of fresh access tokens.
///
/// How the token is obtained (identity service, cached file, ...) is up to the
/// implementation; retries inside one call are the supplier's own business.
#[async_trait]
pub trait TokenSupplier: Send + Sync {
    async fn supply_token(&self) -> MessagingResult<AccessToken>;
}

#[async_trait]
impl<F, Fut> TokenSupplier for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = MessagingResult<AccessToken>> + Send,
{
    async fn supply_token(&self) -> MessagingResult<AccessToken> {
        self().await
    }
}

/// The published credential and the headers derived from it.
#[derive(Clone, Debug)]
pub struct Credential {
    value: String,
    issued_at: Instant,
    expires_at: Instant,
    headers: Headers,
}

impl Credential {
    fn from_token(token: AccessToken, issued_at: Instant) -> Self {
        let mut headers = Headers::new();
        headers.insert(
            AUTHORIZATION_HEADER.to_string(),
            format!("Bearer {}", token.value),
        );
        Self {
            value: token.value,
            issued_at,
            expires_at: token.expires_at,
            headers,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Scheduler lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// Not started.
    Idle,
    /// Waiting for the next refresh.
    Scheduled { refresh_at: Instant },
    /// Supplier call in progress.
    Refreshing,
    /// Stopped; will not refresh again.
    Stopped,
}

/// Non-fatal authentication events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthEvent {
    /// A new credential was published.
    Refreshed { expires_at: Instant },
    /// The supplier failed; the last credential stays in use until it expires.
    RefreshFailed { message: String, retry_at: Instant },
}

struct Shared {
    supplier: Arc<dyn TokenSupplier>,
    grace_period: Duration,
    retry_interval: Duration,
    credential: watch::Sender<Option<Arc<Credential>>>,
    state: watch::Sender<SchedulerState>,
    events: broadcast::Sender<AuthEvent>,
}

impl Shared {
    /// Publish `token` and schedule its refresh. Returns the refresh instant.
    fn install(&self, token: AccessToken) -> Instant {
        let now = Instant::now();
        let credential = Credential::from_token(token, now);
        let refresh_at = refresh_instant(&credential, self.grace_period);
        let expires_at = credential.expires_at;

        // Readers never observe a partial update; the whole Arc is swapped.
        self.credential.send_replace(Some(Arc::new(credential)));
        self.transition(SchedulerState::Scheduled { refresh_at });
        let _ = self.events.send(AuthEvent::Refreshed { expires_at });
        refresh_at
    }

    /// Move to `next` unless the scheduler has been stopped.
    fn transition(&self, next: SchedulerState) {
        self.state.send_if_modified(|state| {
            if *state == SchedulerState::Stopped {
                return false;
            }
            *state = next;
            true
        });
    }
}

/// When to refresh a credential: `expiry - grace`, or halfway through its
/// lifetime if the lifetime is shorter than the grace period.
fn refresh_instant(credential: &Credential, grace_period: Duration) -> Instant {
    let lifetime = credential
        .expires_at
        .saturating_duration_since(credential.issued_at);
    if lifetime > grace_period {
        credential.expires_at - grace_period
    } else {
        credential.issued_at + lifetime / 2
    }
}

/// Reject a token that is already expired on arrival; it could never be
/// scheduled ahead of its expiry.
fn ensure_fresh(token: AccessToken) -> MessagingResult<AccessToken> {
    if token.expires_at <= Instant::now() {
        return Err(MessagingError::auth("Supplied token is already expired"));
    }
    Ok(token)
}

/// Keeps a bearer credential fresh ahead of its expiry.
pub struct TokenRefreshScheduler {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenRefreshScheduler {
    pub fn new(
        supplier: Arc<dyn TokenSupplier>,
        grace_period: Duration,
        retry_interval: Duration,
        events: broadcast::Sender<AuthEvent>,
    ) -> Self {
        let (credential, _) = watch::channel(None);
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            shared: Arc::new(Shared {
                supplier,
                grace_period,
                retry_interval,
                credential,
                state,
                events,
            }),
            task: Mutex::new(None),
        }
    }

    /// Obtain the initial token and start the refresh timer.
    ///
    /// Fails if the initial supplier call fails or the scheduler was stopped.
    /// Calling `start` on a running scheduler is a no-op.
    pub async fn start(&self) -> MessagingResult<()> {
        match self.state() {
            SchedulerState::Stopped => return Err(MessagingError::Closed),
            SchedulerState::Idle => {}
            _ => return Ok(()),
        }

        let token = ensure_fresh(self.shared.supplier.supply_token().await?)?;
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        if self.state() == SchedulerState::Stopped {
            return Err(MessagingError::Closed);
        }

        let refresh_at = self.shared.install(token);
        info!(?refresh_at, "Token refresh scheduler started");
        *task = Some(tokio::spawn(refresh_loop(
            Arc::clone(&self.shared),
            refresh_at,
        )));
        Ok(())
    }

    /// Cancel the pending refresh and stop for good. Idempotent.
    pub fn stop(&self) {
        let was = self.shared.state.send_replace(SchedulerState::Stopped);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        if was != SchedulerState::Stopped {
            debug!("Token refresh scheduler stopped");
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.shared.state.borrow()
    }

    /// The most recently published credential, expired or not.
    pub fn credential(&self) -> Option<Arc<Credential>> {
        self.shared.credential.borrow().clone()
    }

    /// Watch credential swaps.
    pub fn watch_credential(&self) -> watch::Receiver<Option<Arc<Credential>>> {
        self.shared.credential.subscribe()
    }

    /// Headers for an outbound message.
    ///
    /// Fails with [`MessagingError::CredentialExpired`] once the last credential
    /// has hard-expired.
    pub fn headers(&self) -> MessagingResult<Headers> {
        let credential = self
            .credential()
            .ok_or_else(|| MessagingError::auth("No credential available"))?;
        if credential.is_expired_at(Instant::now()) {
            return Err(MessagingError::CredentialExpired);
        }
        Ok(credential.headers().clone())
    }

    pub fn grace_period(&self) -> Duration {
        self.shared.grace_period
    }
}

impl Drop for TokenRefreshScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn refresh_loop(shared: Arc<Shared>, mut refresh_at: Instant) {
    loop {
        // Returns immediately if refresh_at already passed.
        sleep_until(refresh_at).await;
        shared.transition(SchedulerState::Refreshing);

        match shared.supplier.supply_token().await.and_then(ensure_fresh) {
            Ok(token) => {
                refresh_at = shared.install(token);
                debug!(?refresh_at, "Access token refreshed");
            }
            Err(err) => {
                let retry_at = Instant::now() + shared.retry_interval;
                warn!(
                    error = %err,
                    retry_in = ?shared.retry_interval,
                    "Access token refresh failed"
                );
                shared.transition(SchedulerState::Scheduled {
                    refresh_at: retry_at,
                });
                let _ = shared.events.send(AuthEvent::RefreshFailed {
                    message: err.to_string(),
                    retry_at,
                });
                refresh_at = retry_at;
            }
        }
    }
}
