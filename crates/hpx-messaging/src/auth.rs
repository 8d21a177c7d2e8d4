//! Authentication providers for outbound messages.
//!
//! An [`AuthenticationConfig`] names one credential source and the static
//! headers merged into every outbound message. [`AuthenticationConfig::build`]
//! turns it into an [`Authentication`] provider:
//!
//! | Source | Provider | Headers |
//! |--------|----------|---------|
//! | `None` | [`NoAuth`] | additional headers only |
//! | `Basic` | [`BasicAuth`] | `Authorization: Basic ...` |
//! | `AccessToken` | [`AccessTokenAuth`] | `Authorization: Bearer ...`, refreshed ahead of expiry |

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::broadcast;

use crate::{
    error::MessagingResult,
    refresh::{AUTHORIZATION_HEADER, AuthEvent, TokenRefreshScheduler, TokenSupplier},
    types::Headers,
};

/// Supplies the headers that authenticate outbound messages.
#[async_trait]
pub trait Authentication: Send + Sync + fmt::Debug {
    /// Acquire whatever the provider needs before the first message.
    async fn start(&self) -> MessagingResult<()> {
        Ok(())
    }

    /// Headers to merge into an outbound message.
    fn headers(&self) -> MessagingResult<Headers>;

    /// Release background resources. Idempotent.
    fn stop(&self) {}
}

/// Where credentials come from.
#[derive(Clone)]
pub enum CredentialSource {
    /// No credential; only additional headers are sent.
    None,
    /// Static username and password.
    Basic { username: String, password: String },
    /// Bearer token refreshed ahead of expiry.
    AccessToken {
        supplier: Arc<dyn TokenSupplier>,
        /// Lead time before expiry at which the token is refreshed.
        expiry_grace_period: Duration,
        /// Delay before retrying a failed refresh.
        refresh_retry_interval: Duration,
    },
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::AccessToken {
                expiry_grace_period,
                refresh_retry_interval,
                ..
            } => f
                .debug_struct("AccessToken")
                .field("expiry_grace_period", expiry_grace_period)
                .field("refresh_retry_interval", refresh_retry_interval)
                .finish_non_exhaustive(),
        }
    }
}

/// Authentication configuration of a messaging provider.
#[derive(Clone, Debug)]
pub struct AuthenticationConfig {
    pub source: CredentialSource,
    /// Static headers merged into every outbound message.
    pub additional_headers: Headers,
}

impl AuthenticationConfig {
    /// No credential.
    pub fn none() -> Self {
        Self {
            source: CredentialSource::None,
            additional_headers: Headers::new(),
        }
    }

    /// Static basic credentials.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            source: CredentialSource::Basic {
                username: username.into(),
                password: password.into(),
            },
            additional_headers: Headers::new(),
        }
    }

    /// Bearer tokens from `supplier`, refreshed 5 s before expiry by default.
    pub fn access_token(supplier: impl TokenSupplier + 'static) -> Self {
        Self {
            source: CredentialSource::AccessToken {
                supplier: Arc::new(supplier),
                expiry_grace_period: Duration::from_secs(5),
                refresh_retry_interval: Duration::from_secs(10),
            },
            additional_headers: Headers::new(),
        }
    }

    /// Add a static header.
    #[must_use]
    pub fn additional_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_headers.insert(name.into(), value.into());
        self
    }

    /// Set the refresh lead time. Only meaningful for access tokens.
    #[must_use]
    pub fn expiry_grace_period(mut self, grace: Duration) -> Self {
        if let CredentialSource::AccessToken {
            expiry_grace_period,
            ..
        } = &mut self.source
        {
            *expiry_grace_period = grace;
        }
        self
    }

    /// Set the retry delay after a failed refresh. Only meaningful for access tokens.
    #[must_use]
    pub fn refresh_retry_interval(mut self, interval: Duration) -> Self {
        if let CredentialSource::AccessToken {
            refresh_retry_interval,
            ..
        } = &mut self.source
        {
            *refresh_retry_interval = interval;
        }
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        match &self.source {
            CredentialSource::None => {}
            CredentialSource::Basic { username, .. } => {
                if username.is_empty() {
                    return Err("Username cannot be empty".to_string());
                }
            }
            CredentialSource::AccessToken {
                expiry_grace_period,
                refresh_retry_interval,
                ..
            } => {
                if expiry_grace_period.is_zero() {
                    return Err("Expiry grace period must be > 0".to_string());
                }
                if refresh_retry_interval.is_zero() {
                    return Err("Refresh retry interval must be > 0".to_string());
                }
            }
        }
        if self.additional_headers.keys().any(String::is_empty) {
            return Err("Header names cannot be empty".to_string());
        }
        Ok(())
    }

    /// Build the provider for this configuration.
    ///
    /// Refresh events are published on `events`.
    pub fn build(&self, events: broadcast::Sender<AuthEvent>) -> Arc<dyn Authentication> {
        let additional = self.additional_headers.clone();
        match &self.source {
            CredentialSource::None => Arc::new(NoAuth::new(additional)),
            CredentialSource::Basic { username, password } => {
                Arc::new(BasicAuth::new(username, password, additional))
            }
            CredentialSource::AccessToken {
                supplier,
                expiry_grace_period,
                refresh_retry_interval,
            } => Arc::new(AccessTokenAuth::new(
                TokenRefreshScheduler::new(
                    Arc::clone(supplier),
                    *expiry_grace_period,
                    *refresh_retry_interval,
                    events,
                ),
                additional,
            )),
        }
    }
}

/// Additional headers only.
#[derive(Debug, Clone, Default)]
pub struct NoAuth {
    additional_headers: Headers,
}

impl NoAuth {
    pub fn new(additional_headers: Headers) -> Self {
        Self { additional_headers }
    }
}

#[async_trait]
impl Authentication for NoAuth {
    fn headers(&self) -> MessagingResult<Headers> {
        Ok(self.additional_headers.clone())
    }
}

/// Basic authentication with a precomputed header.
#[derive(Clone)]
pub struct BasicAuth {
    headers: Headers,
}

impl BasicAuth {
    pub fn new(username: &str, password: &str, additional_headers: Headers) -> Self {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        let mut headers = additional_headers;
        headers.insert(AUTHORIZATION_HEADER.to_string(), format!("Basic {encoded}"));
        Self { headers }
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth").finish_non_exhaustive()
    }
}

#[async_trait]
impl Authentication for BasicAuth {
    fn headers(&self) -> MessagingResult<Headers> {
        Ok(self.headers.clone())
    }
}

/// Bearer token authentication backed by a [`TokenRefreshScheduler`].
pub struct AccessTokenAuth {
    scheduler: TokenRefreshScheduler,
    additional_headers: Headers,
}

impl AccessTokenAuth {
    pub fn new(scheduler: TokenRefreshScheduler, additional_headers: Headers) -> Self {
        Self {
            scheduler,
            additional_headers,
        }
    }

    pub fn scheduler(&self) -> &TokenRefreshScheduler {
        &self.scheduler
    }
}

impl fmt::Debug for AccessTokenAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenAuth")
            .field("state", &self.scheduler.state())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Authentication for AccessTokenAuth {
    async fn start(&self) -> MessagingResult<()> {
        self.scheduler.start().await
    }

    fn headers(&self) -> MessagingResult<Headers> {
        let mut headers = self.additional_headers.clone();
        // The credential wins over a static header of the same name.
        headers.extend(self.scheduler.headers()?);
        Ok(headers)
    }

    fn stop(&self) {
        self.scheduler.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::MessagingError,
        refresh::{AccessToken, SchedulerState},
    };

    fn events() -> broadcast::Sender<AuthEvent> {
        broadcast::channel(4).0
    }

    async fn supply() -> MessagingResult<AccessToken> {
        Ok(AccessToken::expiring_in("jwt", Duration::from_secs(300)))
    }

    #[test]
    fn test_no_auth_sends_additional_headers() {
        let auth = AuthenticationConfig::none()
            .additional_header("x-client", "hpx")
            .build(events());
        let headers = auth.headers().expect("headers");
        assert_eq!(headers.get("x-client"), Some(&"hpx".to_string()));
        assert!(!headers.contains_key(AUTHORIZATION_HEADER));
    }

    #[test]
    fn test_basic_auth_header() {
        let auth = AuthenticationConfig::basic("ditto", "ditto").build(events());
        let headers = auth.headers().expect("headers");
        assert_eq!(
            headers.get(AUTHORIZATION_HEADER),
            Some(&"Basic ZGl0dG86ZGl0dG8=".to_string())
        );
    }

    #[test]
    fn test_basic_debug_redacts_password() {
        let config = AuthenticationConfig::basic("user", "s3cret");
        assert!(!format!("{config:?}").contains("s3cret"));
    }

    #[tokio::test]
    async fn test_access_token_auth_merges_headers() {
        let auth = AuthenticationConfig::access_token(supply)
            .additional_header("x-client", "hpx")
            .additional_header(AUTHORIZATION_HEADER, "overridden")
            .build(events());

        assert!(auth.headers().is_err());
        auth.start().await.expect("start");

        let headers = auth.headers().expect("headers");
        assert_eq!(headers.get("x-client"), Some(&"hpx".to_string()));
        assert_eq!(
            headers.get(AUTHORIZATION_HEADER),
            Some(&"Bearer jwt".to_string())
        );
        auth.stop();
        auth.stop();
    }

    #[test]
    fn test_grace_period_only_applies_to_access_tokens() {
        let config = AuthenticationConfig::basic("u", "p").expiry_grace_period(Duration::ZERO);
        assert!(config.validate().is_ok());

        let config = AuthenticationConfig::access_token(supply).expiry_grace_period(Duration::ZERO);
        assert_eq!(
            config.validate().unwrap_err(),
            "Expiry grace period must be > 0"
        );
    }

    #[test]
    fn test_validation_empty_username() {
        let config = AuthenticationConfig::basic("", "p");
        assert_eq!(config.validate().unwrap_err(), "Username cannot be empty");
    }

    #[tokio::test]
    async fn test_access_token_scheduler_state() {
        let auth = AccessTokenAuth::new(
            TokenRefreshScheduler::new(
                Arc::new(supply),
                Duration::from_secs(5),
                Duration::from_secs(1),
                events(),
            ),
            Headers::new(),
        );
        assert_eq!(auth.scheduler().state(), SchedulerState::Idle);
        auth.start().await.expect("start");
        assert!(matches!(
            auth.scheduler().state(),
            SchedulerState::Scheduled { .. }
        ));
        auth.stop();
        assert!(matches!(auth.start().await, Err(MessagingError::Closed)));
    }
}
