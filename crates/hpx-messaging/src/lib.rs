//! # hpx-messaging
//!
//! Client-side messaging over a reconnecting message channel.
//!
//! This crate layers request/response correlation, event subscriptions,
//! subscription replay and proactive credential refresh on top of any
//! bidirectional text [`Channel`].
//!
//! ## Features
//!
//! - **Correlated requests**: every request waits for exactly one response, a timeout or a close
//! - **Message bus**: inbound messages routed by correlation id, topic or header
//! - **Subscription replay**: registered subscription messages resent in order on reconnect
//! - **Token refresh**: bearer credentials renewed ahead of expiry, failures reported as events
//! - **Header injection**: credential and static headers attached to every outbound message
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//!
//! use hpx_messaging::{
//!     AccessToken, Adaptable, AuthenticationConfig, MessagingConfig, MessagingProvider,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let auth = AuthenticationConfig::access_token(|| async {
//!         Ok(AccessToken::expiring_in("token", Duration::from_secs(3600)))
//!     })
//!     .additional_header("x-client", "demo");
//!
//!     let provider = MessagingProvider::new(my_channel(), MessagingConfig::default(), auth)?;
//!     provider.initialize().await?;
//!
//!     provider.register_subscription_message("events", "START-SEND-EVENTS");
//!     provider.emit("START-SEND-EVENTS").await?;
//!
//!     let request =
//!         Adaptable::new(serde_json::json!({"op": "retrieve"})).with_topic("things/commands");
//!     let response = provider.send_request(request).await?;
//!     println!("{}", response.value());
//!
//!     provider.close().await?;
//!     Ok(())
//! }
//! ```

pub mod adaptable;
pub mod auth;
pub mod bus;
pub mod channel;
pub mod config;
pub mod correlation;
pub mod error;
pub mod provider;
pub mod refresh;
pub mod replay;
pub mod types;

// Re-export commonly used types
pub use adaptable::Adaptable;
pub use auth::{
    AccessTokenAuth, Authentication, AuthenticationConfig, BasicAuth, CredentialSource, NoAuth,
};
pub use bus::{Classification, Dispatch, MessageBus, SubscriptionHandle, SubscriptionStream};
pub use channel::{Channel, ChannelEvent, ConnectionEpoch, Outbound};
pub use config::MessagingConfig;
pub use correlation::CorrelationRegistry;
pub use error::{MessagingError, MessagingResult};
pub use provider::{LegacyOperation, MessagingProvider, ProviderState};
pub use refresh::{
    AccessToken, AuthEvent, Credential, SchedulerState, TokenRefreshScheduler, TokenSupplier,
};
pub use replay::SubscriptionReplayRegistry;
pub use types::{CORRELATION_ID_HEADER, CorrelationId, Headers, SubscriptionKey};
