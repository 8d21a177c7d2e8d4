//! The messaging provider: request/response, subscriptions and credentials
//! over one [`Channel`].
//!
//! ```text
//!   emit / send_request                       Channel events
//!          │                                        │
//!          ▼                                        ▼
//!   ┌─────────────┐  cmd_tx   ┌──────────┐   ┌────────────┐
//!   │  Provider   │──────────▶│  Driver  │◀──│  Channel   │
//!   └─────────────┘           └──────────┘   └────────────┘
//!          │                    │      │
//!          │ subscribe_once     │      └── Connected: replay subscriptions
//!          ▼                    ▼
//!   ┌─────────────┐  publish  ┌──────────────────────┐
//!   │ MessageBus  │◀──────────│ inbound Message(text) │
//!   └─────────────┘           └──────────────────────┘
//! ```
//!
//! The driver task owns the channel's event stream. While the channel is
//! disconnected it holds outbound traffic back, so after every `Connected`
//! the registered subscription messages go out before anything else.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::timeout_at,
};
use tracing::{debug, info, warn};

use crate::{
    adaptable::Adaptable,
    auth::{Authentication, AuthenticationConfig},
    bus::{Classification, MessageBus},
    channel::{Channel, ChannelEvent, ConnectionEpoch, Outbound},
    config::MessagingConfig,
    correlation::CorrelationRegistry,
    error::{MessagingError, MessagingResult},
    refresh::AuthEvent,
    replay::SubscriptionReplayRegistry,
    types::{CorrelationId, SubscriptionKey},
};

/// Lifecycle of a [`MessagingProvider`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderState {
    /// Constructed; [`MessagingProvider::initialize`] has not completed.
    Created,
    /// The channel is usable.
    Ready,
    /// Closed; will not carry traffic again.
    Closed,
}

/// Operations superseded by [`MessagingProvider::emit`] and
/// [`MessagingProvider::send_request`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LegacyOperation {
    Send,
    SendCommand,
    SendCommandResponse,
    EmitEvent,
    RegisterReplyHandler,
    RegisterMessageHandler,
    DeregisterMessageHandler,
}

impl LegacyOperation {
    pub fn name(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::SendCommand => "send_command",
            Self::SendCommandResponse => "send_command_response",
            Self::EmitEvent => "emit_event",
            Self::RegisterReplyHandler => "register_reply_handler",
            Self::RegisterMessageHandler => "register_message_handler",
            Self::DeregisterMessageHandler => "deregister_message_handler",
        }
    }
}

#[derive(Debug)]
enum ControlCommand {
    Close,
}

/// Receivers handed to the driver on the first successful initialize.
struct Startup {
    ctrl_rx: mpsc::Receiver<ControlCommand>,
    cmd_rx: mpsc::Receiver<Outbound>,
}

struct Inner<C> {
    channel: Arc<C>,
    config: MessagingConfig,
    auth_config: AuthenticationConfig,
    auth: Arc<dyn Authentication>,
    auth_events: broadcast::Sender<AuthEvent>,
    bus: Arc<MessageBus>,
    replay: Arc<SubscriptionReplayRegistry>,
    state: Arc<watch::Sender<ProviderState>>,
    ctrl_tx: mpsc::Sender<ControlCommand>,
    cmd_tx: mpsc::Sender<Outbound>,
    startup: Mutex<Option<Startup>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
}

/// Client-side messaging over a [`Channel`].
///
/// Cloning is cheap; all clones share one channel and one set of registries.
pub struct MessagingProvider<C: Channel> {
    inner: Arc<Inner<C>>,
}

impl<C: Channel> Clone for MessagingProvider<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Channel> MessagingProvider<C> {
    /// Create a provider over `channel`. Nothing is connected until
    /// [`initialize`](Self::initialize).
    pub fn new(
        channel: C,
        config: MessagingConfig,
        auth_config: AuthenticationConfig,
    ) -> MessagingResult<Self> {
        config.validate().map_err(MessagingError::config)?;
        auth_config.validate().map_err(MessagingError::config)?;

        let (auth_events, _) = broadcast::channel(config.auth_event_capacity);
        let auth = auth_config.build(auth_events.clone());
        let bus = MessageBus::new(
            CorrelationRegistry::new(config.max_pending_requests),
            config.subscriber_channel_capacity,
        );
        let (ctrl_tx, ctrl_rx) = mpsc::channel(1);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let (state, _) = watch::channel(ProviderState::Created);

        Ok(Self {
            inner: Arc::new(Inner {
                channel: Arc::new(channel),
                config,
                auth_config,
                auth,
                auth_events,
                bus: Arc::new(bus),
                replay: Arc::new(SubscriptionReplayRegistry::new()),
                state: Arc::new(state),
                ctrl_tx,
                cmd_tx,
                startup: Mutex::new(Some(Startup { ctrl_rx, cmd_rx })),
                driver: Mutex::new(None),
                closed: AtomicBool::new(false),
                init_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Start authentication, connect the channel and wait until it is usable.
    ///
    /// Concurrent calls are serialized: a later call sees the outcome of the
    /// earlier one and, if that failed, makes its own attempt. Calling again
    /// once ready is a no-op.
    pub async fn initialize(&self) -> MessagingResult<()> {
        let _guard = self.inner.init_lock.lock().await;
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(MessagingError::Closed);
        }
        match self.state() {
            ProviderState::Ready => return Ok(()),
            ProviderState::Closed => return Err(MessagingError::Closed),
            ProviderState::Created => {}
        }
        let startup = self.inner.startup.lock().take();
        let Some(startup) = startup else {
            // The driver ran and stopped before the first connection.
            return Err(MessagingError::ChannelClosed);
        };

        info!("Initializing messaging provider");
        if let Err(err) = self.inner.auth.start().await {
            warn!(error = %err, "Authentication failed to start");
            *self.inner.startup.lock() = Some(startup);
            return Err(err);
        }
        let events = match self.inner.channel.connect().await {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "Channel failed to connect");
                *self.inner.startup.lock() = Some(startup);
                return Err(err);
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let driver = Driver {
            channel: Arc::clone(&self.inner.channel),
            auth: Arc::clone(&self.inner.auth),
            bus: Arc::clone(&self.inner.bus),
            replay: Arc::clone(&self.inner.replay),
            state: Arc::clone(&self.inner.state),
            cleanup_interval: self.inner.config.pending_cleanup_interval,
            connected: false,
            ready_tx: Some(ready_tx),
        };
        *self.inner.driver.lock() = Some(tokio::spawn(driver.run(startup, events)));

        if ready_rx.await.is_err() {
            return Err(if self.inner.closed.load(Ordering::Acquire) {
                MessagingError::Closed
            } else {
                MessagingError::ChannelClosed
            });
        }
        match self.state() {
            ProviderState::Ready => Ok(()),
            _ => Err(MessagingError::Closed),
        }
    }

    /// Send a raw message without waiting for a reply.
    ///
    /// Credential and additional headers are attached as transport headers.
    pub async fn emit(&self, message: impl Into<String>) -> MessagingResult<()> {
        self.ensure_ready()?;
        let headers = self.inner.auth.headers()?;
        self.inner
            .cmd_tx
            .send(Outbound {
                headers,
                payload: message.into(),
            })
            .await
            .map_err(|_| MessagingError::ChannelClosed)
    }

    /// Serialize `adaptable` as JSON and [`emit`](Self::emit) it.
    pub async fn emit_adaptable(&self, adaptable: &Adaptable) -> MessagingResult<()> {
        self.emit(adaptable.to_json()?).await
    }

    /// Send a request and wait for the response carrying its correlation id.
    ///
    /// A fresh correlation id is assigned if the request has none. Fails with
    /// [`MessagingError::TimedOut`] after the configured timeout, including
    /// time spent waiting for room in the outbound queue.
    pub async fn send_request(&self, adaptable: Adaptable) -> MessagingResult<Adaptable> {
        self.send_request_with_timeout(adaptable, self.inner.config.timeout)
            .await
    }

    /// [`send_request`](Self::send_request) with an explicit deadline.
    pub async fn send_request_with_timeout(
        &self,
        adaptable: Adaptable,
        timeout: Duration,
    ) -> MessagingResult<Adaptable> {
        self.ensure_ready()?;
        let (id, request) = match adaptable.correlation_id() {
            Some(id) => (id, adaptable),
            None => {
                let id = CorrelationId::new();
                let request = adaptable.with_correlation_id(&id);
                (id, request)
            }
        };

        // Registered before emitting so a fast response cannot be missed.
        let waiter = self
            .inner
            .bus
            .subscribe_once(Classification::CorrelationId(id.clone()), timeout)?;
        debug!(correlation_id = %id, "Sending request");
        match timeout_at(waiter.deadline(), self.emit_adaptable(&request)).await {
            Ok(sent) => sent?,
            Err(_) => return Err(MessagingError::timed_out(id.to_string(), timeout)),
        }
        waiter.wait().await
    }

    /// Remember `message` and resend it after every (re)connect.
    pub fn register_subscription_message(
        &self,
        key: impl Into<SubscriptionKey>,
        message: impl Into<String>,
    ) {
        self.inner.replay.register(key, message);
    }

    /// Stop resending the message registered under `key`.
    pub fn unregister_subscription_message(&self, key: impl Into<SubscriptionKey>) {
        self.inner.replay.unregister(&key.into());
    }

    /// Always fails with [`MessagingError::NotSupported`].
    pub fn invoke_legacy(&self, operation: LegacyOperation) -> MessagingResult<()> {
        Err(MessagingError::not_supported(operation.name()))
    }

    /// Close the provider. Idempotent.
    ///
    /// Stops credential refresh, fails every pending request with
    /// [`MessagingError::Closed`] and closes the channel.
    pub async fn close(&self) -> MessagingResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Closing messaging provider");
        self.inner.state.send_replace(ProviderState::Closed);
        self.inner.auth.stop();

        let cancelled = self.inner.bus.close();
        if cancelled > 0 {
            debug!(cancelled, "Cancelled pending requests");
        }

        let _ = self.inner.ctrl_tx.try_send(ControlCommand::Close);
        let driver = self.inner.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
        self.inner.channel.close().await
    }

    pub fn state(&self) -> ProviderState {
        *self.inner.state.borrow()
    }

    /// Non-fatal authentication events.
    pub fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.auth_events.subscribe()
    }

    pub fn authentication_config(&self) -> &AuthenticationConfig {
        &self.inner.auth_config
    }

    pub fn messaging_config(&self) -> &MessagingConfig {
        &self.inner.config
    }

    /// The inbound message bus, for subscribing to events.
    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    fn ensure_ready(&self) -> MessagingResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(MessagingError::ChannelClosed);
        }
        match self.state() {
            ProviderState::Ready => Ok(()),
            ProviderState::Created => Err(MessagingError::NotInitialized),
            ProviderState::Closed => Err(MessagingError::ChannelClosed),
        }
    }
}

struct Driver<C> {
    channel: Arc<C>,
    auth: Arc<dyn Authentication>,
    bus: Arc<MessageBus>,
    replay: Arc<SubscriptionReplayRegistry>,
    state: Arc<watch::Sender<ProviderState>>,
    cleanup_interval: Duration,
    connected: bool,
    ready_tx: Option<oneshot::Sender<()>>,
}

impl<C: Channel> Driver<C> {
    async fn run(mut self, startup: Startup, mut events: mpsc::Receiver<ChannelEvent>) {
        let Startup {
            mut ctrl_rx,
            mut cmd_rx,
        } = startup;
        let mut cleanup_interval = tokio::time::interval(self.cleanup_interval);

        loop {
            tokio::select! {
                biased;
                ctrl = ctrl_rx.recv() => {
                    match ctrl {
                        Some(ControlCommand::Close) | None => return,
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(ChannelEvent::Connected { epoch }) => self.on_connected(epoch).await,
                        Some(ChannelEvent::Disconnected { epoch, reason }) => {
                            info!(epoch = epoch.0, %reason, "Channel disconnected");
                            self.connected = false;
                        }
                        Some(ChannelEvent::Message(text)) => self.on_message(&text),
                        None => {
                            warn!("Channel event stream ended");
                            self.bus.close();
                            return;
                        }
                    }
                }
                // Held back while disconnected so replay goes first on the next connection.
                cmd = cmd_rx.recv(), if self.connected => {
                    match cmd {
                        Some(outbound) => {
                            if let Err(err) = self.channel.send(outbound).await {
                                warn!(error = %err, "Failed to send outbound message");
                            }
                        }
                        None => return,
                    }
                }
                _ = cleanup_interval.tick() => {
                    let expired = self.bus.correlations().expire_stale();
                    if expired > 0 {
                        debug!(expired, "Expired stale pending requests");
                    }
                }
            }
        }
    }

    async fn on_connected(&mut self, epoch: ConnectionEpoch) {
        info!(epoch = epoch.0, "Channel connected");
        self.connected = true;
        self.replay_subscriptions(epoch).await;

        if let Some(ready_tx) = self.ready_tx.take() {
            self.state.send_if_modified(|state| {
                if *state != ProviderState::Created {
                    return false;
                }
                *state = ProviderState::Ready;
                true
            });
            let _ = ready_tx.send(());
        }
    }

    async fn replay_subscriptions(&self, epoch: ConnectionEpoch) {
        let messages = self.replay.replay_all();
        if messages.is_empty() {
            return;
        }
        let headers = match self.auth.headers() {
            Ok(headers) => headers,
            Err(err) => {
                warn!(epoch = epoch.0, error = %err, "Skipping subscription replay");
                return;
            }
        };

        debug!(epoch = epoch.0, count = messages.len(), "Replaying subscription messages");
        for payload in messages {
            let outbound = Outbound {
                headers: headers.clone(),
                payload,
            };
            if let Err(err) = self.channel.send(outbound).await {
                warn!(epoch = epoch.0, error = %err, "Subscription replay interrupted");
                return;
            }
        }
    }

    fn on_message(&self, text: &str) {
        match Adaptable::from_json(text) {
            Ok(message) => {
                self.bus.publish(message);
            }
            Err(err) => {
                warn!(error = %err, "Dropping unparseable inbound message");
            }
        }
    }
}
