//! Inbound message routing.
//!
//! The [`MessageBus`] receives every inbound [`Adaptable`] in channel order. A
//! message carrying a correlation id that matches a live waiter resolves that
//! waiter and goes nowhere else. Anything else is offered to every subscriber
//! whose [`Classification`] matches it.

use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use futures_util::Stream;
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, timeout_at},
};
use tracing::{debug, warn};

use crate::{
    adaptable::Adaptable,
    correlation::{CorrelationRegistry, Waiter},
    error::{MessagingError, MessagingResult},
    types::CorrelationId,
};

/// Predicate used to route inbound messages to subscribers or waiters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    /// Messages carrying this correlation id.
    CorrelationId(CorrelationId),
    /// Messages routed under exactly this topic.
    Topic(String),
    /// Messages whose topic starts with this prefix.
    TopicPrefix(String),
    /// Messages carrying a header with this value.
    Header { name: String, value: String },
    /// Every message.
    Any,
}

impl Classification {
    /// Classification matching a correlation id.
    pub fn for_correlation_id(id: impl Into<CorrelationId>) -> Self {
        Self::CorrelationId(id.into())
    }

    /// Classification matching an exact topic.
    pub fn for_topic(topic: impl Into<String>) -> Self {
        Self::Topic(topic.into())
    }

    /// Check whether `message` falls under this classification.
    pub fn matches(&self, message: &Adaptable) -> bool {
        match self {
            Self::CorrelationId(id) => message.correlation_id().as_ref() == Some(id),
            Self::Topic(topic) => message.topic() == Some(topic.as_str()),
            Self::TopicPrefix(prefix) => message
                .topic()
                .is_some_and(|topic| topic.starts_with(prefix.as_str())),
            Self::Header { name, value } => message.header(name) == Some(value.as_str()),
            Self::Any => true,
        }
    }
}

/// What happened to a published message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Resolved a pending request.
    Resolved,
    /// Delivered to this many subscribers.
    Delivered(usize),
    /// Nothing matched; the message was dropped.
    Dropped,
}

/// Identifies a durable subscription for [`MessageBus::unsubscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type Handler = Arc<dyn Fn(Adaptable) + Send + Sync>;

enum Delivery {
    Handler(Handler),
    Once(oneshot::Sender<Adaptable>),
}

struct Subscriber {
    classification: Classification,
    delivery: Delivery,
}

type SubscriberMap = scc::HashMap<u64, Subscriber>;

/// Routes inbound messages to pending requests and subscribers.
pub struct MessageBus {
    correlations: CorrelationRegistry,
    subscribers: Arc<SubscriberMap>,
    next_id: AtomicU64,
    stream_capacity: usize,
    closed: AtomicBool,
}

impl MessageBus {
    /// Create a bus over the given correlation registry.
    pub fn new(correlations: CorrelationRegistry, stream_capacity: usize) -> Self {
        Self {
            correlations,
            subscribers: Arc::new(scc::HashMap::new()),
            next_id: AtomicU64::new(0),
            stream_capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// The registry of pending requests.
    pub fn correlations(&self) -> &CorrelationRegistry {
        &self.correlations
    }

    /// Route one inbound message.
    ///
    /// Must be called in channel-receive order; dispatch completes before returning.
    pub fn publish(&self, message: Adaptable) -> Dispatch {
        if let Some(id) = message.correlation_id()
            && self.correlations.resolve(&id, message.clone())
        {
            return Dispatch::Resolved;
        }

        let mut handlers = Vec::new();
        let mut once = Vec::new();
        self.subscribers.retain_sync(|id, subscriber| {
            if subscriber.classification.matches(&message) {
                match &subscriber.delivery {
                    Delivery::Handler(handler) => handlers.push(Arc::clone(handler)),
                    Delivery::Once(_) => once.push(*id),
                }
            }
            true
        });

        let mut delivered = 0;
        for id in once {
            // Removal claims the one-shot; a concurrent timeout may have won.
            if let Some((_, subscriber)) = self.subscribers.remove_sync(&id)
                && let Delivery::Once(tx) = subscriber.delivery
                && tx.send(message.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        for handler in &handlers {
            handler(message.clone());
        }
        delivered += handlers.len();

        if delivered == 0 {
            debug!(
                correlation_id = ?message.correlation_id(),
                topic = ?message.topic(),
                "Dropping inbound message with no waiter or subscriber"
            );
            return Dispatch::Dropped;
        }
        Dispatch::Delivered(delivered)
    }

    /// Register a one-shot match that completes with the first matching message.
    ///
    /// A correlation-id classification goes through the correlation registry, so
    /// it fails with [`MessagingError::DuplicateKey`] if that id is already in flight.
    /// Registration happens before this returns; await the result with
    /// [`OnceSubscription::wait`].
    pub fn subscribe_once(
        &self,
        classification: Classification,
        timeout: Duration,
    ) -> MessagingResult<OnceSubscription> {
        if self.is_closed() {
            return Err(MessagingError::Closed);
        }
        let deadline = Instant::now() + timeout;
        let subscription = if let Classification::CorrelationId(id) = classification {
            OnceSubscription::Correlated(self.correlations.register(id, deadline)?)
        } else {
            let (tx, rx) = oneshot::channel();
            let id = self.insert(classification, Delivery::Once(tx));
            OnceSubscription::Classified(ClassifiedWaiter {
                id,
                rx,
                deadline,
                timeout,
                subscribers: Arc::clone(&self.subscribers),
                settled: false,
            })
        };

        // A close that raced the registration may have missed this entry.
        if self.is_closed() {
            subscription.cancel();
            return Err(MessagingError::Closed);
        }
        Ok(subscription)
    }

    /// Register a durable handler for every matching message.
    ///
    /// Handlers run on the dispatching task and must not block.
    pub fn subscribe<F>(&self, classification: Classification, handler: F) -> SubscriptionHandle
    where
        F: Fn(Adaptable) + Send + Sync + 'static,
    {
        SubscriptionHandle(self.insert(classification, Delivery::Handler(Arc::new(handler))))
    }

    /// Subscribe as an async stream of matching messages.
    ///
    /// The subscription ends when the stream is dropped. Messages are dropped
    /// with a warning if the stream falls behind by more than its capacity.
    pub fn subscribe_stream(&self, classification: Classification) -> SubscriptionStream {
        let (tx, rx) = mpsc::channel(self.stream_capacity);
        let handle = self.subscribe(classification, move |message| {
            if let Err(err) = tx.try_send(message) {
                warn!(error = %err, "Dropping subscription message due to backpressure");
            }
        });
        SubscriptionStream {
            handle,
            rx,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Remove a durable subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.subscribers.remove_sync(&handle.0).is_some()
    }

    /// Number of registered subscribers, one-shot matches included.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Cancel every pending request and drop every subscriber.
    ///
    /// Pending requests and one-shot matches fail with [`MessagingError::Closed`];
    /// subscription streams end.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let cancelled = self.correlations.cancel_all();
        self.subscribers.clear_sync();
        cancelled
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn insert(&self, classification: Classification, delivery: Delivery) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber {
            classification,
            delivery,
        };
        // Ids are never reused, so the insert cannot collide.
        let _ = self.subscribers.insert_sync(id, subscriber);
        id
    }
}

/// A pending one-shot match registered by [`MessageBus::subscribe_once`].
pub enum OnceSubscription {
    /// Waiting on a correlation id.
    Correlated(Waiter),
    /// Waiting on any other classification.
    Classified(ClassifiedWaiter),
}

impl OnceSubscription {
    /// The correlation id being waited on, if any.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::Correlated(waiter) => Some(waiter.id()),
            Self::Classified(_) => None,
        }
    }

    /// When this match times out.
    pub fn deadline(&self) -> Instant {
        match self {
            Self::Correlated(waiter) => waiter.deadline(),
            Self::Classified(waiter) => waiter.deadline,
        }
    }

    /// Withdraw the match without waiting for it.
    pub fn cancel(self) {
        match self {
            Self::Correlated(waiter) => {
                waiter.cancel();
            }
            Self::Classified(waiter) => drop(waiter),
        }
    }

    /// Wait for the matching message or the deadline.
    pub async fn wait(self) -> MessagingResult<Adaptable> {
        match self {
            Self::Correlated(waiter) => waiter.wait().await,
            Self::Classified(waiter) => waiter.wait().await,
        }
    }
}

/// One-shot match on a non-correlation classification.
pub struct ClassifiedWaiter {
    id: u64,
    rx: oneshot::Receiver<Adaptable>,
    deadline: Instant,
    timeout: Duration,
    subscribers: Arc<SubscriberMap>,
    settled: bool,
}

impl ClassifiedWaiter {
    async fn wait(mut self) -> MessagingResult<Adaptable> {
        let outcome = match timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(MessagingError::Closed),
            Err(_) => {
                if self.subscribers.remove_sync(&self.id).is_some() {
                    Err(MessagingError::timed_out(
                        format!("subscription-{}", self.id),
                        self.timeout,
                    ))
                } else {
                    (&mut self.rx).await.map_err(|_| MessagingError::Closed)
                }
            }
        };
        self.settled = true;
        outcome
    }
}

impl Drop for ClassifiedWaiter {
    fn drop(&mut self) {
        if !self.settled {
            self.subscribers.remove_sync(&self.id);
        }
    }
}

/// Async stream of messages for one subscription.
pub struct SubscriptionStream {
    handle: SubscriptionHandle,
    rx: mpsc::Receiver<Adaptable>,
    subscribers: Arc<SubscriberMap>,
}

impl SubscriptionStream {
    /// The handle of the underlying subscription.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Receive the next message, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<Adaptable> {
        self.rx.recv().await
    }
}

impl Stream for SubscriptionStream {
    type Item = Adaptable;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.rx.poll_recv(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.subscribers.remove_sync(&self.handle.0);
    }
}
