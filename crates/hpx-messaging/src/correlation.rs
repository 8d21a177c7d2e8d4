//! Lock-free correlation registry using `scc::HashMap`.
//!
//! Every outstanding request owns one entry keyed by its correlation id. An
//! entry is claimed exactly once: by a matching response ([`CorrelationRegistry::resolve`]),
//! by its deadline ([`Waiter::wait`] or [`CorrelationRegistry::expire_stale`]), or by
//! cancellation ([`Waiter::cancel`] or [`CorrelationRegistry::cancel_all`]). Claiming is an
//! atomic remove on the map, so whichever path removes the entry wins and all
//! others observe it as already gone.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::oneshot,
    time::{Instant, timeout_at},
};
use tracing::debug;

use crate::{
    adaptable::Adaptable,
    error::{MessagingError, MessagingResult},
    types::CorrelationId,
};

type Outcome = MessagingResult<Adaptable>;

/// A pending request awaiting its response.
struct PendingRequest {
    /// Channel to send the outcome.
    response_tx: oneshot::Sender<Outcome>,
    /// When this request times out.
    deadline: Instant,
    /// Deadline measured from registration, reported on timeout.
    timeout: Duration,
    /// Distinguishes this registration from a later one reusing the same id.
    ticket: u64,
}

struct Inner {
    requests: scc::HashMap<CorrelationId, PendingRequest>,
    next_ticket: AtomicU64,
    capacity: usize,
}

/// Registry of outstanding requests keyed by correlation id.
///
/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct CorrelationRegistry {
    inner: Arc<Inner>,
}

impl CorrelationRegistry {
    /// Create a registry holding at most `capacity` outstanding requests.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                requests: scc::HashMap::new(),
                next_ticket: AtomicU64::new(0),
                capacity,
            }),
        }
    }

    /// Register a waiter for `id` that times out at `deadline`.
    ///
    /// Fails with [`MessagingError::DuplicateKey`] if `id` already has a live
    /// waiter, or [`MessagingError::CapacityExceeded`] if the registry is full.
    ///
    /// The capacity check and the insert are separate steps, so concurrent
    /// registrations may overshoot `capacity` by a few entries.
    pub fn register(&self, id: CorrelationId, deadline: Instant) -> MessagingResult<Waiter> {
        if !self.has_capacity() {
            return Err(MessagingError::capacity_exceeded(
                "Too many pending requests",
            ));
        }

        let (tx, rx) = oneshot::channel();
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let timeout = deadline.saturating_duration_since(Instant::now());
        let pending = PendingRequest {
            response_tx: tx,
            deadline,
            timeout,
            ticket,
        };

        if let Err((id, _)) = self.inner.requests.insert_sync(id.clone(), pending) {
            return Err(MessagingError::duplicate_key(id.to_string()));
        }

        Ok(Waiter {
            id,
            ticket,
            deadline,
            timeout,
            rx,
            inner: Arc::clone(&self.inner),
            settled: false,
        })
    }

    /// Resolve the waiter for `id` with a response.
    ///
    /// Returns `true` if a live waiter was found and fulfilled, `false` otherwise.
    pub fn resolve(&self, id: &CorrelationId, message: Adaptable) -> bool {
        if let Some((_, pending)) = self.inner.requests.remove_sync(id) {
            // Receiver may already be gone if the caller dropped the future.
            let _ = pending.response_tx.send(Ok(message));
            return true;
        }
        false
    }

    /// Fail every live waiter with [`MessagingError::Closed`].
    ///
    /// Returns the number of waiters cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut claimed = 0;
        for (id, ticket) in self.snapshot(|_| true) {
            if let Some((_, pending)) = self
                .inner
                .requests
                .remove_if_sync(&id, |p| p.ticket == ticket)
            {
                let _ = pending.response_tx.send(Err(MessagingError::Closed));
                claimed += 1;
            }
        }
        claimed
    }

    /// Time out every waiter whose deadline has passed.
    ///
    /// Covers waiters whose handle is never polled. Returns the number expired.
    pub fn expire_stale(&self) -> usize {
        let now = Instant::now();
        let mut expired = 0;
        for (id, ticket) in self.snapshot(|pending| pending.deadline <= now) {
            if let Some((id, pending)) = self
                .inner
                .requests
                .remove_if_sync(&id, |p| p.ticket == ticket)
            {
                debug!(correlation_id = %id, "Expiring stale pending request");
                let _ = pending
                    .response_tx
                    .send(Err(MessagingError::timed_out(id.to_string(), pending.timeout)));
                expired += 1;
            }
        }
        expired
    }

    /// Check whether `id` currently has a live waiter.
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.inner.requests.get_sync(id).is_some()
    }

    /// Check if there's capacity for more requests.
    pub fn has_capacity(&self) -> bool {
        self.inner.requests.len() < self.inner.capacity
    }

    /// Get the current number of pending requests.
    pub fn len(&self) -> usize {
        self.inner.requests.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.requests.is_empty()
    }

    fn snapshot(&self, filter: impl Fn(&PendingRequest) -> bool) -> Vec<(CorrelationId, u64)> {
        let mut entries = Vec::new();
        self.inner.requests.retain_sync(|id, pending| {
            if filter(pending) {
                entries.push((id.clone(), pending.ticket));
            }
            true
        });
        entries
    }
}

/// Handle to one registered waiter.
///
/// Dropping an unsettled handle cancels its registration.
pub struct Waiter {
    id: CorrelationId,
    ticket: u64,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<Outcome>,
    inner: Arc<Inner>,
    settled: bool,
}

impl Waiter {
    /// The correlation id this waiter is registered under.
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// When this waiter times out.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait until the response arrives, the deadline passes, or the registry is closed.
    pub async fn wait(mut self) -> MessagingResult<Adaptable> {
        let outcome = match timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(MessagingError::Closed),
            Err(_) => {
                if self.claim() {
                    Err(MessagingError::timed_out(self.id.to_string(), self.timeout))
                } else {
                    // Another path claimed the entry first; its outcome is in flight.
                    (&mut self.rx).await.unwrap_or(Err(MessagingError::Closed))
                }
            }
        };
        self.settled = true;
        outcome
    }

    /// Remove this waiter without resolving it.
    ///
    /// Returns `true` if the cancellation won, `false` if the waiter was
    /// already resolved, timed out, or cancelled.
    pub fn cancel(mut self) -> bool {
        self.settled = true;
        self.claim()
    }

    fn claim(&self) -> bool {
        self.inner
            .requests
            .remove_if_sync(&self.id, |p| p.ticket == self.ticket)
            .is_some()
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if !self.settled {
            self.claim();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn response(id: &str) -> Adaptable {
        Adaptable::new(json!({"status": 200})).with_correlation_id(&CorrelationId::from(id))
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = CorrelationRegistry::new(10);
        let id = CorrelationId::from("req-1");

        let waiter = registry.register(id.clone(), in_secs(5)).expect("register");
        assert_eq!(registry.len(), 1);

        assert!(registry.resolve(&id, response("req-1")));
        assert!(registry.is_empty());

        let result = waiter.wait().await.expect("response");
        assert_eq!(result.correlation_id(), Some(id));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let registry = CorrelationRegistry::new(10);
        let id = CorrelationId::from("same");

        let _first = registry.register(id.clone(), in_secs(5)).expect("register");
        let second = registry.register(id, in_secs(5));
        assert!(matches!(second, Err(MessagingError::DuplicateKey { .. })));
    }

    #[test]
    fn test_capacity_limit() {
        let registry = CorrelationRegistry::new(2);
        let _a = registry.register("a".into(), in_secs(5)).expect("register");
        let _b = registry.register("b".into(), in_secs(5)).expect("register");

        assert!(!registry.has_capacity());
        let c = registry.register("c".into(), in_secs(5));
        assert!(matches!(c, Err(MessagingError::CapacityExceeded { .. })));
    }

    #[test]
    fn test_resolve_nonexistent() {
        let registry = CorrelationRegistry::new(10);
        assert!(!registry.resolve(&"missing".into(), response("missing")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry_and_drops_late_response() {
        let registry = CorrelationRegistry::new(10);
        let id = CorrelationId::from("slow");
        let waiter = registry
            .register(id.clone(), Instant::now() + Duration::from_millis(50))
            .expect("register");

        let result = waiter.wait().await;
        assert!(matches!(result, Err(MessagingError::TimedOut { .. })));
        assert!(!registry.contains(&id));
        assert!(!registry.resolve(&id, response("slow")));
    }

    #[tokio::test]
    async fn test_cancel_all_fails_waiters_with_closed() {
        let registry = CorrelationRegistry::new(10);
        let a = registry.register("a".into(), in_secs(5)).expect("register");
        let b = registry.register("b".into(), in_secs(5)).expect("register");

        assert_eq!(registry.cancel_all(), 2);
        assert!(registry.is_empty());
        assert!(matches!(a.wait().await, Err(MessagingError::Closed)));
        assert!(matches!(b.wait().await, Err(MessagingError::Closed)));
    }

    #[test]
    fn test_cancel_then_resolve_loses() {
        let registry = CorrelationRegistry::new(10);
        let id = CorrelationId::from("c");
        let waiter = registry.register(id.clone(), in_secs(5)).expect("register");

        assert!(waiter.cancel());
        assert!(!registry.resolve(&id, response("c")));
    }

    #[test]
    fn test_resolve_then_cancel_loses() {
        let registry = CorrelationRegistry::new(10);
        let id = CorrelationId::from("c");
        let waiter = registry.register(id.clone(), in_secs(5)).expect("register");

        assert!(registry.resolve(&id, response("c")));
        assert!(!waiter.cancel());
    }

    #[test]
    fn test_drop_unregisters_waiter() {
        let registry = CorrelationRegistry::new(10);
        let id = CorrelationId::from("dropped");
        let waiter = registry.register(id.clone(), in_secs(5)).expect("register");
        drop(waiter);

        assert!(!registry.contains(&id));
        // The id is free for reuse.
        let _again = registry.register(id, in_secs(5)).expect("register again");
    }

    #[test]
    fn test_stale_drop_does_not_remove_newer_registration() {
        let registry = CorrelationRegistry::new(10);
        let id = CorrelationId::from("reused");

        let first = registry.register(id.clone(), in_secs(5)).expect("register");
        assert!(registry.resolve(&id, response("reused")));
        let _second = registry.register(id.clone(), in_secs(5)).expect("register");

        drop(first);
        assert!(registry.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_stale_notifies_unpolled_waiters() {
        let registry = CorrelationRegistry::new(10);
        let waiter = registry
            .register("old".into(), Instant::now() + Duration::from_millis(10))
            .expect("register");
        let _fresh = registry.register("fresh".into(), in_secs(60)).expect("register");

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(registry.expire_stale(), 1);
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            waiter.wait().await,
            Err(MessagingError::TimedOut { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resolve_at_deadline_has_single_outcome() {
        for round in 0..200 {
            let registry = CorrelationRegistry::new(10);
            let id = CorrelationId::from(format!("edge-{round}"));
            let deadline = Instant::now() + Duration::from_millis(2);
            let waiter = registry.register(id.clone(), deadline).expect("register");
            let message = response("edge");

            let resolver = tokio::spawn({
                let registry = registry.clone();
                let message = message.clone();
                async move {
                    tokio::time::sleep_until(deadline).await;
                    registry.resolve(&id, message)
                }
            });
            let outcome = waiter.wait().await;
            let resolved = resolver.await.expect("join");

            // Whoever claimed the entry decides the outcome.
            if resolved {
                assert_eq!(outcome.expect("resolved response"), message);
            } else {
                assert!(matches!(outcome, Err(MessagingError::TimedOut { .. })));
            }
            assert!(registry.is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_at_deadline_times_out_once() {
        let registry = CorrelationRegistry::new(10);
        let id = CorrelationId::from("swept");
        let deadline = Instant::now() + Duration::from_millis(10);
        let waiter = registry.register(id.clone(), deadline).expect("register");

        let sweeper = tokio::spawn({
            let registry = registry.clone();
            async move {
                tokio::time::sleep_until(deadline).await;
                registry.expire_stale()
            }
        });

        assert!(matches!(
            waiter.wait().await,
            Err(MessagingError::TimedOut { .. })
        ));
        assert!(sweeper.await.expect("join") <= 1);
        assert!(registry.is_empty());
        assert!(!registry.resolve(&id, response("swept")));
    }

    #[test]
    fn test_exactly_one_claim_wins_under_contention() {
        use std::thread;

        for round in 0..50 {
            let registry = CorrelationRegistry::new(10);
            let id = CorrelationId::from(format!("race-{round}"));
            let waiter = registry.register(id.clone(), in_secs(5)).expect("register");

            let resolver = {
                let registry = registry.clone();
                let id = id.clone();
                thread::spawn(move || registry.resolve(&id, response("race")))
            };
            let closer = {
                let registry = registry.clone();
                thread::spawn(move || registry.cancel_all() == 1)
            };
            let canceller = thread::spawn(move || waiter.cancel());

            let wins = [resolver, closer, canceller]
                .into_iter()
                .map(|handle| handle.join().unwrap_or(false))
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);
            assert!(registry.is_empty());
        }
    }
}
