//! Ordered registry of subscription messages to resend after a reconnect.
//!
//! Each key keeps the position of its first registration; overwriting a key
//! replaces its message in place. Replay order is therefore the order in
//! which keys were first registered.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::types::SubscriptionKey;

struct ReplayEntry {
    /// Position assigned at first registration.
    position: u64,
    message: String,
}

/// Lock-free store for replayable subscription messages.
pub struct SubscriptionReplayRegistry {
    entries: scc::HashMap<SubscriptionKey, ReplayEntry>,
    next_position: AtomicU64,
}

impl SubscriptionReplayRegistry {
    pub fn new() -> Self {
        Self {
            entries: scc::HashMap::new(),
            next_position: AtomicU64::new(0),
        }
    }

    /// Insert or overwrite the message for `key`.
    ///
    /// Returns `true` if the key was new.
    pub fn register(&self, key: impl Into<SubscriptionKey>, message: impl Into<String>) -> bool {
        let key = key.into();
        let message = message.into();
        match self.entries.entry_sync(key) {
            scc::hash_map::Entry::Occupied(mut entry) => {
                debug!(key = %entry.key(), "Replacing subscription message");
                entry.get_mut().message = message;
                false
            }
            scc::hash_map::Entry::Vacant(entry) => {
                let position = self.next_position.fetch_add(1, Ordering::Relaxed);
                entry.insert_entry(ReplayEntry { position, message });
                true
            }
        }
    }

    /// Remove the message for `key`. Returns `false` if it was absent.
    pub fn unregister(&self, key: &SubscriptionKey) -> bool {
        self.entries.remove_sync(key).is_some()
    }

    /// All current messages in first-registration order.
    pub fn replay_all(&self) -> Vec<String> {
        let mut entries = Vec::with_capacity(self.entries.len());
        self.entries.retain_sync(|_, entry| {
            entries.push((entry.position, entry.message.clone()));
            true
        });
        entries.sort_unstable_by_key(|(position, _)| *position);
        entries.into_iter().map(|(_, message)| message).collect()
    }

    /// The message currently registered for `key`.
    pub fn get(&self, key: &SubscriptionKey) -> Option<String> {
        self.entries
            .get_sync(key)
            .map(|entry| entry.get().message.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SubscriptionReplayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_in_registration_order() {
        let registry = SubscriptionReplayRegistry::new();
        registry.register("a", "SUB:a");
        registry.register("b", "SUB:b");
        registry.register("c", "SUB:c");

        assert_eq!(registry.replay_all(), vec!["SUB:a", "SUB:b", "SUB:c"]);
    }

    #[test]
    fn test_overwrite_keeps_original_position() {
        let registry = SubscriptionReplayRegistry::new();
        assert!(registry.register("A", "A1"));
        assert!(registry.register("B", "B1"));
        assert!(!registry.register("A", "A2"));

        assert_eq!(registry.replay_all(), vec!["A2", "B1"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unregister_then_register_moves_to_end() {
        let registry = SubscriptionReplayRegistry::new();
        registry.register("A", "A1");
        registry.register("B", "B1");

        assert!(registry.unregister(&"A".into()));
        assert!(!registry.unregister(&"A".into()));
        registry.register("A", "A2");

        assert_eq!(registry.replay_all(), vec!["B1", "A2"]);
    }

    #[test]
    fn test_replay_does_not_mutate() {
        let registry = SubscriptionReplayRegistry::new();
        registry.register("sub-1", "SUBSCRIBE:events");

        assert_eq!(registry.replay_all(), registry.replay_all());
        assert_eq!(
            registry.get(&"sub-1".into()).as_deref(),
            Some("SUBSCRIBE:events")
        );
    }

    #[test]
    fn test_concurrent_registration_of_distinct_keys() {
        use std::{sync::Arc, thread};

        let registry = Arc::new(SubscriptionReplayRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for j in 0..25 {
                        registry.register(format!("t{i}-{j}"), format!("SUB:{i}-{j}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().ok();
        }

        assert_eq!(registry.len(), 200);
        assert_eq!(registry.replay_all().len(), 200);
    }
}
