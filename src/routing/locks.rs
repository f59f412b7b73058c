use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// The unit of serialization. Keying on the (contact, channel) pair rather than
/// a conversation id also serializes the find-or-create of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub contact_id: i64,
    pub channel_id: i64,
}

impl ConversationKey {
    pub fn new(contact_id: i64, channel_id: i64) -> Self {
        Self {
            contact_id,
            channel_id,
        }
    }
}

/// Keyed async locks. Entries are weak so idle keys cost nothing once their
/// last guard drops; dead entries are swept when the map grows past the
/// prune threshold.
pub struct ConversationLocks {
    entries: Mutex<HashMap<ConversationKey, Weak<AsyncMutex<()>>>>,
    prune_threshold: usize,
}

impl ConversationLocks {
    pub fn new(prune_threshold: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            prune_threshold: prune_threshold.max(1),
        }
    }

    pub async fn lock(&self, key: ConversationKey) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut entries = self.entries.lock();
            if entries.len() >= self.prune_threshold {
                entries.retain(|_, entry| entry.strong_count() > 0);
            }
            match entries.get(&key).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(AsyncMutex::new(()));
                    entries.insert(key, Arc::downgrade(&mutex));
                    mutex
                }
            }
        };
        mutex.lock_owned().await
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::{ConversationKey, ConversationLocks};

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(ConversationLocks::new(16));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(ConversationKey::new(1, 1)).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = ConversationLocks::new(16);
        let _first = locks.lock(ConversationKey::new(1, 1)).await;
        let second = tokio::time::timeout(
            Duration::from_millis(200),
            locks.lock(ConversationKey::new(2, 1)),
        )
        .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn released_keys_are_pruned() {
        let locks = ConversationLocks::new(2);
        for contact_id in 0..5 {
            drop(locks.lock(ConversationKey::new(contact_id, 1)).await);
        }
        assert!(locks.tracked_keys() <= 2);

        let _held = locks.lock(ConversationKey::new(100, 1)).await;
        let _held_too = locks.lock(ConversationKey::new(101, 1)).await;
        drop(locks.lock(ConversationKey::new(102, 1)).await);
        assert!(locks.tracked_keys() >= 2);
    }
}
