use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::error::{CmsError, Result};
use crate::types::{ConsumerId, DashMap, MessageDispatch};

/// Delivery endpoint for inbound messages addressed to one consumer.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Takes ownership of `dispatch`, delivering or dropping it.
    async fn dispatch(&self, dispatch: MessageDispatch);
}

/// Non-owning ConsumerId -> Dispatcher lookup. The owner of a dispatcher keeps it
/// alive; an entry whose owner is gone behaves as unregistered.
#[derive(Default)]
pub struct DispatcherRegistry {
    dispatchers: DashMap<ConsumerId, Weak<dyn Dispatcher>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails when a live dispatcher is already registered for `id`.
    pub fn register(&self, id: ConsumerId, dispatcher: &Arc<dyn Dispatcher>) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.dispatchers.entry(id) {
            Entry::Occupied(mut e) => {
                if e.get().strong_count() > 0 {
                    return Err(CmsError::IllegalState(format!("dispatcher already registered for {}", e.key())));
                }
                e.insert(Arc::downgrade(dispatcher));
            }
            Entry::Vacant(e) => {
                e.insert(Arc::downgrade(dispatcher));
            }
        }
        Ok(())
    }

    /// Returns whether an entry was removed. Removing twice is harmless.
    #[inline]
    pub fn unregister(&self, id: &ConsumerId) -> bool {
        self.dispatchers.remove(id).is_some()
    }

    pub fn lookup(&self, id: &ConsumerId) -> Option<Arc<dyn Dispatcher>> {
        let found = self.dispatchers.get(id).map(|d| d.upgrade());
        match found {
            Some(Some(d)) => Some(d),
            Some(None) => {
                self.dispatchers.remove_if(id, |_, d| d.strong_count() == 0);
                None
            }
            None => None,
        }
    }

    #[inline]
    pub fn contains(&self, id: &ConsumerId) -> bool {
        self.dispatchers.get(id).map(|d| d.strong_count() > 0).unwrap_or(false)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }

    #[inline]
    pub fn ids(&self) -> Vec<ConsumerId> {
        self.dispatchers.iter().map(|e| e.key().clone()).collect()
    }

    #[inline]
    pub fn clear(&self) {
        self.dispatchers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::types::{ConnectionId, SessionId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl Dispatcher for Counting {
        async fn dispatch(&self, _dispatch: MessageDispatch) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn consumer(n: i64) -> ConsumerId {
        ConsumerId::new(&SessionId::new(&ConnectionId::new("c"), 1), n)
    }

    #[tokio::test]
    async fn register_lookup_unregister() {
        let registry = DispatcherRegistry::new();
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let d: Arc<dyn Dispatcher> = counting.clone();

        registry.register(consumer(1), &d).unwrap();
        assert!(registry.register(consumer(1), &d).is_err());
        assert_eq!(registry.len(), 1);

        let found = registry.lookup(&consumer(1)).unwrap();
        found.dispatch(MessageDispatch::new(consumer(1), Message::text("a"))).await;
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert!(registry.lookup(&consumer(2)).is_none());

        assert!(registry.unregister(&consumer(1)));
        assert!(!registry.unregister(&consumer(1)));
        assert!(registry.is_empty());
    }

    #[test]
    fn dropped_owner_behaves_as_unregistered() {
        let registry = DispatcherRegistry::new();
        {
            let d: Arc<dyn Dispatcher> = Arc::new(Counting(AtomicUsize::new(0)));
            registry.register(consumer(3), &d).unwrap();
            assert!(registry.contains(&consumer(3)));
        }
        assert!(!registry.contains(&consumer(3)));
        assert!(registry.lookup(&consumer(3)).is_none());
        assert!(registry.is_empty());

        let d: Arc<dyn Dispatcher> = Arc::new(Counting(AtomicUsize::new(0)));
        registry.register(consumer(3), &d).unwrap();
        assert_eq!(registry.ids(), vec![consumer(3)]);
    }
}
