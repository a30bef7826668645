//! Cooperative cancellation for renders and progressive loads.
//!
//! A [`CancellationToken`] is handed to the backend together with a render
//! request. The backend checks it at native-call granularity: before the call
//! starts and after it returns. Cancelling never interrupts a native call.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::hash::Hash;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Cancellation token for cooperative cancellation.
///
/// Clones share the same cancellation state, so a token can be cancelled from
/// a different task than the one awaiting the render.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token in the non-cancelled state.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancels this token and every clone of it. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resets the token (and all clones) to the non-cancelled state.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    /// Returns true if both tokens share the same cancellation state.
    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of in-flight work keyed by `K`.
///
/// The render cache registers every render it starts so that a viewport
/// change can cancel renders of pages that are no longer needed. Several
/// registrations may share a key; cancelling a key cancels all of them.
pub struct CancellationRegistry<K> {
    tokens: Mutex<FxHashMap<K, SmallVec<[CancellationToken; 1]>>>,
}

impl<K: Hash + Eq + Clone> CancellationRegistry<K> {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(FxHashMap::default()),
        }
    }

    /// Registers work under `key` and returns a fresh token for it.
    pub fn register(&self, key: K) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().entry(key).or_default().push(token.clone());
        token
    }

    /// Registers work under `key` for as long as the returned guard lives.
    pub fn enter(&self, key: K) -> Registration<'_, K> {
        let token = self.register(key.clone());
        Registration {
            registry: self,
            key,
            token,
        }
    }

    /// Cancels all work registered under `key`. Returns `true` if found.
    pub fn cancel(&self, key: &K) -> bool {
        match self.tokens.lock().get(key) {
            Some(tokens) => {
                tokens.iter().for_each(CancellationToken::cancel);
                true
            }
            None => false,
        }
    }

    /// Cancels every registration whose key matches `predicate`.
    ///
    /// Returns the number of tokens cancelled.
    pub fn cancel_where<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&K) -> bool,
    {
        let tokens = self.tokens.lock();
        let mut cancelled = 0;
        for (key, registered) in tokens.iter() {
            if !predicate(key) {
                continue;
            }
            for token in registered.iter().filter(|t| !t.is_cancelled()) {
                token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Cancels all registered work.
    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    /// Removes the registration of `token` under `key`.
    ///
    /// Other registrations under the same key are left alone.
    pub fn unregister(&self, key: &K, token: &CancellationToken) -> bool {
        let mut tokens = self.tokens.lock();
        let Some(registered) = tokens.get_mut(key) else {
            return false;
        };
        let Some(at) = registered.iter().position(|t| t.same_as(token)) else {
            return false;
        };
        registered.swap_remove(at);
        if registered.is_empty() {
            tokens.remove(key);
        }
        true
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.tokens.lock().values().map(|t| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

impl<K: Hash + Eq + Clone> Default for CancellationRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// A registration that ends when dropped, including when the future holding
/// it is dropped mid-render.
pub struct Registration<'a, K: Hash + Eq + Clone> {
    registry: &'a CancellationRegistry<K>,
    key: K,
    token: CancellationToken,
}

impl<K: Hash + Eq + Clone> Registration<'_, K> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl<K: Hash + Eq + Clone> Drop for Registration<'_, K> {
    fn drop(&mut self) {
        self.registry.unregister(&self.key, &self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shared_between_clones() {
        let token = CancellationToken::new();
        let worker = token.clone();
        assert!(!worker.is_cancelled());

        token.cancel();
        assert!(worker.is_cancelled());
        assert!(worker.same_as(&token));

        worker.reset();
        assert!(!token.is_cancelled());
        assert!(!token.same_as(&CancellationToken::new()));
    }

    #[test]
    fn test_registry_cancel_where() {
        let registry = CancellationRegistry::new();
        let t1 = registry.register(1u32);
        let t5 = registry.register(5u32);
        let t9 = registry.register(9u32);

        assert_eq!(registry.cancel_where(|page| *page > 4), 2);
        assert!(!t1.is_cancelled());
        assert!(t5.is_cancelled());
        assert!(t9.is_cancelled());

        // Already cancelled tokens are not counted twice
        assert_eq!(registry.cancel_where(|page| *page > 4), 0);
        assert!(registry.cancel(&1));
        assert!(!registry.cancel(&2));
    }

    #[test]
    fn test_registrations_under_one_key_accumulate() {
        let registry = CancellationRegistry::new();
        let first = registry.register("page");
        let second = registry.register("page");
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.cancel_where(|key| *key == "page"), 2);
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());

        assert!(registry.unregister(&"page", &first));
        assert!(!registry.unregister(&"page", &first));
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(&"page", &second));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registration_guard_unregisters_on_drop() {
        let registry = CancellationRegistry::new();
        let kept = registry.register(7u32);
        {
            let guard = registry.enter(7u32);
            assert_eq!(registry.len(), 2);
            assert!(registry.cancel(&7));
            assert!(guard.token().is_cancelled());
        }
        assert_eq!(registry.len(), 1);
        assert!(kept.is_cancelled());
        assert!(registry.unregister(&7, &kept));
        assert!(registry.is_empty());
    }
}
