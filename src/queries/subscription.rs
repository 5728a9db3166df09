//! Shared subscription state behind every query cache
//!
//! A `SubscriptionMap` owns one `Subscription` per live key. The first
//! registration for a key starts its computation; later registrations join it
//! and get the cached value straight away. When the last callback leaves, the
//! computation is cancelled, its hooks are released and the key is evicted.
//!
//! Delivery for a key is serialized, so a callback never sees an older value
//! after a newer one. Callbacks must not register on the key they are being
//! called for.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::ingest::Notification;
use crate::store::StoreError;

use super::QueryError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A consumer callback. Identity is the underlying closure, so clones of one
/// `Callback` count as the same callback.
pub struct Callback<V> {
    f: Arc<dyn Fn(&V) + Send + Sync>,
    cancel: Option<CancellationToken>,
}

impl<V> Clone for Callback<V> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
            cancel: self.cancel.clone(),
        }
    }
}

impl<V> fmt::Debug for Callback<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl<V> Callback<V> {
    pub fn new(f: impl Fn(&V) + Send + Sync + 'static) -> Self {
        Self {
            f: Arc::new(f),
            cancel: None,
        }
    }

    /// Never invoke this callback once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    pub fn same_as(&self, other: &Callback<V>) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.f) as *const (),
            Arc::as_ptr(&other.f) as *const (),
        )
    }

    pub(crate) fn deliver(&self, value: &V) {
        if !self.is_cancelled() {
            (self.f)(value);
        }
    }
}

/// Handle returned by `query`. Dropping it leaves the callback registered.
#[must_use = "call unregister() to release the subscription"]
pub struct Registration {
    unregister: Box<dyn FnOnce() + Send>,
}

impl Registration {
    pub(crate) fn new(unregister: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unregister: Box::new(unregister),
        }
    }

    pub fn unregister(self) {
        (self.unregister)()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Registration")
    }
}

pub(crate) struct SubscriptionState<V, X> {
    latest: Option<V>,
    ext: X,
    callbacks: Vec<Callback<V>>,
    /// Released on teardown, e.g. registrations on lower-level caches.
    hooks: Vec<Registration>,
    torn_down: bool,
}

/// Live state for one key.
pub(crate) struct Subscription<V, X> {
    state: Mutex<SubscriptionState<V, X>>,
    delivery: Mutex<()>,
    token: CancellationToken,
}

impl<V: Clone, X> Subscription<V, X> {
    fn new(ext: X) -> Self {
        Self {
            state: Mutex::new(SubscriptionState {
                latest: None,
                ext,
                callbacks: Vec::new(),
                hooks: Vec::new(),
                torn_down: false,
            }),
            delivery: Mutex::new(()),
            token: CancellationToken::new(),
        }
    }

    /// Cancelled when the key is torn down.
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn has_callback(&self, callback: &Callback<V>) -> bool {
        lock(&self.state)
            .callbacks
            .iter()
            .any(|c| c.same_as(callback))
    }

    /// Read or adjust the cached value and extension state without delivering.
    pub(crate) fn inspect<R>(&self, f: impl FnOnce(&Option<V>, &mut X) -> R) -> R {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        f(&state.latest, &mut state.ext)
    }

    /// Run `f` against the state and deliver whatever it returns to every callback.
    pub(crate) fn update(&self, f: impl FnOnce(&mut Option<V>, &mut X) -> Option<V>) {
        let _delivery = lock(&self.delivery);
        let (value, callbacks) = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if state.torn_down {
                return;
            }
            match f(&mut state.latest, &mut state.ext) {
                Some(value) => (value, state.callbacks.clone()),
                None => return,
            }
        };
        for callback in &callbacks {
            callback.deliver(&value);
        }
    }

    fn deliver_latest(&self, callback: &Callback<V>) {
        let _delivery = lock(&self.delivery);
        let latest = lock(&self.state).latest.clone();
        if let Some(value) = latest {
            callback.deliver(&value);
        }
    }
}

impl<V: Clone + PartialEq, X> Subscription<V, X> {
    /// Cache and deliver `value` if it differs from the cached one.
    pub(crate) fn publish(&self, value: V) {
        self.update(|latest, _| {
            if latest.as_ref() == Some(&value) {
                None
            } else {
                *latest = Some(value.clone());
                Some(value)
            }
        });
    }
}

/// Key to subscription map with at most one live computation per key.
pub struct SubscriptionMap<K, V, X = ()> {
    entries: Arc<Mutex<HashMap<K, Arc<Subscription<V, X>>>>>,
}

impl<K, V, X> Clone for SubscriptionMap<K, V, X> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<K, V, X> Default for SubscriptionMap<K, V, X> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V, X> SubscriptionMap<K, V, X>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + 'static,
    V: Clone + Send + 'static,
    X: Default + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// No live keys.
    pub fn is_clean(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.is_clean()
    }

    pub(crate) fn get(&self, key: &K) -> Option<Arc<Subscription<V, X>>> {
        lock(&self.entries).get(key).cloned()
    }

    /// Add `callback` for `key`. `start` runs only for a new key, with no locks
    /// held, and returns hooks to release on teardown.
    pub(crate) fn register<S>(
        &self,
        key: K,
        callback: Callback<V>,
        start: S,
    ) -> Result<Registration, QueryError>
    where
        S: FnOnce(&Arc<Subscription<V, X>>) -> Vec<Registration>,
    {
        let (subscription, created) = {
            let mut entries = lock(&self.entries);
            match entries.get(&key) {
                Some(existing) => {
                    let mut state = lock(&existing.state);
                    if state.callbacks.iter().any(|c| c.same_as(&callback)) {
                        return Err(QueryError::DuplicatedCallbackError);
                    }
                    state.callbacks.push(callback.clone());
                    (Arc::clone(existing), false)
                }
                None => {
                    let subscription = Arc::new(Subscription::new(X::default()));
                    lock(&subscription.state).callbacks.push(callback.clone());
                    entries.insert(key.clone(), Arc::clone(&subscription));
                    (subscription, true)
                }
            }
        };

        if created {
            log::debug!("starting subscription for {:?}", key);
            let hooks = start(&subscription);
            let mut state = lock(&subscription.state);
            if state.torn_down {
                drop(state);
                for hook in hooks {
                    hook.unregister();
                }
            } else {
                state.hooks.extend(hooks);
            }
        } else {
            subscription.deliver_latest(&callback);
        }

        let map = self.clone();
        Ok(Registration::new(move || map.unregister(&key, &callback)))
    }

    fn unregister(&self, key: &K, callback: &Callback<V>) {
        let hooks = {
            let mut entries = lock(&self.entries);
            let Some(subscription) = entries.get(key).cloned() else {
                return;
            };
            let mut state = lock(&subscription.state);
            state.callbacks.retain(|c| !c.same_as(callback));
            if !state.callbacks.is_empty() {
                return;
            }
            state.torn_down = true;
            subscription.token.cancel();
            let hooks = std::mem::take(&mut state.hooks);
            drop(state);
            entries.remove(key);
            hooks
        };
        log::debug!("tore down subscription for {:?}", key);
        for hook in hooks {
            hook.unregister();
        }
    }
}

/// Recompute a value from the store whenever a relevant notification arrives.
/// `rx` must be subscribed before the call so nothing between the first load
/// and the first `recv` is missed.
pub(crate) fn spawn_computation<V, X, P, L, Fut>(
    subscription: Arc<Subscription<V, X>>,
    mut rx: broadcast::Receiver<Notification>,
    relevant: P,
    load: L,
) where
    V: Clone + PartialEq + Send + 'static,
    X: Send + 'static,
    P: Fn(&Notification) -> bool + Send + Sync + 'static,
    L: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, StoreError>> + Send,
{
    let token = subscription.token().clone();
    tokio::spawn(async move {
        let mut dirty = true;
        loop {
            if std::mem::take(&mut dirty) {
                match load().await {
                    Ok(value) => {
                        if token.is_cancelled() {
                            break;
                        }
                        subscription.publish(value);
                    }
                    Err(e) => log::warn!("query reload failed: {}", e),
                }
            }
            tokio::select! {
                _ = token.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(notification) => dirty = relevant(&notification),
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!("query lagged by {} notifications, reloading", skipped);
                        dirty = true;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Callback<u32>, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback = Callback::new(move |v: &u32| sink.lock().unwrap().push(*v));
        (callback, seen)
    }

    #[test]
    fn test_start_runs_once_per_key() {
        let map: SubscriptionMap<&'static str, u32> = SubscriptionMap::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let (a, _) = counting();
        let (b, _) = counting();

        let mut regs = Vec::new();
        for callback in [a, b] {
            let starts = starts.clone();
            regs.push(
                map.register("k", callback, move |_| {
                    starts.fetch_add(1, Ordering::SeqCst);
                    Vec::new()
                })
                .unwrap(),
            );
        }
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(map.len(), 1);

        for reg in regs {
            reg.unregister();
        }
        assert!(map.is_clean());
    }

    #[test]
    fn test_duplicate_callback_is_rejected() {
        let map: SubscriptionMap<&'static str, u32> = SubscriptionMap::new();
        let (a, _) = counting();
        let reg = map.register("k", a.clone(), |_| Vec::new()).unwrap();
        assert_eq!(
            map.register("k", a.clone(), |_| Vec::new()).unwrap_err(),
            QueryError::DuplicatedCallbackError
        );
        // Same callback on another key is fine.
        let other = map.register("j", a, |_| Vec::new()).unwrap();
        reg.unregister();
        other.unregister();
        assert!(map.is_clean());
    }

    #[test]
    fn test_warm_value_is_delivered_on_join() {
        let map: SubscriptionMap<&'static str, u32> = SubscriptionMap::new();
        let (a, seen_a) = counting();
        let (b, seen_b) = counting();

        let _ra = map
            .register("k", a, |sub| {
                sub.publish(7);
                Vec::new()
            })
            .unwrap();
        let _rb = map.register("k", b, |_| Vec::new()).unwrap();

        assert_eq!(*seen_a.lock().unwrap(), vec![7]);
        assert_eq!(*seen_b.lock().unwrap(), vec![7]);

        // Unchanged values are not redelivered.
        map.get(&"k").unwrap().publish(7);
        assert_eq!(seen_a.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_cancelled_callback_is_never_called() {
        let map: SubscriptionMap<&'static str, u32> = SubscriptionMap::new();
        let token = CancellationToken::new();
        let (a, seen) = counting();
        let reg = map
            .register("k", a.with_cancellation(token.clone()), |_| Vec::new())
            .unwrap();

        token.cancel();
        map.get(&"k").unwrap().publish(1);
        assert!(seen.lock().unwrap().is_empty());
        reg.unregister();
    }

    #[test]
    fn test_teardown_releases_hooks_and_cancels() {
        let map: SubscriptionMap<&'static str, u32> = SubscriptionMap::new();
        let released = Arc::new(AtomicUsize::new(0));
        let hook_counter = released.clone();
        let (a, _) = counting();

        let reg = map
            .register("k", a, move |_| {
                vec![Registration::new(move || {
                    hook_counter.fetch_add(1, Ordering::SeqCst);
                })]
            })
            .unwrap();
        let token = map.get(&"k").unwrap().token().clone();

        reg.unregister();
        assert!(token.is_cancelled());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(map.is_clean());
    }
}
