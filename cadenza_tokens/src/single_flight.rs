//! Coalescing of concurrent identical operations

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::watch;

type Slot<T, E> = watch::Receiver<Option<Result<T, E>>>;

/// How a caller participated in a flight
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    /// The caller ran the operation
    Leader,
    /// The caller waited on another caller's operation
    Follower,
}

/// Ensures that at most one operation per key is in flight at a time
///
/// The first caller for a key runs the operation. Callers arriving while it
/// runs wait for and share its result. Once the result is published the key
/// is free again, so the next caller starts a fresh flight. If the leader is
/// cancelled before finishing, one of the waiting callers takes over.
pub(crate) struct SingleFlight<K, T, E> {
    inflight: Mutex<HashMap<K, Slot<T, E>>>,
}

impl<K, T, E> fmt::Debug for SingleFlight<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight").finish_non_exhaustive()
    }
}

impl<K, T, E> Default for SingleFlight<K, T, E> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

enum Claim<T, E> {
    Lead(watch::Sender<Option<Result<T, E>>>),
    Follow(Slot<T, E>),
}

/// Frees the key when the leader finishes or is cancelled
///
/// The key is removed before the sender is dropped, so woken followers never
/// find the abandoned slot still registered.
struct FlightGuard<'a, K: Eq + Hash, T, E> {
    flights: &'a SingleFlight<K, T, E>,
    key: Option<K>,
    sender: watch::Sender<Option<Result<T, E>>>,
}

impl<'a, K: Eq + Hash, T, E> Drop for FlightGuard<'a, K, T, E> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.flights.lock().remove(&key);
        }
    }
}

impl<K, T, E> SingleFlight<K, T, E> {
    fn lock(&self) -> MutexGuard<'_, HashMap<K, Slot<T, E>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, T, E> SingleFlight<K, T, E>
where
    K: Eq + Hash + Clone,
    T: Clone,
    E: Clone,
{
    /// Runs `op` unless a flight for `key` is already running, in which case
    /// its result is shared
    pub async fn run<F, Fut>(&self, key: K, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_tracked(key, op).await.0
    }

    /// Like [`run()`][Self::run()], also reporting whether this caller led the flight
    pub async fn run_tracked<F, Fut>(&self, key: K, op: F) -> (Result<T, E>, Role)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let sender = loop {
            let claim = {
                let mut inflight = self.lock();
                match inflight.get(&key) {
                    Some(slot) => Claim::Follow(slot.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(key.clone(), rx);
                        Claim::Lead(tx)
                    }
                }
            };

            match claim {
                Claim::Lead(tx) => break tx,
                Claim::Follow(mut slot) => {
                    loop {
                        let published = slot.borrow_and_update().as_ref().cloned();
                        if let Some(result) = published {
                            return (result, Role::Follower);
                        }

                        if slot.changed().await.is_err() {
                            break;
                        }
                    }

                    let published = slot.borrow().as_ref().cloned();
                    if let Some(result) = published {
                        return (result, Role::Follower);
                    }

                    tracing::debug!("flight leader abandoned its operation, retrying");
                }
            }
        };

        let guard = FlightGuard {
            flights: self,
            key: Some(key),
            sender,
        };

        let result = op().await;
        guard.sender.send_replace(Some(result.clone()));
        drop(guard);

        (result, Role::Leader)
    }
}
