//! Per-key single-flight initialization.
//!
//! A single coarse mutex protects the key → slot map, and it is only held for
//! the check-and-insert step. The caller that inserts a pending marker becomes
//! the leader and runs the initializer with no lock held; everyone else who
//! arrives for the same key waits on the marker and receives a clone of the
//! leader's outcome. Successful values are kept, failures are dropped so the
//! next caller starts over.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Raised to waiters when the leader's initializer unwound without finishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitAbandoned {
    pub key: String,
}

enum Slot<V, E> {
    Ready(V),
    Pending(Arc<Flight<V, E>>),
}

struct Flight<V, E> {
    outcome: Mutex<Option<Result<V, E>>>,
    done: Condvar,
}

impl<V: Clone, E: Clone> Flight<V, E> {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn publish(&self, outcome: Result<V, E>) {
        *lock(&self.outcome) = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> Result<V, E> {
        let mut outcome = lock(&self.outcome);
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            outcome = self
                .done
                .wait(outcome)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Map from key to an initialized value, with at most one initializer per key
/// in flight at any time.
pub struct SingleFlight<V, E> {
    slots: Mutex<HashMap<String, Slot<V, E>>>,
}

impl<V, E> Default for SingleFlight<V, E> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

enum Role<V, E> {
    Leader(Arc<Flight<V, E>>),
    Follower(Arc<Flight<V, E>>),
}

impl<V, E> SingleFlight<V, E>
where
    V: Clone,
    E: Clone + From<InitAbandoned>,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the value for `key`, running `init` if nobody has produced it yet.
    ///
    /// Concurrent callers for the same key share one run of `init`; callers for
    /// different keys never wait on each other.
    pub fn get_or_try_init<F>(&self, key: &str, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let role = {
            let mut slots = lock(&self.slots);
            match slots.get(key) {
                Some(Slot::Ready(value)) => return Ok(value.clone()),
                Some(Slot::Pending(flight)) => Role::Follower(Arc::clone(flight)),
                None => {
                    let flight = Arc::new(Flight::new());
                    slots.insert(key.to_string(), Slot::Pending(Arc::clone(&flight)));
                    Role::Leader(flight)
                }
            }
        };

        match role {
            Role::Follower(flight) => {
                tracing::debug!(key = %key, "Waiting for in-flight initialization");
                flight.wait()
            }
            Role::Leader(flight) => {
                let mut guard = LeaderGuard {
                    owner: self,
                    key,
                    flight,
                    finished: false,
                };
                let outcome = init();
                guard.finish(outcome.clone());
                outcome
            }
        }
    }

    /// Keys whose initialization has completed successfully, sorted.
    pub fn ready_keys(&self) -> Vec<String> {
        let slots = lock(&self.slots);
        let mut keys: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn get(&self, key: &str) -> Option<V> {
        match lock(&self.slots).get(key) {
            Some(Slot::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }
}

/// Settles the leader's flight exactly once, including when `init` panics.
struct LeaderGuard<'a, V, E>
where
    V: Clone,
    E: Clone + From<InitAbandoned>,
{
    owner: &'a SingleFlight<V, E>,
    key: &'a str,
    flight: Arc<Flight<V, E>>,
    finished: bool,
}

impl<V, E> LeaderGuard<'_, V, E>
where
    V: Clone,
    E: Clone + From<InitAbandoned>,
{
    fn finish(&mut self, outcome: Result<V, E>) {
        {
            let mut slots = lock(&self.owner.slots);
            match &outcome {
                Ok(value) => {
                    slots.insert(self.key.to_string(), Slot::Ready(value.clone()));
                }
                Err(_) => {
                    slots.remove(self.key);
                }
            }
        }
        self.flight.publish(outcome);
        self.finished = true;
    }
}

impl<V, E> Drop for LeaderGuard<'_, V, E>
where
    V: Clone,
    E: Clone + From<InitAbandoned>,
{
    fn drop(&mut self) {
        if !self.finished {
            let abandoned = E::from(InitAbandoned {
                key: self.key.to_string(),
            });
            self.finish(Err(abandoned));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
