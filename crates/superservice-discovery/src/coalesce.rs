//! Duplicate call suppression
//!
//! A [`Group`] merges concurrent calls that share a key into a single
//! execution. The first caller for a key starts the work; every caller that
//! arrives while it is in flight awaits the same future and receives a clone
//! of its result, errors included. Once the work completes the key is
//! forgotten and the next call starts a fresh execution.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;

type SharedCall<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// Coalesces concurrent identical calls
pub struct Group<T, E> {
    calls: Mutex<HashMap<String, SharedCall<T, E>>>,
}

impl<T, E> fmt::Debug for Group<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("in_flight", &self.calls.lock().len())
            .finish()
    }
}

impl<T, E> Default for Group<T, E> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<T, E> Group<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create an empty group
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, or join the execution already in flight for it.
    ///
    /// `work` is dropped unpolled when another call for the same key is
    /// already running.
    pub async fn work<F>(&self, key: &str, work: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let call = {
            let mut calls = self.calls.lock();
            match calls.get(key).filter(|call| call.peek().is_none()) {
                Some(call) => {
                    tracing::trace!(key = %key, "Joining in-flight call");
                    call.clone()
                }
                None => {
                    let call = work.boxed().shared();
                    calls.insert(key.to_string(), call.clone());
                    call
                }
            }
        };

        let result = call.clone().await;

        let mut calls = self.calls.lock();
        if calls.get(key).is_some_and(|current| current.ptr_eq(&call)) {
            calls.remove(key);
        }

        result
    }

    /// Number of keys with a call in flight
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}
