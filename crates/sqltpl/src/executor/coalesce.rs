use crate::Error;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// Flight is the shared result of one in-flight call.
pub type Flight<V> = Shared<BoxFuture<'static, Result<V, Error>>>;

/// Group collapses concurrent calls having the same key into a single
/// execution, whose result (or error) is handed to every caller.
///
/// A key is evicted as soon as its call completes: Group is not a cache.
pub struct Group<V> {
    flights: Arc<Mutex<HashMap<String, Flight<V>>>>,
}

impl<V> Default for Group<V> {
    fn default() -> Self {
        Self {
            flights: Default::default(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Group<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the Flight of `key`, starting it from `work` if no call of `key`
    /// is in flight. Returns the Flight and whether it was already in flight.
    ///
    /// A started Flight runs to completion as its own task, even if every
    /// caller stops awaiting it.
    pub fn join<W, F>(&self, key: &str, work: W) -> (Flight<V>, bool)
    where
        W: FnOnce() -> F,
        F: Future<Output = Result<V, Error>> + Send + 'static,
    {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(flight) = flights.get(key) {
            return (flight.clone(), true);
        }

        // The task can't evict `key` until we release `flights`,
        // which happens only after it's been inserted.
        let task = tokio::spawn({
            let flights = self.flights.clone();
            let key = key.to_string();
            let work = work();

            async move {
                let result = work.await;
                flights
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&key);
                result
            }
        });

        let flight = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(Error::database(
                    anyhow::Error::new(err).context("coalesced call failed"),
                )),
            }
        }
        .boxed()
        .shared();

        flights.insert(key.to_string(), flight.clone());
        (flight, false)
    }

    /// Number of calls in flight.
    pub fn in_flight(&self) -> usize {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_joined_calls_share_one_execution() {
        let group = Group::<u32>::new();
        let calls = Arc::new(AtomicU32::new(0));

        let work = || {
            let calls = calls.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
            }
        };

        let (first, first_shared) = group.join("a", work);
        let (second, second_shared) = group.join("a", work);
        let (other, other_shared) = group.join("b", work);

        assert!(!first_shared);
        assert!(second_shared);
        assert!(!other_shared);
        assert_eq!(group.in_flight(), 2);

        let (first, second, other) = tokio::join!(first, second, other);
        assert_eq!(first.unwrap(), second.unwrap());
        assert!(other.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(group.in_flight(), 0);

        // A completed key starts a fresh execution.
        let (again, again_shared) = group.join("a", work);
        assert!(!again_shared);
        again.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let group = Group::<u32>::new();
        let work = || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(Error::RecordNotFound)
        };

        let (first, _) = group.join("k", work);
        let (second, shared) = group.join("k", work);
        assert!(shared);

        let (first, second) = tokio::join!(first, second);
        assert!(matches!(first, Err(Error::RecordNotFound)));
        assert!(matches!(second, Err(Error::RecordNotFound)));
    }

    #[tokio::test]
    async fn test_abandoned_flight_still_evicts() {
        let group = Group::<u32>::new();
        let (flight, _) = group.join("k", || async { Ok(1) });
        std::mem::drop(flight);

        for _ in 0..100 {
            if group.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("flight was not evicted");
    }
}
